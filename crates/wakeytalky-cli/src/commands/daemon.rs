use std::time::Duration;

use chrono::NaiveDateTime;
use clap::Args;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use wakeytalky_core::schedule::next_trigger;
use wakeytalky_core::{AlarmController, Event, TriggerPayload};

use super::{now, open_controller, CliResult};

#[derive(Args)]
pub struct DaemonArgs {
    /// Seconds between checks for due alarms
    #[arg(long, default_value = "15")]
    poll_secs: u64,
}

/// Alarms whose next trigger after `since` is no later than `until`.
fn due_triggers(controller: &AlarmController, since: NaiveDateTime, until: NaiveDateTime) -> Vec<TriggerPayload> {
    controller
        .alarms()
        .filter(|alarm| alarm.enabled)
        .filter_map(|alarm| {
            let at = next_trigger(alarm, since).ok()?;
            (at <= until).then(|| TriggerPayload {
                alarm_id: alarm.id.clone(),
                scheduled_time: at,
            })
        })
        .collect()
}

fn print_event(controller: &AlarmController, event: &Event) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "failed to encode event"),
    }
    if let Event::Rang { instance_id, .. } = event {
        if let Some(message) = controller.voice_message(instance_id) {
            eprintln!("{}", String::from_utf8_lossy(&message.body));
        }
    }
}

/// Stands in for the notification platform: checks the schedule on an
/// interval, feeds snooze timers back and prints every event as a JSON line.
pub async fn run(args: DaemonArgs) -> CliResult {
    let mut last_check = now();
    let (mut controller, mut timers) = open_controller(last_check).await?;
    let mut events = controller.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(args.poll_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(alarms = controller.alarms().count(), "daemon started");
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(fired) = timers.recv() => {
                if let Err(e) = controller.handle_timer(fired, now()).await {
                    warn!(error = %e, "snooze timer handling failed");
                }
            }
            _ = ticker.tick() => {
                let current = now();
                // CLI commands write the same store; see their changes first.
                if let Err(e) = controller.refresh(current).await {
                    warn!(error = %e, "alarm state refresh failed");
                }
                for payload in due_triggers(&controller, last_check, current) {
                    if let Err(e) = controller.on_trigger(payload, current).await {
                        warn!(error = %e, "trigger failed");
                    }
                }
                if let Err(e) = controller.poll_due(current).await {
                    warn!(error = %e, "snooze poll failed");
                }
                last_check = current;
            }
            received = events.recv() => match received {
                Ok(event) => print_event(&controller, &event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event output fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("daemon stopping");
    controller.shutdown(now()).await?;
    Ok(())
}
