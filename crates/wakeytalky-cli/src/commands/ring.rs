use clap::{ArgGroup, Subcommand};
use serde::Serialize;
use wakeytalky_core::gate::{gate_passes, pending_tasks};
use wakeytalky_core::{AlarmController, AlarmInstance, TaskProgress, TriggerPayload};

use super::{now, open_controller, parse_at, print_json, CliResult};

#[derive(Subcommand)]
pub enum RingAction {
    /// Fire an alarm by hand, as the notification platform would
    Trigger {
        alarm_id: String,
        /// Scheduled time, YYYY-MM-DDTHH:MM (defaults to now)
        #[arg(long)]
        at: Option<String>,
    },
    /// Unresolved alarm instances
    List,
    /// One instance with its gate and voice message
    Status { id: String },
    /// Snooze a ringing alarm
    Snooze { id: String },
    /// Ask to dismiss; may demand tasks first
    Dismiss { id: String },
    /// Report progress on a task
    #[command(group(ArgGroup::new("progress").required(true).args(["set", "add", "done", "verdict"])))]
    Task {
        id: String,
        task_id: String,
        /// Absolute progress
        #[arg(long)]
        set: Option<u32>,
        /// Add to current progress
        #[arg(long)]
        add: Option<u32>,
        /// Mark complete
        #[arg(long)]
        done: bool,
        /// Verifier result for photo tasks
        #[arg(long)]
        verdict: Option<bool>,
    },
    /// Ring any snooze whose time has come
    Poll,
    /// Recently resolved instances
    History {
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

#[derive(Serialize)]
struct InstanceStatus<'a> {
    #[serde(flatten)]
    instance: &'a AlarmInstance,
    escalation_level: u8,
    snoozes_left: u32,
    gate_passes: bool,
    pending_tasks: Vec<&'a str>,
    voice: Option<String>,
}

/// Exact id, or a unique prefix of one.
fn resolve(controller: &AlarmController, id: &str) -> Result<String, String> {
    if controller.instance(id).is_some() {
        return Ok(id.to_string());
    }
    let mut matches = controller
        .active_instances()
        .map(|i| i.id())
        .filter(|candidate| candidate.starts_with(id));
    match (matches.next(), matches.next()) {
        (Some(only), None) => Ok(only.to_string()),
        (Some(_), Some(_)) => Err(format!("ambiguous instance id: {id}")),
        (None, _) => Err(format!("instance not found: {id}")),
    }
}

fn status<'a>(controller: &'a AlarmController, id: &str) -> Result<InstanceStatus<'a>, String> {
    let instance = controller
        .instance(id)
        .ok_or_else(|| format!("instance not found: {id}"))?;
    let voice = controller
        .voice_message(id)
        .map(|m| String::from_utf8_lossy(&m.body).into_owned());
    Ok(InstanceStatus {
        instance,
        escalation_level: instance.escalation_level(),
        snoozes_left: instance.snoozes_left(),
        gate_passes: gate_passes(instance),
        pending_tasks: pending_tasks(instance).into_iter().map(|t| t.id.as_str()).collect(),
        voice,
    })
}

pub async fn run(action: RingAction) -> CliResult {
    let now = now();
    let (mut controller, _timers) = open_controller(now).await?;

    match action {
        RingAction::Trigger { alarm_id, at } => {
            let scheduled_time = parse_at(at.as_deref())?;
            let payload = TriggerPayload {
                alarm_id,
                scheduled_time,
            };
            let events = controller.on_trigger(payload, now.max(scheduled_time)).await?;
            print_json(&events)?;
        }
        RingAction::List => {
            let live: Vec<InstanceStatus> = controller
                .active_instances()
                .map(|i| status(&controller, i.id()))
                .collect::<Result<_, _>>()?;
            print_json(&live)?;
        }
        RingAction::Status { id } => {
            let id = resolve(&controller, &id)?;
            print_json(&status(&controller, &id)?)?;
        }
        RingAction::Snooze { id } => {
            let id = resolve(&controller, &id)?;
            let events = controller.snooze(&id, now).await?;
            print_json(&events)?;
        }
        RingAction::Dismiss { id } => {
            let id = resolve(&controller, &id)?;
            let events = controller.request_dismiss(&id, now).await?;
            print_json(&events)?;
        }
        RingAction::Task {
            id,
            task_id,
            set,
            add,
            done,
            verdict,
        } => {
            let id = resolve(&controller, &id)?;
            let progress = match (set, add, verdict) {
                (Some(n), _, _) => TaskProgress::Progress(n),
                (_, Some(n), _) => TaskProgress::Increment(n),
                (_, _, Some(v)) => TaskProgress::Verdict(v),
                _ if done => TaskProgress::Complete,
                _ => return Err("no progress given".into()),
            };
            let events = controller.complete_task(&id, &task_id, progress, now).await?;
            print_json(&events)?;
        }
        RingAction::Poll => {
            let events = controller.poll_due(now).await?;
            print_json(&events)?;
        }
        RingAction::History { limit } => {
            let history = controller.history();
            let start = history.len().saturating_sub(limit);
            let recent = &history[start..];
            print_json(&recent)?;
        }
    }

    controller.flush().await?;
    Ok(())
}
