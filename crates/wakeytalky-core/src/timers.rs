//! Snooze re-entry timers.
//!
//! Each snoozed instance gets one sleeping tokio task that posts a
//! [`TimerFired`] to the controller's channel when it wakes. Arming never
//! blocks. Cancelling aborts the task; a message that was already queued is
//! filtered out by the ring state machine's generation check.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::ring::InstanceId;

/// A snooze timer for `instance_id` elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub instance_id: InstanceId,
    pub generation: u64,
}

/// Must be used from inside a tokio runtime.
pub struct SnoozeTimers {
    handles: HashMap<InstanceId, JoinHandle<()>>,
    tx: mpsc::UnboundedSender<TimerFired>,
}

impl SnoozeTimers {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                handles: HashMap::new(),
                tx,
            },
            rx,
        )
    }

    /// Start (or restart) the timer for an instance.
    pub fn arm(&mut self, instance_id: &str, generation: u64, delay: Duration) {
        self.handles.retain(|_, h| !h.is_finished());
        if let Some(old) = self.handles.remove(instance_id) {
            old.abort();
        }

        let tx = self.tx.clone();
        let fired = TimerFired {
            instance_id: instance_id.to_string(),
            generation,
        };
        debug!(instance_id, generation, delay_ms = delay.as_millis() as u64, "snooze timer armed");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the controller shut down.
            let _ = tx.send(fired);
        });
        self.handles.insert(instance_id.to_string(), handle);
    }

    /// Returns true if a timer was pending.
    pub fn cancel(&mut self, instance_id: &str) -> bool {
        match self.handles.remove(instance_id) {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                if pending {
                    debug!(instance_id, "snooze timer cancelled");
                }
                pending
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }

    pub fn pending(&self) -> usize {
        self.handles.values().filter(|h| !h.is_finished()).count()
    }
}

impl Drop for SnoozeTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (mut timers, mut rx) = SnoozeTimers::new();
        timers.arm("i-1", 3, Duration::from_secs(300));
        assert_eq!(timers.pending(), 1);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(rx.try_recv().is_err());

        let fired = rx.recv().await.unwrap();
        assert_eq!(
            fired,
            TimerFired {
                instance_id: "i-1".into(),
                generation: 3
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (mut timers, mut rx) = SnoozeTimers::new();
        timers.arm("i-1", 1, Duration::from_secs(60));
        assert!(timers.cancel("i-1"));
        assert!(!timers.cancel("i-1"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_previous_timer() {
        let (mut timers, mut rx) = SnoozeTimers::new();
        timers.arm("i-1", 1, Duration::from_secs(60));
        timers.arm("i-1", 2, Duration::from_secs(90));
        assert_eq!(timers.pending(), 1);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.generation, 2);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }
}
