use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::alarm::{AlarmId, TaskId};
use crate::ring::InstanceId;

/// Every ring transition produces an Event.
/// Storage, notification and voice layers subscribe to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Entered `Ringing` (first ring, snooze elapsed, or recovery).
    Rang {
        instance_id: InstanceId,
        alarm_id: AlarmId,
        ring_count: u32,
        snooze_count: u32,
        escalation_level: u8,
        at: NaiveDateTime,
    },
    Snoozed {
        instance_id: InstanceId,
        alarm_id: AlarmId,
        snooze_count: u32,
        until: NaiveDateTime,
        at: NaiveDateTime,
    },
    /// Dismissal blocked until the listed tasks are completed.
    ChallengeRequired {
        instance_id: InstanceId,
        alarm_id: AlarmId,
        pending_tasks: Vec<TaskId>,
        at: NaiveDateTime,
    },
    TaskProgressed {
        instance_id: InstanceId,
        task_id: TaskId,
        current: u32,
        completed: bool,
        at: NaiveDateTime,
    },
    Dismissed {
        instance_id: InstanceId,
        alarm_id: AlarmId,
        ring_count: u32,
        snooze_count: u32,
        at: NaiveDateTime,
    },
    /// Host went away while the alarm was still live.
    Expired {
        instance_id: InstanceId,
        alarm_id: AlarmId,
        at: NaiveDateTime,
    },
}

impl Event {
    pub fn instance_id(&self) -> &str {
        match self {
            Event::Rang { instance_id, .. }
            | Event::Snoozed { instance_id, .. }
            | Event::ChallengeRequired { instance_id, .. }
            | Event::TaskProgressed { instance_id, .. }
            | Event::Dismissed { instance_id, .. }
            | Event::Expired { instance_id, .. } => instance_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Rang { .. } => "rang",
            Event::Snoozed { .. } => "snoozed",
            Event::ChallengeRequired { .. } => "challenge_required",
            Event::TaskProgressed { .. } => "task_progressed",
            Event::Dismissed { .. } => "dismissed",
            Event::Expired { .. } => "expired",
        }
    }
}

/// Fan-out channel for events. Publishing never blocks; a subscriber that
/// falls behind by more than the capacity sees `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            debug!(kind, "event dropped, no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
