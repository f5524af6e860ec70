//! Ring state machine for one occurrence of an alarm.
//!
//! Like the rest of the core it does no I/O and never reads the clock: the
//! caller passes `now` and gets back the events each transition produced.
//!
//! ## State Transitions
//!
//! ```text
//! Scheduled -> Ringing -> Snoozed -> Ringing (loop)
//!                      -> ChallengePending -> Dismissed
//!                      -> Dismissed
//! any live state -> Expired -> Ringing (recovery)
//! ```

use std::fmt;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alarm::{Alarm, AlarmId, SnoozePolicy, Task, TaskProgress};
use crate::error::AlarmError;
use crate::events::Event;
use crate::gate;

pub type InstanceId = String;

/// Escalation stops growing after this many rings.
pub const MAX_ESCALATION_LEVEL: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingState {
    Scheduled,
    Ringing,
    Snoozed,
    /// Dismiss requested but the challenge gate is closed.
    ChallengePending,
    Dismissed,
    /// Host went away before the alarm was resolved. Recoverable.
    Expired,
}

impl RingState {
    /// Ringing, snoozed or waiting on tasks.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            RingState::Ringing | RingState::Snoozed | RingState::ChallengePending
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RingState::Dismissed | RingState::Expired)
    }
}

impl fmt::Display for RingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RingState::Scheduled => "scheduled",
            RingState::Ringing => "ringing",
            RingState::Snoozed => "snoozed",
            RingState::ChallengePending => "challenge_pending",
            RingState::Dismissed => "dismissed",
            RingState::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// One concrete occurrence of an [`Alarm`] being triggered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmInstance {
    pub(crate) id: InstanceId,
    pub(crate) alarm_id: AlarmId,
    #[serde(default)]
    pub(crate) label: String,
    pub(crate) scheduled_time: NaiveDateTime,
    pub(crate) state: RingState,
    pub(crate) ring_count: u32,
    pub(crate) snooze_count: u32,
    pub(crate) policy: SnoozePolicy,
    /// Copy of the alarm's tasks with progress reset.
    pub(crate) task_snapshot: Vec<Task>,
    #[serde(default)]
    pub(crate) first_rang_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub(crate) last_rang_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub(crate) snoozed_until: Option<NaiveDateTime>,
    #[serde(default)]
    pub(crate) resolved_at: Option<NaiveDateTime>,
    /// Bumped whenever a pending snooze timer is superseded or cancelled.
    #[serde(default)]
    pub(crate) timer_generation: u64,
}

impl AlarmInstance {
    /// New occurrence in `Scheduled`, snapshotting the alarm's policy and a
    /// fresh copy of its tasks.
    pub fn from_alarm(alarm: &Alarm, scheduled_time: NaiveDateTime) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            alarm_id: alarm.id.clone(),
            label: alarm.label.clone(),
            scheduled_time,
            state: RingState::Scheduled,
            ring_count: 0,
            snooze_count: 0,
            policy: alarm.snooze_policy(),
            task_snapshot: alarm.tasks.iter().map(Task::fresh).collect(),
            first_rang_at: None,
            last_rang_at: None,
            snoozed_until: None,
            resolved_at: None,
            timer_generation: 0,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn alarm_id(&self) -> &str {
        &self.alarm_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> RingState {
        self.state
    }

    pub fn scheduled_time(&self) -> NaiveDateTime {
        self.scheduled_time
    }

    pub fn ring_count(&self) -> u32 {
        self.ring_count
    }

    pub fn snooze_count(&self) -> u32 {
        self.snooze_count
    }

    pub fn policy(&self) -> &SnoozePolicy {
        &self.policy
    }

    pub fn tasks(&self) -> &[Task] {
        &self.task_snapshot
    }

    pub fn snoozed_until(&self) -> Option<NaiveDateTime> {
        self.snoozed_until
    }

    pub fn first_rang_at(&self) -> Option<NaiveDateTime> {
        self.first_rang_at
    }

    pub fn resolved_at(&self) -> Option<NaiveDateTime> {
        self.resolved_at
    }

    pub fn timer_generation(&self) -> u64 {
        self.timer_generation
    }

    /// Voice/volume intensity, `min(ring_count, 7)`.
    pub fn escalation_level(&self) -> u8 {
        self.ring_count.min(MAX_ESCALATION_LEVEL as u32) as u8
    }

    /// Time since the first ring, if it has rung.
    pub fn elapsed_since_first_ring(&self, now: NaiveDateTime) -> Option<Duration> {
        self.first_rang_at.map(|t| now - t)
    }

    /// Snooze remaining before the limit is hit.
    pub fn snoozes_left(&self) -> u32 {
        self.policy.max_snooze_count.saturating_sub(self.snooze_count)
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// `Scheduled -> Ringing`.
    pub fn trigger(&mut self, now: NaiveDateTime) -> Result<Event, AlarmError> {
        if self.state != RingState::Scheduled {
            return Err(self.invalid("trigger"));
        }
        self.ring_count = 1;
        self.snooze_count = 0;
        self.first_rang_at = Some(now);
        Ok(self.enter_ringing(now))
    }

    /// `Ringing -> Snoozed`. State is untouched on error.
    pub fn snooze(&mut self, now: NaiveDateTime) -> Result<Event, AlarmError> {
        if !self.state.is_live() {
            return Err(self.invalid("snooze"));
        }
        if !self.policy.snooze_enabled {
            return Err(AlarmError::SnoozeDisabled);
        }
        if self.snooze_count >= self.policy.max_snooze_count {
            return Err(AlarmError::SnoozeLimitExceeded {
                max: self.policy.max_snooze_count,
            });
        }
        if self.state != RingState::Ringing {
            return Err(self.invalid("snooze"));
        }

        let until = now + Duration::minutes(self.policy.snooze_interval_minutes as i64);
        self.snooze_count += 1;
        self.timer_generation += 1;
        self.snoozed_until = Some(until);
        self.state = RingState::Snoozed;
        Ok(Event::Snoozed {
            instance_id: self.id.clone(),
            alarm_id: self.alarm_id.clone(),
            snooze_count: self.snooze_count,
            until,
            at: now,
        })
    }

    /// `Snoozed -> Ringing` when the snooze timer fires.
    ///
    /// Returns `None` for a stale timer: the instance already left `Snoozed`
    /// or the timer belongs to an older snooze.
    pub fn snooze_elapsed(&mut self, generation: u64, now: NaiveDateTime) -> Option<Event> {
        if self.state != RingState::Snoozed || generation != self.timer_generation {
            return None;
        }
        self.ring_count += 1;
        self.snoozed_until = None;
        Some(self.enter_ringing(now))
    }

    /// User asks to stop the alarm. Dismisses when the gate passes, otherwise
    /// moves to `ChallengePending`. A pending snooze timer is invalidated.
    pub fn request_dismiss(&mut self, now: NaiveDateTime) -> Result<Event, AlarmError> {
        if !self.state.is_live() {
            return Err(self.invalid("dismiss"));
        }
        self.cancel_snooze_timer();
        if gate::gate_passes(self) {
            return Ok(self.dismiss(now));
        }
        self.state = RingState::ChallengePending;
        Ok(Event::ChallengeRequired {
            instance_id: self.id.clone(),
            alarm_id: self.alarm_id.clone(),
            pending_tasks: gate::pending_tasks(self)
                .into_iter()
                .map(|t| t.id.clone())
                .collect(),
            at: now,
        })
    }

    /// Record task progress. In `ChallengePending` the instance is dismissed
    /// as soon as the gate opens.
    pub fn complete_task(
        &mut self,
        task_id: &str,
        progress: TaskProgress,
        now: NaiveDateTime,
    ) -> Result<Vec<Event>, AlarmError> {
        if self.state.is_terminal() {
            return Err(self.invalid("complete a task"));
        }
        let (task_id, current, completed) = {
            let task = gate::complete_task(self, task_id, progress)?;
            (task.id.clone(), task.current, task.completed)
        };
        let mut events = vec![Event::TaskProgressed {
            instance_id: self.id.clone(),
            task_id,
            current,
            completed,
            at: now,
        }];
        if self.state == RingState::ChallengePending && gate::gate_passes(self) {
            events.push(self.dismiss(now));
        }
        Ok(events)
    }

    /// Host is going away with the alarm unresolved.
    pub fn expire(&mut self, now: NaiveDateTime) -> Result<Event, AlarmError> {
        if self.state.is_terminal() {
            return Err(self.invalid("expire"));
        }
        self.cancel_snooze_timer();
        self.state = RingState::Expired;
        Ok(Event::Expired {
            instance_id: self.id.clone(),
            alarm_id: self.alarm_id.clone(),
            at: now,
        })
    }

    /// `Expired -> Ringing` on restart. Counters and task progress carry over.
    pub fn recover(&mut self, now: NaiveDateTime) -> Result<Event, AlarmError> {
        if self.state != RingState::Expired {
            return Err(self.invalid("recover"));
        }
        self.ring_count += 1;
        if self.first_rang_at.is_none() {
            self.first_rang_at = Some(now);
        }
        Ok(self.enter_ringing(now))
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn enter_ringing(&mut self, now: NaiveDateTime) -> Event {
        self.state = RingState::Ringing;
        self.last_rang_at = Some(now);
        Event::Rang {
            instance_id: self.id.clone(),
            alarm_id: self.alarm_id.clone(),
            ring_count: self.ring_count,
            snooze_count: self.snooze_count,
            escalation_level: self.escalation_level(),
            at: now,
        }
    }

    fn dismiss(&mut self, now: NaiveDateTime) -> Event {
        self.state = RingState::Dismissed;
        self.resolved_at = Some(now);
        Event::Dismissed {
            instance_id: self.id.clone(),
            alarm_id: self.alarm_id.clone(),
            ring_count: self.ring_count,
            snooze_count: self.snooze_count,
            at: now,
        }
    }

    fn cancel_snooze_timer(&mut self) {
        if self.state == RingState::Snoozed {
            self.timer_generation += 1;
            self.snoozed_until = None;
        }
    }

    fn invalid(&self, action: &'static str) -> AlarmError {
        AlarmError::InvalidTransition {
            from: self.state,
            action,
        }
    }
}
