//! Alarm templates and their wake-up tasks.
//!
//! An [`Alarm`] is the user-configured recurring rule. It owns its [`Task`]s;
//! a ringing occurrence works on a copy (see [`crate::ring::AlarmInstance`]).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScheduleError;

pub type AlarmId = String;
pub type TaskId = String;

/// Wall-clock hour and minute (24h, no timezone).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Result<Self, ScheduleError> {
        let time = Self { hour, minute };
        time.validate()?;
        Ok(time)
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.hour > 23 {
            return Err(ScheduleError::invalid(
                "time_of_day",
                format!("hour {} is outside 0-23", self.hour),
            ));
        }
        if self.minute > 59 {
            return Err(ScheduleError::invalid(
                "time_of_day",
                format!("minute {} is outside 0-59", self.minute),
            ));
        }
        Ok(())
    }

    pub fn to_naive_time(self) -> Result<NaiveTime, ScheduleError> {
        self.validate()?;
        NaiveTime::from_hms_opt(self.hour as u32, self.minute as u32, 0)
            .ok_or_else(|| ScheduleError::invalid("time_of_day", self.to_string()))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for TimeOfDay {
    type Err = ScheduleError;

    /// Parses `HH:MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| ScheduleError::invalid("time_of_day", format!("expected HH:MM, got '{s}'")))?;
        let hour = h
            .parse::<u8>()
            .map_err(|_| ScheduleError::invalid("time_of_day", format!("bad hour '{h}'")))?;
        let minute = m
            .parse::<u8>()
            .map_err(|_| ScheduleError::invalid("time_of_day", format!("bad minute '{m}'")))?;
        Self::new(hour, minute)
    }
}

/// Snooze and challenge settings, copied into each ring so edits made while
/// an alarm is ringing do not change the live occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnoozePolicy {
    pub snooze_enabled: bool,
    pub snooze_interval_minutes: u32,
    pub max_snooze_count: u32,
    /// Tasks are required once `snooze_count >= task_required_after_snoozes`.
    pub task_required_after_snoozes: u32,
}

impl Default for SnoozePolicy {
    fn default() -> Self {
        Self {
            snooze_enabled: true,
            snooze_interval_minutes: 5,
            max_snooze_count: 3,
            task_required_after_snoozes: 2,
        }
    }
}

/// A user-configured recurring wake-up rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: AlarmId,
    /// Purpose shown to the user and forwarded to voice generation.
    #[serde(default)]
    pub label: String,
    pub time: TimeOfDay,
    /// Weekday ordinals, 0 = Sunday .. 6 = Saturday. Empty means one-shot.
    #[serde(default)]
    pub active_days: BTreeSet<u8>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub snooze_enabled: bool,
    pub snooze_interval_minutes: u32,
    pub max_snooze_count: u32,
    pub task_required_after_snoozes: u32,
    #[serde(default)]
    pub tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Alarm {
    /// Create an enabled alarm with the default snooze policy and no tasks.
    pub fn new(label: impl Into<String>, time: TimeOfDay, active_days: impl IntoIterator<Item = u8>) -> Self {
        let policy = SnoozePolicy::default();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            label: label.into(),
            time,
            active_days: active_days.into_iter().collect(),
            enabled: true,
            snooze_enabled: policy.snooze_enabled,
            snooze_interval_minutes: policy.snooze_interval_minutes,
            max_snooze_count: policy.max_snooze_count,
            task_required_after_snoozes: policy.task_required_after_snoozes,
            tasks: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_policy(mut self, policy: SnoozePolicy) -> Self {
        self.apply_policy(policy);
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn apply_policy(&mut self, policy: SnoozePolicy) {
        self.snooze_enabled = policy.snooze_enabled;
        self.snooze_interval_minutes = policy.snooze_interval_minutes;
        self.max_snooze_count = policy.max_snooze_count;
        self.task_required_after_snoozes = policy.task_required_after_snoozes;
    }

    pub fn snooze_policy(&self) -> SnoozePolicy {
        SnoozePolicy {
            snooze_enabled: self.snooze_enabled,
            snooze_interval_minutes: self.snooze_interval_minutes,
            max_snooze_count: self.max_snooze_count,
            task_required_after_snoozes: self.task_required_after_snoozes,
        }
    }

    pub fn is_one_shot(&self) -> bool {
        self.active_days.is_empty()
    }

    /// Time of day and weekday ordinals only.
    pub fn validate_schedule(&self) -> Result<(), ScheduleError> {
        self.time.validate()?;
        if let Some(day) = self.active_days.iter().find(|d| **d > 6) {
            return Err(ScheduleError::invalid(
                "active_days",
                format!("weekday {day} is outside 0-6"),
            ));
        }
        Ok(())
    }

    /// Check time of day, weekday ordinals and snooze interval.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.validate_schedule()?;
        if self.snooze_enabled && self.snooze_interval_minutes == 0 {
            return Err(ScheduleError::invalid(
                "snooze_interval_minutes",
                "must be a positive number of minutes",
            ));
        }
        Ok(())
    }

    /// Full replace from the edit form. Identity and creation time survive.
    pub fn replace_with(&mut self, edited: Alarm) {
        let id = std::mem::take(&mut self.id);
        let created_at = self.created_at;
        *self = edited;
        self.id = id;
        self.created_at = created_at;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Steps,
    MathProblem,
    Photo,
    Hydration,
    Repetitions,
    Reading,
    TimedActivity,
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "steps" | "step_count" => Ok(TaskKind::Steps),
            "math" | "math_problem" | "numeric_problem" => Ok(TaskKind::MathProblem),
            "photo" => Ok(TaskKind::Photo),
            "hydration" | "water" => Ok(TaskKind::Hydration),
            "repetitions" | "reps" => Ok(TaskKind::Repetitions),
            "reading" => Ok(TaskKind::Reading),
            "timed" | "timed_activity" => Ok(TaskKind::TimedActivity),
            other => Err(format!("unknown task kind '{other}'")),
        }
    }
}

/// Numeric goal, or what the photo has to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskTarget {
    Count(u32),
    Description(String),
}

/// How a collaborator reports progress on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaskProgress {
    /// Absolute progress counter.
    Progress(u32),
    Increment(u32),
    /// Pass/fail from a verifier such as object detection.
    Verdict(bool),
    Complete,
}

/// A unit of required post-snooze activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub target: TaskTarget,
    #[serde(default)]
    pub current: u32,
    #[serde(default)]
    pub completed: bool,
}

impl Task {
    pub fn new(kind: TaskKind, target: TaskTarget) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, target)
    }

    pub fn with_id(id: impl Into<TaskId>, kind: TaskKind, target: TaskTarget) -> Self {
        Self {
            id: id.into(),
            kind,
            target,
            current: 0,
            completed: false,
        }
    }

    /// Apply progress. Returns true when this call completed the task.
    ///
    /// `completed` is sticky: nothing here ever sets it back to false.
    pub fn record(&mut self, progress: TaskProgress) -> bool {
        let was_completed = self.completed;
        match progress {
            TaskProgress::Progress(n) => {
                self.current = n;
                self.complete_if_target_reached();
            }
            TaskProgress::Increment(n) => {
                self.current = self.current.saturating_add(n);
                self.complete_if_target_reached();
            }
            TaskProgress::Verdict(passed) => {
                if passed {
                    self.completed = true;
                }
            }
            TaskProgress::Complete => self.completed = true,
        }
        !was_completed && self.completed
    }

    /// Copy with progress cleared, used when a new occurrence starts.
    pub fn fresh(&self) -> Self {
        Self {
            current: 0,
            completed: false,
            ..self.clone()
        }
    }

    fn complete_if_target_reached(&mut self) {
        if let TaskTarget::Count(goal) = self.target {
            if self.current >= goal {
                self.completed = true;
            }
        }
    }
}
