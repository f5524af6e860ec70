//! # WakeyTalky Core Library
//!
//! Alarm scheduling, snooze escalation and the task-gated dismissal that
//! stands between a ringing alarm and going back to sleep. The CLI binary is
//! a thin layer over this crate; a mobile host would be another one.
//!
//! ## Architecture
//!
//! - **Schedule**: pure next-trigger computation over local wall-clock time
//! - **Ring**: per-instance state machine (ringing, snoozed, challenge pending,
//!   dismissed, expired) driven by caller-supplied timestamps
//! - **Gate**: decides whether tasks stand between the user and dismissal
//! - **Storage**: atomic JSON persistence and TOML configuration
//! - **Platform**: traits for notifications, voice and task verification
//!
//! ## Key Components
//!
//! - [`AlarmController`]: owns alarms, live instances, timers and the store
//! - [`AlarmInstance`]: one firing of an alarm and its ring state
//! - [`Config`]: application configuration management
//! - [`Event`]: every transition the controller performs

pub mod alarm;
pub mod controller;
pub mod error;
pub mod events;
pub mod gate;
pub mod platform;
pub mod ring;
pub mod schedule;
pub mod storage;
pub mod timers;

pub use alarm::{Alarm, AlarmId, SnoozePolicy, Task, TaskId, TaskKind, TaskProgress, TaskTarget, TimeOfDay};
pub use controller::AlarmController;
pub use error::{AlarmError, ConfigError, CoreError, PersistenceError, PlatformError, ScheduleError};
pub use events::{Event, EventBus};
pub use platform::{
    LogNotifier, NotificationPlatform, TaskVerifier, TextVoice, TriggerPayload, VoiceCue, VoiceGenerator,
    VoiceMessage,
};
pub use ring::{AlarmInstance, InstanceId, RingState};
pub use storage::{AlarmStore, Config, JsonFileStore, MemoryStore, StoreLock, StoreSnapshot};
pub use timers::TimerFired;
