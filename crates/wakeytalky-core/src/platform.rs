//! Collaborators the alarm core talks to but does not implement.
//!
//! The push/notification platform, the voice generator and the camera-based
//! task verifier all live outside this crate. Each is a trait here with a
//! small implementation for the CLI and test doubles under [`testing`].

use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::alarm::{AlarmId, Task};
use crate::error::PlatformError;

pub type NotificationId = String;

/// What the platform hands back when a scheduled notification fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub alarm_id: AlarmId,
    pub scheduled_time: NaiveDateTime,
}

/// OS notification / timer service.
pub trait NotificationPlatform: Send + Sync {
    fn name(&self) -> &str;

    fn schedule_at(
        &self,
        at: NaiveDateTime,
        payload: &TriggerPayload,
    ) -> Result<NotificationId, PlatformError>;

    fn cancel(&self, id: &str) -> Result<(), PlatformError>;
}

/// Inputs for the wake-up message of one ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceCue {
    pub ring_count: u32,
    pub snooze_count: u32,
    pub escalation_level: u8,
    pub alarm_purpose: String,
}

/// Opaque playable message. The core never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceMessage {
    pub content_type: String,
    pub body: Vec<u8>,
}

pub trait VoiceGenerator: Send + Sync {
    fn generate(&self, cue: &VoiceCue) -> Result<VoiceMessage, PlatformError>;
}

/// Decides whether evidence (for example a photo) satisfies a task.
pub trait TaskVerifier: Send + Sync {
    fn verify(&self, task: &Task, evidence: &[u8]) -> bool;
}

/// Run a blocking collaborator call with a deadline.
pub(crate) async fn call_bounded<T, F>(timeout: Duration, call: F) -> Result<T, PlatformError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PlatformError> + Send + 'static,
{
    let ms = timeout.as_millis() as u64;
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(call)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(PlatformError::Unavailable(join.to_string())),
        Err(_) => Err(PlatformError::Timeout { ms }),
    }
}

/// Notification platform that only logs. Used by the CLI daemon, which does
/// its own trigger timing.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl NotificationPlatform for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn schedule_at(
        &self,
        at: NaiveDateTime,
        payload: &TriggerPayload,
    ) -> Result<NotificationId, PlatformError> {
        info!(alarm_id = %payload.alarm_id, %at, "alarm scheduled");
        Ok(format!("{}@{}", payload.alarm_id, at.format("%Y-%m-%dT%H:%M")))
    }

    fn cancel(&self, id: &str) -> Result<(), PlatformError> {
        info!(notification_id = id, "alarm notification cancelled");
        Ok(())
    }
}

/// Voice generator that produces a plain-text script instead of audio.
#[derive(Debug, Default)]
pub struct TextVoice;

impl VoiceGenerator for TextVoice {
    fn generate(&self, cue: &VoiceCue) -> Result<VoiceMessage, PlatformError> {
        let purpose = if cue.alarm_purpose.is_empty() {
            "your day"
        } else {
            cue.alarm_purpose.as_str()
        };
        let urgency = match cue.escalation_level {
            0..=1 => "Good morning",
            2..=3 => "Time to get up",
            4..=5 => "Seriously, get up",
            _ => "WAKE UP NOW",
        };
        let body = format!(
            "{urgency}! It's time for {purpose}. Ring {} after {} snoozes.",
            cue.ring_count, cue.snooze_count
        );
        Ok(VoiceMessage {
            content_type: "text/plain".into(),
            body: body.into_bytes(),
        })
    }
}

/// Test doubles for the collaborator traits.
pub mod testing {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Records every schedule/cancel call. Can be switched to fail.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        scheduled: Mutex<Vec<(NotificationId, NaiveDateTime, TriggerPayload)>>,
        cancelled: Mutex<Vec<NotificationId>>,
        next_id: AtomicU64,
        unavailable: AtomicBool,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        pub fn scheduled(&self) -> Vec<(NotificationId, NaiveDateTime, TriggerPayload)> {
            self.scheduled.lock().map(|s| s.clone()).unwrap_or_default()
        }

        /// Most recent instant scheduled for an alarm that was not cancelled since.
        pub fn active_for(&self, alarm_id: &str) -> Option<NaiveDateTime> {
            let cancelled = self.cancelled();
            self.scheduled()
                .into_iter()
                .rev()
                .find(|(id, _, p)| p.alarm_id == alarm_id && !cancelled.contains(id))
                .map(|(_, at, _)| at)
        }

        pub fn cancelled(&self) -> Vec<NotificationId> {
            self.cancelled.lock().map(|c| c.clone()).unwrap_or_default()
        }

        fn check(&self) -> Result<(), PlatformError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(PlatformError::Unavailable("recording notifier offline".into()));
            }
            Ok(())
        }
    }

    impl NotificationPlatform for RecordingNotifier {
        fn name(&self) -> &str {
            "recording"
        }

        fn schedule_at(
            &self,
            at: NaiveDateTime,
            payload: &TriggerPayload,
        ) -> Result<NotificationId, PlatformError> {
            self.check()?;
            let id = format!("n-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            if let Ok(mut scheduled) = self.scheduled.lock() {
                scheduled.push((id.clone(), at, payload.clone()));
            }
            Ok(id)
        }

        fn cancel(&self, id: &str) -> Result<(), PlatformError> {
            self.check()?;
            if let Ok(mut cancelled) = self.cancelled.lock() {
                cancelled.push(id.to_string());
            }
            Ok(())
        }
    }

    /// Remembers the cues it was asked for and answers with a fixed body.
    #[derive(Debug, Default)]
    pub struct ScriptedVoice {
        cues: Mutex<Vec<VoiceCue>>,
    }

    impl ScriptedVoice {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn cues(&self) -> Vec<VoiceCue> {
            self.cues.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    impl VoiceGenerator for ScriptedVoice {
        fn generate(&self, cue: &VoiceCue) -> Result<VoiceMessage, PlatformError> {
            if let Ok(mut cues) = self.cues.lock() {
                cues.push(cue.clone());
            }
            Ok(VoiceMessage {
                content_type: "text/plain".into(),
                body: format!("level {}", cue.escalation_level).into_bytes(),
            })
        }
    }

    /// Always returns the same verdict.
    #[derive(Debug, Clone, Copy)]
    pub struct FixedVerifier(pub bool);

    impl TaskVerifier for FixedVerifier {
        fn verify(&self, _task: &Task, _evidence: &[u8]) -> bool {
            self.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use chrono::NaiveDate;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(7, 0, 0)
            .unwrap()
    }

    #[test]
    fn text_voice_escalates() {
        let voice = TextVoice;
        let calm = voice
            .generate(&VoiceCue {
                ring_count: 1,
                snooze_count: 0,
                escalation_level: 1,
                alarm_purpose: "gym".into(),
            })
            .unwrap();
        let loud = voice
            .generate(&VoiceCue {
                ring_count: 7,
                snooze_count: 6,
                escalation_level: 7,
                alarm_purpose: String::new(),
            })
            .unwrap();
        let calm = String::from_utf8(calm.body).unwrap();
        let loud = String::from_utf8(loud.body).unwrap();
        assert!(calm.starts_with("Good morning"));
        assert!(calm.contains("gym"));
        assert!(loud.starts_with("WAKE UP NOW"));
    }

    #[test]
    fn recording_notifier_tracks_active() {
        let notifier = RecordingNotifier::new();
        let payload = TriggerPayload {
            alarm_id: "a".into(),
            scheduled_time: at(),
        };
        let id = notifier.schedule_at(at(), &payload).unwrap();
        assert_eq!(notifier.active_for("a"), Some(at()));
        notifier.cancel(&id).unwrap();
        assert_eq!(notifier.active_for("a"), None);

        notifier.set_unavailable(true);
        assert!(notifier.schedule_at(at(), &payload).is_err());
    }

    #[tokio::test]
    async fn bounded_call_times_out() {
        let result: Result<(), PlatformError> = call_bounded(Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        })
        .await;
        assert_eq!(result, Err(PlatformError::Timeout { ms: 20 }));

        let ok = call_bounded(Duration::from_secs(1), || Ok(5)).await;
        assert_eq!(ok, Ok(5));
    }
}
