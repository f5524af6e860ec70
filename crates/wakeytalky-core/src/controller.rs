//! Alarm controller: the explicitly constructed context that owns alarms,
//! live ring instances, the snooze timers and the store.
//!
//! Every operation runs on `&mut self`, so transitions are serialized. Each
//! state change is published on the event bus and saved. A failed save never
//! fails the operation: the in-memory state stays authoritative, the
//! controller is marked dirty and the next mutation (or [`flush`]) retries.
//!
//! Other processes may write the same store. Every mutation holds the store
//! lock, re-reads the store first and adopts it when its revision moved, so
//! a transition always applies to the latest saved state.
//!
//! [`flush`]: AlarmController::flush

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::alarm::{Alarm, AlarmId, TaskProgress, TimeOfDay};
use crate::error::{AlarmError, CoreError, PersistenceError, Result};
use crate::events::{Event, EventBus};
use crate::gate;
use crate::platform::{
    call_bounded, NotificationId, NotificationPlatform, TaskVerifier, TriggerPayload, VoiceCue,
    VoiceGenerator, VoiceMessage,
};
use crate::ring::{AlarmInstance, InstanceId, RingState};
use crate::schedule;
use crate::storage::{AlarmStore, Config, StoreLock, StoreSnapshot};
use crate::timers::{SnoozeTimers, TimerFired};

pub struct AlarmController {
    config: Config,
    alarms: BTreeMap<AlarmId, Alarm>,
    instances: BTreeMap<InstanceId, AlarmInstance>,
    history: Vec<AlarmInstance>,
    store: Arc<dyn AlarmStore>,
    notifier: Arc<dyn NotificationPlatform>,
    voice: Option<Arc<dyn VoiceGenerator>>,
    timers: SnoozeTimers,
    bus: EventBus,
    notifications: HashMap<AlarmId, NotificationId>,
    voice_messages: HashMap<InstanceId, VoiceMessage>,
    /// Store revision the in-memory state was read from or last saved as.
    revision: u64,
    dirty: bool,
}

const LOCK_POLL: Duration = Duration::from_millis(20);

impl AlarmController {
    /// Build a controller. The returned receiver carries snooze timer
    /// firings; feed them back through [`handle_timer`](Self::handle_timer).
    pub fn new(
        config: Config,
        store: Arc<dyn AlarmStore>,
        notifier: Arc<dyn NotificationPlatform>,
    ) -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (timers, timer_rx) = SnoozeTimers::new();
        let controller = Self {
            config,
            alarms: BTreeMap::new(),
            instances: BTreeMap::new(),
            history: Vec::new(),
            store,
            notifier,
            voice: None,
            timers,
            bus: EventBus::default(),
            notifications: HashMap::new(),
            voice_messages: HashMap::new(),
            revision: 0,
            dirty: false,
        };
        (controller, timer_rx)
    }

    pub fn with_voice(mut self, voice: Arc<dyn VoiceGenerator>) -> Self {
        self.voice = Some(voice);
        self
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    pub fn alarm(&self, id: &str) -> Option<&Alarm> {
        self.alarms.get(id)
    }

    pub fn alarms(&self) -> impl Iterator<Item = &Alarm> {
        self.alarms.values()
    }

    pub fn instance(&self, id: &str) -> Option<&AlarmInstance> {
        self.instances
            .get(id)
            .or_else(|| self.history.iter().rev().find(|i| i.id() == id))
    }

    /// Instances that are not dismissed yet, including expired ones.
    pub fn active_instances(&self) -> impl Iterator<Item = &AlarmInstance> {
        self.instances.values()
    }

    pub fn history(&self) -> &[AlarmInstance] {
        &self.history
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.pending()
    }

    /// Next trigger of one alarm, `None` when it is disabled.
    pub fn next_trigger(&self, alarm_id: &str, from: NaiveDateTime) -> Result<Option<NaiveDateTime>> {
        let alarm = self.require_alarm(alarm_id)?;
        if !alarm.enabled {
            return Ok(None);
        }
        Ok(Some(schedule::next_trigger(alarm, from)?))
    }

    /// Earliest trigger across all enabled alarms.
    pub fn next_due(&self, from: NaiveDateTime) -> Option<(AlarmId, NaiveDateTime)> {
        schedule::next_enabled_trigger(self.alarms.values(), from)
    }

    pub fn gate_passes(&self, instance_id: &str) -> Result<bool> {
        let inst = self
            .instances
            .get(instance_id)
            .ok_or_else(|| AlarmError::UnknownInstance(instance_id.to_string()))?;
        Ok(gate::gate_passes(inst))
    }

    /// What the voice collaborator needs for the current ring.
    pub fn voice_cue(&self, instance_id: &str) -> Option<VoiceCue> {
        self.instances.get(instance_id).map(|inst| VoiceCue {
            ring_count: inst.ring_count(),
            snooze_count: inst.snooze_count(),
            escalation_level: inst.escalation_level(),
            alarm_purpose: inst.label().to_string(),
        })
    }

    /// Message generated for the latest ring of an instance.
    pub fn voice_message(&self, instance_id: &str) -> Option<&VoiceMessage> {
        self.voice_messages.get(instance_id)
    }

    /// A new alarm carrying the configured snooze defaults.
    pub fn new_alarm(&self, label: &str, time: TimeOfDay, days: impl IntoIterator<Item = u8>) -> Alarm {
        Alarm::new(label, time, days).with_policy(self.config.alarm_defaults.policy())
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Restore state from the store.
    ///
    /// Expired instances re-enter `Ringing`, overdue snoozes ring now and
    /// pending snoozes get their timers back. Notifications are rescheduled
    /// for every enabled alarm.
    pub async fn load(&mut self, now: NaiveDateTime) -> Result<Vec<Event>> {
        let _lock = self.acquire_lock().await?;
        let snapshot = self.load_bounded().await?;
        info!(
            revision = snapshot.revision,
            alarms = snapshot.alarms.len(),
            instances = snapshot.instances.len(),
            "alarm state loaded"
        );
        self.adopt(snapshot, now);
        self.reschedule_all(now).await;

        let mut events = Vec::new();
        let ids: Vec<InstanceId> = self.instances.keys().cloned().collect();
        for id in ids {
            let Some(inst) = self.instances.get_mut(&id) else {
                continue;
            };
            match inst.state() {
                RingState::Expired => {
                    info!(instance_id = %id, "recovering expired alarm");
                    events.push(inst.recover(now)?);
                }
                RingState::Scheduled => events.push(inst.trigger(now)?),
                RingState::Snoozed => {
                    if inst.snoozed_until().is_some_and(|until| until > now) {
                        continue;
                    }
                    let generation = inst.timer_generation();
                    events.extend(inst.snooze_elapsed(generation, now));
                    self.timers.cancel(&id);
                }
                RingState::Dismissed => {
                    self.archive(&id);
                    self.dirty = true;
                }
                RingState::Ringing | RingState::ChallengePending => {}
            }
        }

        if !events.is_empty() {
            return Ok(self.commit(events).await);
        }
        if self.dirty {
            self.mark_dirty_and_save().await;
        }
        Ok(events)
    }

    /// Pick up whatever another process saved since this one last read or
    /// wrote the store. No-op when nothing changed.
    pub async fn refresh(&mut self, now: NaiveDateTime) -> Result<(), PersistenceError> {
        let _lock = self.begin(now).await?;
        Ok(())
    }

    /// Host is going away: unresolved rings become `Expired` so the next
    /// [`load`](Self::load) re-rings them. Snoozed instances keep their
    /// deadline.
    pub async fn shutdown(&mut self, now: NaiveDateTime) -> Result<Vec<Event>> {
        let lock = self.begin(now).await?;
        let mut events = Vec::new();
        for inst in self.instances.values_mut() {
            if matches!(inst.state(), RingState::Ringing | RingState::ChallengePending) {
                events.push(inst.expire(now)?);
            }
        }
        self.timers.cancel_all();
        let events = self.commit(events).await;
        drop(lock);
        self.flush().await?;
        Ok(events)
    }

    // ── Alarm management ─────────────────────────────────────────────

    pub async fn add_alarm(&mut self, alarm: Alarm, now: NaiveDateTime) -> Result<AlarmId> {
        alarm.validate()?;
        let _lock = self.begin(now).await?;
        let id = alarm.id.clone();
        info!(alarm_id = %id, time = %alarm.time, label = %alarm.label, "alarm added");
        self.alarms.insert(id.clone(), alarm);
        self.sync_notification(&id, now).await;
        self.mark_dirty_and_save().await;
        Ok(id)
    }

    /// Full replace from the edit form. Live instances keep their snapshot.
    pub async fn update_alarm(&mut self, id: &str, edited: Alarm, now: NaiveDateTime) -> Result<()> {
        edited.validate()?;
        let _lock = self.begin(now).await?;
        let alarm = self
            .alarms
            .get_mut(id)
            .ok_or_else(|| AlarmError::UnknownAlarm(id.to_string()))?;
        alarm.replace_with(edited);
        info!(alarm_id = %id, "alarm updated");
        self.sync_notification(id, now).await;
        self.mark_dirty_and_save().await;
        Ok(())
    }

    pub async fn remove_alarm(&mut self, id: &str, now: NaiveDateTime) -> Result<Alarm> {
        let _lock = self.begin(now).await?;
        let alarm = self
            .alarms
            .remove(id)
            .ok_or_else(|| AlarmError::UnknownAlarm(id.to_string()))?;
        self.cancel_notification(id).await;
        info!(alarm_id = %id, "alarm removed");
        self.mark_dirty_and_save().await;
        Ok(alarm)
    }

    pub async fn set_enabled(&mut self, id: &str, enabled: bool, now: NaiveDateTime) -> Result<()> {
        let _lock = self.begin(now).await?;
        let alarm = self
            .alarms
            .get_mut(id)
            .ok_or_else(|| AlarmError::UnknownAlarm(id.to_string()))?;
        if alarm.enabled == enabled {
            return Ok(());
        }
        alarm.enabled = enabled;
        alarm.updated_at = chrono::Utc::now();
        self.sync_notification(id, now).await;
        self.mark_dirty_and_save().await;
        Ok(())
    }

    // ── Ring commands ────────────────────────────────────────────────

    /// Platform callback: a scheduled notification fired.
    ///
    /// Disabled or duplicate triggers are ignored, including a redelivery of
    /// one that was already dismissed. A one-shot alarm disables itself once
    /// it fires.
    pub async fn on_trigger(&mut self, payload: TriggerPayload, now: NaiveDateTime) -> Result<Vec<Event>> {
        let _lock = self.begin(now).await?;
        let alarm = self.require_alarm(&payload.alarm_id)?;
        if !alarm.enabled {
            debug!(alarm_id = %payload.alarm_id, "trigger for disabled alarm ignored");
            return Ok(Vec::new());
        }
        let duplicate = self
            .instances
            .values()
            .chain(self.history.iter())
            .any(|i| i.alarm_id() == payload.alarm_id && i.scheduled_time() == payload.scheduled_time);
        if duplicate {
            debug!(alarm_id = %payload.alarm_id, "duplicate trigger ignored");
            return Ok(Vec::new());
        }

        let mut inst = AlarmInstance::from_alarm(alarm, payload.scheduled_time);
        let event = inst.trigger(now)?;
        let one_shot = alarm.is_one_shot();
        self.instances.insert(inst.id().to_string(), inst);

        if one_shot {
            if let Some(alarm) = self.alarms.get_mut(&payload.alarm_id) {
                alarm.enabled = false;
            }
        }
        let from = payload.scheduled_time.max(now);
        self.sync_notification(&payload.alarm_id, from).await;
        Ok(self.commit(vec![event]).await)
    }

    pub async fn snooze(&mut self, instance_id: &str, now: NaiveDateTime) -> Result<Vec<Event>> {
        let _lock = self.begin(now).await?;
        let inst = self.require_instance_mut(instance_id)?;
        let event = inst.snooze(now)?;
        let generation = inst.timer_generation();
        let delay = Duration::from_secs(inst.policy().snooze_interval_minutes as u64 * 60);
        self.timers.arm(instance_id, generation, delay);
        Ok(self.commit(vec![event]).await)
    }

    /// Platform callback: a snooze timer elapsed. Stale timers are a no-op.
    pub async fn on_snooze_timer_elapsed(
        &mut self,
        instance_id: &str,
        generation: u64,
        now: NaiveDateTime,
    ) -> Result<Vec<Event>> {
        let _lock = self.begin(now).await?;
        let Some(inst) = self.instances.get_mut(instance_id) else {
            debug!(instance_id, "timer for resolved instance dropped");
            return Ok(Vec::new());
        };
        match inst.snooze_elapsed(generation, now) {
            Some(event) => Ok(self.commit(vec![event]).await),
            None => {
                debug!(instance_id, generation, state = %inst.state(), "stale snooze timer dropped");
                Ok(Vec::new())
            }
        }
    }

    pub async fn handle_timer(&mut self, fired: TimerFired, now: NaiveDateTime) -> Result<Vec<Event>> {
        self.on_snooze_timer_elapsed(&fired.instance_id, fired.generation, now)
            .await
    }

    /// Fire every snooze whose deadline has passed. For hosts that cannot
    /// keep timers alive between runs.
    pub async fn poll_due(&mut self, now: NaiveDateTime) -> Result<Vec<Event>> {
        let _lock = self.begin(now).await?;
        let mut events = Vec::new();
        for inst in self.instances.values_mut() {
            if inst.state() != RingState::Snoozed {
                continue;
            }
            if inst.snoozed_until().is_some_and(|until| until <= now) {
                let generation = inst.timer_generation();
                events.extend(inst.snooze_elapsed(generation, now));
            }
        }
        if events.is_empty() {
            return Ok(events);
        }
        Ok(self.commit(events).await)
    }

    /// Dismiss, or move to `ChallengePending` if tasks are still open.
    pub async fn request_dismiss(&mut self, instance_id: &str, now: NaiveDateTime) -> Result<Vec<Event>> {
        let _lock = self.begin(now).await?;
        let inst = self.require_instance_mut(instance_id)?;
        let event = inst.request_dismiss(now)?;
        self.timers.cancel(instance_id);
        Ok(self.commit(vec![event]).await)
    }

    pub async fn complete_task(
        &mut self,
        instance_id: &str,
        task_id: &str,
        progress: TaskProgress,
        now: NaiveDateTime,
    ) -> Result<Vec<Event>> {
        let _lock = self.begin(now).await?;
        self.apply_progress(instance_id, task_id, progress, now).await
    }

    /// Ask a verifier about some evidence and record its verdict.
    pub async fn verify_task(
        &mut self,
        instance_id: &str,
        task_id: &str,
        verifier: &dyn TaskVerifier,
        evidence: &[u8],
        now: NaiveDateTime,
    ) -> Result<Vec<Event>> {
        let _lock = self.begin(now).await?;
        let inst = self.require_instance_mut(instance_id)?;
        let task = inst
            .tasks()
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| AlarmError::UnknownTask(task_id.to_string()))?;
        let verdict = verifier.verify(task, evidence);
        debug!(instance_id, task_id, verdict, "task verified");
        self.apply_progress(instance_id, task_id, TaskProgress::Verdict(verdict), now)
            .await
    }

    // ── Persistence ──────────────────────────────────────────────────

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            version: crate::storage::store::STORE_VERSION,
            revision: self.revision,
            alarms: self.alarms.clone(),
            instances: self.instances.clone(),
            history: self.history.clone(),
        }
    }

    /// Save if anything changed since the last successful save, retrying
    /// with exponential backoff.
    ///
    /// Refuses with [`PersistenceError::Conflict`] when another process saved
    /// in the meantime; the next mutation adopts that state instead.
    pub async fn flush(&mut self) -> Result<(), PersistenceError> {
        if !self.dirty {
            return Ok(());
        }
        let _lock = self.acquire_lock().await?;
        let found = self.load_bounded().await?.revision;
        if found != self.revision {
            return Err(PersistenceError::Conflict {
                expected: self.revision,
                found,
            });
        }
        self.save_locked().await
    }

    /// Save with retries. Callers hold the store lock.
    async fn save_locked(&mut self) -> Result<(), PersistenceError> {
        let mut snapshot = self.snapshot();
        snapshot.revision = self.revision + 1;
        let attempts = self.config.storage.save_retries.max(1);
        let mut attempt = 0;
        loop {
            match self.save_bounded(snapshot.clone()).await {
                Ok(()) => {
                    self.revision = snapshot.revision;
                    self.dirty = false;
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(PersistenceError::RetriesExhausted {
                            attempts,
                            last: Box::new(e),
                        });
                    }
                    let backoff = self.config.storage.backoff(attempt - 1);
                    warn!(attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "save failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn save_bounded(&self, snapshot: StoreSnapshot) -> Result<(), PersistenceError> {
        let store = Arc::clone(&self.store);
        let timeout = self.config.storage.io_timeout();
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || store.save(&snapshot))).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(PersistenceError::Join(join.to_string())),
            Err(_) => Err(PersistenceError::Timeout {
                ms: self.config.storage.io_timeout_ms,
            }),
        }
    }

    async fn load_bounded(&self) -> Result<StoreSnapshot, PersistenceError> {
        let store = Arc::clone(&self.store);
        let timeout = self.config.storage.io_timeout();
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || store.load())).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(PersistenceError::Join(join.to_string())),
            Err(_) => Err(PersistenceError::Timeout {
                ms: self.config.storage.io_timeout_ms,
            }),
        }
    }

    /// Take the store lock, waiting up to the I/O timeout for other holders.
    async fn acquire_lock(&self) -> Result<StoreLock, PersistenceError> {
        let timeout = self.config.storage.io_timeout();
        let started = tokio::time::Instant::now();
        loop {
            let store = Arc::clone(&self.store);
            let attempt = tokio::task::spawn_blocking(move || store.try_lock())
                .await
                .map_err(|join| PersistenceError::Join(join.to_string()))?;
            if let Some(lock) = attempt? {
                return Ok(lock);
            }
            if started.elapsed() >= timeout {
                return Err(PersistenceError::Timeout {
                    ms: self.config.storage.io_timeout_ms,
                });
            }
            debug!("alarm state locked by another process, waiting");
            tokio::time::sleep(LOCK_POLL).await;
        }
    }

    /// Lock the store and catch up with it before a mutation.
    async fn begin(&mut self, now: NaiveDateTime) -> Result<StoreLock, PersistenceError> {
        let lock = self.acquire_lock().await?;
        let snapshot = self.load_bounded().await?;
        if snapshot.revision != self.revision {
            if self.dirty {
                warn!(
                    ours = self.revision,
                    theirs = snapshot.revision,
                    "unsaved alarm state superseded by another writer"
                );
            }
            debug!(from = self.revision, to = snapshot.revision, "adopting alarm state from store");
            let alarms_changed = snapshot.alarms != self.alarms;
            self.adopt(snapshot, now);
            if alarms_changed {
                self.reschedule_all(now).await;
            }
        }
        Ok(lock)
    }

    /// Replace in-memory state with a stored snapshot and re-arm snooze
    /// timers to match it. Overdue snoozes fire right away.
    fn adopt(&mut self, snapshot: StoreSnapshot, now: NaiveDateTime) {
        self.revision = snapshot.revision;
        self.alarms = snapshot.alarms;
        self.instances = snapshot.instances;
        self.history = snapshot.history;
        self.dirty = false;

        let instances = &self.instances;
        self.voice_messages.retain(|id, _| instances.contains_key(id));
        self.timers.cancel_all();
        for inst in self.instances.values() {
            if inst.state() != RingState::Snoozed {
                continue;
            }
            let delay = inst
                .snoozed_until()
                .and_then(|until| (until - now).to_std().ok())
                .unwrap_or_default();
            self.timers.arm(inst.id(), inst.timer_generation(), delay);
        }
    }

    async fn mark_dirty_and_save(&mut self) {
        self.dirty = true;
        if let Err(e) = self.save_locked().await {
            warn!(error = %e, "alarm state not saved; keeping in-memory state");
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Publish, archive and save the result of a transition.
    async fn commit(&mut self, events: Vec<Event>) -> Vec<Event> {
        for event in &events {
            match event {
                Event::Rang {
                    instance_id,
                    ring_count,
                    escalation_level,
                    ..
                } => {
                    info!(%instance_id, ring_count, escalation_level, "alarm ringing");
                    self.generate_voice(instance_id).await;
                }
                Event::Snoozed {
                    instance_id,
                    snooze_count,
                    until,
                    ..
                } => info!(%instance_id, snooze_count, %until, "alarm snoozed"),
                Event::ChallengeRequired {
                    instance_id,
                    pending_tasks,
                    ..
                } => info!(%instance_id, pending = pending_tasks.len(), "challenge required"),
                Event::TaskProgressed {
                    instance_id,
                    task_id,
                    completed,
                    ..
                } => debug!(%instance_id, %task_id, completed, "task progressed"),
                Event::Dismissed { instance_id, .. } => {
                    info!(%instance_id, "alarm dismissed");
                    self.archive(instance_id);
                }
                Event::Expired { instance_id, .. } => warn!(%instance_id, "alarm expired unresolved"),
            }
            self.bus.publish(event.clone());
        }
        self.mark_dirty_and_save().await;
        events
    }

    fn archive(&mut self, instance_id: &str) {
        self.timers.cancel(instance_id);
        self.voice_messages.remove(instance_id);
        if let Some(done) = self.instances.remove(instance_id) {
            self.history.push(done);
        }
        let limit = self.config.storage.history_limit;
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }

    async fn apply_progress(
        &mut self,
        instance_id: &str,
        task_id: &str,
        progress: TaskProgress,
        now: NaiveDateTime,
    ) -> Result<Vec<Event>> {
        let inst = self.require_instance_mut(instance_id)?;
        let events = inst.complete_task(task_id, progress, now)?;
        Ok(self.commit(events).await)
    }

    async fn generate_voice(&mut self, instance_id: &str) {
        let (Some(voice), Some(cue)) = (self.voice.clone(), self.voice_cue(instance_id)) else {
            return;
        };
        let timeout = self.config.platform.call_timeout();
        match call_bounded(timeout, move || voice.generate(&cue)).await {
            Ok(message) => {
                self.voice_messages.insert(instance_id.to_string(), message);
            }
            Err(e) => warn!(instance_id, error = %e, "voice generation failed"),
        }
    }

    /// Make the platform's pending notification match the alarm's next trigger.
    async fn sync_notification(&mut self, alarm_id: &str, from: NaiveDateTime) {
        self.cancel_notification(alarm_id).await;
        let Some(alarm) = self.alarms.get(alarm_id) else {
            return;
        };
        if !alarm.enabled {
            return;
        }
        let at = match schedule::next_trigger(alarm, from) {
            Ok(at) => at,
            Err(e) => {
                warn!(alarm_id, error = %e, "alarm cannot be scheduled");
                return;
            }
        };
        let payload = TriggerPayload {
            alarm_id: alarm_id.to_string(),
            scheduled_time: at,
        };
        let notifier = Arc::clone(&self.notifier);
        let timeout = self.config.platform.call_timeout();
        match call_bounded(timeout, move || notifier.schedule_at(at, &payload)).await {
            Ok(notification_id) => {
                debug!(alarm_id, %at, %notification_id, "notification scheduled");
                self.notifications.insert(alarm_id.to_string(), notification_id);
            }
            Err(e) => warn!(alarm_id, error = %e, "failed to schedule notification"),
        }
    }

    async fn cancel_notification(&mut self, alarm_id: &str) {
        let Some(notification_id) = self.notifications.remove(alarm_id) else {
            return;
        };
        let notifier = Arc::clone(&self.notifier);
        let timeout = self.config.platform.call_timeout();
        let id = notification_id.clone();
        if let Err(e) = call_bounded(timeout, move || notifier.cancel(&id)).await {
            warn!(alarm_id, %notification_id, error = %e, "failed to cancel notification");
        }
    }

    async fn reschedule_all(&mut self, now: NaiveDateTime) {
        let gone: Vec<AlarmId> = self
            .notifications
            .keys()
            .filter(|id| !self.alarms.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            self.cancel_notification(&id).await;
        }
        let ids: Vec<AlarmId> = self.alarms.keys().cloned().collect();
        for id in ids {
            self.sync_notification(&id, now).await;
        }
    }

    fn require_alarm(&self, id: &str) -> Result<&Alarm, CoreError> {
        self.alarms
            .get(id)
            .ok_or_else(|| AlarmError::UnknownAlarm(id.to_string()).into())
    }

    fn require_instance_mut(&mut self, id: &str) -> Result<&mut AlarmInstance, CoreError> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| AlarmError::UnknownInstance(id.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{SnoozePolicy, Task, TaskKind, TaskTarget};
    use crate::platform::testing::{FixedVerifier, RecordingNotifier, ScriptedVoice};
    use crate::storage::MemoryStore;
    use chrono::{Duration, NaiveDate};

    fn monday(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.storage.retry_backoff_ms = 1;
        config.storage.io_timeout_ms = 3_600_000;
        config.platform.call_timeout_ms = 3_600_000;
        config
    }

    struct Harness {
        controller: AlarmController,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let (controller, _rx) = AlarmController::new(test_config(), store.clone(), notifier.clone());
        Harness {
            controller,
            store,
            notifier,
        }
    }

    fn work_alarm(tasks: Vec<Task>) -> Alarm {
        Alarm::new("work", TimeOfDay::new(7, 0).unwrap(), [1, 3, 5])
            .with_policy(SnoozePolicy {
                snooze_enabled: true,
                snooze_interval_minutes: 5,
                max_snooze_count: 3,
                task_required_after_snoozes: 2,
            })
            .with_tasks(tasks)
    }

    async fn ring(h: &mut Harness, alarm_id: &str, at: NaiveDateTime) -> InstanceId {
        let events = h
            .controller
            .on_trigger(
                TriggerPayload {
                    alarm_id: alarm_id.to_string(),
                    scheduled_time: at,
                },
                at,
            )
            .await
            .unwrap();
        events[0].instance_id().to_string()
    }

    #[tokio::test]
    async fn add_alarm_schedules_notification_and_saves() {
        let mut h = harness();
        let id = h
            .controller
            .add_alarm(work_alarm(vec![]), monday(6, 0))
            .await
            .unwrap();
        assert_eq!(h.notifier.active_for(&id), Some(monday(7, 0)));
        assert_eq!(h.store.save_count(), 1);
        assert!(!h.controller.is_dirty());
    }

    #[tokio::test]
    async fn invalid_alarm_is_rejected() {
        let mut h = harness();
        let mut alarm = work_alarm(vec![]);
        alarm.active_days.insert(8);
        let err = h.controller.add_alarm(alarm, monday(6, 0)).await.unwrap_err();
        assert!(matches!(err, CoreError::Schedule(_)));
        assert_eq!(h.controller.alarms().count(), 0);
    }

    #[tokio::test]
    async fn disable_cancels_notification() {
        let mut h = harness();
        let id = h
            .controller
            .add_alarm(work_alarm(vec![]), monday(6, 0))
            .await
            .unwrap();
        h.controller.set_enabled(&id, false, monday(6, 0)).await.unwrap();
        assert_eq!(h.notifier.active_for(&id), None);
        assert_eq!(h.controller.next_trigger(&id, monday(6, 0)).unwrap(), None);

        h.controller.set_enabled(&id, true, monday(8, 0)).await.unwrap();
        assert_eq!(h.notifier.active_for(&id), Some(monday(7, 0) + Duration::days(2)));
    }

    #[tokio::test]
    async fn trigger_reschedules_next_occurrence() {
        let mut h = harness();
        let id = h
            .controller
            .add_alarm(work_alarm(vec![]), monday(6, 0))
            .await
            .unwrap();
        let inst = ring(&mut h, &id, monday(7, 0)).await;
        assert_eq!(h.controller.instance(&inst).unwrap().state(), RingState::Ringing);
        assert_eq!(h.notifier.active_for(&id), Some(monday(7, 0) + Duration::days(2)));

        // Same trigger delivered twice.
        let again = h
            .controller
            .on_trigger(
                TriggerPayload {
                    alarm_id: id.clone(),
                    scheduled_time: monday(7, 0),
                },
                monday(7, 0),
            )
            .await
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(h.controller.active_instances().count(), 1);
    }

    #[tokio::test]
    async fn redelivered_trigger_after_dismiss_is_ignored() {
        let mut h = harness();
        let id = h
            .controller
            .add_alarm(work_alarm(vec![]), monday(6, 0))
            .await
            .unwrap();
        let inst = ring(&mut h, &id, monday(7, 0)).await;
        h.controller.request_dismiss(&inst, monday(7, 1)).await.unwrap();

        let payload = TriggerPayload {
            alarm_id: id.clone(),
            scheduled_time: monday(7, 0),
        };
        let again = h.controller.on_trigger(payload, monday(7, 2)).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(h.controller.active_instances().count(), 0);
        assert_eq!(h.controller.history().len(), 1);
    }

    #[tokio::test]
    async fn one_shot_disables_itself() {
        let mut h = harness();
        let alarm = Alarm::new("nap", TimeOfDay::new(14, 0).unwrap(), []);
        let id = h.controller.add_alarm(alarm, monday(13, 0)).await.unwrap();
        ring(&mut h, &id, monday(14, 0)).await;
        assert!(!h.controller.alarm(&id).unwrap().enabled);
        assert_eq!(h.notifier.active_for(&id), None);
    }

    #[tokio::test]
    async fn dismissed_instances_move_to_history() {
        let mut h = harness();
        let id = h
            .controller
            .add_alarm(work_alarm(vec![]), monday(6, 0))
            .await
            .unwrap();
        let inst = ring(&mut h, &id, monday(7, 0)).await;
        h.controller.request_dismiss(&inst, monday(7, 1)).await.unwrap();
        assert_eq!(h.controller.active_instances().count(), 0);
        assert_eq!(h.controller.history().len(), 1);
        assert_eq!(h.controller.instance(&inst).unwrap().state(), RingState::Dismissed);
        assert!(matches!(
            h.controller.snooze(&inst, monday(7, 2)).await,
            Err(CoreError::Alarm(AlarmError::UnknownInstance(_)))
        ));
    }

    #[tokio::test]
    async fn history_is_capped() {
        let mut h = harness();
        h.controller.config.storage.history_limit = 2;
        let id = h
            .controller
            .add_alarm(work_alarm(vec![]), monday(6, 0))
            .await
            .unwrap();
        for week in 0..3 {
            let at = monday(7, 0) + Duration::weeks(week);
            let inst = ring(&mut h, &id, at).await;
            h.controller.request_dismiss(&inst, at).await.unwrap();
        }
        assert_eq!(h.controller.history().len(), 2);
        assert_eq!(h.controller.history()[0].scheduled_time(), monday(7, 0) + Duration::weeks(1));
    }

    #[tokio::test]
    async fn load_archives_leftover_dismissed_instances_within_limit() {
        let mut h = harness();
        h.controller.config.storage.history_limit = 2;
        let alarm = work_alarm(vec![]);
        let resolved = |week: i64| {
            let at = monday(7, 0) + Duration::weeks(week);
            let mut inst = AlarmInstance::from_alarm(&alarm, at);
            inst.trigger(at).unwrap();
            inst.request_dismiss(at).unwrap();
            inst
        };
        let mut seeded = StoreSnapshot::default();
        seeded.history = vec![resolved(0), resolved(1)];
        let leftover = resolved(2);
        let leftover_id = leftover.id().to_string();
        seeded.instances.insert(leftover_id.clone(), leftover);
        seeded.alarms.insert(alarm.id.clone(), alarm);
        h.store.save(&seeded).unwrap();

        let events = h.controller.load(monday(8, 0)).await.unwrap();
        assert!(events.is_empty());
        assert_eq!(h.controller.active_instances().count(), 0);
        assert_eq!(h.controller.history().len(), 2);
        assert_eq!(h.controller.history()[1].id(), leftover_id);

        let stored = h.store.load().unwrap();
        assert!(stored.instances.is_empty());
        assert_eq!(stored.history.len(), 2);
        assert_eq!(stored.history[0].scheduled_time(), monday(7, 0) + Duration::weeks(1));
        assert!(!h.controller.is_dirty());
    }

    #[tokio::test]
    async fn flush_refuses_to_overwrite_newer_state() {
        let mut h = harness();
        h.store.fail_next_saves(10);
        h.controller
            .add_alarm(work_alarm(vec![]), monday(6, 0))
            .await
            .unwrap();
        assert!(h.controller.is_dirty());

        // Someone else saved in the meantime.
        let theirs = StoreSnapshot {
            revision: 7,
            ..StoreSnapshot::default()
        };
        h.store.fail_next_saves(0);
        h.store.save(&theirs).unwrap();

        assert!(matches!(
            h.controller.flush().await,
            Err(PersistenceError::Conflict { expected: 0, found: 7 })
        ));
        h.controller.refresh(monday(6, 1)).await.unwrap();
        assert_eq!(h.controller.alarms().count(), 0);
        assert!(!h.controller.is_dirty());
    }

    #[tokio::test]
    async fn save_failure_keeps_memory_state_and_retries() {
        let mut h = harness();
        h.store.fail_next_saves(2);
        let id = h
            .controller
            .add_alarm(work_alarm(vec![]), monday(6, 0))
            .await
            .unwrap();
        // Third attempt succeeded.
        assert!(!h.controller.is_dirty());
        assert_eq!(h.store.load().unwrap().alarms.len(), 1);

        h.store.fail_next_saves(10);
        h.controller.set_enabled(&id, false, monday(6, 0)).await.unwrap();
        assert!(h.controller.is_dirty());
        assert!(!h.controller.alarm(&id).unwrap().enabled);
        assert!(matches!(
            h.controller.flush().await,
            Err(PersistenceError::RetriesExhausted { attempts: 3, .. })
        ));

        h.store.fail_next_saves(0);
        h.controller.flush().await.unwrap();
        assert!(!h.store.load().unwrap().alarms[&id].enabled);
    }

    #[tokio::test]
    async fn voice_follows_escalation() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let voice = Arc::new(ScriptedVoice::new());
        let (controller, _rx) = AlarmController::new(test_config(), store.clone(), notifier.clone());
        let mut h = Harness {
            controller: controller.with_voice(voice.clone()),
            store,
            notifier,
        };
        let id = h
            .controller
            .add_alarm(work_alarm(vec![]), monday(6, 0))
            .await
            .unwrap();
        let inst = ring(&mut h, &id, monday(7, 0)).await;
        h.controller.snooze(&inst, monday(7, 0)).await.unwrap();
        let generation = h.controller.instance(&inst).unwrap().timer_generation();
        h.controller
            .on_snooze_timer_elapsed(&inst, generation, monday(7, 5))
            .await
            .unwrap();

        let cues = voice.cues();
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[1].ring_count, 2);
        assert_eq!(cues[1].snooze_count, 1);
        assert_eq!(cues[1].alarm_purpose, "work");
        assert_eq!(
            h.controller.voice_message(&inst).unwrap().body,
            b"level 2".to_vec()
        );
    }

    #[tokio::test]
    async fn verifier_verdict_completes_photo_task() {
        let mut h = harness();
        let photo = Task::with_id("p", TaskKind::Photo, TaskTarget::Description("toothbrush".into()));
        let mut alarm = work_alarm(vec![photo]);
        alarm.task_required_after_snoozes = 0;
        let id = h.controller.add_alarm(alarm, monday(6, 0)).await.unwrap();
        let inst = ring(&mut h, &id, monday(7, 0)).await;

        let events = h.controller.request_dismiss(&inst, monday(7, 1)).await.unwrap();
        assert!(matches!(events[0], Event::ChallengeRequired { .. }));
        assert!(!h.controller.gate_passes(&inst).unwrap());

        h.controller
            .verify_task(&inst, "p", &FixedVerifier(false), b"blurry", monday(7, 2))
            .await
            .unwrap();
        assert_eq!(
            h.controller.instance(&inst).unwrap().state(),
            RingState::ChallengePending
        );

        let events = h
            .controller
            .verify_task(&inst, "p", &FixedVerifier(true), b"sharp", monday(7, 3))
            .await
            .unwrap();
        assert!(matches!(events.last(), Some(Event::Dismissed { .. })));
        // The template is untouched.
        assert!(!h.controller.alarm(&id).unwrap().tasks[0].completed);
    }

    #[tokio::test]
    async fn edits_do_not_touch_live_instance() {
        let mut h = harness();
        let id = h
            .controller
            .add_alarm(work_alarm(vec![]), monday(6, 0))
            .await
            .unwrap();
        let inst = ring(&mut h, &id, monday(7, 0)).await;

        let mut edited = work_alarm(vec![]);
        edited.max_snooze_count = 0;
        h.controller.update_alarm(&id, edited, monday(7, 0)).await.unwrap();
        assert_eq!(h.controller.alarm(&id).unwrap().max_snooze_count, 0);
        h.controller.snooze(&inst, monday(7, 0)).await.unwrap();
    }

    #[tokio::test]
    async fn notifier_outage_does_not_fail_add() {
        let mut h = harness();
        h.notifier.set_unavailable(true);
        let id = h
            .controller
            .add_alarm(work_alarm(vec![]), monday(6, 0))
            .await
            .unwrap();
        assert!(h.controller.alarm(&id).is_some());
        assert!(h.notifier.scheduled().is_empty());
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let mut h = harness();
        let mut rx = h.controller.subscribe();
        let id = h
            .controller
            .add_alarm(work_alarm(vec![]), monday(6, 0))
            .await
            .unwrap();
        ring(&mut h, &id, monday(7, 0)).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "rang");
    }
}
