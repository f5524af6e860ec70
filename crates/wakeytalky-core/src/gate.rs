//! Challenge gate: decides whether a ringing alarm may be dismissed.
//!
//! Tasks become mandatory once `snooze_count >= task_required_after_snoozes`
//! (a threshold of 0 means from the very first ring). The gate only reads
//! the `completed` flag; deciding that a photo shows the right object or that
//! enough steps were walked belongs to whoever reports the progress.

use crate::alarm::{Task, TaskProgress};
use crate::error::AlarmError;
use crate::ring::AlarmInstance;

/// Whether tasks are mandatory for this occurrence yet.
pub fn tasks_required(instance: &AlarmInstance) -> bool {
    instance.snooze_count >= instance.policy.task_required_after_snoozes
}

/// True when dismissal is allowed right now.
pub fn gate_passes(instance: &AlarmInstance) -> bool {
    !tasks_required(instance)
        || instance.task_snapshot.is_empty()
        || instance.task_snapshot.iter().all(|t| t.completed)
}

/// Tasks in the snapshot that are not completed yet, in order.
pub fn pending_tasks(instance: &AlarmInstance) -> Vec<&Task> {
    instance
        .task_snapshot
        .iter()
        .filter(|t| !t.completed)
        .collect()
}

/// Apply progress to one task of the snapshot.
pub fn complete_task<'a>(
    instance: &'a mut AlarmInstance,
    task_id: &str,
    progress: TaskProgress,
) -> Result<&'a Task, AlarmError> {
    let task = instance
        .task_snapshot
        .iter_mut()
        .find(|t| t.id == task_id)
        .ok_or_else(|| AlarmError::UnknownTask(task_id.to_string()))?;
    task.record(progress);
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{Alarm, SnoozePolicy, TaskKind, TaskTarget, TimeOfDay};
    use chrono::{NaiveDate, NaiveDateTime};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(7, 0, 0)
            .unwrap()
    }

    fn instance(threshold: u32, tasks: Vec<Task>) -> AlarmInstance {
        let alarm = Alarm::new("gate", TimeOfDay::new(7, 0).unwrap(), [1])
            .with_policy(SnoozePolicy {
                snooze_enabled: true,
                snooze_interval_minutes: 5,
                max_snooze_count: 5,
                task_required_after_snoozes: threshold,
            })
            .with_tasks(tasks);
        let mut inst = AlarmInstance::from_alarm(&alarm, now());
        inst.trigger(now()).unwrap();
        inst
    }

    fn steps(id: &str) -> Task {
        Task::with_id(id, TaskKind::Steps, TaskTarget::Count(20))
    }

    #[test]
    fn passes_below_threshold() {
        let mut inst = instance(2, vec![steps("1")]);
        assert!(gate_passes(&inst));
        inst.snooze_count = 1;
        assert!(gate_passes(&inst));
        inst.snooze_count = 2;
        assert!(!gate_passes(&inst));
    }

    #[test]
    fn zero_threshold_requires_tasks_immediately() {
        let inst = instance(0, vec![steps("1")]);
        assert!(tasks_required(&inst));
        assert!(!gate_passes(&inst));
    }

    #[test]
    fn empty_snapshot_always_passes() {
        let mut inst = instance(0, vec![]);
        inst.snooze_count = 10;
        assert!(gate_passes(&inst));
    }

    #[test]
    fn all_completed_passes() {
        let mut inst = instance(0, vec![steps("1"), steps("2")]);
        complete_task(&mut inst, "1", TaskProgress::Complete).unwrap();
        assert!(!gate_passes(&inst));
        assert_eq!(pending_tasks(&inst).len(), 1);
        complete_task(&mut inst, "2", TaskProgress::Progress(25)).unwrap();
        assert!(gate_passes(&inst));
        assert!(pending_tasks(&inst).is_empty());
    }

    #[test]
    fn repeated_checks_agree() {
        let inst = instance(0, vec![steps("1")]);
        assert_eq!(gate_passes(&inst), gate_passes(&inst));
    }

    #[test]
    fn unknown_task_is_an_error() {
        let mut inst = instance(0, vec![steps("1")]);
        let err = complete_task(&mut inst, "nope", TaskProgress::Complete).unwrap_err();
        assert_eq!(err, AlarmError::UnknownTask("nope".into()));
        assert!(!inst.tasks()[0].completed);
    }
}
