mod memory;
mod sqlite;

pub use memory::*;
pub use sqlite::*;

use crate::messaging::{StatusSet, StatusUpdate, Task, TaskId, TaskStatus};
use chrono::{DateTime, Utc};

/// Failures surfaced by a task store.
///
/// `DuplicateTask` and `NotFound` are user-visible conditions on the control
/// path; `NotFound` is expected (and tolerated) on the event path where a
/// purge can race a late status report. `Storage` is a backend fault and is
/// fatal when hit during startup.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task \"{0}\" already exists")]
    DuplicateTask(TaskId),

    #[error("task \"{0}\" not found")]
    NotFound(TaskId),

    #[error("task store failure: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Durable CRUD and querying over task records.
///
/// A store knows nothing about scheduling policy; it answers the questions
/// the scheduler asks ("what is due", "what can be purged") and applies the
/// one rule that protects record integrity: a status update never downgrades
/// a canceled or aborted task back toward a running state.
///
/// There is a single writer, the scheduler process. The worker pool never
/// touches the store; it reports through status events.
pub trait TaskStore: Send {
    /// Initialize backing storage. Idempotent.
    fn bootstrap(&mut self) -> Result<(), StoreError>;

    /// Insert a new record; the id must not already exist.
    fn insert(&mut self, task: &Task) -> Result<(), StoreError>;

    fn get(&mut self, id: &TaskId) -> Result<Task, StoreError>;

    /// Replace a record wholesale. This is the scheduler's re-arm path and
    /// is not subject to the sticky-status rule.
    fn update(&mut self, task: &Task) -> Result<(), StoreError>;

    /// Apply a status update message, honoring the sticky-status rule.
    /// Returns whether the update was applied.
    fn update_status(&mut self, update: &StatusUpdate) -> Result<bool, StoreError>;

    fn delete(&mut self, id: &TaskId) -> Result<(), StoreError>;

    fn exists(&mut self, id: &TaskId) -> Result<bool, StoreError>;

    fn list(&mut self) -> Result<Vec<Task>, StoreError>;

    /// Tasks in one of `statuses` that are ready for action: due to start
    /// (`redo = false`) or due for re-arming (`redo = true`).
    fn list_to_do(
        &mut self,
        statuses: StatusSet,
        now: DateTime<Utc>,
        redo: bool,
    ) -> Result<Vec<Task>, StoreError>;

    fn count_by_status(&mut self, statuses: StatusSet) -> Result<usize, StoreError>;

    /// Delete terminal records past their expiry grace period. Returns how
    /// many were removed.
    fn purge(&mut self, statuses: StatusSet, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Reclaim backing storage. Called on a slow cadence, never on the
    /// request path.
    fn vacuum(&mut self) -> Result<(), StoreError>;

    /// Fail every task stranded in a non-terminal state by an unclean
    /// shutdown, so it becomes eligible for redo or purge instead of being
    /// stuck forever. Returns the ids that were recovered.
    fn recover(&mut self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError>;

    /// Delete everything. Administrative reset; requires the scheduler to be
    /// stopped.
    fn flush(&mut self) -> Result<usize, StoreError>;
}

/// Shared transition logic for `update_status` implementations.
///
/// Canceled records never change again through this path. Aborted records
/// accept only a cancel on top (an operator ending a repeating series whose
/// last run was killed). Everything else applies, with `None` fields keeping
/// their stored values.
pub(crate) fn apply_status_update(task: &mut Task, update: &StatusUpdate) -> bool {
    if task.status.is_sticky()
        && !(task.status == TaskStatus::Aborted && update.status == TaskStatus::Canceled)
    {
        return false;
    }

    task.status = update.status;
    if let Some(output) = &update.output {
        task.output = Some(output.clone());
    }
    if let Some(stop) = update.stop_datetime {
        task.stop_datetime = Some(stop);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::TaskSpec;
    use serde_json::json;

    fn task_with_status(status: TaskStatus) -> Task {
        let mut task = Task::from_spec(TaskSpec::new("echo", json!(null)), Utc::now());
        task.status = status;
        task
    }

    #[test]
    fn canceled_is_never_downgraded() {
        let mut task = task_with_status(TaskStatus::Canceled);
        let done = StatusUpdate::new(task.id.clone(), TaskStatus::Done)
            .with_output(json!("late result"))
            .stopped_at(Utc::now());

        assert!(!apply_status_update(&mut task, &done));
        assert_eq!(task.status, TaskStatus::Canceled);
        assert!(task.output.is_none());
    }

    #[test]
    fn aborted_accepts_only_cancel() {
        let mut task = task_with_status(TaskStatus::Aborted);

        let doing = StatusUpdate::new(task.id.clone(), TaskStatus::Doing);
        assert!(!apply_status_update(&mut task, &doing));
        assert_eq!(task.status, TaskStatus::Aborted);

        let cancel = StatusUpdate::new(task.id.clone(), TaskStatus::Canceled);
        assert!(apply_status_update(&mut task, &cancel));
        assert_eq!(task.status, TaskStatus::Canceled);
    }

    #[test]
    fn none_fields_keep_stored_values() {
        let mut task = task_with_status(TaskStatus::Doing);
        task.output = Some(json!("partial"));

        let update = StatusUpdate::new(task.id.clone(), TaskStatus::Failed)
            .stopped_at(Utc::now());
        assert!(apply_status_update(&mut task, &update));
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.output, Some(json!("partial")));
    }
}
