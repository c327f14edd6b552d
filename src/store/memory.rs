//!
//! A task store held entirely in memory.
//!
//! Records do not survive the process, so recovery after a crash degrades to
//! starting from scratch. Useful for tests and for deployments that treat
//! every boot as a clean slate; anything else wants [`SqliteStore`].
//!
//! [`SqliteStore`]: crate::store::SqliteStore

use crate::messaging::{StatusSet, StatusUpdate, Task, TaskId, TaskStatus};
use crate::store::{apply_status_update, StoreError, TaskStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: HashMap<TaskId, Task>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryStore {
    fn bootstrap(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn insert(&mut self, task: &Task) -> Result<(), StoreError> {
        if self.tasks.contains_key(&task.id) {
            return Err(StoreError::DuplicateTask(task.id.clone()));
        }
        self.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get(&mut self, id: &TaskId) -> Result<Task, StoreError> {
        self.tasks.get(id).cloned().ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn update(&mut self, task: &Task) -> Result<(), StoreError> {
        match self.tasks.get_mut(&task.id) {
            Some(stored) => {
                *stored = task.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(task.id.clone())),
        }
    }

    fn update_status(&mut self, update: &StatusUpdate) -> Result<bool, StoreError> {
        let task = self
            .tasks
            .get_mut(&update.id)
            .ok_or_else(|| StoreError::NotFound(update.id.clone()))?;
        Ok(apply_status_update(task, update))
    }

    fn delete(&mut self, id: &TaskId) -> Result<(), StoreError> {
        self.tasks.remove(id).map(|_| ()).ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn exists(&mut self, id: &TaskId) -> Result<bool, StoreError> {
        Ok(self.tasks.contains_key(id))
    }

    fn list(&mut self) -> Result<Vec<Task>, StoreError> {
        let mut tasks = self.tasks.values().cloned().collect::<Vec<_>>();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    fn list_to_do(
        &mut self,
        statuses: StatusSet,
        now: DateTime<Utc>,
        redo: bool,
    ) -> Result<Vec<Task>, StoreError> {
        let mut tasks = self
            .tasks
            .values()
            .filter(|task| statuses.contains(task.status))
            .filter(|task| if redo { task.redo_due(now) } else { task.due(now) })
            .cloned()
            .collect::<Vec<_>>();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    fn count_by_status(&mut self, statuses: StatusSet) -> Result<usize, StoreError> {
        Ok(self.tasks.values().filter(|task| statuses.contains(task.status)).count())
    }

    fn purge(&mut self, statuses: StatusSet, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| !(statuses.contains(task.status) && task.expired(now)));
        Ok(before - self.tasks.len())
    }

    fn vacuum(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn recover(&mut self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        let mut recovered = Vec::new();
        for task in self.tasks.values_mut() {
            if StatusSet::ORPHANED.contains(task.status) {
                task.status = TaskStatus::Failed;
                task.stop_datetime = Some(now);
                recovered.push(task.id.clone());
            }
        }
        recovered.sort();
        Ok(recovered)
    }

    fn flush(&mut self) -> Result<usize, StoreError> {
        let count = self.tasks.len();
        self.tasks.clear();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::TaskSpec;
    use chrono::Duration;
    use serde_json::json;

    fn store_with(tasks: Vec<Task>) -> MemoryStore {
        let mut store = MemoryStore::new();
        store.bootstrap().unwrap();
        for task in &tasks {
            store.insert(task).unwrap();
        }
        store
    }

    fn named_task(id: &str, status: TaskStatus) -> Task {
        let mut spec = TaskSpec::new("echo", json!(null));
        spec.id = Some(TaskId::new(id));
        let mut task = Task::from_spec(spec, Utc::now());
        task.status = status;
        task
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let task = named_task("t1", TaskStatus::Default);
        let mut store = store_with(vec![task.clone()]);

        match store.insert(&task) {
            Err(StoreError::DuplicateTask(id)) => assert_eq!(id, task.id),
            other => panic!("expected DuplicateTask, got {other:?}"),
        }
    }

    #[test]
    fn get_and_delete_unknown_id_report_not_found() {
        let mut store = store_with(vec![]);
        let id = TaskId::new("missing");

        assert!(matches!(store.get(&id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(&id), Err(StoreError::NotFound(_))));
        assert!(!store.exists(&id).unwrap());
    }

    #[test]
    fn list_to_do_honors_start_datetime() {
        let now = Utc::now();
        let mut due = named_task("due", TaskStatus::Default);
        due.start_datetime = now - Duration::seconds(1);
        let mut later = named_task("later", TaskStatus::Default);
        later.start_datetime = now + Duration::seconds(60);
        let mut store = store_with(vec![due.clone(), later]);

        let ready = store.list_to_do(TaskStatus::Default.into(), now, false).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, due.id);
    }

    #[test]
    fn list_to_do_redo_respects_interval_boundary() {
        let stop = Utc::now();
        let mut task = named_task("redo", TaskStatus::Done);
        task.redo_interval = Some(5);
        task.stop_datetime = Some(stop);
        let mut store = store_with(vec![task.clone()]);

        let early = stop + Duration::seconds(5) - Duration::milliseconds(1);
        assert!(store.list_to_do(StatusSet::REDOABLE, early, true).unwrap().is_empty());

        let exact = stop + Duration::seconds(5);
        let ready = store.list_to_do(StatusSet::REDOABLE, exact, true).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, task.id);
    }

    #[test]
    fn recover_fails_every_orphaned_task() {
        let now = Utc::now();
        let mut store = store_with(vec![
            named_task("scheduled", TaskStatus::Scheduled),
            named_task("queued", TaskStatus::Queued),
            named_task("doing", TaskStatus::Doing),
            named_task("done", TaskStatus::Done),
        ]);

        let recovered = store.recover(now).unwrap();
        assert_eq!(recovered.len(), 3);
        assert_eq!(store.count_by_status(StatusSet::ORPHANED).unwrap(), 0);

        for id in ["scheduled", "queued", "doing"] {
            let task = store.get(&TaskId::new(id)).unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.stop_datetime, Some(now));
        }
        assert_eq!(store.get(&TaskId::new("done")).unwrap().status, TaskStatus::Done);
    }

    #[test]
    fn purge_removes_only_expired_terminal_tasks() {
        let now = Utc::now();

        let mut stale = named_task("stale", TaskStatus::Done);
        stale.expire = 10;
        stale.stop_datetime = Some(now - Duration::seconds(11));

        let mut fresh = named_task("fresh", TaskStatus::Done);
        fresh.expire = 3600;
        fresh.stop_datetime = Some(now - Duration::seconds(11));

        let mut repeating = named_task("repeating", TaskStatus::Done);
        repeating.redo_interval = Some(3600);
        repeating.expire = 0;
        repeating.stop_datetime = Some(now - Duration::seconds(11));

        let running = named_task("running", TaskStatus::Doing);

        let mut store = store_with(vec![stale, fresh, repeating, running]);
        let purged = store.purge(StatusSet::TERMINAL, now).unwrap();

        assert_eq!(purged, 1);
        assert!(!store.exists(&TaskId::new("stale")).unwrap());
        assert!(store.exists(&TaskId::new("fresh")).unwrap());
        assert!(store.exists(&TaskId::new("repeating")).unwrap());
        assert!(store.exists(&TaskId::new("running")).unwrap());
    }

    #[test]
    fn canceled_repeating_task_is_purged() {
        let now = Utc::now();
        let mut task = named_task("series", TaskStatus::Canceled);
        task.redo_interval = Some(60);
        task.expire = 0;
        task.stop_datetime = Some(now);
        let mut store = store_with(vec![task]);

        assert_eq!(store.purge(StatusSet::TERMINAL, now).unwrap(), 1);
    }

    #[test]
    fn update_status_is_sticky_for_canceled() {
        let mut store = store_with(vec![named_task("t1", TaskStatus::Canceled)]);

        let late = StatusUpdate::new(TaskId::new("t1"), TaskStatus::Done)
            .with_output(json!("result"));
        assert!(!store.update_status(&late).unwrap());
        assert_eq!(store.get(&TaskId::new("t1")).unwrap().status, TaskStatus::Canceled);
    }

    #[test]
    fn flush_empties_the_store() {
        let mut store = store_with(vec![
            named_task("a", TaskStatus::Default),
            named_task("b", TaskStatus::Done),
        ]);
        assert_eq!(store.flush().unwrap(), 2);
        assert!(store.list().unwrap().is_empty());
    }
}
