//! SQLite-backed task store.
//!
//! The durable default: records survive restarts, which is what makes
//! startup recovery meaningful. One table, point lookups by id, status
//! filtering via an index, timestamps as RFC 3339 text. The scheduler is the
//! only writer by design, so no cross-process locking is layered on top of
//! what SQLite already does.

use crate::messaging::{StatusSet, StatusUpdate, Task, TaskId, TaskStatus};
use crate::store::{apply_status_update, StoreError, TaskStore};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, Row};
use std::path::Path;

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the store at the given path. The schema is not
    /// touched until `bootstrap` runs.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(storage)?;
        Ok(Self { conn })
    }

    /// A private, non-persistent store. Test use.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Ok(Self { conn })
    }

    fn select_where_status(&mut self, statuses: StatusSet) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            "SELECT id, worker_name, options, status, start_datetime, \
                    redo_interval, stop_datetime, output, expire \
             FROM tasks WHERE status IN ({}) ORDER BY id",
            status_list(statuses)
        );
        let mut stmt = self.conn.prepare(&sql).map_err(storage)?;
        let tasks = stmt
            .query_map([], row_to_task)
            .map_err(storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage)?;
        Ok(tasks)
    }
}

impl TaskStore for SqliteStore {
    fn bootstrap(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS tasks (
                    id             TEXT PRIMARY KEY,
                    worker_name    TEXT NOT NULL,
                    options        TEXT NOT NULL,
                    status         TEXT NOT NULL,
                    start_datetime TEXT NOT NULL,
                    redo_interval  INTEGER,
                    stop_datetime  TEXT,
                    output         TEXT,
                    expire         INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS tasks_status ON tasks (status);",
            )
            .map_err(storage)
    }

    fn insert(&mut self, task: &Task) -> Result<(), StoreError> {
        let result = self.conn.execute(
            "INSERT INTO tasks \
             (id, worker_name, options, status, start_datetime, redo_interval, \
              stop_datetime, output, expire) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            task_params(task)?,
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateTask(task.id.clone()))
            }
            Err(e) => Err(storage(e)),
        }
    }

    fn get(&mut self, id: &TaskId) -> Result<Task, StoreError> {
        let result = self.conn.query_row(
            "SELECT id, worker_name, options, status, start_datetime, \
                    redo_interval, stop_datetime, output, expire \
             FROM tasks WHERE id = ?1",
            params![id.as_str()],
            row_to_task,
        );

        match result {
            Ok(task) => Ok(task),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(StoreError::NotFound(id.clone())),
            Err(e) => Err(storage(e)),
        }
    }

    fn update(&mut self, task: &Task) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET worker_name = ?2, options = ?3, status = ?4, \
                        start_datetime = ?5, redo_interval = ?6, stop_datetime = ?7, \
                        output = ?8, expire = ?9 \
                 WHERE id = ?1",
                task_params(task)?,
            )
            .map_err(storage)?;

        if changed == 0 {
            return Err(StoreError::NotFound(task.id.clone()));
        }
        Ok(())
    }

    fn update_status(&mut self, update: &StatusUpdate) -> Result<bool, StoreError> {
        let mut task = self.get(&update.id)?;
        if !apply_status_update(&mut task, update) {
            return Ok(false);
        }
        self.update(&task)?;
        Ok(true)
    }

    fn delete(&mut self, id: &TaskId) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.as_str()])
            .map_err(storage)?;

        if changed == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    fn exists(&mut self, id: &TaskId) -> Result<bool, StoreError> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
                params![id.as_str()],
                |row| row.get::<_, bool>(0),
            )
            .map_err(storage)
    }

    fn list(&mut self) -> Result<Vec<Task>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, worker_name, options, status, start_datetime, \
                        redo_interval, stop_datetime, output, expire \
                 FROM tasks ORDER BY id",
            )
            .map_err(storage)?;
        let tasks = stmt
            .query_map([], row_to_task)
            .map_err(storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage)?;
        Ok(tasks)
    }

    fn list_to_do(
        &mut self,
        statuses: StatusSet,
        now: DateTime<Utc>,
        redo: bool,
    ) -> Result<Vec<Task>, StoreError> {
        // Status narrowing happens in SQL; the time arithmetic stays in one
        // place (the Task helpers) rather than being duplicated per dialect.
        let mut tasks = self.select_where_status(statuses)?;
        tasks.retain(|task| if redo { task.redo_due(now) } else { task.due(now) });
        Ok(tasks)
    }

    fn count_by_status(&mut self, statuses: StatusSet) -> Result<usize, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM tasks WHERE status IN ({})", status_list(statuses));
        self.conn
            .query_row(&sql, [], |row| row.get::<_, i64>(0))
            .map(|count| count as usize)
            .map_err(storage)
    }

    fn purge(&mut self, statuses: StatusSet, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let candidates = self.select_where_status(statuses)?;
        let mut purged = 0;
        for task in candidates.iter().filter(|task| task.expired(now)) {
            purged += self
                .conn
                .execute("DELETE FROM tasks WHERE id = ?1", params![task.id.as_str()])
                .map_err(storage)?;
        }
        Ok(purged)
    }

    fn vacuum(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("VACUUM").map_err(storage)
    }

    fn recover(&mut self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        let orphaned = self.select_where_status(StatusSet::ORPHANED)?;
        let ids = orphaned.into_iter().map(|task| task.id).collect::<Vec<_>>();

        let sql = format!(
            "UPDATE tasks SET status = ?1, stop_datetime = ?2 WHERE status IN ({})",
            status_list(StatusSet::ORPHANED)
        );
        self.conn
            .execute(&sql, params![TaskStatus::Failed.as_str(), now.to_rfc3339()])
            .map_err(storage)?;
        Ok(ids)
    }

    fn flush(&mut self) -> Result<usize, StoreError> {
        self.conn.execute("DELETE FROM tasks", []).map_err(storage)
    }
}

fn storage(e: rusqlite::Error) -> StoreError {
    StoreError::Storage(anyhow::Error::new(e))
}

/// Comma-separated quoted status names for an `IN (...)` clause. Status
/// names are fixed identifiers, so building the clause by hand is safe.
fn status_list(statuses: StatusSet) -> String {
    let names = statuses.iter().map(|s| format!("'{}'", s.as_str())).collect::<Vec<_>>();
    if names.is_empty() {
        // An empty set matches nothing; `IN ('')` keeps the SQL valid.
        return "''".to_owned();
    }
    names.join(",")
}

type TaskParams = (
    String,
    String,
    String,
    &'static str,
    String,
    Option<i64>,
    Option<String>,
    Option<String>,
    i64,
);

fn task_params(task: &Task) -> Result<TaskParams, StoreError> {
    let options = serde_json::to_string(&task.options)
        .map_err(|e| StoreError::Storage(anyhow!("serializing task options: {e}")))?;
    let output = task
        .output
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Storage(anyhow!("serializing task output: {e}")))?;

    Ok((
        task.id.as_str().to_owned(),
        task.worker_name.clone(),
        options,
        task.status.as_str(),
        task.start_datetime.to_rfc3339(),
        task.redo_interval.map(|i| i as i64),
        task.stop_datetime.map(|t| t.to_rfc3339()),
        output,
        task.expire as i64,
    ))
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let worker_name: String = row.get(1)?;
    let options: String = row.get(2)?;
    let status: String = row.get(3)?;
    let start_datetime: String = row.get(4)?;
    let redo_interval: Option<i64> = row.get(5)?;
    let stop_datetime: Option<String> = row.get(6)?;
    let output: Option<String> = row.get(7)?;
    let expire: i64 = row.get(8)?;

    Ok(Task {
        id: TaskId::new(id),
        worker_name,
        options: serde_json::from_str(&options).map_err(|e| conversion(2, e))?,
        status: status.parse::<TaskStatus>().map_err(|e| conversion(3, anyhow!(e)))?,
        start_datetime: parse_datetime(&start_datetime).map_err(|e| conversion(4, e))?,
        redo_interval: redo_interval.map(|i| i as u64),
        stop_datetime: stop_datetime
            .as_deref()
            .map(parse_datetime)
            .transpose()
            .map_err(|e| conversion(6, e))?,
        output: output
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| conversion(7, e))?,
        expire: expire as u64,
    })
}

fn parse_datetime(text: &str) -> Result<DateTime<Utc>, anyhow::Error> {
    Ok(DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc))
}

fn conversion<E>(column: usize, e: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, e.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::TaskSpec;
    use chrono::Duration;
    use serde_json::json;

    fn open_store() -> SqliteStore {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.bootstrap().unwrap();
        store
    }

    fn sample_task(id: &str) -> Task {
        let mut spec = TaskSpec::new("collector", json!({"instance": "db1", "port": 5432}));
        spec.id = Some(TaskId::new(id));
        spec.redo_interval = Some(60);
        Task::from_spec(spec, Utc::now())
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let mut store = open_store();
        store.bootstrap().unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn insert_get_round_trips_every_field() {
        let mut store = open_store();
        let mut task = sample_task("t1");
        task.output = Some(json!({"rows": 12}));
        task.stop_datetime = Some(Utc::now());

        store.insert(&task).unwrap();
        assert_eq!(store.get(&task.id).unwrap(), task);
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let mut store = open_store();
        let task = sample_task("t1");
        store.insert(&task).unwrap();

        assert!(matches!(store.insert(&task), Err(StoreError::DuplicateTask(_))));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let task = sample_task("t1");

        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.bootstrap().unwrap();
            store.insert(&task).unwrap();
        }

        let mut store = SqliteStore::open(&path).unwrap();
        store.bootstrap().unwrap();
        assert_eq!(store.get(&task.id).unwrap(), task);
    }

    #[test]
    fn recover_marks_orphans_failed() {
        let mut store = open_store();
        for (id, status) in [
            ("a", TaskStatus::Scheduled),
            ("b", TaskStatus::Queued),
            ("c", TaskStatus::Doing),
            ("d", TaskStatus::Default),
        ] {
            let mut task = sample_task(id);
            task.status = status;
            store.insert(&task).unwrap();
        }

        let now = Utc::now();
        let recovered = store.recover(now).unwrap();
        assert_eq!(recovered.len(), 3);
        assert_eq!(store.count_by_status(StatusSet::ORPHANED).unwrap(), 0);
        assert_eq!(store.count_by_status(TaskStatus::Failed.into()).unwrap(), 3);
        assert_eq!(store.get(&TaskId::new("d")).unwrap().status, TaskStatus::Default);
    }

    #[test]
    fn update_status_refuses_to_downgrade_canceled() {
        let mut store = open_store();
        let mut task = sample_task("t1");
        task.status = TaskStatus::Canceled;
        task.stop_datetime = Some(Utc::now());
        store.insert(&task).unwrap();

        let late = StatusUpdate::new(task.id.clone(), TaskStatus::Done)
            .with_output(json!("finished anyway"));
        assert!(!store.update_status(&late).unwrap());
        assert_eq!(store.get(&task.id).unwrap().status, TaskStatus::Canceled);
    }

    #[test]
    fn purge_deletes_expired_and_reports_count() {
        let mut store = open_store();
        let now = Utc::now();

        let mut gone = sample_task("gone");
        gone.status = TaskStatus::Done;
        gone.redo_interval = None;
        gone.expire = 5;
        gone.stop_datetime = Some(now - Duration::seconds(6));
        store.insert(&gone).unwrap();

        let mut kept = sample_task("kept");
        kept.status = TaskStatus::Done;
        kept.stop_datetime = Some(now - Duration::seconds(6));
        store.insert(&kept).unwrap();

        assert_eq!(store.purge(StatusSet::TERMINAL, now).unwrap(), 1);
        assert!(!store.exists(&TaskId::new("gone")).unwrap());
        assert!(store.exists(&TaskId::new("kept")).unwrap());
    }

    #[test]
    fn flush_reports_deleted_count() {
        let mut store = open_store();
        store.insert(&sample_task("a")).unwrap();
        store.insert(&sample_task("b")).unwrap();

        assert_eq!(store.flush().unwrap(), 2);
        assert!(store.list().unwrap().is_empty());
    }
}
