use crate::messaging::TaskId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::BitOr;
use std::str::FromStr;

/// Grace period in seconds a finished, non-repeating task is kept around
/// before it is purged, when the submitter does not say otherwise.
pub const DEFAULT_EXPIRE: u64 = 3600;

/// Where a task is in its life, as a plain tagged state.
///
/// `Canceled` and `Aborted` are sticky: once recorded, a late status update
/// from the worker pool (e.g. a `Done` for a child that finished just as it
/// was canceled) must not overwrite them. That rule lives in the store's
/// status-update operation; the scheduler's re-arm path replaces whole
/// records and is the one legitimate way back out of a terminal state.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet picked up by the scheduler.
    Default,
    /// Due; handed to the worker pool's task queue.
    Scheduled,
    /// Accepted by the worker pool, waiting for a free slot.
    Queued,
    /// A child process is executing it.
    Doing,
    /// Finished successfully.
    Done,
    /// Finished with an error, or no child could be started.
    Failed,
    /// Canceled by explicit request before or during execution.
    Canceled,
    /// Forcibly terminated by a signal before completion.
    Aborted,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Default,
        TaskStatus::Scheduled,
        TaskStatus::Queued,
        TaskStatus::Doing,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Canceled,
        TaskStatus::Aborted,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::Aborted
        )
    }

    /// Terminal states that win over any late status update.
    pub fn is_sticky(self) -> bool {
        matches!(self, TaskStatus::Canceled | TaskStatus::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Default => "default",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Queued => "queued",
            TaskStatus::Doing => "doing",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Aborted => "aborted",
        }
    }

    fn bit(self) -> u16 {
        1 << self as u16
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status {s:?}"))
    }
}

/// A set of statuses, used to filter store queries.
///
/// The stored status itself stays a single tagged value; only queries speak
/// in sets ("everything terminal", "everything a crash can strand").
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StatusSet(u16);

impl StatusSet {
    pub const EMPTY: StatusSet = StatusSet(0);

    /// Done, Failed, Canceled or Aborted.
    pub const TERMINAL: StatusSet = StatusSet(
        1 << TaskStatus::Done as u16
            | 1 << TaskStatus::Failed as u16
            | 1 << TaskStatus::Canceled as u16
            | 1 << TaskStatus::Aborted as u16,
    );

    /// Terminal outcomes eligible for periodic re-arming. Canceled tasks are
    /// excluded: cancellation ends a repeating series.
    pub const REDOABLE: StatusSet = StatusSet(
        1 << TaskStatus::Done as u16
            | 1 << TaskStatus::Failed as u16
            | 1 << TaskStatus::Aborted as u16,
    );

    /// States an unclean shutdown can strand a task in.
    pub const ORPHANED: StatusSet = StatusSet(
        1 << TaskStatus::Scheduled as u16
            | 1 << TaskStatus::Queued as u16
            | 1 << TaskStatus::Doing as u16,
    );

    pub fn contains(self, status: TaskStatus) -> bool {
        self.0 & status.bit() != 0
    }

    pub fn with(self, status: TaskStatus) -> Self {
        Self(self.0 | status.bit())
    }

    pub fn iter(self) -> impl Iterator<Item = TaskStatus> {
        TaskStatus::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl From<TaskStatus> for StatusSet {
    fn from(status: TaskStatus) -> Self {
        StatusSet::EMPTY.with(status)
    }
}

impl BitOr for TaskStatus {
    type Output = StatusSet;

    fn bitor(self, rhs: TaskStatus) -> StatusSet {
        StatusSet::from(self).with(rhs)
    }
}

impl BitOr<TaskStatus> for StatusSet {
    type Output = StatusSet;

    fn bitor(self, rhs: TaskStatus) -> StatusSet {
        self.with(rhs)
    }
}

/// The unit of schedulable work, as persisted in the task store.
///
/// Exactly one record exists per id at any time; ids are never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Name of the registered work function to invoke.
    pub worker_name: String,

    /// Opaque payload handed to the work function as its arguments.
    #[serde(default)]
    pub options: serde_json::Value,

    pub status: TaskStatus,

    /// When the task becomes eligible to run.
    pub start_datetime: DateTime<Utc>,

    /// If set and > 0, the task is re-armed this many seconds after each
    /// terminal `stop_datetime`.
    #[serde(default)]
    pub redo_interval: Option<u64>,

    /// When the task last reached a terminal state.
    #[serde(default)]
    pub stop_datetime: Option<DateTime<Utc>>,

    /// Result or error payload of the last execution.
    #[serde(default)]
    pub output: Option<serde_json::Value>,

    /// Seconds after a terminal, non-repeating `stop_datetime` before the
    /// record is purged. Zero purges on the first sweep that sees it.
    #[serde(default)]
    pub expire: u64,
}

impl Task {
    /// Build a fresh record from a submission, filling defaults.
    pub fn from_spec(spec: TaskSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: spec.id.unwrap_or_else(TaskId::generate),
            worker_name: spec.worker_name,
            options: spec.options,
            status: TaskStatus::Default,
            start_datetime: spec.start_datetime.unwrap_or(now),
            redo_interval: spec.redo_interval,
            stop_datetime: None,
            output: None,
            expire: spec.expire.unwrap_or(DEFAULT_EXPIRE),
        }
    }

    pub fn is_repeating(&self) -> bool {
        matches!(self.redo_interval, Some(interval) if interval > 0)
    }

    /// Eligible for a first run: `start_datetime` has passed.
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        self.start_datetime <= now
    }

    /// Eligible for re-arming: terminal, repeating, and the redo interval has
    /// elapsed since the last stop. Holds exactly at the boundary instant.
    pub fn redo_due(&self, now: DateTime<Utc>) -> bool {
        match (self.redo_interval, self.stop_datetime) {
            (Some(interval), Some(stop)) if interval > 0 => {
                stop + Duration::seconds(interval as i64) <= now
            }
            _ => false,
        }
    }

    /// Eligible for purging: terminal, past the expiry grace period, and not
    /// waiting for a redo. A canceled task is purgeable even when repeating.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        if !self.status.is_terminal() {
            return false;
        }
        if self.is_repeating() && self.status != TaskStatus::Canceled {
            return false;
        }
        match self.stop_datetime {
            Some(stop) => stop + Duration::seconds(self.expire as i64) <= now,
            None => false,
        }
    }
}

/// What an external caller submits; everything optional gets a default when
/// the record is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub worker_name: String,

    #[serde(default)]
    pub options: serde_json::Value,

    #[serde(default)]
    pub id: Option<TaskId>,

    #[serde(default)]
    pub start_datetime: Option<DateTime<Utc>>,

    #[serde(default)]
    pub redo_interval: Option<u64>,

    #[serde(default)]
    pub expire: Option<u64>,
}

impl TaskSpec {
    pub fn new<S: Into<String>>(worker_name: S, options: serde_json::Value) -> Self {
        Self {
            worker_name: worker_name.into(),
            options,
            id: None,
            start_datetime: None,
            redo_interval: None,
            expire: None,
        }
    }
}
