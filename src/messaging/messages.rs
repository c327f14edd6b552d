use crate::messaging::{Task, TaskId, TaskSpec, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ambient configuration handed to work functions alongside their options.
pub type ContextMap = HashMap<String, serde_json::Value>;

/// One control-socket exchange: a request wrapped with the optional shared
/// secret. The scheduler rejects the request when its configured token does
/// not match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub request: ControlRequest,
}

/// A request made by an external actor to the scheduler's control endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Submit a new task.
    New(TaskSpec),

    /// Apply a status update. Normally carried on the worker pool's event
    /// queue; accepted here too so tooling can patch a record.
    Status(StatusUpdate),

    /// Cancel a task: drop it before it starts, or terminate its child.
    Cancel { id: TaskId },

    /// Hard-kill a running task's child. No effect on tasks that have not
    /// started.
    Abort { id: TaskId },

    /// Return every task in the store.
    List,

    /// Merge key/value pairs into the ambient worker context, or with no
    /// payload, read the current context back.
    Context {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        set: Option<ContextMap>,
    },
}

/// A reply from the scheduler: a success envelope or a failure message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Resp { content: RespContent },
    Error { message: String },
}

impl ControlResponse {
    pub fn resp(content: RespContent) -> Self {
        ControlResponse::Resp { content }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        ControlResponse::Error { message: message.into() }
    }
}

/// Payload of a successful control reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RespContent {
    Ack,
    TaskId { id: TaskId },
    Tasks { tasks: Vec<Task> },
    Context { context: ContextMap },
    Applied { applied: bool },
}

/// A status transition for one task, with optional result payload and stop
/// time. Fields left `None` keep their stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub id: TaskId,
    pub status: TaskStatus,

    #[serde(default)]
    pub output: Option<serde_json::Value>,

    #[serde(default)]
    pub stop_datetime: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn new(id: TaskId, status: TaskStatus) -> Self {
        Self { id, status, output: None, stop_datetime: None }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn stopped_at(mut self, stop: DateTime<Utc>) -> Self {
        self.stop_datetime = Some(stop);
        self
    }
}

/// What the scheduler pushes down the task queue to the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolMessage {
    /// Run a task that the scheduler has marked `Scheduled`.
    Run { task: Task },

    /// Remove a task from the pending queue, or terminate its child if it
    /// already started.
    Cancel { id: TaskId },

    /// Terminate a running task's child. Queued tasks are left alone.
    Abort { id: TaskId },

    /// Full snapshot of the ambient worker context.
    Context { context: ContextMap },
}

/// What the worker pool reports back on the event queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    Status(StatusUpdate),
}

/// What a worker child receives on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInvocation {
    pub options: serde_json::Value,
    #[serde(default)]
    pub context: ContextMap,
}

/// What a worker child writes to stdout before exiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReport {
    Success { output: serde_json::Value },
    Failure { message: String },
}
