use crate::io::{read_frame, write_frame};
use crate::messaging::{
    ContextMap, ControlEnvelope, ControlRequest, ControlResponse, RespContent, StatusUpdate, Task,
    TaskId, TaskSpec,
};
use anyhow::{anyhow, bail, Context};
use std::path::PathBuf;
use tokio::net::UnixStream;

pub struct ControlClientOptions {
    /// Path of the scheduler's control socket.
    pub socket_path: PathBuf,

    /// Shared secret, when the scheduler was started with one.
    pub token: Option<String>,
}

/// Synchronous-style helper for talking to the scheduler.
///
/// Every call opens a fresh connection, sends one request, reads exactly one
/// reply and closes. Never long-lived, never multiplexed; that keeps the
/// protocol trivial and the scheduler free of session state.
pub struct ControlClient {
    options: ControlClientOptions,
}

impl ControlClient {
    pub fn new(options: ControlClientOptions) -> Self {
        Self { options }
    }

    /// Perform one request/response exchange.
    pub async fn call(&self, request: ControlRequest) -> Result<ControlResponse, anyhow::Error> {
        let path = &self.options.socket_path;
        let mut stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("connecting to control socket {}", path.display()))?;

        let envelope = ControlEnvelope { token: self.options.token.clone(), request };
        write_frame(&mut stream, &envelope).await.context("sending control request")?;

        read_frame(&mut stream)
            .await
            .context("receiving control response")?
            .ok_or_else(|| anyhow!("connection closed before a response arrived"))
    }

    async fn expect(&self, request: ControlRequest) -> Result<RespContent, anyhow::Error> {
        match self.call(request).await? {
            ControlResponse::Resp { content } => Ok(content),
            ControlResponse::Error { message } => Err(anyhow!(message)),
        }
    }

    /// Submit a task; returns its id so it can be inspected or canceled
    /// later.
    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskId, anyhow::Error> {
        match self.expect(ControlRequest::New(spec)).await? {
            RespContent::TaskId { id } => Ok(id),
            other => bail!("unexpected response to task submission: {other:?}"),
        }
    }

    /// Cancel a task. Returns whether the store actually changed (false when
    /// it was already canceled).
    pub async fn cancel(&self, id: TaskId) -> Result<bool, anyhow::Error> {
        match self.expect(ControlRequest::Cancel { id }).await? {
            RespContent::Applied { applied } => Ok(applied),
            other => bail!("unexpected response to cancel: {other:?}"),
        }
    }

    /// Hard-kill a running task's child process.
    pub async fn abort(&self, id: TaskId) -> Result<(), anyhow::Error> {
        self.expect(ControlRequest::Abort { id }).await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Task>, anyhow::Error> {
        match self.expect(ControlRequest::List).await? {
            RespContent::Tasks { tasks } => Ok(tasks),
            other => bail!("unexpected response to list: {other:?}"),
        }
    }

    pub async fn update_status(&self, update: StatusUpdate) -> Result<bool, anyhow::Error> {
        match self.expect(ControlRequest::Status(update)).await? {
            RespContent::Applied { applied } => Ok(applied),
            other => bail!("unexpected response to status update: {other:?}"),
        }
    }

    /// Merge key/value pairs into the ambient worker context; returns the
    /// merged blob.
    pub async fn set_context(&self, pairs: ContextMap) -> Result<ContextMap, anyhow::Error> {
        match self.expect(ControlRequest::Context { set: Some(pairs) }).await? {
            RespContent::Context { context } => Ok(context),
            other => bail!("unexpected response to context update: {other:?}"),
        }
    }

    pub async fn get_context(&self) -> Result<ContextMap, anyhow::Error> {
        match self.expect(ControlRequest::Context { set: None }).await? {
            RespContent::Context { context } => Ok(context),
            other => bail!("unexpected response to context read: {other:?}"),
        }
    }
}
