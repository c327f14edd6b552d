use crate::io::{read_frame, write_frame};
use crate::messaging::{ContextMap, PoolEvent, PoolMessage};
use crate::pool::POOL_SUBCOMMAND;
use crate::service::DrudgeService;
use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::select;
use tokio::sync::mpsc;

pub struct PoolSupervisorOptions {
    /// Pause before restarting a dead pool process.
    pub restart_backoff: Duration,
}

impl Default for PoolSupervisorOptions {
    fn default() -> Self {
        Self { restart_backoff: Duration::from_secs(2) }
    }
}

pub struct PoolSupervisorParams {
    /// Task-queue messages from the scheduler, bound for the pool.
    pub task_rx: mpsc::Receiver<PoolMessage>,

    /// Where pool status events are delivered.
    pub event_tx: mpsc::Sender<PoolEvent>,
}

/// Scheduler-side keeper of the worker pool process.
///
/// Spawns the pool (this binary re-executed in pool mode), bridges the task
/// queue onto its stdin and its stdout onto the event queue, and restarts it
/// if it dies. A restarted pool comes up with empty queues; records stranded
/// `Queued`/`Doing` in the store are the recovery procedure's problem, not
/// ours.
pub struct PoolSupervisor {
    options: PoolSupervisorOptions,
    task_rx: mpsc::Receiver<PoolMessage>,
    task_rx_closed: bool,
    event_tx: mpsc::Sender<PoolEvent>,
    child: Child,
    stdin: Option<ChildStdin>,
    last_context: Option<ContextMap>,
}

#[derive(Debug)]
pub enum PoolLink {
    Outgoing(Option<PoolMessage>),
    Exited(std::io::Result<ExitStatus>),
}

impl PoolSupervisor {
    pub fn spawn(
        options: PoolSupervisorOptions,
        params: PoolSupervisorParams,
    ) -> Result<Self, anyhow::Error> {
        let PoolSupervisorParams { task_rx, event_tx } = params;
        let (child, stdin) = launch_pool(event_tx.clone())?;

        Ok(Self {
            options,
            task_rx,
            task_rx_closed: false,
            event_tx,
            child,
            stdin: Some(stdin),
            last_context: None,
        })
    }

    async fn forward(&mut self, message: &PoolMessage) {
        let Some(stdin) = self.stdin.as_mut() else { return };
        if let Err(e) = write_frame(stdin, message).await {
            // The pool is on its way down; its exit is handled separately
            // and the stranded task is caught by recovery.
            warn!(e:?; "Could not forward message to worker pool");
        }
    }
}

impl DrudgeService for PoolSupervisor {
    type TaskOutput = PoolLink;

    async fn poll_task(&mut self) -> Self::TaskOutput {
        select! {
            message = self.task_rx.recv(), if !self.task_rx_closed => PoolLink::Outgoing(message),
            status = self.child.wait() => PoolLink::Exited(status),
        }
    }

    async fn on_task_ready(&mut self, link: Self::TaskOutput) -> Result<(), anyhow::Error> {
        match link {
            PoolLink::Outgoing(Some(message)) => {
                if let PoolMessage::Context { context } = &message {
                    self.last_context = Some(context.clone());
                }
                self.forward(&message).await;
                Ok(())
            }

            PoolLink::Outgoing(None) => {
                self.task_rx_closed = true;
                Ok(())
            }

            PoolLink::Exited(status) => {
                warn!(status:?; "Worker pool process died, restarting");
                tokio::time::sleep(self.options.restart_backoff).await;

                let (child, stdin) = launch_pool(self.event_tx.clone())
                    .context("respawning worker pool process")?;
                self.child = child;
                self.stdin = Some(stdin);

                // A fresh pool starts with an empty context blob.
                if let Some(context) = self.last_context.clone() {
                    self.forward(&PoolMessage::Context { context }).await;
                }
                Ok(())
            }
        }
    }

    async fn on_terminate(&mut self) -> Result<(), anyhow::Error> {
        // Closing the task queue is the shutdown request; the pool stops its
        // children and exits on its own.
        self.stdin = None;

        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => debug!(status:?; "Worker pool exited"),
            Ok(Err(e)) => warn!(e:?; "Could not collect worker pool exit status"),
            Err(_) => {
                warn!("Worker pool did not exit in time, killing it");
                let _ = self.child.kill().await;
            }
        }
        Ok(())
    }
}

fn launch_pool(event_tx: mpsc::Sender<PoolEvent>) -> Result<(Child, ChildStdin), anyhow::Error> {
    let exe = std::env::current_exe().context("locating current executable")?;
    let mut child = Command::new(exe)
        .arg(POOL_SUBCOMMAND)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .context("spawning worker pool process")?;

    let stdin = child.stdin.take().ok_or_else(|| anyhow!("pool stdin not captured"))?;
    let stdout = child.stdout.take().ok_or_else(|| anyhow!("pool stdout not captured"))?;
    tokio::spawn(forward_events(stdout, event_tx));

    info!(pid:? = child.id(); "Worker pool process started");
    Ok((child, stdin))
}

/// Pump status events off the pool's stdout into the scheduler's event
/// queue. Ends quietly at pipe EOF; a replacement pump is spawned with each
/// pool process.
async fn forward_events(mut stdout: ChildStdout, event_tx: mpsc::Sender<PoolEvent>) {
    loop {
        match read_frame::<_, PoolEvent>(&mut stdout).await {
            Ok(Some(event)) => {
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(e:?; "Malformed frame on event queue");
                break;
            }
        }
    }
}
