use crate::io::{read_frame, write_frame};
use crate::messaging::{ContextMap, PoolEvent, PoolMessage, StatusUpdate, Task, TaskId, TaskStatus};
use crate::pool::child::{classify_outcome, spawn_task, terminate, FinishedTask, RunningTask};
use crate::worker::WorkerRegistry;
use anyhow::Context;
use chrono::Utc;
use log::{debug, info, trace, warn};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::io::Stdout;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

pub struct WorkerPoolOptions {
    /// How long one loop iteration blocks on the task queue before going
    /// back to supervision and dispatch duties.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(100) }
    }
}

/// The worker pool process: bounds concurrent execution per work type and
/// supervises one OS child per running task.
///
/// The task queue arrives on stdin and status events leave on stdout, both
/// as the usual frames; the scheduler holds the other end of both pipes.
/// The loop is single-threaded and cooperative: each iteration reaps
/// finished children, takes at most one queue message, then fills free
/// slots, never blocking longer than the poll interval.
pub struct WorkerPool {
    registry: WorkerRegistry,
    options: WorkerPoolOptions,
    context: ContextMap,
    pending: HashMap<String, VecDeque<Task>>,
    running: HashMap<TaskId, RunningTask>,
    children: JoinSet<FinishedTask>,
}

impl WorkerPool {
    pub fn new(registry: WorkerRegistry, options: WorkerPoolOptions) -> Self {
        Self {
            registry,
            options,
            context: ContextMap::new(),
            pending: HashMap::new(),
            running: HashMap::new(),
            children: JoinSet::new(),
        }
    }

    pub async fn run(mut self) -> Result<(), anyhow::Error> {
        info!(workers:? = self.registry.names(); "Worker pool started");

        let mut queue_rx = spawn_queue_reader();
        let mut events = tokio::io::stdout();

        loop {
            self.supervise(&mut events).await?;

            match tokio::time::timeout(self.options.poll_interval, queue_rx.recv()).await {
                Ok(Some(message)) => self.handle_message(message, &mut events).await?,
                // Task queue closed: the scheduler went away.
                Ok(None) => break,
                Err(_) => {}
            }

            self.dispatch(&mut events).await?;
        }

        self.shutdown().await;
        info!("Worker pool stopped");
        Ok(())
    }

    /// Reap every child that has exited and report its outcome.
    async fn supervise(&mut self, events: &mut Stdout) -> Result<(), anyhow::Error> {
        while let Some(joined) = self.children.try_join_next() {
            let finished = match joined {
                Ok(finished) => finished,
                Err(e) => {
                    warn!(e:?; "Supervision task panicked");
                    continue;
                }
            };

            self.running.remove(&finished.id);
            let update = classify_outcome(&finished, Utc::now());
            debug!(id:% = update.id, status:% = update.status; "Worker process finished");
            self.emit(events, update).await?;
        }
        Ok(())
    }

    async fn handle_message(
        &mut self,
        message: PoolMessage,
        events: &mut Stdout,
    ) -> Result<(), anyhow::Error> {
        match message {
            PoolMessage::Run { task } => self.accept(task, events).await?,

            PoolMessage::Cancel { id } => {
                if let Some(running) = self.running.get(&id) {
                    debug!(id:% = id; "Cancel: terminating running worker");
                    terminate(running);
                } else if self.drop_pending(&id) {
                    debug!(id:% = id; "Cancel: dropped queued task before it started");
                }
            }

            // An abort only acts on a running child; a queued task is left
            // for CANCEL.
            PoolMessage::Abort { id } => {
                if let Some(running) = self.running.get(&id) {
                    debug!(id:% = id; "Abort: terminating running worker");
                    terminate(running);
                }
            }

            PoolMessage::Context { context } => {
                trace!(keys = context.len(); "Replacing ambient context");
                self.context = context;
            }
        }
        Ok(())
    }

    async fn accept(&mut self, task: Task, events: &mut Stdout) -> Result<(), anyhow::Error> {
        if task.status != TaskStatus::Scheduled {
            warn!(id:% = task.id, status:% = task.status; "Dropping task not marked scheduled");
            return Ok(());
        }

        if !self.registry.contains(&task.worker_name) {
            warn!(id:% = task.id, worker = task.worker_name.as_str(); "Unknown worker");
            let update = StatusUpdate::new(task.id, TaskStatus::Failed)
                .stopped_at(Utc::now())
                .with_output(json!(format!("unknown worker {:?}", task.worker_name)));
            return self.emit(events, update).await;
        }

        let update = StatusUpdate::new(task.id.clone(), TaskStatus::Queued);
        self.pending.entry(task.worker_name.clone()).or_default().push_back(task);
        self.emit(events, update).await
    }

    /// Start pending tasks wherever a work type has a free slot.
    async fn dispatch(&mut self, events: &mut Stdout) -> Result<(), anyhow::Error> {
        let names = self.pending.keys().cloned().collect::<Vec<_>>();
        for name in names {
            let pool_size = self.registry.pool_size(&name).unwrap_or(1);

            while self.in_flight(&name) < pool_size {
                let Some(task) = self.pending.get_mut(&name).and_then(VecDeque::pop_front) else {
                    break;
                };

                let update = match spawn_task(&task, &self.context, &mut self.children).await {
                    Ok(running) => {
                        debug!(id:% = task.id, pid = running.pid; "Worker process started");
                        self.running.insert(task.id.clone(), running);
                        StatusUpdate::new(task.id, TaskStatus::Doing)
                    }
                    Err(e) => {
                        warn!(id:% = task.id, e:?; "Could not start worker process");
                        StatusUpdate::new(task.id, TaskStatus::Failed)
                            .stopped_at(Utc::now())
                            .with_output(json!(format!("could not start worker: {e:#}")))
                    }
                };
                self.emit(events, update).await?;
            }
        }
        Ok(())
    }

    fn in_flight(&self, worker_name: &str) -> usize {
        self.running.values().filter(|running| running.worker_name == worker_name).count()
    }

    fn drop_pending(&mut self, id: &TaskId) -> bool {
        for queue in self.pending.values_mut() {
            if let Some(position) = queue.iter().position(|task| &task.id == id) {
                queue.remove(position);
                return true;
            }
        }
        false
    }

    async fn emit(&mut self, events: &mut Stdout, update: StatusUpdate) -> Result<(), anyhow::Error> {
        write_frame(events, &PoolEvent::Status(update))
            .await
            .context("reporting status event to scheduler")
    }

    /// The queue is gone; stop whatever is still running before exiting.
    async fn shutdown(&mut self) {
        for running in self.running.values() {
            terminate(running);
        }
        while self.children.join_next().await.is_some() {}
    }
}

/// Decouple frame reads from the loop's poll timeout: a frame is only taken
/// off this channel once fully read, so a timeout can never tear a frame in
/// half.
fn spawn_queue_reader() -> mpsc::Receiver<PoolMessage> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        loop {
            match read_frame::<_, PoolMessage>(&mut stdin).await {
                Ok(Some(message)) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(e:?; "Malformed frame on task queue");
                    break;
                }
            }
        }
    });
    rx
}
