use crate::control::ControlCall;
use crate::messaging::{
    ContextMap, ControlRequest, ControlResponse, PoolEvent, PoolMessage, RespContent, StatusSet,
    StatusUpdate, Task, TaskStatus,
};
use crate::service::DrudgeService;
use crate::store::{StoreError, TaskStore};
use crate::worker::{UnknownWorker, WorkerRegistry};
use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};

pub struct SchedulerOptions {
    /// Cadence of the due/redo/purge sweep.
    pub tick_interval: Duration,

    /// Cadence of store compaction.
    pub vacuum_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            vacuum_interval: Duration::from_secs(3600),
        }
    }
}

pub struct SchedulerParams {
    pub store: Box<dyn TaskStore>,
    pub registry: WorkerRegistry,

    /// Task queue toward the worker pool.
    pub task_tx: mpsc::Sender<PoolMessage>,

    /// Event queue from the worker pool.
    pub event_rx: mpsc::Receiver<PoolEvent>,

    /// Control calls relayed by the socket listener.
    pub call_rx: mpsc::Receiver<ControlCall>,
}

/// The authoritative owner of the task store.
///
/// Decides what runs when: on a ~1 Hz tick it purges expired records, pushes
/// due tasks onto the task queue and re-arms repeating ones; between ticks it
/// serves control calls and applies the pool's status events. Single
/// threaded, and the only writer the store ever sees.
pub struct Scheduler {
    store: Box<dyn TaskStore>,
    registry: WorkerRegistry,
    context: ContextMap,
    task_tx: mpsc::Sender<PoolMessage>,
    event_rx: mpsc::Receiver<PoolEvent>,
    event_rx_closed: bool,
    call_rx: mpsc::Receiver<ControlCall>,
    call_rx_closed: bool,
    tick: Interval,
    vacuum: Interval,
}

#[derive(Debug)]
pub enum SchedulerWakeup {
    Tick,
    Vacuum,
    Event(Option<PoolEvent>),
    Call(Option<ControlCall>),
}

impl Scheduler {
    /// Bootstrap the store and reconcile whatever a previous run left
    /// behind. A store that cannot be read here is fatal: the scheduler
    /// must not serve without it.
    pub fn new(options: SchedulerOptions, params: SchedulerParams) -> Result<Self, StoreError> {
        let SchedulerParams { mut store, registry, task_tx, event_rx, call_rx } = params;

        store.bootstrap()?;
        let recovered = store.recover(Utc::now())?;
        for id in &recovered {
            warn!(id:% = id; "Failing task orphaned by unclean shutdown");
        }
        let pending = store.count_by_status(TaskStatus::Default.into())?;
        info!(pending, recovered = recovered.len(); "Scheduler ready");

        let mut tick = interval(options.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut vacuum = interval(options.vacuum_interval);
        vacuum.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Self {
            store,
            registry,
            context: ContextMap::new(),
            task_tx,
            event_rx,
            event_rx_closed: false,
            call_rx,
            call_rx_closed: false,
            tick,
            vacuum,
        })
    }

    /// One sweep: purge what has expired, schedule what is due, re-arm what
    /// finished a redo interval ago.
    async fn sweep(&mut self, now: DateTime<Utc>) -> Result<(), anyhow::Error> {
        let purged = self.store.purge(StatusSet::TERMINAL, now)?;
        if purged > 0 {
            debug!(purged; "Purged expired tasks");
        }

        for task in self.store.list_to_do(TaskStatus::Default.into(), now, false)? {
            debug!(id:% = task.id, worker = task.worker_name.as_str(); "Task due");
            self.push_to_pool(task).await?;
        }

        for mut task in self.store.list_to_do(StatusSet::REDOABLE, now, true)? {
            debug!(id:% = task.id, worker = task.worker_name.as_str(); "Re-arming repeating task");
            task.output = None;
            task.stop_datetime = None;
            self.push_to_pool(task).await?;
        }

        Ok(())
    }

    /// Mark a task scheduled and hand it to the worker pool. The store is
    /// written first so a crash between the two leaves a record recovery
    /// knows how to fail.
    async fn push_to_pool(&mut self, mut task: Task) -> Result<(), anyhow::Error> {
        task.status = TaskStatus::Scheduled;
        self.store.update(&task)?;
        self.task_tx.send(PoolMessage::Run { task }).await.context("task queue closed")?;
        Ok(())
    }

    /// Apply a status event from the pool. Unknown ids are expected here: a
    /// purge or cancel sweep can win the race against a late report.
    fn apply_event(&mut self, update: StatusUpdate) {
        match self.store.update_status(&update) {
            Ok(true) => {
                trace!(id:% = update.id, status:% = update.status; "Applied status event")
            }
            Ok(false) => {
                debug!(id:% = update.id, status:% = update.status; "Stale status event ignored")
            }
            Err(StoreError::NotFound(_)) => {
                debug!(id:% = update.id; "Status event for a task no longer in the store")
            }
            Err(e) => error!(id:% = update.id, e:?; "Could not apply status event"),
        }
    }

    async fn handle_request(&mut self, request: ControlRequest) -> ControlResponse {
        match self.try_handle(request).await {
            Ok(content) => ControlResponse::resp(content),
            Err(e) => ControlResponse::error(format!("{e:#}")),
        }
    }

    async fn try_handle(&mut self, request: ControlRequest) -> Result<RespContent, anyhow::Error> {
        match request {
            ControlRequest::New(spec) => {
                if !self.registry.contains(&spec.worker_name) {
                    return Err(UnknownWorker(spec.worker_name).into());
                }

                let task = Task::from_spec(spec, Utc::now());
                self.store.insert(&task)?;
                info!(id:% = task.id, worker = task.worker_name.as_str(); "Task submitted");
                Ok(RespContent::TaskId { id: task.id })
            }

            ControlRequest::Status(update) => {
                let applied = self.store.update_status(&update)?;
                Ok(RespContent::Applied { applied })
            }

            ControlRequest::Cancel { id } => {
                let update =
                    StatusUpdate::new(id.clone(), TaskStatus::Canceled).stopped_at(Utc::now());
                let applied = self.store.update_status(&update)?;
                if applied {
                    info!(id:% = id; "Task canceled");
                }
                // Whether or not it already started, the pool gets to drop
                // or terminate its copy.
                self.task_tx.send(PoolMessage::Cancel { id }).await.context("task queue closed")?;
                Ok(RespContent::Applied { applied })
            }

            ControlRequest::Abort { id } => {
                if !self.store.exists(&id)? {
                    return Err(StoreError::NotFound(id).into());
                }
                // No store write here: the pool reports the resulting
                // aborted status itself once the child is dead.
                self.task_tx.send(PoolMessage::Abort { id }).await.context("task queue closed")?;
                Ok(RespContent::Ack)
            }

            ControlRequest::List => Ok(RespContent::Tasks { tasks: self.store.list()? }),

            ControlRequest::Context { set } => {
                if let Some(pairs) = set {
                    self.context.extend(pairs);
                    self.task_tx
                        .send(PoolMessage::Context { context: self.context.clone() })
                        .await
                        .context("task queue closed")?;
                }
                Ok(RespContent::Context { context: self.context.clone() })
            }
        }
    }
}

impl DrudgeService for Scheduler {
    type TaskOutput = SchedulerWakeup;

    async fn poll_task(&mut self) -> Self::TaskOutput {
        select! {
            _ = self.tick.tick() => SchedulerWakeup::Tick,
            _ = self.vacuum.tick() => SchedulerWakeup::Vacuum,
            event = self.event_rx.recv(), if !self.event_rx_closed => SchedulerWakeup::Event(event),
            call = self.call_rx.recv(), if !self.call_rx_closed => SchedulerWakeup::Call(call),
        }
    }

    async fn on_task_ready(&mut self, wakeup: Self::TaskOutput) -> Result<(), anyhow::Error> {
        match wakeup {
            SchedulerWakeup::Tick => {
                // A failing sweep is logged, not fatal: the next tick gets
                // another chance and control calls keep being served.
                if let Err(e) = self.sweep(Utc::now()).await {
                    error!(e:?; "Scheduler sweep failed");
                }
            }

            SchedulerWakeup::Vacuum => {
                debug!("Vacuuming task store");
                if let Err(e) = self.store.vacuum() {
                    error!(e:?; "Task store vacuum failed");
                }
            }

            SchedulerWakeup::Event(Some(PoolEvent::Status(update))) => self.apply_event(update),
            SchedulerWakeup::Event(None) => self.event_rx_closed = true,

            SchedulerWakeup::Call(Some(call)) => {
                let ControlCall { request, reply_tx } = call;
                let response = self.handle_request(request).await;
                // A client that hung up before the reply is its own problem.
                let _ = reply_tx.send(response);
            }
            SchedulerWakeup::Call(None) => self.call_rx_closed = true,
        }
        Ok(())
    }
}
