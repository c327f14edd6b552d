use crate::control::{ControlListener, ControlListenerOptions};
use crate::pool::{PoolSupervisor, PoolSupervisorOptions, PoolSupervisorParams};
use crate::scheduler::{Scheduler, SchedulerOptions, SchedulerParams};
use crate::service::start_service;
use crate::sig::SignalListener;
use crate::store::TaskStore;
use crate::worker::WorkerRegistry;
use anyhow::Context;
use log::info;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tokio::try_join;

pub struct DrudgeOptions {
    pub socket_path: PathBuf,
    pub token: Option<String>,
    pub scheduler: SchedulerOptions,
    pub pool: PoolSupervisorOptions,
}

impl Default for DrudgeOptions {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("drudge.sock"),
            token: None,
            scheduler: SchedulerOptions::default(),
            pool: PoolSupervisorOptions::default(),
        }
    }
}

/// The scheduler process, assembled: store-owning scheduler, control socket,
/// worker pool supervision and signal handling, wired together with the two
/// queues and run until told to stop.
pub struct Drudge {
    options: DrudgeOptions,
    store: Box<dyn TaskStore>,
    registry: WorkerRegistry,
}

impl Drudge {
    pub fn new(options: DrudgeOptions, store: Box<dyn TaskStore>, registry: WorkerRegistry) -> Self {
        Self { options, store, registry }
    }

    pub async fn run(self) -> Result<(), anyhow::Error> {
        let Drudge { options, store, registry } = self;

        let (term_tx, term_rx) = oneshot::channel();
        // Task queue: scheduler -> pool. Event queue: pool -> scheduler.
        let (task_tx, task_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (call_tx, call_rx) = mpsc::channel(16);

        let scheduler = Scheduler::new(
            options.scheduler,
            SchedulerParams { store, registry, task_tx, event_rx, call_rx },
        )
        .context("initializing task store")?;
        let listener = ControlListener::bind(
            ControlListenerOptions { socket_path: options.socket_path, token: options.token },
            call_tx,
        )?;
        let supervisor =
            PoolSupervisor::spawn(options.pool, PoolSupervisorParams { task_rx, event_tx })?;
        let signals = SignalListener::new(term_tx)?;

        let (sched_task, mut sched_chan) = start_service("scheduler", scheduler);
        let (ctl_task, mut ctl_chan) = start_service("control", listener);
        let (pool_task, mut pool_chan) = start_service("pool", supervisor);
        let (sig_task, mut sig_chan) = start_service("signals", signals);

        let cleanup_task = Box::pin(async move {
            term_rx.await.context("termination channel dropped")?;
            info!("Received request for termination");
            ctl_chan.terminate();
            sched_chan.terminate();
            pool_chan.terminate();
            sig_chan.terminate();
            Ok(())
        });

        try_join!(sched_task, ctl_task, pool_task, sig_task, cleanup_task)?;
        info!("drudge stopped");
        Ok(())
    }
}
