use crate::service::DrudgeService;
use anyhow::anyhow;
use futures::StreamExt;
use libc::{c_int, SIGINT, SIGTERM};
use log::info;
use signal_hook_tokio::Signals;
use tokio::sync::oneshot;

/// Turns SIGINT/SIGTERM into a single termination request for the rest of
/// the process tree.
pub struct SignalListener {
    signals: Signals,
    term_tx: Option<oneshot::Sender<()>>,
}

impl SignalListener {
    pub fn new(term_tx: oneshot::Sender<()>) -> Result<Self, anyhow::Error> {
        let signals = Signals::new([SIGINT, SIGTERM])?;
        Ok(Self { signals, term_tx: Some(term_tx) })
    }
}

impl DrudgeService for SignalListener {
    type TaskOutput = Option<c_int>;

    async fn poll_task(&mut self) -> Self::TaskOutput {
        self.signals.next().await
    }

    async fn on_task_ready(&mut self, signal: Self::TaskOutput) -> Result<(), anyhow::Error> {
        match signal {
            Some(signal @ (SIGINT | SIGTERM)) => {
                info!(signal; "Received termination signal");
                if let Some(term_tx) = self.term_tx.take() {
                    let _ = term_tx.send(());
                }
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(anyhow!("signal stream unexpectedly closed")),
        }
    }

    async fn on_terminate(&mut self) -> Result<(), anyhow::Error> {
        self.signals.handle().close();
        Ok(())
    }
}
