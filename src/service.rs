use anyhow::Context;
use log::{debug, trace};
use std::fmt::Debug;
use std::future::{Future, IntoFuture};
use tokio::select;
use tokio::sync::oneshot;

/// A long-running component of the drudge process tree.
///
/// Each service repeatedly polls for its next unit of work and handles it;
/// the runner interleaves that with a termination channel so every service
/// can be wound down in order during shutdown.
pub trait DrudgeService {
    type TaskOutput: Debug;

    /// Wait for the next unit of work. Must be cancellation safe: the runner
    /// races this against the termination signal.
    async fn poll_task(&mut self) -> Self::TaskOutput;

    /// Handle one unit of work. Returning an error stops the service and
    /// propagates to the process supervisor.
    async fn on_task_ready(&mut self, output: Self::TaskOutput) -> Result<(), anyhow::Error>;

    /// Clean up before the service stops.
    async fn on_terminate(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Handle used to ask a started service to stop.
pub struct ServiceChannel {
    name: String,
    term_tx: Option<oneshot::Sender<()>>,
}

impl ServiceChannel {
    pub fn terminate(&mut self) {
        if let Some(term_tx) = self.term_tx.take() {
            debug!(service = self.name.as_str(); "Sending termination signal");
            let _ = term_tx.send(());
        }
    }
}

/// Drive a service until it is told to terminate or its handler fails.
///
/// Returns the service's future (to be joined by the caller) and the channel
/// that stops it.
pub fn start_service<N, S>(
    name: N,
    mut service: S,
) -> (impl Future<Output = Result<(), anyhow::Error>>, ServiceChannel)
where
    N: Into<String>,
    S: DrudgeService,
{
    let name = name.into();
    let (term_tx, mut term_rx) = oneshot::channel();
    let channel = ServiceChannel { name: name.clone(), term_tx: Some(term_tx) };

    let task = async move {
        debug!(service = name.as_str(); "Starting");

        let term_rx = &mut term_rx;
        loop {
            select! {
                output = service.poll_task() => {
                    trace!(service = name.as_str(), output:?; "Task ready");
                    service
                        .on_task_ready(output)
                        .await
                        .with_context(|| format!("{name}: task handling failed"))?;
                },

                result = term_rx.into_future() => {
                    result.with_context(|| format!("{name}: termination channel dropped"))?;

                    debug!(service = name.as_str(); "Terminating");
                    service
                        .on_terminate()
                        .await
                        .with_context(|| format!("{name}: termination handling failed"))?;
                    break;
                }
            }
        }

        debug!(service = name.as_str(); "Stopped");
        Ok(())
    };

    (task, channel)
}
