use crate::control::ControlCall;
use crate::io::{read_frame, write_frame};
use crate::messaging::{ControlEnvelope, ControlRequest, ControlResponse};
use crate::service::DrudgeService;
use anyhow::Context;
use log::{debug, info};
use std::path::PathBuf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

pub struct ControlListenerOptions {
    /// Filesystem path of the control socket. External callers must know
    /// this path; it is removed again on clean shutdown.
    pub socket_path: PathBuf,

    /// Optional shared secret every envelope must carry.
    pub token: Option<String>,
}

/// The scheduler's control endpoint: a Unix socket accepting one request
/// frame per connection and answering with one response frame.
///
/// Each accepted connection is served by its own short-lived task; the
/// request itself is relayed to the scheduler over the call channel, so the
/// listener never touches the store.
pub struct ControlListener {
    inner: UnixListener,
    socket_path: PathBuf,
    token: Option<String>,
    call_tx: mpsc::Sender<ControlCall>,
    handlers: JoinSet<()>,
}

impl ControlListener {
    pub fn bind(
        options: ControlListenerOptions,
        call_tx: mpsc::Sender<ControlCall>,
    ) -> Result<Self, anyhow::Error> {
        let ControlListenerOptions { socket_path, token } = options;

        // A stale socket file from an unclean shutdown would make bind fail.
        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!(path:% = socket_path.display(); "Removed stale control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).context(format!(
                    "removing stale control socket {}",
                    socket_path.display()
                ))
            }
        }

        let inner = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding control socket {}", socket_path.display()))?;
        info!(path:% = socket_path.display(); "Accepting control connections");

        Ok(Self { inner, socket_path, token, call_tx, handlers: JoinSet::new() })
    }
}

impl DrudgeService for ControlListener {
    type TaskOutput = std::io::Result<(UnixStream, tokio::net::unix::SocketAddr)>;

    async fn poll_task(&mut self) -> Self::TaskOutput {
        self.inner.accept().await
    }

    async fn on_task_ready(&mut self, conn: Self::TaskOutput) -> Result<(), anyhow::Error> {
        let (stream, _addr) = conn.context("accepting control connection")?;

        // Reap handlers that have already finished before adding one more.
        while self.handlers.try_join_next().is_some() {}

        let token = self.token.clone();
        let call_tx = self.call_tx.clone();
        self.handlers.spawn(async move {
            if let Err(e) = handle_connection(stream, token, call_tx).await {
                debug!(e:?; "Control connection failed");
            }
        });
        Ok(())
    }

    async fn on_terminate(&mut self) -> Result<(), anyhow::Error> {
        while self.handlers.join_next().await.is_some() {}

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

/// Serve one connection: read the single request, relay it to the
/// scheduler, write the single response, done. No sessions, no pipelining.
async fn handle_connection(
    mut stream: UnixStream,
    token: Option<String>,
    call_tx: mpsc::Sender<ControlCall>,
) -> Result<(), anyhow::Error> {
    let Some(envelope) = read_frame::<_, ControlEnvelope>(&mut stream).await? else {
        // Connected and hung up without a request.
        return Ok(());
    };

    let response = if authorized(token.as_deref(), &envelope) {
        relay(envelope.request, &call_tx).await
    } else {
        ControlResponse::error("authentication failed")
    };

    write_frame(&mut stream, &response).await
}

fn authorized(expected: Option<&str>, envelope: &ControlEnvelope) -> bool {
    match expected {
        None => true,
        Some(token) => envelope.token.as_deref() == Some(token),
    }
}

async fn relay(request: ControlRequest, call_tx: &mpsc::Sender<ControlCall>) -> ControlResponse {
    let (reply_tx, reply_rx) = oneshot::channel();
    if call_tx.send(ControlCall { request, reply_tx }).await.is_err() {
        return ControlResponse::error("scheduler is shutting down");
    }
    match reply_rx.await {
        Ok(response) => response,
        Err(_) => ControlResponse::error("scheduler dropped the request"),
    }
}
