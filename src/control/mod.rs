mod client;
mod listener;

pub use client::*;
pub use listener::*;

use crate::messaging::{ControlRequest, ControlResponse};
use tokio::sync::oneshot;

/// One control request in flight between the socket listener and the
/// scheduler, with the channel its reply travels back on.
#[derive(Debug)]
pub struct ControlCall {
    pub request: ControlRequest,
    pub reply_tx: oneshot::Sender<ControlResponse>,
}
