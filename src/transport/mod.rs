//! Worker transports.
//!
//! A transport spawns one addressable worker, carries [`CoordinatorMessage`]s
//! to it and reports [`TransportEvent`]s back. The scheduler only sees the
//! [`WorkerTransport`] and [`TransportFactory`] traits.

mod process;
mod thread;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{CoordinatorMessage, ProtocolError, WorkerId, WorkerMessage};

pub use process::{ProcessTransport, ProcessTransportFactory};
pub use thread::{ThreadTransport, ThreadTransportFactory};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker channel closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Something a worker reported, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(WorkerMessage),
    /// The worker is gone. Always the last event.
    Crashed(String),
}

pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Sending half of a live worker.
pub trait WorkerTransport: Send + Sync {
    fn send(&self, message: CoordinatorMessage) -> Result<(), TransportError>;

    /// Tear the worker down. Idempotent; no events follow.
    fn terminate(&self);
}

pub trait TransportFactory: Send + Sync + 'static {
    fn spawn(
        &self,
        worker_id: WorkerId,
    ) -> Result<(Arc<dyn WorkerTransport>, EventReceiver), TransportError>;

    /// Short label for logs.
    fn kind(&self) -> &'static str;
}
