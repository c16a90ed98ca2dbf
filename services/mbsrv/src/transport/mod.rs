//! Transport read loops
//!
//! One task per accepted TCP connection and one per open serial port. Tasks share nothing
//! but the dispatch queue and the optional observer.

pub mod serial;
pub mod tcp;

pub use serial::SerialPortConfig;
pub use tcp::TcpListenerConfig;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::dispatch::DispatchQueue;
use crate::observer::{notify, Observer, TransportEvent};
use crate::request::Request;

/// Default size of a single read
pub const DEFAULT_READ_BUFFER: usize = 512;

/// Largest read buffer a transport accepts
pub const MAX_READ_BUFFER: usize = 64 * 1024;

/// State every read loop is handed when it starts
#[derive(Clone)]
pub(crate) struct IngestContext {
    pub queue: DispatchQueue,
    pub observer: Option<Observer>,
    pub shutdown: CancellationToken,
}

impl IngestContext {
    pub fn notify(&self, event: TransportEvent) {
        notify(self.observer.as_ref(), event);
    }

    /// Enqueue a request; false means the loop should stop
    pub async fn forward(&self, request: Request) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            sent = self.queue.enqueue(request) => match sent {
                Ok(()) => true,
                Err(e) => {
                    warn!("{}, stopping read loop", e);
                    false
                },
            },
        }
    }
}
