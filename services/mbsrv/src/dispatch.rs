//! Dispatch queue shared by every transport
//!
//! Every read loop holds a [`DispatchQueue`] clone and awaits capacity before handing a
//! request over, so a slow consumer stalls ingestion on all transports at once. There is
//! exactly one [`RequestReceiver`].

use tokio::sync::mpsc;

use crate::error::{MbsrvError, Result};
use crate::request::Request;

/// Default queue depth; one slot keeps the handoff close to synchronous
pub const DEFAULT_QUEUE_CAPACITY: usize = 1;

/// Producer side of the dispatch queue
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<Request>,
}

/// Consumer side of the dispatch queue
#[derive(Debug)]
pub struct RequestReceiver {
    rx: mpsc::Receiver<Request>,
}

/// Create a dispatch queue holding at most `capacity` undelivered requests
pub fn channel(capacity: usize) -> (DispatchQueue, RequestReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (DispatchQueue { tx }, RequestReceiver { rx })
}

impl DispatchQueue {
    /// Hand a request to the consumer, waiting while the queue is full
    pub async fn enqueue(&self, request: Request) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| MbsrvError::QueueClosed)
    }

    /// True once the receiver has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl RequestReceiver {
    /// Next request from any transport, or `None` when every producer is gone
    pub async fn recv(&mut self) -> Option<Request> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Request> {
        self.rx.try_recv().ok()
    }
}
