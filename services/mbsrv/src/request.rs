//! Requests and responder handles
//!
//! A [`Request`] pairs one validated frame with the handle that can answer it. The read
//! loops split every connection or port: they keep the read half and hand the write half
//! to a [`StreamResponder`], so nothing in the ingestion layer ever writes to, or closes,
//! the writer a consumer may be using.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{MbsrvError, Result};
use crate::frame::Frame;

/// Capability to send a reply back to where a request came from
#[async_trait]
pub trait Responder: Send + Sync + fmt::Debug {
    /// Peer address or device path, for logging
    fn peer(&self) -> &str;

    /// Write raw reply bytes to the originating connection or port
    async fn respond(&self, bytes: &[u8]) -> Result<()>;
}

/// Responder over the write half of any byte stream
pub struct StreamResponder<W> {
    peer: String,
    writer: Arc<Mutex<W>>,
}

/// Responder bound to one accepted TCP connection
pub type TcpResponder = StreamResponder<OwnedWriteHalf>;

impl<W> StreamResponder<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(peer: impl Into<String>, writer: W) -> Self {
        Self {
            peer: peer.into(),
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

impl<W> fmt::Debug for StreamResponder<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResponder")
            .field("peer", &self.peer)
            .finish()
    }
}

#[async_trait]
impl<W> Responder for StreamResponder<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn respond(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| MbsrvError::io(format!("Failed to send response to {}: {}", self.peer, e)))?;
        writer.flush().await?;
        debug!("Sent {} bytes to {}", bytes.len(), self.peer);
        Ok(())
    }
}

/// One parsed frame and the handle that can answer it
#[derive(Debug, Clone)]
pub struct Request {
    responder: Arc<dyn Responder>,
    frame: Frame,
}

impl Request {
    pub fn new(responder: Arc<dyn Responder>, frame: Frame) -> Self {
        Self { responder, frame }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Peer the request arrived from
    pub fn peer(&self) -> &str {
        self.responder.peer()
    }

    /// Frame a response PDU for this request's transport and send it
    pub async fn respond(&self, pdu: &[u8]) -> Result<()> {
        let bytes = self.frame.encode_reply(pdu);
        self.responder.respond(&bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RtuFrame;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_stream_responder_writes_through() {
        let (client, server) = tokio::io::duplex(64);
        let (_read, write) = tokio::io::split(server);
        let responder = StreamResponder::new("duplex", write);
        assert_eq!(responder.peer(), "duplex");

        responder.respond(&[0xDE, 0xAD]).await.unwrap();

        let mut client = client;
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0xDE, 0xAD]);
    }

    #[tokio::test]
    async fn test_request_respond_encodes_reply() {
        let (mut client, server) = tokio::io::duplex(64);
        let (_read, write) = tokio::io::split(server);
        let frame = RtuFrame::parse(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]).unwrap();
        let request = Request::new(Arc::new(StreamResponder::new("ttyS0", write)), frame.into());

        request.respond(&[0x03, 0x02, 0x00, 0x07]).await.unwrap();

        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        let reply = RtuFrame::parse(&buf).unwrap();
        assert_eq!(reply.function(), 0x03);
        assert_eq!(reply.data().as_ref(), &[0x02, 0x00, 0x07]);
    }
}
