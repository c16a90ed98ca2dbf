//! Modbus TCP listener and connection reader
//!
//! Each read is expected to carry exactly one MBAP frame; there is no reassembly across
//! reads. A read that does not parse ends the connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::{IngestContext, DEFAULT_READ_BUFFER, MAX_READ_BUFFER};
use crate::error::{MbsrvError, Result};
use crate::frame::{TcpFrame, MBAP_HEADER_LEN, MBAP_MAX_LENGTH};
use crate::observer::TransportEvent;
use crate::request::{Request, Responder, TcpResponder};

/// Largest MBAP ADU; a smaller read buffer would split valid requests
pub const MIN_TCP_READ_BUFFER: usize = MBAP_HEADER_LEN - 1 + MBAP_MAX_LENGTH;

/// TCP listener configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpListenerConfig {
    /// Bind address, e.g. "0.0.0.0:502"
    pub address: String,
    /// Per-read deadline; a connection idle for longer is dropped
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    /// Maximum bytes taken by a single read
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_buffer_size() -> usize {
    DEFAULT_READ_BUFFER
}

impl TcpListenerConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            read_timeout_ms: None,
            buffer_size: DEFAULT_READ_BUFFER,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(MbsrvError::config("TCP listen address cannot be empty"));
        }
        if !(MIN_TCP_READ_BUFFER..=MAX_READ_BUFFER).contains(&self.buffer_size) {
            return Err(MbsrvError::config(format!(
                "Read buffer for {} must be between {} and {} bytes",
                self.address, MIN_TCP_READ_BUFFER, MAX_READ_BUFFER
            )));
        }
        if self.read_timeout_ms == Some(0) {
            return Err(MbsrvError::config(format!(
                "Read timeout for {} must be greater than zero",
                self.address
            )));
        }
        Ok(())
    }
}

/// Per-connection read settings
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadSettings {
    pub timeout: Option<Duration>,
    pub buffer_size: usize,
}

impl From<&TcpListenerConfig> for ReadSettings {
    fn from(config: &TcpListenerConfig) -> Self {
        Self {
            timeout: config.read_timeout(),
            buffer_size: config.buffer_size,
        }
    }
}

/// Bind a listener; nothing is started or registered on failure
pub(crate) async fn bind(address: &str) -> Result<TcpListener> {
    TcpListener::bind(address).await.map_err(|e| {
        error!("Failed to listen on {}: {}", address, e);
        MbsrvError::bind(address, e)
    })
}

/// Accept connections until shutdown or the first accept error
pub(crate) async fn accept_loop(listener: TcpListener, settings: ReadSettings, ctx: IngestContext) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    loop {
        let accepted = tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                debug!("Listener {} closed", local);
                return;
            },
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                let peer = addr.to_string();
                info!("Accepted Modbus connection from {}", peer);
                ctx.notify(TransportEvent::Accepted { peer: peer.clone() });

                let (reader, writer) = stream.into_split();
                let responder: Arc<dyn Responder> =
                    Arc::new(TcpResponder::new(peer.clone(), writer));
                tokio::spawn(read_connection(peer, reader, responder, settings, ctx.clone()));
            },
            Err(e) => {
                error!("Unable to accept connections on {}: {}", local, e);
                ctx.notify(TransportEvent::AcceptFailed {
                    error: e.to_string(),
                });
                return;
            },
        }
    }
}

/// Read loop for one connection; always reports the teardown
pub(crate) async fn read_connection<R>(
    peer: String,
    reader: R,
    responder: Arc<dyn Responder>,
    settings: ReadSettings,
    ctx: IngestContext,
) where
    R: AsyncRead + Unpin,
{
    serve_connection(&peer, reader, responder, settings, &ctx).await;
    debug!("Connection {} closed", peer);
    ctx.notify(TransportEvent::Disconnected { peer });
}

async fn serve_connection<R>(
    peer: &str,
    mut reader: R,
    responder: Arc<dyn Responder>,
    settings: ReadSettings,
    ctx: &IngestContext,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; settings.buffer_size];

    loop {
        let read = tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            read = read_with_deadline(&mut reader, &mut buffer, settings.timeout) => read,
        };

        let bytes_read = match read {
            // End of stream
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                warn!("Read error from {}: {}", peer, e);
                return;
            },
        };

        let packet = &buffer[..bytes_read];
        debug!("Received {} bytes from {}: {}", bytes_read, peer, hex::encode(packet));

        let frame = match TcpFrame::parse(packet) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Bad packet from {}: {}", peer, e);
                ctx.notify(TransportEvent::FrameRejected {
                    peer: peer.to_string(),
                    error: e.to_string(),
                });
                return;
            },
        };

        if !ctx.forward(Request::new(responder.clone(), frame.into())).await {
            return;
        }
    }
}

async fn read_with_deadline<R>(
    reader: &mut R,
    buffer: &mut [u8],
    deadline: Option<Duration>,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, reader.read(buffer))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded"))?,
        None => reader.read(buffer).await,
    }
}

/// Local address a bound listener ended up on
pub(crate) fn local_addr(listener: &TcpListener) -> Result<SocketAddr> {
    Ok(listener.local_addr()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch;
    use crate::request::StreamResponder;
    use tokio::io::AsyncWriteExt;
    use tokio_util::sync::CancellationToken;

    const READ_HOLDING: [u8; 12] = [
        0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02,
    ];

    fn context(capacity: usize) -> (IngestContext, dispatch::RequestReceiver) {
        let (queue, receiver) = dispatch::channel(capacity);
        let ctx = IngestContext {
            queue,
            observer: None,
            shutdown: CancellationToken::new(),
        };
        (ctx, receiver)
    }

    fn settings(timeout: Option<Duration>) -> ReadSettings {
        ReadSettings {
            timeout,
            buffer_size: DEFAULT_READ_BUFFER,
        }
    }

    #[test]
    fn test_listener_config_validation() {
        assert!(TcpListenerConfig::new("127.0.0.1:502").validate().is_ok());
        assert!(TcpListenerConfig::new("").validate().is_err());

        let mut config = TcpListenerConfig::new("127.0.0.1:502");
        config.read_timeout_ms = Some(0);
        assert!(config.validate().is_err());

        let config =
            TcpListenerConfig::new("127.0.0.1:502").with_read_timeout(Duration::from_secs(5));
        assert_eq!(config.read_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_listener_buffer_must_hold_a_full_adu() {
        assert_eq!(MIN_TCP_READ_BUFFER, 260);

        let mut config = TcpListenerConfig::new("127.0.0.1:502");
        config.buffer_size = MIN_TCP_READ_BUFFER;
        assert!(config.validate().is_ok());
        config.buffer_size = MIN_TCP_READ_BUFFER - 1;
        assert!(config.validate().is_err());
        config.buffer_size = 0;
        assert!(config.validate().is_err());
        config.buffer_size = MAX_READ_BUFFER + 1;
        assert!(config.validate().is_err());
        config.buffer_size = usize::MAX;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_reader_enqueues_each_frame() {
        let (ctx, mut receiver) = context(4);
        let (mut client, server) = tokio::io::duplex(512);
        let (read_half, write_half) = tokio::io::split(server);
        let responder: Arc<dyn Responder> = Arc::new(StreamResponder::new("peer", write_half));

        let task = tokio::spawn(read_connection(
            "peer".to_string(),
            read_half,
            responder,
            settings(None),
            ctx,
        ));

        client.write_all(&READ_HOLDING).await.unwrap();
        let first = receiver.recv().await.unwrap();
        assert_eq!(first.frame().function(), 0x03);

        client.write_all(&READ_HOLDING).await.unwrap();
        assert!(receiver.recv().await.is_some());

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_stops_on_bad_frame() {
        let (ctx, mut receiver) = context(4);
        let (mut client, server) = tokio::io::duplex(512);
        let (read_half, write_half) = tokio::io::split(server);
        let responder: Arc<dyn Responder> = Arc::new(StreamResponder::new("peer", write_half));

        let task = tokio::spawn(read_connection(
            "peer".to_string(),
            read_half,
            responder,
            settings(None),
            ctx,
        ));

        client.write_all(&[0x00, 0x01, 0x00, 0x07, 0x00]).await.unwrap();
        task.await.unwrap();
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_read_deadline_closes_connection() {
        let (ctx, _receiver) = context(1);
        let (_client, server) = tokio::io::duplex(512);
        let (read_half, write_half) = tokio::io::split(server);
        let responder: Arc<dyn Responder> = Arc::new(StreamResponder::new("idle", write_half));

        let finished = tokio::time::timeout(
            Duration::from_secs(2),
            read_connection(
                "idle".to_string(),
                read_half,
                responder,
                settings(Some(Duration::from_millis(50))),
                ctx,
            ),
        )
        .await;
        assert!(finished.is_ok());
    }
}
