//! Modbus ingestion server
//!
//! The server owns the dispatch queue and every open transport. `listen_tcp` and
//! `listen_rtu` open a transport and start its background loop; each loop pushes parsed
//! requests into the one shared queue, drained by whoever holds the [`RequestReceiver`].
//!
//! ## Example Usage
//!
//! ```no_run
//! use mbsrv::config::IngestConfig;
//! use mbsrv::server::Server;
//! use mbsrv::transport::TcpListenerConfig;
//!
//! # async fn run() -> mbsrv::error::Result<()> {
//! let (mut server, mut requests) = Server::new(&IngestConfig::default());
//! server.listen_tcp(&TcpListenerConfig::new("0.0.0.0:502")).await?;
//!
//! while let Some(request) = requests.recv().await {
//!     // Illegal function exception for everything
//!     let function = request.frame().function();
//!     request.respond(&[function | 0x80, 0x01]).await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

use crate::config::IngestConfig;
use crate::dispatch::{self, RequestReceiver};
use crate::error::Result;
use crate::observer::{Observer, TransportEvent};
use crate::request::{Responder, StreamResponder};
use crate::transport::tcp::{self, ReadSettings};
use crate::transport::{serial, IngestContext, SerialPortConfig, TcpListenerConfig};

/// An active TCP listener
#[derive(Debug)]
pub struct ListenerHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// False once the accept loop has stopped
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// An open serial port
#[derive(Debug)]
pub struct PortHandle {
    device: String,
    task: JoinHandle<()>,
}

impl PortHandle {
    pub fn device(&self) -> &str {
        &self.device
    }

    /// False once the read loop has stopped
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Modbus TCP/RTU ingestion server
pub struct Server {
    context: IngestContext,
    listeners: Vec<ListenerHandle>,
    ports: Vec<PortHandle>,
}

impl Server {
    /// Create a server and the receiving end of its dispatch queue
    pub fn new(config: &IngestConfig) -> (Self, RequestReceiver) {
        let (queue, receiver) = dispatch::channel(config.queue_capacity);
        let server = Self {
            context: IngestContext {
                queue,
                observer: None,
                shutdown: CancellationToken::new(),
            },
            listeners: Vec::new(),
            ports: Vec::new(),
        };
        (server, receiver)
    }

    /// Report transport events to `observer`; applies to transports opened afterwards
    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.context.observer = Some(observer);
        self
    }

    /// Bind a TCP listener and start accepting connections
    ///
    /// Returns the bound address. On failure nothing is registered and no task is
    /// started.
    pub async fn listen_tcp(&mut self, config: &TcpListenerConfig) -> Result<SocketAddr> {
        if let Err(e) = config.validate() {
            self.context.notify(TransportEvent::BindFailed {
                address: config.address.clone(),
                error: e.to_string(),
            });
            return Err(e);
        }

        let listener = match tcp::bind(&config.address).await {
            Ok(listener) => listener,
            Err(e) => {
                self.context.notify(TransportEvent::BindFailed {
                    address: config.address.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            },
        };
        let address = tcp::local_addr(&listener)?;

        info!("Modbus TCP listening on {}", address);
        self.context.notify(TransportEvent::Listening {
            address: address.to_string(),
        });

        let span = tracing::info_span!("tcp", listener = %address);
        let task = tokio::spawn(
            tcp::accept_loop(listener, ReadSettings::from(config), self.context.clone())
                .instrument(span),
        );
        self.listeners.push(ListenerHandle { address, task });
        Ok(address)
    }

    /// Open a serial device and start reading RTU frames from it
    pub fn listen_rtu(&mut self, config: &SerialPortConfig) -> Result<()> {
        let port = serial::open(config)?;
        self.attach_serial(config.device.clone(), port, config)
    }

    /// Run the RTU reader over an already-open byte stream
    ///
    /// `listen_rtu` uses this after opening the device; it also accepts pseudo
    /// terminals or in-memory streams. The configuration is validated first; on failure
    /// the stream is dropped and nothing is registered.
    pub fn attach_serial<S>(
        &mut self,
        device: impl Into<String>,
        stream: S,
        config: &SerialPortConfig,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let device = device.into();
        config.validate()?;

        let (reader, writer) = tokio::io::split(stream);
        let responder: Arc<dyn Responder> =
            Arc::new(StreamResponder::new(device.clone(), writer));

        self.context.notify(TransportEvent::PortOpened {
            device: device.clone(),
        });

        let span = tracing::info_span!("rtu", device = %device);
        let task = tokio::spawn(
            serial::read_port(
                device.clone(),
                reader,
                config.reassembler(),
                config.buffer_size,
                responder,
                self.context.clone(),
            )
            .instrument(span),
        );
        self.ports.push(PortHandle { device, task });
        Ok(())
    }

    pub fn listeners(&self) -> &[ListenerHandle] {
        &self.listeners
    }

    pub fn ports(&self) -> &[PortHandle] {
        &self.ports
    }

    /// Stop every listener, connection and port loop
    ///
    /// Requests already queued stay available to the receiver.
    pub fn shutdown(&self) {
        info!(
            "Shutting down {} listener(s) and {} port(s)",
            self.listeners.len(),
            self.ports.len()
        );
        self.context.shutdown.cancel();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.context.shutdown.cancel();
    }
}
