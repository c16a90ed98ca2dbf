//! Modbus TCP/RTU ingestion
//!
//! Accepts Modbus TCP connections and reads Modbus RTU serial ports, turns what arrives
//! into validated frames and feeds them, paired with a handle that can answer them, into
//! one dispatch queue. What happens to a request after that is up to the consumer.
//!
//! ```text
//!  TCP listener ──► connection reader ──┐
//!  TCP listener ──► connection reader ──┤
//!                                       ├──► dispatch queue ──► consumer
//!  serial port ──► reassembler ─────────┤
//!  serial port ──► reassembler ─────────┘
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod logging;
pub mod observer;
pub mod reassembly;
pub mod request;
pub mod server;
pub mod transport;

pub use config::MbsrvConfig;
pub use dispatch::{DispatchQueue, RequestReceiver};
pub use error::{MbsrvError, Result};
pub use frame::{Frame, FrameError, RtuFrame, TcpFrame};
pub use observer::{Observer, TransportEvent};
pub use reassembly::{BoundaryPolicy, Reassembler};
pub use request::{Request, Responder};
pub use server::Server;
pub use transport::{SerialPortConfig, TcpListenerConfig};
