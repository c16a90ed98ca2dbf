//! Modbus RTU serial port reader
//!
//! Serial links are long-lived: a frame that fails to parse is dropped and the port keeps
//! listening. Only an I/O error on the port itself ends its loop.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

use super::{IngestContext, DEFAULT_READ_BUFFER, MAX_READ_BUFFER};
use crate::error::{MbsrvError, Result};
use crate::frame::{RtuFrame, RTU_MAX_FRAME_LEN, RTU_MIN_FRAME_LEN};
use crate::observer::TransportEvent;
use crate::reassembly::{BoundaryPolicy, Reassembler, DEFAULT_MAX_FRAME_LEN};
use crate::request::{Request, Responder};

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialPortConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM1")
    pub device: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity ("None", "Even", "Odd")
    pub parity: String,
    /// Flow control ("None", "Software", "Hardware")
    pub flow_control: String,
    /// Frame boundary detection
    pub boundary: BoundaryPolicy,
    /// Bytes held without a frame boundary before the accumulator is discarded
    pub max_frame_len: usize,
    /// Maximum bytes taken by a single read
    pub buffer_size: usize,
}

impl Default for SerialPortConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: "None".to_string(),
            flow_control: "None".to_string(),
            boundary: BoundaryPolicy::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            buffer_size: DEFAULT_READ_BUFFER,
        }
    }
}

impl SerialPortConfig {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Self::default()
        }
    }

    pub fn with_boundary(mut self, boundary: BoundaryPolicy) -> Self {
        self.boundary = boundary;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.is_empty() {
            return Err(MbsrvError::config("Port path cannot be empty"));
        }

        if self.baud_rate == 0 {
            return Err(MbsrvError::config("Baud rate must be greater than zero"));
        }

        if ![5, 6, 7, 8].contains(&self.data_bits) {
            return Err(MbsrvError::config("Data bits must be 5, 6, 7, or 8"));
        }

        if ![1, 2].contains(&self.stop_bits) {
            return Err(MbsrvError::config("Stop bits must be 1 or 2"));
        }

        if !["None", "Even", "Odd"].contains(&self.parity.as_str()) {
            return Err(MbsrvError::config("Parity must be None, Even, or Odd"));
        }

        if !["None", "Software", "Hardware"].contains(&self.flow_control.as_str()) {
            return Err(MbsrvError::config(
                "Flow control must be None, Software, or Hardware",
            ));
        }

        if !(RTU_MIN_FRAME_LEN..=RTU_MAX_FRAME_LEN).contains(&self.max_frame_len) {
            return Err(MbsrvError::config(format!(
                "max_frame_len must be between {} and {}",
                RTU_MIN_FRAME_LEN, RTU_MAX_FRAME_LEN
            )));
        }

        if !(1..=MAX_READ_BUFFER).contains(&self.buffer_size) {
            return Err(MbsrvError::config(format!(
                "Read buffer must be between 1 and {} bytes",
                MAX_READ_BUFFER
            )));
        }

        Ok(())
    }

    /// A reassembler for one port opened with this configuration
    pub fn reassembler(&self) -> Reassembler {
        Reassembler::new(self.boundary, self.max_frame_len)
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.parity.as_str() {
            "Even" => tokio_serial::Parity::Even,
            "Odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        }
    }

    fn flow_control(&self) -> tokio_serial::FlowControl {
        match self.flow_control.as_str() {
            "Software" => tokio_serial::FlowControl::Software,
            "Hardware" => tokio_serial::FlowControl::Hardware,
            _ => tokio_serial::FlowControl::None,
        }
    }

    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

/// Open the configured device
pub fn open(config: &SerialPortConfig) -> Result<SerialStream> {
    config.validate()?;
    debug!("Opening serial port: {}", config.device);

    #[allow(unused_mut)]
    let mut port = tokio_serial::new(&config.device, config.baud_rate)
        .data_bits(config.data_bits())
        .parity(config.parity())
        .stop_bits(config.stop_bits())
        .flow_control(config.flow_control())
        .open_native_async()
        .map_err(|e| {
            error!("Failed to open {}: {}", config.device, e);
            MbsrvError::serial_open(&config.device, e)
        })?;

    #[cfg(unix)]
    port.set_exclusive(false)
        .map_err(|e| MbsrvError::serial_open(&config.device, e))?;

    info!(
        "Serial port {} opened ({} baud, {}{}{})",
        config.device,
        config.baud_rate,
        config.data_bits,
        config.parity.chars().next().unwrap_or('N'),
        config.stop_bits
    );
    Ok(port)
}

/// Read loop for one port. The reassembler is owned by this task alone.
pub(crate) async fn read_port<R>(
    device: String,
    mut reader: R,
    mut reassembler: Reassembler,
    buffer_size: usize,
    responder: Arc<dyn Responder>,
    ctx: IngestContext,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let read = tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                debug!("Serial port {} closed", device);
                return;
            },
            read = reader.read(&mut buffer) => read,
        };

        let bytes_read = match read {
            Ok(0) => {
                debug!("Serial port {} reached end of stream", device);
                ctx.notify(TransportEvent::PortFailed {
                    device,
                    error: "end of stream".to_string(),
                });
                return;
            },
            Ok(n) => n,
            Err(e) => {
                error!("Serial read error on {}: {}", device, e);
                ctx.notify(TransportEvent::PortFailed {
                    device,
                    error: e.to_string(),
                });
                return;
            },
        };

        debug!(
            "Received {} bytes on {}: {}",
            bytes_read,
            device,
            hex::encode(&buffer[..bytes_read])
        );

        for candidate in reassembler.push(&buffer[..bytes_read]) {
            match RtuFrame::parse(&candidate) {
                Ok(frame) => {
                    if !ctx.forward(Request::new(responder.clone(), frame.into())).await {
                        return;
                    }
                },
                Err(e) => {
                    warn!(
                        "Bad serial frame on {}: {} ({}), keep listening",
                        device,
                        e,
                        hex::encode(&candidate)
                    );
                    // Held bytes were aligned against a bad frame; resync from the next read
                    reassembler.reset();
                },
            }
        }
    }
}
