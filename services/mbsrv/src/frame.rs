//! Modbus Frame Processing
//!
//! Frame construction for both TCP (MBAP) and RTU modes. A frame value only exists once
//! its bytes have been validated: length-consistent for TCP, length- and CRC-valid for
//! RTU. Parsing is pure; the ingestion loops decide what a failure means for their
//! transport.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// MBAP header length (transaction id, protocol id, length, unit id)
pub const MBAP_HEADER_LEN: usize = 7;

/// Smallest RTU frame accepted: address + function + one data byte + CRC
pub const RTU_MIN_FRAME_LEN: usize = 5;

/// Largest RTU ADU allowed by the Modbus serial line specification
pub const RTU_MAX_FRAME_LEN: usize = 256;

/// Largest value of the MBAP length field (unit id + 253 byte PDU)
pub const MBAP_MAX_LENGTH: usize = 254;

const MODBUS_CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

/// Compute the Modbus RTU CRC-16 of `data`
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Frame construction errors
///
/// `Incomplete` means more bytes could still complete the frame; every other variant
/// means the bytes can never form a valid frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Incomplete frame: need {needed} bytes, got {actual}")]
    Incomplete { needed: usize, actual: usize },

    #[error("Frame too long: {actual} bytes exceeds {max}")]
    TooLong { actual: usize, max: usize },

    #[error("Invalid protocol ID: {0}")]
    ProtocolId(u16),

    #[error("Length mismatch: header declares {declared} bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Frame carries no function code")]
    MissingFunction,

    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    Crc { expected: u16, actual: u16 },
}

impl FrameError {
    /// True when the bytes were a valid prefix that ran out early
    pub fn is_incomplete(&self) -> bool {
        matches!(self, FrameError::Incomplete { .. })
    }
}

/// Modbus TCP frame: MBAP header plus PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFrame {
    transaction_id: u16,
    unit_id: u8,
    function: u8,
    data: Bytes,
}

impl TcpFrame {
    /// Parse one MBAP-framed PDU. The byte count must match the header exactly.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < MBAP_HEADER_LEN + 1 {
            return Err(FrameError::Incomplete {
                needed: MBAP_HEADER_LEN + 1,
                actual: bytes.len(),
            });
        }

        let transaction_id = u16::from_be_bytes([bytes[0], bytes[1]]);
        let protocol_id = u16::from_be_bytes([bytes[2], bytes[3]]);
        if protocol_id != 0 {
            return Err(FrameError::ProtocolId(protocol_id));
        }

        // Length counts the unit id and the PDU
        let length = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
        if length < 2 {
            return Err(FrameError::MissingFunction);
        }
        if length > MBAP_MAX_LENGTH {
            return Err(FrameError::TooLong {
                actual: length,
                max: MBAP_MAX_LENGTH,
            });
        }

        let expected = MBAP_HEADER_LEN - 1 + length;
        if bytes.len() < expected {
            return Err(FrameError::Incomplete {
                needed: expected,
                actual: bytes.len(),
            });
        }
        if bytes.len() > expected {
            return Err(FrameError::LengthMismatch {
                declared: length,
                actual: bytes.len() - (MBAP_HEADER_LEN - 1),
            });
        }

        Ok(Self {
            transaction_id,
            unit_id: bytes[6],
            function: bytes[7],
            data: Bytes::copy_from_slice(&bytes[MBAP_HEADER_LEN + 1..]),
        })
    }

    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn function(&self) -> u8 {
        self.function
    }

    /// PDU data following the function code
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Wrap a response PDU in an MBAP header echoing this request's ids
    pub fn encode_reply(&self, pdu: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
        out.put_u16(self.transaction_id);
        out.put_u16(0);
        out.put_u16((pdu.len() + 1) as u16);
        out.put_u8(self.unit_id);
        out.put_slice(pdu);
        out.freeze()
    }
}

/// Modbus RTU frame: address, PDU and CRC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    address: u8,
    function: u8,
    data: Bytes,
    crc: u16,
}

impl RtuFrame {
    /// Parse one RTU frame, verifying its trailing CRC
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < RTU_MIN_FRAME_LEN {
            return Err(FrameError::Incomplete {
                needed: RTU_MIN_FRAME_LEN,
                actual: bytes.len(),
            });
        }
        if bytes.len() > RTU_MAX_FRAME_LEN {
            return Err(FrameError::TooLong {
                actual: bytes.len(),
                max: RTU_MAX_FRAME_LEN,
            });
        }

        let body_end = bytes.len() - 2;
        let received = u16::from_le_bytes([bytes[body_end], bytes[body_end + 1]]);
        let calculated = crc16(&bytes[..body_end]);
        if received != calculated {
            return Err(FrameError::Crc {
                expected: calculated,
                actual: received,
            });
        }

        Ok(Self {
            address: bytes[0],
            function: bytes[1],
            data: Bytes::copy_from_slice(&bytes[2..body_end]),
            crc: received,
        })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn function(&self) -> u8 {
        self.function
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn crc(&self) -> u16 {
        self.crc
    }

    /// Prefix a response PDU with this request's address and append a fresh CRC
    pub fn encode_reply(&self, pdu: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(pdu.len() + 3);
        out.put_u8(self.address);
        out.put_slice(pdu);
        let crc = crc16(&out);
        out.put_u16_le(crc);
        out.freeze()
    }
}

/// A validated frame from either transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Tcp(TcpFrame),
    Rtu(RtuFrame),
}

impl Frame {
    pub fn function(&self) -> u8 {
        match self {
            Frame::Tcp(f) => f.function(),
            Frame::Rtu(f) => f.function(),
        }
    }

    /// Unit id (TCP) or slave address (RTU)
    pub fn unit_id(&self) -> u8 {
        match self {
            Frame::Tcp(f) => f.unit_id(),
            Frame::Rtu(f) => f.address(),
        }
    }

    pub fn data(&self) -> &Bytes {
        match self {
            Frame::Tcp(f) => f.data(),
            Frame::Rtu(f) => f.data(),
        }
    }

    /// Encode a response PDU with the framing of the transport this frame came from
    pub fn encode_reply(&self, pdu: &[u8]) -> Bytes {
        match self {
            Frame::Tcp(f) => f.encode_reply(pdu),
            Frame::Rtu(f) => f.encode_reply(pdu),
        }
    }
}

impl From<TcpFrame> for Frame {
    fn from(frame: TcpFrame) -> Self {
        Frame::Tcp(frame)
    }
}

impl From<RtuFrame> for Frame {
    fn from(frame: RtuFrame) -> Self {
        Frame::Rtu(frame)
    }
}
