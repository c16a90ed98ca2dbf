//! Serial frame reassembly
//!
//! RTU has no length field and no delimiter, and a serial read may return anything from
//! one byte to several frames. A [`Reassembler`] keeps the bytes of one port between reads
//! and decides, from the bytes alone, when a candidate frame is complete. Each port task
//! owns its own instance; accumulators are never shared between ports.
//!
//! ```text
//!            push (n <= 2, empty)            push (boundary reached)
//!   Empty ──────────────────────► Accumulating ─────────────────────► frame ready
//!     ▲                                │  ▲                                │
//!     │          ceiling exceeded      │  └──── remainder kept ◄───────────┤
//!     └────────────────────────────────┴───────────────────────────────────┘
//! ```

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::frame::RTU_MIN_FRAME_LEN;

/// Fragments this short can never start a frame (address + function + CRC needs more)
pub const UNDER_LENGTH_FRAGMENT: usize = 2;

/// Accumulated length at which the fixed-threshold policy hands the bytes over
pub const FIXED_THRESHOLD: usize = RTU_MIN_FRAME_LEN;

/// Default safety ceiling for an incomplete accumulator
pub const DEFAULT_MAX_FRAME_LEN: usize = 100;

/// How the reassembler decides a frame is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryPolicy {
    /// Hand over everything once at least [`FIXED_THRESHOLD`] bytes are held
    FixedThreshold,
    /// Derive the frame length from the function code; unknown codes fall back to the
    /// fixed threshold
    #[default]
    LengthAware,
}

/// What a partial header says about the total frame length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedLen {
    /// Total frame length in bytes, CRC included
    Known(usize),
    /// The length is encoded further in; at least this many bytes are required
    NeedHeader(usize),
    /// Function code has no length rule
    Unknown,
}

/// Maps the first bytes of a frame to its expected total length
pub type LengthRule = fn(&[u8]) -> ExpectedLen;

/// Length rule for Modbus requests as received by a server
pub fn request_length(buf: &[u8]) -> ExpectedLen {
    let Some(&function) = buf.get(1) else {
        return ExpectedLen::NeedHeader(2);
    };

    match function {
        // address, function, start(2), quantity/value(2), crc(2)
        0x01..=0x06 => ExpectedLen::Known(8),
        // address, function, start(2), quantity(2), byte count, data, crc(2)
        0x0F | 0x10 => byte_count_at(buf, 6, 9),
        // address, function, reference(2), and mask(2), or mask(2), crc(2)
        0x16 => ExpectedLen::Known(10),
        // address, function, read(4), write start(2), write quantity(2), byte count, data, crc(2)
        0x17 => byte_count_at(buf, 10, 13),
        _ => ExpectedLen::Unknown,
    }
}

fn byte_count_at(buf: &[u8], offset: usize, fixed: usize) -> ExpectedLen {
    match buf.get(offset) {
        Some(&count) => ExpectedLen::Known(fixed + count as usize),
        None => ExpectedLen::NeedHeader(offset + 1),
    }
}

/// Observable state of a reassembler between reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    Empty,
    Accumulating,
}

/// Per-port byte accumulator and frame boundary detector
#[derive(Debug)]
pub struct Reassembler {
    policy: BoundaryPolicy,
    max_frame_len: usize,
    length_rule: LengthRule,
    buf: BytesMut,
}

impl Reassembler {
    pub fn new(policy: BoundaryPolicy, max_frame_len: usize) -> Self {
        Self {
            policy,
            max_frame_len,
            length_rule: request_length,
            buf: BytesMut::with_capacity(max_frame_len),
        }
    }

    /// Replace the function-code length table used by the length-aware policy
    pub fn with_length_rule(mut self, rule: LengthRule) -> Self {
        self.length_rule = rule;
        self
    }

    pub fn policy(&self) -> BoundaryPolicy {
        self.policy
    }

    pub fn state(&self) -> ReassemblyState {
        if self.buf.is_empty() {
            ReassemblyState::Empty
        } else {
            ReassemblyState::Accumulating
        }
    }

    /// Bytes currently held
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop everything held
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Feed the bytes of one read; returns the candidate frames completed by it, oldest first
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        if chunk.is_empty() {
            return Vec::new();
        }

        if self.buf.is_empty() && chunk.len() <= UNDER_LENGTH_FRAGMENT {
            self.buf.extend_from_slice(chunk);
            debug!("Under-length fragment of {} bytes held", chunk.len());
            return Vec::new();
        }

        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        match self.policy {
            BoundaryPolicy::FixedThreshold => {
                if let Some(frame) = self.take_at_threshold() {
                    frames.push(frame);
                }
            },
            BoundaryPolicy::LengthAware => self.take_by_length(&mut frames),
        }

        if self.buf.len() > self.max_frame_len {
            warn!(
                "Discarding {} buffered bytes: no frame boundary within {} bytes",
                self.buf.len(),
                self.max_frame_len
            );
            self.buf.clear();
        }

        frames
    }

    fn take_at_threshold(&mut self) -> Option<Bytes> {
        if self.buf.len() >= FIXED_THRESHOLD {
            Some(self.buf.split().freeze())
        } else {
            None
        }
    }

    fn take_by_length(&mut self, frames: &mut Vec<Bytes>) {
        while !self.buf.is_empty() {
            match (self.length_rule)(&self.buf) {
                ExpectedLen::Known(total) if self.buf.len() >= total => {
                    // Bytes past the boundary belong to the next frame
                    frames.push(self.buf.split_to(total).freeze());
                },
                ExpectedLen::Known(_) | ExpectedLen::NeedHeader(_) => break,
                ExpectedLen::Unknown => {
                    if let Some(frame) = self.take_at_threshold() {
                        frames.push(frame);
                    }
                    break;
                },
            }
        }
    }
}
