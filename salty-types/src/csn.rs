//! Combined sequence numbers.
//!
//! A CSN is a 48-bit counter made of a 16-bit overflow number and a 32-bit
//! sequence number. It starts at a random sequence number with overflow
//! zero and is incremented once per message in one direction. When both
//! halves reach their maximum the counter is dead: every further increment
//! or serialization fails with [`CodecError::OverflowSentinel`].

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{CodecError, CodecResult};

/// Wire size of a CSN.
pub const CSN_SIZE: usize = 6;

/// Combined sequence number.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CombinedSequenceNumber {
    overflow: u16,
    sequence: u32,
}

impl CombinedSequenceNumber {
    /// Fresh CSN with overflow zero and a random sequence number.
    pub fn random() -> Self {
        Self {
            overflow: 0,
            sequence: OsRng.next_u32(),
        }
    }

    /// CSN from explicit parts.
    pub const fn new(overflow: u16, sequence: u32) -> Self {
        Self { overflow, sequence }
    }

    /// Parse the 6-byte big-endian wire form.
    pub fn from_bytes(bytes: [u8; CSN_SIZE]) -> Self {
        Self {
            overflow: u16::from_be_bytes([bytes[0], bytes[1]]),
            sequence: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        }
    }

    /// Overflow half.
    pub fn overflow_number(&self) -> u16 {
        self.overflow
    }

    /// Sequence half.
    pub fn sequence_number(&self) -> u32 {
        self.sequence
    }

    /// The 48-bit value.
    pub fn combined(&self) -> u64 {
        (u64::from(self.overflow) << 32) | u64::from(self.sequence)
    }

    /// True once the terminal value has been reached.
    pub fn is_overflow_sentinel(&self) -> bool {
        self.overflow == u16::MAX && self.sequence == u32::MAX
    }

    /// Advance by one.
    pub fn increment(&mut self) -> CodecResult<()> {
        if self.is_overflow_sentinel() {
            return Err(CodecError::OverflowSentinel);
        }
        match self.sequence.checked_add(1) {
            Some(next) => self.sequence = next,
            None => {
                self.sequence = 0;
                self.overflow += 1;
            }
        }
        Ok(())
    }

    /// The 6-byte big-endian wire form.
    pub fn as_bytes(&self) -> CodecResult<[u8; CSN_SIZE]> {
        if self.is_overflow_sentinel() {
            return Err(CodecError::OverflowSentinel);
        }
        let mut out = [0u8; CSN_SIZE];
        out[..2].copy_from_slice(&self.overflow.to_be_bytes());
        out[2..].copy_from_slice(&self.sequence.to_be_bytes());
        Ok(out)
    }
}

impl fmt::Debug for CombinedSequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Csn({}:{})", self.overflow, self.sequence)
    }
}

impl fmt::Display for CombinedSequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.combined())
    }
}
