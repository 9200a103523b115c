//! Dataset timestamps
//!
//! A timestamp is the version of an Active or Pending dataset: 48 bits of
//! seconds, 15 bits of ticks (1/32768 s) and the authoritative (U) bit.
//! Timestamps are totally ordered by seconds, then ticks, then the
//! authoritative bit, where an authoritative timestamp wins a tie.

use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Largest representable seconds value (48 bits).
pub const MAX_SECONDS: u64 = (1 << 48) - 1;
/// Largest representable ticks value (15 bits).
pub const MAX_TICKS: u16 = (1 << 15) - 1;
/// Encoded length of a timestamp TLV value.
pub const TIMESTAMP_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    seconds: u64,
    ticks: u16,
    authoritative: bool,
}

impl Timestamp {
    /// Build a timestamp, masking `seconds` to 48 bits and `ticks` to 15 bits.
    pub fn new(seconds: u64, ticks: u16, authoritative: bool) -> Self {
        Self {
            seconds: seconds & MAX_SECONDS,
            ticks: ticks & MAX_TICKS,
            authoritative,
        }
    }

    pub fn from_seconds(seconds: u64) -> Self {
        Self::new(seconds, 0, false)
    }

    pub fn seconds(&self) -> u64 {
        self.seconds
    }

    pub fn ticks(&self) -> u16 {
        self.ticks
    }

    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    /// Next timestamp after this one, in whole seconds.
    pub fn advanced_by(&self, seconds: u64) -> Self {
        Self::new(
            self.seconds.saturating_add(seconds).min(MAX_SECONDS),
            self.ticks,
            self.authoritative,
        )
    }

    pub fn encode(&self) -> [u8; TIMESTAMP_LEN] {
        let mut out = [0u8; TIMESTAMP_LEN];
        out[..6].copy_from_slice(&self.seconds.to_be_bytes()[2..]);
        let low = (self.ticks << 1) | u16::from(self.authoritative);
        out[6..].copy_from_slice(&low.to_be_bytes());
        out
    }

    pub fn decode(tlv_type: u8, value: &[u8]) -> Result<Self, DecodeError> {
        let bytes: &[u8; TIMESTAMP_LEN] =
            value.try_into().map_err(|_| DecodeError::InvalidLength {
                tlv_type,
                length: value.len(),
            })?;
        let mut seconds = [0u8; 8];
        seconds[2..].copy_from_slice(&bytes[..6]);
        let low = u16::from_be_bytes([bytes[6], bytes[7]]);
        Ok(Self {
            seconds: u64::from_be_bytes(seconds),
            ticks: low >> 1,
            authoritative: low & 1 == 1,
        })
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .cmp(&other.seconds)
            .then(self.ticks.cmp(&other.ticks))
            .then(self.authoritative.cmp(&other.authoritative))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s+{}t", self.seconds, self.ticks)?;
        if self.authoritative {
            write!(f, "(U)")?;
        }
        Ok(())
    }
}

/// True when `candidate` is strictly newer than `current`; an absent current
/// timestamp is older than any present one.
pub fn is_newer(candidate: Option<Timestamp>, current: Option<Timestamp>) -> bool {
    match (candidate, current) {
        (Some(c), Some(s)) => c > s,
        (Some(_), None) => true,
        (None, _) => false,
    }
}
