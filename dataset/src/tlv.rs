//! TLV codec
//!
//! Type-length-value records with a one-byte type and a one-byte length.
//! [`TlvSet`] keeps TLVs unique by type in insertion order and preserves
//! types it does not recognise, so datasets echoed or merged by this node
//! keep fields added by newer peers.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::DecodeError;

/// Largest value a one-byte length can describe.
pub const MAX_TLV_VALUE_LEN: usize = u8::MAX as usize;

// ============================================================================
// MeshCoP TLV registry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MeshcopTlv {
    Channel = 0,
    PanId = 1,
    ExtendedPanId = 2,
    NetworkName = 3,
    Pskc = 4,
    NetworkKey = 5,
    NetworkKeySequence = 6,
    MeshLocalPrefix = 7,
    SteeringData = 8,
    BorderAgentLocator = 9,
    CommissionerId = 10,
    CommissionerSessionId = 11,
    SecurityPolicy = 12,
    Get = 13,
    ActiveTimestamp = 14,
    State = 16,
    PendingTimestamp = 51,
    DelayTimer = 52,
    ChannelMask = 53,
}

/// Allowed value lengths for a TLV type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthRule {
    Exact(usize),
    Range(usize, usize),
    AtLeast(usize),
    Any,
}

impl LengthRule {
    pub fn allows(self, len: usize) -> bool {
        match self {
            Self::Exact(n) => len == n,
            Self::Range(min, max) => (min..=max).contains(&len),
            Self::AtLeast(min) => len >= min,
            Self::Any => true,
        }
    }
}

impl MeshcopTlv {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Channel,
            1 => Self::PanId,
            2 => Self::ExtendedPanId,
            3 => Self::NetworkName,
            4 => Self::Pskc,
            5 => Self::NetworkKey,
            6 => Self::NetworkKeySequence,
            7 => Self::MeshLocalPrefix,
            8 => Self::SteeringData,
            9 => Self::BorderAgentLocator,
            10 => Self::CommissionerId,
            11 => Self::CommissionerSessionId,
            12 => Self::SecurityPolicy,
            13 => Self::Get,
            14 => Self::ActiveTimestamp,
            16 => Self::State,
            51 => Self::PendingTimestamp,
            52 => Self::DelayTimer,
            53 => Self::ChannelMask,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::PanId => "pan id",
            Self::ExtendedPanId => "extended pan id",
            Self::NetworkName => "network name",
            Self::Pskc => "pskc",
            Self::NetworkKey => "network key",
            Self::NetworkKeySequence => "network key sequence",
            Self::MeshLocalPrefix => "mesh-local prefix",
            Self::SteeringData => "steering data",
            Self::BorderAgentLocator => "border agent locator",
            Self::CommissionerId => "commissioner id",
            Self::CommissionerSessionId => "commissioner session id",
            Self::SecurityPolicy => "security policy",
            Self::Get => "get",
            Self::ActiveTimestamp => "active timestamp",
            Self::State => "state",
            Self::PendingTimestamp => "pending timestamp",
            Self::DelayTimer => "delay timer",
            Self::ChannelMask => "channel mask",
        }
    }

    pub fn length_rule(self) -> LengthRule {
        match self {
            Self::Channel => LengthRule::Exact(3),
            Self::PanId => LengthRule::Exact(2),
            Self::ExtendedPanId => LengthRule::Exact(8),
            Self::NetworkName => LengthRule::Range(1, 16),
            Self::Pskc => LengthRule::Exact(16),
            Self::NetworkKey => LengthRule::Exact(16),
            Self::NetworkKeySequence => LengthRule::Exact(4),
            Self::MeshLocalPrefix => LengthRule::Exact(8),
            Self::SteeringData => LengthRule::Range(1, 16),
            Self::BorderAgentLocator => LengthRule::Exact(2),
            Self::CommissionerId => LengthRule::Range(1, 64),
            Self::CommissionerSessionId => LengthRule::Exact(2),
            Self::SecurityPolicy => LengthRule::AtLeast(3),
            Self::Get => LengthRule::Any,
            Self::ActiveTimestamp => LengthRule::Exact(8),
            Self::State => LengthRule::Exact(1),
            Self::PendingTimestamp => LengthRule::Exact(8),
            Self::DelayTimer => LengthRule::Exact(4),
            Self::ChannelMask => LengthRule::AtLeast(2),
        }
    }

    /// Check the declared length of a TLV of this type.
    pub fn check_length(self, len: usize) -> Result<(), DecodeError> {
        if self.length_rule().allows(len) {
            Ok(())
        } else {
            Err(DecodeError::InvalidLength {
                tlv_type: self.code(),
                length: len,
            })
        }
    }
}

// ============================================================================
// Tlv / TlvSet
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tlv {
    tlv_type: u8,
    value: Bytes,
}

impl Tlv {
    pub fn new(tlv_type: u8, value: impl Into<Bytes>) -> Result<Self, DecodeError> {
        let value = value.into();
        if value.len() > MAX_TLV_VALUE_LEN {
            return Err(DecodeError::TooLong {
                length: value.len(),
                max: MAX_TLV_VALUE_LEN,
            });
        }
        Ok(Self { tlv_type, value })
    }

    /// Build a TLV from a short fixed-size value.
    pub(crate) fn from_array<const N: usize>(tlv_type: MeshcopTlv, value: [u8; N]) -> Self {
        debug_assert!(N <= MAX_TLV_VALUE_LEN);
        Self {
            tlv_type: tlv_type.code(),
            value: Bytes::copy_from_slice(&value),
        }
    }

    /// Build a TLV from a value known to fit a one-byte length.
    pub(crate) fn from_short(tlv_type: MeshcopTlv, value: Vec<u8>) -> Self {
        debug_assert!(value.len() <= MAX_TLV_VALUE_LEN);
        Self {
            tlv_type: tlv_type.code(),
            value: Bytes::from(value),
        }
    }

    pub fn tlv_type(&self) -> u8 {
        self.tlv_type
    }

    pub fn meshcop_type(&self) -> Option<MeshcopTlv> {
        MeshcopTlv::from_code(self.tlv_type)
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn value_bytes(&self) -> Bytes {
        self.value.clone()
    }

    pub fn encoded_len(&self) -> usize {
        2 + self.value.len()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tlv_type);
        buf.put_u8(self.value.len() as u8);
        buf.put_slice(&self.value);
    }
}

/// How decoding treats a type that appears more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    #[default]
    Reject,
    /// Later occurrences replace earlier ones. Used for administrative Set
    /// payloads.
    LastWins,
}

/// Ordered TLVs, unique by type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvSet {
    tlvs: Vec<Tlv>,
}

impl TlvSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tlvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tlvs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tlv> {
        self.tlvs.iter()
    }

    pub fn types(&self) -> impl Iterator<Item = u8> + '_ {
        self.tlvs.iter().map(Tlv::tlv_type)
    }

    pub fn get(&self, tlv_type: u8) -> Option<&Tlv> {
        self.tlvs.iter().find(|t| t.tlv_type == tlv_type)
    }

    pub fn value(&self, tlv_type: u8) -> Option<&[u8]> {
        self.get(tlv_type).map(Tlv::value)
    }

    pub fn contains(&self, tlv_type: u8) -> bool {
        self.get(tlv_type).is_some()
    }

    /// Insert or replace in place. Returns the replaced TLV.
    pub fn insert(&mut self, tlv: Tlv) -> Option<Tlv> {
        match self.tlvs.iter_mut().find(|t| t.tlv_type == tlv.tlv_type) {
            Some(slot) => Some(std::mem::replace(slot, tlv)),
            None => {
                self.tlvs.push(tlv);
                None
            }
        }
    }

    pub fn remove(&mut self, tlv_type: u8) -> Option<Tlv> {
        let index = self.tlvs.iter().position(|t| t.tlv_type == tlv_type)?;
        Some(self.tlvs.remove(index))
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Tlv) -> bool) {
        self.tlvs.retain(|t| keep(t));
    }

    /// Overlay every TLV of `other` onto this set.
    pub fn overlay(&mut self, other: &TlvSet) {
        for tlv in other.iter() {
            self.insert(tlv.clone());
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.tlvs.iter().map(Tlv::encoded_len).sum()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        for tlv in &self.tlvs {
            tlv.encode_into(buf);
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Structural decode: every TLV must fit in `buf`.
    pub fn decode(buf: &[u8], duplicates: DuplicatePolicy) -> Result<Self, DecodeError> {
        let mut set = TlvSet::new();
        let mut offset = 0;

        while offset < buf.len() {
            let remaining = buf.len() - offset;
            if remaining < 2 {
                return Err(DecodeError::Truncated {
                    offset,
                    needed: 2,
                    remaining,
                });
            }
            let tlv_type = buf[offset];
            let len = buf[offset + 1] as usize;
            if remaining - 2 < len {
                return Err(DecodeError::Truncated {
                    offset,
                    needed: 2 + len,
                    remaining,
                });
            }
            let start = offset + 2;
            let tlv = Tlv {
                tlv_type,
                value: Bytes::copy_from_slice(&buf[start..start + len]),
            };
            if set.contains(tlv_type) && duplicates == DuplicatePolicy::Reject {
                return Err(DecodeError::DuplicateType(tlv_type));
            }
            set.insert(tlv);
            offset = start + len;
        }

        Ok(set)
    }
}

impl FromIterator<Tlv> for TlvSet {
    fn from_iter<I: IntoIterator<Item = Tlv>>(iter: I) -> Self {
        let mut set = TlvSet::new();
        for tlv in iter {
            set.insert(tlv);
        }
        set
    }
}

impl<'a> IntoIterator for &'a TlvSet {
    type Item = &'a Tlv;
    type IntoIter = std::slice::Iter<'a, Tlv>;

    fn into_iter(self) -> Self::IntoIter {
        self.tlvs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_preserves_order_and_unknown_types() {
        let buf = [0x01, 0x02, 0xfa, 0xce, 0xc8, 0x01, 0x7f, 0x03, 0x01, b'x'];
        let set = TlvSet::decode(&buf, DuplicatePolicy::Reject).unwrap();
        assert_eq!(set.types().collect::<Vec<_>>(), vec![1, 0xc8, 3]);
        assert_eq!(set.value(0xc8), Some(&[0x7f][..]));
        assert_eq!(set.encode().as_ref(), &buf[..]);
    }

    #[test]
    fn test_truncated_value_is_rejected() {
        let err = TlvSet::decode(&[0x05, 0x10, 0x00, 0x01], DuplicatePolicy::Reject).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                offset: 0,
                needed: 18,
                remaining: 4
            }
        );
    }

    #[test]
    fn test_dangling_type_byte_is_truncated() {
        let err = TlvSet::decode(&[0x01, 0x00, 0x07], DuplicatePolicy::Reject).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { offset: 2, .. }));
    }

    #[test]
    fn test_duplicate_policy() {
        let buf = [0x01, 0x02, 0x00, 0x01, 0x01, 0x02, 0x00, 0x02];
        assert_eq!(
            TlvSet::decode(&buf, DuplicatePolicy::Reject).unwrap_err(),
            DecodeError::DuplicateType(1)
        );
        let set = TlvSet::decode(&buf, DuplicatePolicy::LastWins).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.value(1), Some(&[0x00, 0x02][..]));
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut set = TlvSet::new();
        set.insert(Tlv::new(7, vec![1]).unwrap());
        set.insert(Tlv::new(8, vec![2]).unwrap());
        let old = set.insert(Tlv::new(7, vec![3]).unwrap());
        assert_eq!(old.unwrap().value(), &[1]);
        assert_eq!(set.types().collect::<Vec<_>>(), vec![7, 8]);
    }

    #[test]
    fn test_oversized_value_rejected() {
        assert!(Tlv::new(3, vec![0u8; 256]).is_err());
        assert!(Tlv::new(3, vec![0u8; 255]).is_ok());
    }

    #[test]
    fn test_length_rules() {
        assert!(MeshcopTlv::NetworkName.check_length(0).is_err());
        assert!(MeshcopTlv::NetworkName.check_length(16).is_ok());
        assert!(MeshcopTlv::NetworkName.check_length(17).is_err());
        assert!(MeshcopTlv::SecurityPolicy.check_length(4).is_ok());
        assert!(MeshcopTlv::Channel.check_length(2).is_err());
    }
}
