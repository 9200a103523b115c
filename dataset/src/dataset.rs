//! Operational datasets
//!
//! A [`Dataset`] is a [`TlvSet`] tagged with its kind. Field values are kept
//! in wire form and decoded on access; every TLV is validated when it enters
//! the dataset, so accessors only return `None` for absent fields.

use std::{fmt, time::Duration};

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::DecodeError,
    security_policy::SecurityPolicy,
    timestamp::Timestamp,
    tlv::{DuplicatePolicy, MeshcopTlv, Tlv, TlvSet},
};

/// Largest encoded dataset.
pub const MAX_DATASET_LEN: usize = 254;

/// Fields every complete Active dataset carries.
pub const ACTIVE_FIELDS: [MeshcopTlv; 10] = [
    MeshcopTlv::ActiveTimestamp,
    MeshcopTlv::Channel,
    MeshcopTlv::ChannelMask,
    MeshcopTlv::PanId,
    MeshcopTlv::ExtendedPanId,
    MeshcopTlv::NetworkKey,
    MeshcopTlv::MeshLocalPrefix,
    MeshcopTlv::NetworkName,
    MeshcopTlv::Pskc,
    MeshcopTlv::SecurityPolicy,
];

/// Fields only a Pending dataset carries.
pub const PENDING_ONLY_FIELDS: [MeshcopTlv; 2] =
    [MeshcopTlv::PendingTimestamp, MeshcopTlv::DelayTimer];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetKind {
    Active,
    Pending,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
        }
    }

    /// The TLV holding this kind's own version.
    pub fn timestamp_tlv(&self) -> MeshcopTlv {
        match self {
            Self::Active => MeshcopTlv::ActiveTimestamp,
            Self::Pending => MeshcopTlv::PendingTimestamp,
        }
    }

    /// Whether `tlv` is a field this kind of dataset understands.
    pub fn recognizes(&self, tlv: MeshcopTlv) -> bool {
        ACTIVE_FIELDS.contains(&tlv)
            || (*self == Self::Pending && PENDING_ONLY_FIELDS.contains(&tlv))
    }

    /// Whether a TLV of type `code` is kept in this kind of dataset. Unknown
    /// types are kept for forward compatibility, known non-dataset types are
    /// not.
    pub fn stores(&self, code: u8) -> bool {
        match MeshcopTlv::from_code(code) {
            Some(tlv) => self.recognizes(tlv),
            None => true,
        }
    }

    pub fn required_fields(&self) -> Vec<MeshcopTlv> {
        let mut fields = ACTIVE_FIELDS.to_vec();
        if *self == Self::Pending {
            fields.extend_from_slice(&PENDING_ONLY_FIELDS);
        }
        fields
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Field value types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel {
    pub page: u8,
    pub number: u16,
}

impl Channel {
    pub fn new(number: u16) -> Self {
        Self { page: 0, number }
    }
}

/// Page-0 channel mask, bit `n` set for channel `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChannelMask(pub u32);

impl ChannelMask {
    /// Channels 11 through 26 of the 2.4 GHz band.
    pub const DEFAULT_2_4_GHZ: ChannelMask = ChannelMask(0x07ff_f800);

    pub fn contains(&self, channel: u16) -> bool {
        channel < 32 && self.0 & (1 << channel) != 0
    }

    pub fn channels(&self) -> impl Iterator<Item = u16> + '_ {
        (0..32u16).filter(|c| self.contains(*c))
    }

    /// Channel Mask TLV value: page 0 entry with the bit-reversed mask.
    pub fn encode(&self) -> [u8; 6] {
        let mask = self.0.reverse_bits().to_be_bytes();
        [0, 4, mask[0], mask[1], mask[2], mask[3]]
    }

    /// Parse every entry, returning the page 0 mask (empty when absent).
    pub fn decode(value: &[u8]) -> Result<Self, DecodeError> {
        let code = MeshcopTlv::ChannelMask.code();
        let mut mask = ChannelMask(0);
        let mut rest = value;
        while !rest.is_empty() {
            if rest.len() < 2 {
                return Err(DecodeError::InvalidValue {
                    tlv_type: code,
                    reason: "truncated channel mask entry".to_string(),
                });
            }
            let (page, len) = (rest[0], rest[1] as usize);
            let body = rest.get(2..2 + len).ok_or_else(|| DecodeError::InvalidValue {
                tlv_type: code,
                reason: format!("entry for page {} overruns the TLV", page),
            })?;
            if page == 0 {
                let bytes: [u8; 4] = body.try_into().map_err(|_| DecodeError::InvalidValue {
                    tlv_type: code,
                    reason: format!("page 0 mask must be 4 bytes, got {}", len),
                })?;
                mask = ChannelMask(u32::from_be_bytes(bytes).reverse_bits());
            }
            rest = &rest[2 + len..];
        }
        Ok(mask)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkKey(pub [u8; 16]);

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NetworkKey(<redacted>)")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pskc(pub [u8; 16]);

impl fmt::Debug for Pskc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pskc(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtendedPanId(pub [u8; 8]);

impl fmt::Display for ExtendedPanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshLocalPrefix(pub [u8; 8]);

impl fmt::Display for MeshLocalPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.0;
        write!(
            f,
            "{:x}:{:x}:{:x}:{:x}::/64",
            u16::from_be_bytes([p[0], p[1]]),
            u16::from_be_bytes([p[2], p[3]]),
            u16::from_be_bytes([p[4], p[5]]),
            u16::from_be_bytes([p[6], p[7]])
        )
    }
}

/// Validate a single TLV's value for the MeshCoP type it carries.
pub fn validate_tlv(tlv: &Tlv) -> Result<(), DecodeError> {
    let Some(known) = tlv.meshcop_type() else {
        return Ok(());
    };
    known.check_length(tlv.value().len())?;
    match known {
        MeshcopTlv::ChannelMask => ChannelMask::decode(tlv.value()).map(|_| ()),
        MeshcopTlv::NetworkName => std::str::from_utf8(tlv.value())
            .map(|_| ())
            .map_err(|_| DecodeError::InvalidValue {
                tlv_type: tlv.tlv_type(),
                reason: "network name is not valid UTF-8".to_string(),
            }),
        _ => Ok(()),
    }
}

// ============================================================================
// Dataset
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    kind: DatasetKind,
    tlvs: TlvSet,
}

impl Dataset {
    pub fn new(kind: DatasetKind) -> Self {
        Self {
            kind,
            tlvs: TlvSet::new(),
        }
    }

    /// Wrap already-parsed TLVs, validating each value.
    pub fn from_tlvs(kind: DatasetKind, tlvs: TlvSet) -> Result<Self, DecodeError> {
        for tlv in tlvs.iter() {
            validate_tlv(tlv)?;
        }
        Ok(Self { kind, tlvs })
    }

    /// Strict decode of a dataset blob: no duplicate types, valid field
    /// lengths, at most [`MAX_DATASET_LEN`] bytes.
    pub fn decode(kind: DatasetKind, buf: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_with_limit(kind, buf, MAX_DATASET_LEN)
    }

    pub fn decode_with_limit(
        kind: DatasetKind,
        buf: &[u8],
        max_len: usize,
    ) -> Result<Self, DecodeError> {
        if buf.len() > max_len {
            return Err(DecodeError::TooLong {
                length: buf.len(),
                max: max_len,
            });
        }
        let tlvs = TlvSet::decode(buf, DuplicatePolicy::Reject)?;
        Self::from_tlvs(kind, tlvs)
    }

    pub fn encode(&self) -> Bytes {
        self.tlvs.encode()
    }

    pub fn encoded_len(&self) -> usize {
        self.tlvs.encoded_len()
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    pub fn tlvs(&self) -> &TlvSet {
        &self.tlvs
    }

    pub fn into_tlvs(self) -> TlvSet {
        self.tlvs
    }

    pub fn is_empty(&self) -> bool {
        self.tlvs.is_empty()
    }

    /// Same TLVs under another kind.
    pub fn with_kind(mut self, kind: DatasetKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn insert(&mut self, tlv: Tlv) -> Result<(), DecodeError> {
        validate_tlv(&tlv)?;
        self.tlvs.insert(tlv);
        Ok(())
    }

    /// Overlay every TLV of `other`, replacing fields present in both.
    pub fn overlay(&mut self, other: &Dataset) {
        self.tlvs.overlay(&other.tlvs);
    }

    pub fn remove(&mut self, tlv: MeshcopTlv) -> Option<Tlv> {
        self.tlvs.remove(tlv.code())
    }

    pub fn contains(&self, tlv: MeshcopTlv) -> bool {
        self.tlvs.contains(tlv.code())
    }

    fn field(&self, tlv: MeshcopTlv) -> Option<&[u8]> {
        self.tlvs.value(tlv.code())
    }

    fn fixed<const N: usize>(&self, tlv: MeshcopTlv) -> Option<[u8; N]> {
        self.field(tlv)?.try_into().ok()
    }

    // ---- accessors ----

    pub fn active_timestamp(&self) -> Option<Timestamp> {
        let code = MeshcopTlv::ActiveTimestamp.code();
        Timestamp::decode(code, self.tlvs.value(code)?).ok()
    }

    pub fn pending_timestamp(&self) -> Option<Timestamp> {
        let code = MeshcopTlv::PendingTimestamp.code();
        Timestamp::decode(code, self.tlvs.value(code)?).ok()
    }

    /// The timestamp versioning this dataset's own kind.
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self.kind {
            DatasetKind::Active => self.active_timestamp(),
            DatasetKind::Pending => self.pending_timestamp(),
        }
    }

    pub fn delay_timer(&self) -> Option<Duration> {
        self.fixed::<4>(MeshcopTlv::DelayTimer)
            .map(|b| Duration::from_millis(u32::from_be_bytes(b).into()))
    }

    pub fn channel(&self) -> Option<Channel> {
        self.fixed::<3>(MeshcopTlv::Channel).map(|b| Channel {
            page: b[0],
            number: u16::from_be_bytes([b[1], b[2]]),
        })
    }

    pub fn channel_mask(&self) -> Option<ChannelMask> {
        ChannelMask::decode(self.field(MeshcopTlv::ChannelMask)?).ok()
    }

    pub fn pan_id(&self) -> Option<u16> {
        self.fixed::<2>(MeshcopTlv::PanId).map(u16::from_be_bytes)
    }

    pub fn extended_pan_id(&self) -> Option<ExtendedPanId> {
        self.fixed(MeshcopTlv::ExtendedPanId).map(ExtendedPanId)
    }

    pub fn network_key(&self) -> Option<NetworkKey> {
        self.fixed(MeshcopTlv::NetworkKey).map(NetworkKey)
    }

    pub fn mesh_local_prefix(&self) -> Option<MeshLocalPrefix> {
        self.fixed(MeshcopTlv::MeshLocalPrefix).map(MeshLocalPrefix)
    }

    pub fn network_name(&self) -> Option<&str> {
        std::str::from_utf8(self.field(MeshcopTlv::NetworkName)?).ok()
    }

    pub fn pskc(&self) -> Option<Pskc> {
        self.fixed(MeshcopTlv::Pskc).map(Pskc)
    }

    pub fn security_policy(&self) -> Option<SecurityPolicy> {
        SecurityPolicy::decode(self.field(MeshcopTlv::SecurityPolicy)?).ok()
    }

    // ---- setters ----

    pub fn set_active_timestamp(&mut self, ts: Timestamp) {
        self.tlvs
            .insert(Tlv::from_array(MeshcopTlv::ActiveTimestamp, ts.encode()));
    }

    pub fn set_pending_timestamp(&mut self, ts: Timestamp) {
        self.tlvs
            .insert(Tlv::from_array(MeshcopTlv::PendingTimestamp, ts.encode()));
    }

    /// Stores the delay in milliseconds, saturating at `u32::MAX`.
    pub fn set_delay_timer(&mut self, delay: Duration) {
        let ms = u32::try_from(delay.as_millis()).unwrap_or(u32::MAX);
        self.tlvs
            .insert(Tlv::from_array(MeshcopTlv::DelayTimer, ms.to_be_bytes()));
    }

    pub fn set_channel(&mut self, channel: Channel) {
        let n = channel.number.to_be_bytes();
        self.tlvs.insert(Tlv::from_array(
            MeshcopTlv::Channel,
            [channel.page, n[0], n[1]],
        ));
    }

    pub fn set_channel_mask(&mut self, mask: ChannelMask) {
        self.tlvs
            .insert(Tlv::from_array(MeshcopTlv::ChannelMask, mask.encode()));
    }

    pub fn set_pan_id(&mut self, pan_id: u16) {
        self.tlvs
            .insert(Tlv::from_array(MeshcopTlv::PanId, pan_id.to_be_bytes()));
    }

    pub fn set_extended_pan_id(&mut self, xpanid: ExtendedPanId) {
        self.tlvs
            .insert(Tlv::from_array(MeshcopTlv::ExtendedPanId, xpanid.0));
    }

    pub fn set_network_key(&mut self, key: NetworkKey) {
        self.tlvs
            .insert(Tlv::from_array(MeshcopTlv::NetworkKey, key.0));
    }

    pub fn set_mesh_local_prefix(&mut self, prefix: MeshLocalPrefix) {
        self.tlvs
            .insert(Tlv::from_array(MeshcopTlv::MeshLocalPrefix, prefix.0));
    }

    pub fn set_network_name(&mut self, name: &str) -> Result<(), DecodeError> {
        let tlv = Tlv::new(
            MeshcopTlv::NetworkName.code(),
            Bytes::copy_from_slice(name.as_bytes()),
        )?;
        self.insert(tlv)
    }

    pub fn set_pskc(&mut self, pskc: Pskc) {
        self.tlvs.insert(Tlv::from_array(MeshcopTlv::Pskc, pskc.0));
    }

    pub fn set_security_policy(&mut self, policy: SecurityPolicy) {
        self.tlvs
            .insert(Tlv::from_short(MeshcopTlv::SecurityPolicy, policy.encode()));
    }

    // ---- whole-dataset queries ----

    /// Names of required fields this dataset lacks.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        self.kind
            .required_fields()
            .into_iter()
            .filter(|f| !self.contains(*f))
            .map(MeshcopTlv::name)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }

    /// TLVs selected by a Get filter. An empty filter selects everything,
    /// including unrecognised TLVs; a non-empty filter only yields requested
    /// fields this dataset recognises.
    pub fn select(&self, filter: &[u8]) -> TlvSet {
        if filter.is_empty() {
            return self.tlvs.clone();
        }
        self.tlvs
            .iter()
            .filter(|t| filter.contains(&t.tlv_type()))
            .filter(|t| t.meshcop_type().is_some_and(|m| self.kind.recognizes(m)))
            .cloned()
            .collect()
    }

    /// Recognised fields whose value differs from `previous`.
    pub fn changed_fields(&self, previous: Option<&Dataset>) -> Vec<MeshcopTlv> {
        self.kind
            .required_fields()
            .into_iter()
            .filter(|f| {
                let old = previous.and_then(|p| p.field(*f));
                old != self.field(*f)
            })
            .collect()
    }

    /// A complete, random Active dataset for a new network.
    pub fn generate_network<R: Rng + ?Sized>(
        rng: &mut R,
        channel: Channel,
        network_name: &str,
    ) -> Result<Self, DecodeError> {
        let mut dataset = Dataset::new(DatasetKind::Active);
        dataset.set_active_timestamp(Timestamp::from_seconds(1));
        dataset.set_channel(channel);
        dataset.set_channel_mask(ChannelMask::DEFAULT_2_4_GHZ);
        dataset.set_pan_id(rng.random_range(0..0xffff));

        let mut xpanid = [0u8; 8];
        rng.fill(&mut xpanid);
        dataset.set_extended_pan_id(ExtendedPanId(xpanid));

        let mut key = [0u8; 16];
        rng.fill(&mut key);
        dataset.set_network_key(NetworkKey(key));

        let mut prefix = [0u8; 8];
        rng.fill(&mut prefix[1..6]);
        prefix[0] = 0xfd;
        dataset.set_mesh_local_prefix(MeshLocalPrefix(prefix));

        dataset.set_network_name(network_name)?;

        let mut pskc = [0u8; 16];
        rng.fill(&mut pskc);
        dataset.set_pskc(Pskc(pskc));

        dataset.set_security_policy(SecurityPolicy::default());
        Ok(dataset)
    }
}
