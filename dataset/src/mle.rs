//! Mesh propagation messages
//!
//! The subset of MLE used to spread datasets: Data Request / Data Response
//! between neighbours and the Child ID exchange at attach time. A message is
//! a command byte followed by TLVs. A Data Response without dataset blocks
//! is the periodic multicast advertisement of Leader Data and timestamps.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    dataset::{Dataset, DatasetKind},
    error::DecodeError,
    leader::LeaderData,
    timestamp::Timestamp,
    tlv::{DuplicatePolicy, Tlv, TlvSet},
};

/// Short address of a mesh node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u16);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MleCommand {
    DataRequest = 7,
    DataResponse = 8,
    ChildIdRequest = 11,
    ChildIdResponse = 12,
}

impl MleCommand {
    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            7 => Self::DataRequest,
            8 => Self::DataResponse,
            11 => Self::ChildIdRequest,
            12 => Self::ChildIdResponse,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MleTlv {
    SourceAddress = 0,
    LeaderData = 11,
    TlvRequest = 13,
    ActiveTimestamp = 22,
    PendingTimestamp = 23,
    ActiveDataset = 24,
    PendingDataset = 25,
}

impl MleTlv {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn dataset(kind: DatasetKind) -> Self {
        match kind {
            DatasetKind::Active => Self::ActiveDataset,
            DatasetKind::Pending => Self::PendingDataset,
        }
    }
}

/// Ask a neighbour for its datasets. Carries the requester's timestamps so
/// the responder only includes blocks that differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    pub requested: Vec<DatasetKind>,
    pub active_timestamp: Option<Timestamp>,
    pub pending_timestamp: Option<Timestamp>,
}

impl DataRequest {
    pub fn wants(&self, kind: DatasetKind) -> bool {
        self.requested.contains(&kind)
    }
}

/// Leader Data, timestamps and optionally full datasets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataResponse {
    pub leader_data: LeaderData,
    pub active_timestamp: Option<Timestamp>,
    pub pending_timestamp: Option<Timestamp>,
    pub active_dataset: Option<Dataset>,
    pub pending_dataset: Option<Dataset>,
}

impl DataResponse {
    pub fn dataset(&self, kind: DatasetKind) -> Option<&Dataset> {
        match kind {
            DatasetKind::Active => self.active_dataset.as_ref(),
            DatasetKind::Pending => self.pending_dataset.as_ref(),
        }
    }

    pub fn timestamp(&self, kind: DatasetKind) -> Option<Timestamp> {
        match kind {
            DatasetKind::Active => self.active_timestamp,
            DatasetKind::Pending => self.pending_timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildIdRequest {
    pub active_timestamp: Option<Timestamp>,
    pub pending_timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MleMessage {
    DataRequest(DataRequest),
    DataResponse(DataResponse),
    ChildIdRequest(ChildIdRequest),
    ChildIdResponse(DataResponse),
}

impl MleMessage {
    pub fn command(&self) -> MleCommand {
        match self {
            Self::DataRequest(_) => MleCommand::DataRequest,
            Self::DataResponse(_) => MleCommand::DataResponse,
            Self::ChildIdRequest(_) => MleCommand::ChildIdRequest,
            Self::ChildIdResponse(_) => MleCommand::ChildIdResponse,
        }
    }

    pub fn encode(&self, source: PeerId) -> Result<Bytes, DecodeError> {
        let mut tlvs = TlvSet::new();
        tlvs.insert(Tlv::new(
            MleTlv::SourceAddress.code(),
            source.0.to_be_bytes().to_vec(),
        )?);

        match self {
            Self::DataRequest(req) => {
                let requested: Vec<u8> = req
                    .requested
                    .iter()
                    .map(|k| MleTlv::dataset(*k).code())
                    .collect();
                tlvs.insert(Tlv::new(MleTlv::TlvRequest.code(), requested)?);
                put_timestamps(&mut tlvs, req.active_timestamp, req.pending_timestamp)?;
            }
            Self::ChildIdRequest(req) => {
                put_timestamps(&mut tlvs, req.active_timestamp, req.pending_timestamp)?;
            }
            Self::DataResponse(resp) | Self::ChildIdResponse(resp) => {
                tlvs.insert(Tlv::new(
                    MleTlv::LeaderData.code(),
                    resp.leader_data.encode().to_vec(),
                )?);
                put_timestamps(&mut tlvs, resp.active_timestamp, resp.pending_timestamp)?;
                for kind in [DatasetKind::Active, DatasetKind::Pending] {
                    if let Some(dataset) = resp.dataset(kind) {
                        tlvs.insert(Tlv::new(MleTlv::dataset(kind).code(), dataset.encode())?);
                    }
                }
            }
        }

        let mut buf = BytesMut::with_capacity(1 + tlvs.encoded_len());
        buf.put_u8(self.command() as u8);
        tlvs.encode_into(&mut buf);
        Ok(buf.freeze())
    }

    pub fn decode(buf: &[u8]) -> Result<(PeerId, Self), DecodeError> {
        let (&code, rest) = buf.split_first().ok_or(DecodeError::Empty)?;
        let command = MleCommand::from_code(code).ok_or(DecodeError::UnknownCommand(code))?;
        let tlvs = TlvSet::decode(rest, DuplicatePolicy::Reject)?;

        let source = tlvs
            .value(MleTlv::SourceAddress.code())
            .ok_or(DecodeError::MissingTlv(MleTlv::SourceAddress.code()))?;
        let source: [u8; 2] = source.try_into().map_err(|_| DecodeError::InvalidLength {
            tlv_type: MleTlv::SourceAddress.code(),
            length: source.len(),
        })?;
        let source = PeerId(u16::from_be_bytes(source));

        let active_timestamp = timestamp(&tlvs, MleTlv::ActiveTimestamp)?;
        let pending_timestamp = timestamp(&tlvs, MleTlv::PendingTimestamp)?;

        let message = match command {
            MleCommand::DataRequest => {
                let requested = tlvs
                    .value(MleTlv::TlvRequest.code())
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|code| match *code {
                        c if c == MleTlv::ActiveDataset.code() => Some(DatasetKind::Active),
                        c if c == MleTlv::PendingDataset.code() => Some(DatasetKind::Pending),
                        _ => None,
                    })
                    .collect();
                Self::DataRequest(DataRequest {
                    requested,
                    active_timestamp,
                    pending_timestamp,
                })
            }
            MleCommand::ChildIdRequest => Self::ChildIdRequest(ChildIdRequest {
                active_timestamp,
                pending_timestamp,
            }),
            MleCommand::DataResponse | MleCommand::ChildIdResponse => {
                let code = MleTlv::LeaderData.code();
                let leader_data = tlvs.value(code).ok_or(DecodeError::MissingTlv(code))?;
                let resp = DataResponse {
                    leader_data: LeaderData::decode(code, leader_data)?,
                    active_timestamp,
                    pending_timestamp,
                    active_dataset: dataset(&tlvs, DatasetKind::Active)?,
                    pending_dataset: dataset(&tlvs, DatasetKind::Pending)?,
                };
                if command == MleCommand::DataResponse {
                    Self::DataResponse(resp)
                } else {
                    Self::ChildIdResponse(resp)
                }
            }
        };
        Ok((source, message))
    }
}

fn put_timestamps(
    tlvs: &mut TlvSet,
    active: Option<Timestamp>,
    pending: Option<Timestamp>,
) -> Result<(), DecodeError> {
    if let Some(ts) = active {
        tlvs.insert(Tlv::new(MleTlv::ActiveTimestamp.code(), ts.encode().to_vec())?);
    }
    if let Some(ts) = pending {
        tlvs.insert(Tlv::new(MleTlv::PendingTimestamp.code(), ts.encode().to_vec())?);
    }
    Ok(())
}

fn timestamp(tlvs: &TlvSet, tlv: MleTlv) -> Result<Option<Timestamp>, DecodeError> {
    tlvs.value(tlv.code())
        .map(|v| Timestamp::decode(tlv.code(), v))
        .transpose()
}

fn dataset(tlvs: &TlvSet, kind: DatasetKind) -> Result<Option<Dataset>, DecodeError> {
    tlvs.value(MleTlv::dataset(kind).code())
        .map(|v| Dataset::decode(kind, v))
        .transpose()
}
