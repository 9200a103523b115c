//! Error types for dataset decoding, acceptance, storage and management.

use std::path::PathBuf;

use thiserror::Error;

use crate::timestamp::Timestamp;

/// Structural or value errors found while decoding TLVs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated TLV at offset {offset}: need {needed} bytes, {remaining} remaining")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("duplicate TLV type {0}")]
    DuplicateType(u8),

    #[error("TLV type {tlv_type} has invalid length {length}")]
    InvalidLength { tlv_type: u8, length: usize },

    #[error("TLV type {tlv_type} has invalid value: {reason}")]
    InvalidValue { tlv_type: u8, reason: String },

    #[error("encoded length {length} exceeds maximum {max}")]
    TooLong { length: usize, max: usize },

    #[error("missing required TLV {0}")]
    MissingTlv(u8),

    #[error("unknown command {0}")]
    UnknownCommand(u8),

    #[error("empty message")]
    Empty,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Reasons a dataset update is refused or fails to apply.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] DecodeError),

    #[error("{0} timestamp missing")]
    MissingTimestamp(&'static str),

    #[error("stale {which} timestamp: received {received}, stored {stored}")]
    StaleTimestamp {
        which: &'static str,
        received: Timestamp,
        stored: Timestamp,
    },

    #[error("channel {channel} on page {page} is not supported")]
    UnsupportedChannel { page: u8, channel: u16 },

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("dataset incomplete, missing {}", .0.join(", "))]
    Incomplete(Vec<&'static str>),

    #[error("commissioner session id {received} does not match {expected:?}")]
    InvalidCommissionerSession { received: u16, expected: Option<u16> },

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

pub type DatasetResult<T> = Result<T, DatasetError>;

impl DatasetError {
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedPayload(_) => "malformed_payload",
            Self::MissingTimestamp(_) => "missing_timestamp",
            Self::StaleTimestamp { .. } => "stale_timestamp",
            Self::UnsupportedChannel { .. } => "unsupported_channel",
            Self::InvalidField { .. } => "invalid_field",
            Self::Incomplete(_) => "incomplete",
            Self::InvalidCommissionerSession { .. } => "invalid_commissioner_session",
            Self::Storage(_) => "storage",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("destination unreachable: {0}")]
    Unreachable(String),

    #[error("transport closed")]
    Closed,
}

/// Failures of outbound management requests.
#[derive(Debug, Error)]
pub enum MgmtError {
    #[error("no response after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("response decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("node is shutting down")]
    Shutdown,
}

pub type MgmtResult<T> = Result<T, MgmtError>;

/// Errors returned through a [`crate::node::NodeHandle`].
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node event loop has stopped")]
    Stopped,

    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

pub type NodeResult<T> = Result<T, NodeError>;
