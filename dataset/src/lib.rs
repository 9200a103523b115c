//! Thread Operational Dataset synchronization
//!
//! This crate keeps the Active and Pending Operational Datasets consistent
//! across the nodes of a Thread mesh partition:
//! - MeshCoP TLV codec and typed dataset fields
//! - Leader acceptance policy for management Get/Set requests
//! - Timestamp-driven propagation over MLE Data Request/Response and the
//!   Child ID exchange, including post-merge reconciliation
//! - Pending dataset delay timer with persisted checkpoints
//!
//! [`engine::DatasetEngine`] is the sans-IO state machine;
//! [`node::DatasetNode`] runs it on tokio.

pub mod config;
pub mod dataset;
pub mod delay_timer;
pub mod engine;
pub mod error;
pub mod leader;
pub mod manager;
pub mod metrics;
pub mod mgmt;
pub mod mle;
pub mod node;
pub mod notifier;
pub mod policy;
pub mod security_policy;
pub mod storage;
pub mod timestamp;
pub mod tlv;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::{DatasetConfig, DelayBootPolicy, MgmtConfig};
pub use dataset::{
    Channel, ChannelMask, Dataset, DatasetKind, ExtendedPanId, MeshLocalPrefix, NetworkKey, Pskc,
};
pub use delay_timer::{ManualClock, SystemClock, WallClock};
pub use engine::{Action, DatasetEngine, EngineContext, MgmtDisposition, Role};
pub use error::{DatasetError, DecodeError, MgmtError, NodeError, StorageError, TransportError};
pub use leader::{CommissionerSession, LeaderData};
pub use mgmt::{MgmtClient, MgmtDestination, MgmtRequest, MgmtResponse, MgmtState, MgmtTransport};
pub use mle::{MleMessage, PeerId};
pub use node::{DatasetNode, MeshTransport, NodeHandle};
pub use notifier::{DatasetEvent, Notifier};
pub use security_policy::SecurityPolicy;
pub use storage::{FileSettings, MemorySettings, NoOpSettings, SettingsStore};
pub use timestamp::Timestamp;
pub use tlv::{MeshcopTlv, Tlv, TlvSet};
