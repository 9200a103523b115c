//! Leader authority
//!
//! The leader of a partition owns the network-wide copy of the datasets and
//! versions it with the Data Version / Stable Data Version counters carried
//! in Leader Data. Versions are 8-bit serial numbers.

use rand::Rng;

use crate::{
    error::{DatasetError, DecodeError},
    mle::PeerId,
};

pub const LEADER_DATA_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaderData {
    pub partition_id: u32,
    pub weighting: u8,
    pub data_version: u8,
    pub stable_data_version: u8,
    pub leader_router_id: u8,
}

impl LeaderData {
    pub fn encode(&self) -> [u8; LEADER_DATA_LEN] {
        let p = self.partition_id.to_be_bytes();
        [
            p[0],
            p[1],
            p[2],
            p[3],
            self.weighting,
            self.data_version,
            self.stable_data_version,
            self.leader_router_id,
        ]
    }

    pub fn decode(tlv_type: u8, value: &[u8]) -> Result<Self, DecodeError> {
        let b: [u8; LEADER_DATA_LEN] = value.try_into().map_err(|_| DecodeError::InvalidLength {
            tlv_type,
            length: value.len(),
        })?;
        Ok(Self {
            partition_id: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            weighting: b[4],
            data_version: b[5],
            stable_data_version: b[6],
            leader_router_id: b[7],
        })
    }

    /// Whether `self` carries a newer data version than `other` within the
    /// same partition.
    pub fn is_newer_than(&self, other: &LeaderData) -> bool {
        self.partition_id == other.partition_id
            && version_is_newer(self.data_version, other.data_version)
    }
}

/// Serial-number comparison of 8-bit versions.
pub fn version_is_newer(candidate: u8, current: u8) -> bool {
    (candidate.wrapping_sub(current) as i8) > 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommissionerSession {
    pub session_id: u16,
    pub peer: PeerId,
}

/// Who a management Set came from, as far as the leader can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOrigin {
    ActiveCommissioner,
    /// No Commissioner Session ID, e.g. a node reconciling after a merge.
    Node,
}

#[derive(Debug, Clone)]
pub struct LeaderState {
    leader_data: LeaderData,
    commissioner: Option<CommissionerSession>,
}

impl LeaderState {
    /// Fresh leader with randomised versions.
    pub fn new<R: Rng + ?Sized>(
        rng: &mut R,
        partition_id: u32,
        leader_router_id: u8,
        weighting: u8,
    ) -> Self {
        Self {
            leader_data: LeaderData {
                partition_id,
                weighting,
                data_version: rng.random(),
                stable_data_version: rng.random(),
                leader_router_id,
            },
            commissioner: None,
        }
    }

    pub fn leader_data(&self) -> LeaderData {
        self.leader_data
    }

    /// Increment the data version, and the stable version when a recognised
    /// dataset field changed.
    pub fn bump_versions(&mut self, stable_changed: bool) {
        self.leader_data.data_version = self.leader_data.data_version.wrapping_add(1);
        if stable_changed {
            self.leader_data.stable_data_version =
                self.leader_data.stable_data_version.wrapping_add(1);
        }
    }

    pub fn commissioner(&self) -> Option<CommissionerSession> {
        self.commissioner
    }

    pub fn set_commissioner(&mut self, session: Option<CommissionerSession>) {
        self.commissioner = session;
    }

    /// Match a Set's Commissioner Session ID against the registered session.
    pub fn check_session(&self, received: Option<u16>) -> Result<SetOrigin, DatasetError> {
        let Some(received) = received else {
            return Ok(SetOrigin::Node);
        };
        match self.commissioner {
            Some(c) if c.session_id == received => Ok(SetOrigin::ActiveCommissioner),
            other => Err(DatasetError::InvalidCommissionerSession {
                received,
                expected: other.map(|c| c.session_id),
            }),
        }
    }
}
