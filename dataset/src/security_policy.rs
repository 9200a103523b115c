//! Security Policy TLV view
//!
//! Wire layout: key rotation time in hours (u16 BE), a flags byte, and an
//! optional second flags byte whose low three bits carry the version
//! threshold for routing. Several bits are "disabled when set".

use bitflags::bitflags;

use crate::{error::DecodeError, tlv::MeshcopTlv};

/// Default key rotation time (hours).
pub const DEFAULT_ROTATION_TIME_HOURS: u16 = 672;
/// Shortest key rotation time accepted in a dataset (hours).
pub const MIN_ROTATION_TIME_HOURS: u16 = 2;

const VERSION_THRESHOLD_MASK: u8 = 0x07;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PolicyFlags: u8 {
        /// O: the network key may be read through management Get.
        const OBTAIN_NETWORK_KEY = 0x80;
        /// N: native (on-mesh) commissioning allowed.
        const NATIVE_COMMISSIONING = 0x40;
        /// R: nodes may become routers.
        const ROUTERS = 0x20;
        /// C: external commissioning allowed.
        const EXTERNAL_COMMISSIONING = 0x10;
        /// B: beacons carry joining information.
        const BEACONS = 0x08;
        const CCM_DISABLED = 0x04;
        const AUTONOMOUS_ENROLLMENT_DISABLED = 0x02;
        const NETWORK_KEY_PROVISIONING_DISABLED = 0x01;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PolicyFlags2: u8 {
        const TOBLE_LINK = 0x80;
        const NON_CCM_ROUTERS_DISABLED = 0x40;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecurityPolicy {
    pub rotation_time_hours: u16,
    pub flags: PolicyFlags,
    pub flags2: Option<PolicyFlags2>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            rotation_time_hours: DEFAULT_ROTATION_TIME_HOURS,
            flags: PolicyFlags::all(),
            flags2: Some(PolicyFlags2::from_bits_retain(0xf8)),
        }
    }
}

/// What the discovery and beacon layer may advertise under a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryCapabilities {
    pub native_commissioning: bool,
    pub external_commissioning: bool,
    pub joining_in_beacons: bool,
    pub routers_allowed: bool,
    pub network_key_obtainable: bool,
}

impl SecurityPolicy {
    pub fn decode(value: &[u8]) -> Result<Self, DecodeError> {
        MeshcopTlv::SecurityPolicy.check_length(value.len())?;
        Ok(Self {
            rotation_time_hours: u16::from_be_bytes([value[0], value[1]]),
            flags: PolicyFlags::from_bits_retain(value[2]),
            flags2: value.get(3).copied().map(PolicyFlags2::from_bits_retain),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4);
        out.extend_from_slice(&self.rotation_time_hours.to_be_bytes());
        out.push(self.flags.bits());
        if let Some(flags2) = self.flags2 {
            out.push(flags2.bits());
        }
        out
    }

    pub fn obtain_network_key_enabled(&self) -> bool {
        self.flags.contains(PolicyFlags::OBTAIN_NETWORK_KEY)
    }

    pub fn native_commissioning_enabled(&self) -> bool {
        self.flags.contains(PolicyFlags::NATIVE_COMMISSIONING)
    }

    pub fn routers_enabled(&self) -> bool {
        self.flags.contains(PolicyFlags::ROUTERS)
    }

    pub fn external_commissioning_enabled(&self) -> bool {
        self.flags.contains(PolicyFlags::EXTERNAL_COMMISSIONING)
    }

    pub fn beacons_enabled(&self) -> bool {
        self.flags.contains(PolicyFlags::BEACONS)
    }

    pub fn commercial_commissioning_enabled(&self) -> bool {
        !self.flags.contains(PolicyFlags::CCM_DISABLED)
    }

    pub fn version_threshold_for_routing(&self) -> u8 {
        self.flags2
            .map(|f| f.bits() & VERSION_THRESHOLD_MASK)
            .unwrap_or(0)
    }

    pub fn discovery_capabilities(&self) -> DiscoveryCapabilities {
        DiscoveryCapabilities {
            native_commissioning: self.native_commissioning_enabled(),
            external_commissioning: self.external_commissioning_enabled(),
            joining_in_beacons: self.beacons_enabled(),
            routers_allowed: self.routers_enabled(),
            network_key_obtainable: self.obtain_network_key_enabled(),
        }
    }
}
