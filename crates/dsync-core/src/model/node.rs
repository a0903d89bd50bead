// ── Bus node domain types ──

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::ids::{Dsuid, ZoneId};

/// Cheap change detector reported by every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeDigest {
    pub hash: u32,
    pub modification_count: u32,
    pub pending_events: u32,
}

impl NodeDigest {
    /// Topology equality. The pending-event counter is informational.
    pub fn same_topology(&self, other: &Self) -> bool {
        self.hash == other.hash && self.modification_count == other.modification_count
    }
}

/// What kind of bus member a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum MemberType {
    #[default]
    Meter,
    Gateway,
    Virtual,
    Unknown,
}

/// Capability flags of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct NodeCapabilities {
    pub has_devices: bool,
    pub has_metering: bool,
    pub has_temperature_control: bool,
}

/// A physical controller station on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct BusNode {
    pub dsuid: Dsuid,
    pub name: String,
    pub member_type: MemberType,
    pub capabilities: NodeCapabilities,
    /// Digest stored after the last successful scan.
    pub digest: Option<NodeDigest>,
    pub software_revision: u32,
    pub hardware_version: u32,
    pub api_version: u16,
    pub present: bool,
    pub connected: bool,
    pub valid: bool,
    /// Set once a full scan has completed.
    pub initialized: bool,
    pub devices: BTreeSet<Dsuid>,
    /// Active devices per zone as of the last scan.
    pub active_devices: BTreeMap<ZoneId, u16>,
    pub power_consumption: u32,
    pub energy_meter_value: u64,
}

impl BusNode {
    pub fn new(dsuid: Dsuid) -> Self {
        Self {
            dsuid,
            name: String::new(),
            member_type: MemberType::default(),
            capabilities: NodeCapabilities::default(),
            digest: None,
            software_revision: 0,
            hardware_version: 0,
            api_version: 0,
            present: false,
            connected: false,
            valid: false,
            initialized: false,
            devices: BTreeSet::new(),
            active_devices: BTreeMap::new(),
            power_consumption: 0,
            energy_meter_value: 0,
        }
    }

    /// Whether a digest fetched from the bus allows skipping a full scan.
    pub fn digest_matches(&self, fetched: &NodeDigest) -> bool {
        self.initialized
            && self
                .digest
                .is_some_and(|stored| stored.same_topology(fetched))
    }

    /// Energy counters only move forward; a lower value means the node
    /// restarted and the reading is taken as a new baseline increment.
    pub fn update_energy(&mut self, value: u64) {
        if value >= self.energy_meter_value {
            self.energy_meter_value = value;
        } else {
            self.energy_meter_value = self.energy_meter_value.saturating_add(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_match_requires_initialized_node() {
        let digest = NodeDigest {
            hash: 7,
            modification_count: 2,
            pending_events: 0,
        };
        let mut node = BusNode::new(Dsuid::new(1));
        node.digest = Some(digest);
        assert!(!node.digest_matches(&digest));

        node.initialized = true;
        assert!(node.digest_matches(&NodeDigest {
            pending_events: 9,
            ..digest
        }));
        assert!(!node.digest_matches(&NodeDigest {
            modification_count: 3,
            ..digest
        }));
    }
}
