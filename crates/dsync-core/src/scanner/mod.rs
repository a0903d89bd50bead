// ── Bus reconciliation scanner ──
//
// Scanning is split in two halves. `fetch_*` performs the bus I/O and
// produces a self-contained `ScanResult`; it runs on the maintenance
// task or the task pool. `apply` merges a result into the apartment and
// only ever runs on the dispatcher.

mod fetch;
mod merge;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bus::{
    BusMirror, ClusterSpec, DeviceSpec, LastCalledScene, NodeSpec, ZoneSensorSpec,
};
use crate::event::SystemEvent;
use crate::model::{Dsuid, GroupId, HeatingConfig, NodeDigest, ZoneId};

pub use fetch::{fetch_binary_inputs, fetch_clusters, fetch_device, fetch_node, fetch_zone};
pub use merge::{apply, apply_binary_inputs};
pub(crate) use merge::wants_cluster_check;

/// Which path a node scan took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScanDepth {
    /// Digest unchanged: only active-device counts were refreshed.
    Quick,
    /// Full re-enumeration of zones, devices and clusters.
    Full,
}

/// Everything read from the bus for one zone of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneScan {
    pub zone: ZoneId,
    pub groups: Vec<GroupId>,
    pub devices: Vec<DeviceSpec>,
    pub last_called: Vec<LastCalledScene>,
    pub heating: HeatingConfig,
    pub heating_state: u8,
    pub sensors: Vec<ZoneSensorSpec>,
    pub active_devices: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeScan {
    Quick {
        active_devices: BTreeMap<ZoneId, u16>,
    },
    Full {
        spec: NodeSpec,
        zones: Vec<ZoneScan>,
        clusters: Vec<ClusterSpec>,
    },
}

/// Bus data waiting to be merged by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanResult {
    Node {
        node: Dsuid,
        digest: NodeDigest,
        scanned_at: DateTime<Utc>,
        body: NodeScan,
    },
    Zone {
        node: Dsuid,
        scanned_at: DateTime<Utc>,
        scan: ZoneScan,
    },
    Clusters {
        node: Dsuid,
        clusters: Vec<ClusterSpec>,
    },
    Device {
        node: Dsuid,
        spec: DeviceSpec,
    },
    /// The fetch failed; the node stays invalid until the next cycle.
    Failed {
        node: Dsuid,
    },
}

impl ScanResult {
    pub fn node(&self) -> Dsuid {
        match self {
            Self::Node { node, .. }
            | Self::Zone { node, .. }
            | Self::Clusters { node, .. }
            | Self::Device { node, .. }
            | Self::Failed { node } => *node,
        }
    }

    pub fn depth(&self) -> Option<ScanDepth> {
        match self {
            Self::Node {
                body: NodeScan::Quick { .. },
                ..
            } => Some(ScanDepth::Quick),
            Self::Node {
                body: NodeScan::Full { .. },
                ..
            } => Some(ScanDepth::Full),
            _ => None,
        }
    }
}

/// Side effects of merging a scan result into the apartment.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Bus writes to issue once the apartment lock is released.
    pub mirrors: Vec<BusMirror>,
    /// Outward events to publish.
    pub events: Vec<SystemEvent>,
    /// Devices whose cluster membership should be re-checked.
    pub devices_to_check: Vec<Dsuid>,
    /// Devices whose binary input configuration must be read again.
    pub binary_input_resync: Vec<(Dsuid, u16)>,
    /// Whether the topology changed and a snapshot is due.
    pub dirty: bool,
}
