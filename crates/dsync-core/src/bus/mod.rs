// ── Bus client interfaces ──
//
// The engine talks to the field bus through two narrow traits: one for
// queries, one for modifications. Every call may fail with a transient
// `BusError`. Implementations serialize access to their connection
// themselves; both the meter-maintenance task and ad hoc callers may
// hold the same client concurrently.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BusError;
use crate::model::{
    CardinalDirection, Cluster, Dsuid, GroupId, HeatingConfig, MemberType, NodeCapabilities,
    NodeDigest, ShadingAttributes, WindProtectionClass, ZoneId,
};

pub use memory::{BusCall, BusTopology, MemoryBus, NodeFixture, ZoneFixture};

// ── Wire-independent specs ──────────────────────────────────────────

/// A member found during bus enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMember {
    pub dsuid: Dsuid,
    #[serde(default)]
    pub member_type: MemberType,
}

/// Static description of a node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSpec {
    pub name: String,
    pub software_revision: u32,
    pub hardware_version: u32,
    pub api_version: u16,
    pub capabilities: NodeCapabilities,
}

/// Binary input configuration as reported by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryInputSpec {
    pub target_group: GroupId,
    pub input_type: u8,
    pub input_id: u8,
}

/// Sensor channel configuration as reported by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub sensor_type: u8,
}

/// Everything the bus knows about one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub dsuid: Dsuid,
    pub bus_addr: u16,
    pub zone: ZoneId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub function_id: u16,
    #[serde(default)]
    pub vendor_id: u16,
    #[serde(default)]
    pub product_id: u16,
    #[serde(default)]
    pub revision: u16,
    #[serde(default)]
    pub output_mode: u8,
    #[serde(default)]
    pub button_id: u8,
    #[serde(default)]
    pub button_active_group: u8,
    #[serde(default)]
    pub button_input_mode: u8,
    #[serde(default)]
    pub groups: Vec<GroupId>,
    #[serde(default)]
    pub binary_inputs: Vec<BinaryInputSpec>,
    #[serde(default)]
    pub sensors: Vec<SensorSpec>,
    #[serde(default)]
    pub output_channels: Vec<u8>,
    /// Shading attributes stored in the device, if it carries any.
    #[serde(default)]
    pub shading: Option<ShadingAttributes>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Cluster configuration as stored on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub id: GroupId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: CardinalDirection,
    #[serde(default)]
    pub protection: WindProtectionClass,
    #[serde(default)]
    pub standard_group: u8,
    #[serde(default)]
    pub floor: u8,
    #[serde(default)]
    pub locked_scenes: Vec<u8>,
    #[serde(default)]
    pub configuration_locked: bool,
    #[serde(default)]
    pub automatic: bool,
}

impl From<&Cluster> for ClusterSpec {
    fn from(cluster: &Cluster) -> Self {
        Self {
            id: cluster.id,
            name: cluster.name.clone(),
            location: cluster.location,
            protection: cluster.protection,
            standard_group: cluster.standard_group,
            floor: cluster.floor,
            locked_scenes: cluster.locked_scenes.clone(),
            configuration_locked: cluster.configuration_locked,
            automatic: cluster.automatic,
        }
    }
}

/// Last scene called on a group, as remembered by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastCalledScene {
    pub group: GroupId,
    pub scene: u8,
}

/// A zone sensor value together with how old it was when read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneSensorSpec {
    pub sensor_type: u8,
    pub value: f64,
    #[serde(with = "age_millis", rename = "age_ms", default)]
    pub age: Duration,
}

mod age_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(age: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(age.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// ── Traits ──────────────────────────────────────────────────────────

/// Read side of the bus.
#[async_trait]
pub trait BusQuery: Send + Sync {
    async fn bus_members(&self) -> Result<Vec<BusMember>, BusError>;
    async fn node_digest(&self, node: Dsuid) -> Result<NodeDigest, BusError>;
    async fn node_spec(&self, node: Dsuid) -> Result<NodeSpec, BusError>;
    async fn zones(&self, node: Dsuid) -> Result<Vec<ZoneId>, BusError>;
    async fn devices_in_zone(&self, node: Dsuid, zone: ZoneId) -> Result<Vec<DeviceSpec>, BusError>;
    async fn groups(&self, node: Dsuid, zone: ZoneId) -> Result<Vec<GroupId>, BusError>;
    async fn clusters(&self, node: Dsuid) -> Result<Vec<ClusterSpec>, BusError>;
    async fn last_called_scenes(
        &self,
        node: Dsuid,
        zone: ZoneId,
    ) -> Result<Vec<LastCalledScene>, BusError>;
    async fn zone_heating_config(&self, node: Dsuid, zone: ZoneId)
    -> Result<HeatingConfig, BusError>;
    async fn zone_heating_state(&self, node: Dsuid, zone: ZoneId) -> Result<u8, BusError>;
    async fn zone_sensor_values(
        &self,
        node: Dsuid,
        zone: ZoneId,
    ) -> Result<Vec<ZoneSensorSpec>, BusError>;
    async fn device_count_in_zone(
        &self,
        node: Dsuid,
        zone: ZoneId,
        only_active: bool,
    ) -> Result<u16, BusError>;
    async fn device_spec(&self, node: Dsuid, bus_addr: u16) -> Result<DeviceSpec, BusError>;
}

/// Write side of the bus.
#[async_trait]
pub trait BusModify: Send + Sync {
    async fn add_to_group(&self, device: Dsuid, group: GroupId) -> Result<(), BusError>;
    async fn remove_from_group(&self, device: Dsuid, group: GroupId) -> Result<(), BusError>;
    async fn update_cluster(&self, cluster: &ClusterSpec) -> Result<(), BusError>;
    async fn set_zone_heating_config(
        &self,
        node: Dsuid,
        zone: ZoneId,
        config: HeatingConfig,
    ) -> Result<(), BusError>;
}

// ── Mirror calls ────────────────────────────────────────────────────

/// A model change that has to be repeated on the bus.
///
/// Produced by pure model code and executed by the dispatcher once the
/// apartment lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMirror {
    AddToGroup { device: Dsuid, group: GroupId },
    RemoveFromGroup { device: Dsuid, group: GroupId },
    UpdateCluster(ClusterSpec),
    SetZoneHeatingConfig {
        node: Dsuid,
        zone: ZoneId,
        config: HeatingConfig,
    },
}

impl BusMirror {
    pub async fn apply(&self, bus: &dyn BusModify) -> Result<(), BusError> {
        match self {
            Self::AddToGroup { device, group } => bus.add_to_group(*device, *group).await,
            Self::RemoveFromGroup { device, group } => bus.remove_from_group(*device, *group).await,
            Self::UpdateCluster(spec) => bus.update_cluster(spec).await,
            Self::SetZoneHeatingConfig { node, zone, config } => {
                bus.set_zone_heating_config(*node, *zone, *config).await
            }
        }
    }
}
