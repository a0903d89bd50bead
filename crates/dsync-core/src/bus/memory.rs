// ── In-memory bus ──
//
// A complete bus client over a serde-loadable topology. Modify calls
// are applied to the topology and recorded; query calls are counted;
// faults can be injected per node. Used by the binary's simulation
// mode and throughout the test suite.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{
    BusMember, BusModify, BusQuery, ClusterSpec, DeviceSpec, LastCalledScene, NodeSpec,
    ZoneSensorSpec,
};
use crate::error::BusError;
use crate::model::{Dsuid, GroupId, HeatingConfig, MemberType, NodeDigest, ZoneId};

// ── Topology fixtures ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusTopology {
    #[serde(default)]
    pub nodes: Vec<NodeFixture>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFixture {
    pub dsuid: Dsuid,
    #[serde(default)]
    pub member_type: MemberType,
    #[serde(default)]
    pub spec: NodeSpec,
    #[serde(default)]
    pub digest: NodeDigest,
    #[serde(default)]
    pub zones: Vec<ZoneFixture>,
    #[serde(default)]
    pub clusters: Vec<ClusterSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneFixture {
    pub id: ZoneId,
    #[serde(default)]
    pub groups: Vec<GroupId>,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub last_called: Vec<LastCalledScene>,
    #[serde(default)]
    pub heating: HeatingConfig,
    #[serde(default)]
    pub heating_state: u8,
    #[serde(default)]
    pub sensors: Vec<ZoneSensorSpec>,
}

impl NodeFixture {
    pub fn new(dsuid: Dsuid) -> Self {
        Self {
            dsuid,
            member_type: MemberType::Meter,
            spec: NodeSpec::default(),
            digest: NodeDigest::default(),
            zones: Vec::new(),
            clusters: Vec::new(),
        }
    }

    fn zone(&self, zone: ZoneId) -> Result<&ZoneFixture, BusError> {
        self.zones
            .iter()
            .find(|z| z.id == zone)
            .ok_or_else(|| BusError::Rejected {
                message: format!("zone {zone} unknown on node {}", self.dsuid),
            })
    }

    fn zone_mut(&mut self, zone: ZoneId) -> Result<&mut ZoneFixture, BusError> {
        let node = self.dsuid;
        self.zones
            .iter_mut()
            .find(|z| z.id == zone)
            .ok_or_else(|| BusError::Rejected {
                message: format!("zone {zone} unknown on node {node}"),
            })
    }
}

impl ZoneFixture {
    pub fn new(id: ZoneId) -> Self {
        Self {
            id,
            groups: Vec::new(),
            devices: Vec::new(),
            last_called: Vec::new(),
            heating: HeatingConfig::default(),
            heating_state: 0,
            sensors: Vec::new(),
        }
    }
}

// ── Recorded calls ──────────────────────────────────────────────────

/// A modify call as received by the in-memory bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCall {
    AddToGroup { device: Dsuid, group: GroupId },
    RemoveFromGroup { device: Dsuid, group: GroupId },
    UpdateCluster(ClusterSpec),
    SetZoneHeatingConfig {
        node: Dsuid,
        zone: ZoneId,
        config: HeatingConfig,
    },
}

// ── MemoryBus ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Faults {
    /// Remaining failures per node for query calls.
    nodes: HashMap<Dsuid, u32>,
    /// Remaining failures for modify calls.
    modify: u32,
}

#[derive(Debug, Default)]
pub struct MemoryBus {
    topology: Mutex<BusTopology>,
    calls: Mutex<Vec<BusCall>>,
    queries: Mutex<HashMap<&'static str, usize>>,
    faults: Mutex<Faults>,
}

impl MemoryBus {
    pub fn new(topology: BusTopology) -> Self {
        Self {
            topology: Mutex::new(topology),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json).map(Self::new)
    }

    /// Snapshot of the current topology, including applied modify calls.
    pub fn topology(&self) -> BusTopology {
        self.topology.lock().clone()
    }

    /// Edit the topology in place, e.g. to simulate a change on a node.
    pub fn update<R>(&self, f: impl FnOnce(&mut BusTopology) -> R) -> R {
        f(&mut self.topology.lock())
    }

    pub fn set_digest(&self, node: Dsuid, digest: NodeDigest) {
        self.update(|t| {
            if let Some(n) = t.nodes.iter_mut().find(|n| n.dsuid == node) {
                n.digest = digest;
            }
        });
    }

    /// Make the next `times` queries against `node` fail.
    pub fn fail_node(&self, node: Dsuid, times: u32) {
        self.faults.lock().nodes.insert(node, times);
    }

    /// Make the next `times` modify calls fail.
    pub fn fail_modify(&self, times: u32) {
        self.faults.lock().modify = times;
    }

    pub fn calls(&self) -> Vec<BusCall> {
        self.calls.lock().clone()
    }

    pub fn take_calls(&self) -> Vec<BusCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn query_count(&self, method: &str) -> usize {
        self.queries.lock().get(method).copied().unwrap_or(0)
    }

    // ── Internals ────────────────────────────────────────────────────

    fn count(&self, method: &'static str) {
        *self.queries.lock().entry(method).or_insert(0) += 1;
    }

    fn check_node(&self, node: Dsuid) -> Result<(), BusError> {
        let mut faults = self.faults.lock();
        if let Some(remaining) = faults.nodes.get_mut(&node) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BusError::Unreachable { node });
            }
        }
        Ok(())
    }

    fn check_modify(&self) -> Result<(), BusError> {
        let mut faults = self.faults.lock();
        if faults.modify > 0 {
            faults.modify -= 1;
            return Err(BusError::Timeout);
        }
        Ok(())
    }

    fn with_node<T>(
        &self,
        method: &'static str,
        node: Dsuid,
        f: impl FnOnce(&NodeFixture) -> Result<T, BusError>,
    ) -> Result<T, BusError> {
        self.count(method);
        self.check_node(node)?;
        trace!(method, %node, "memory bus query");
        let topology = self.topology.lock();
        let fixture = topology
            .nodes
            .iter()
            .find(|n| n.dsuid == node)
            .ok_or(BusError::Unreachable { node })?;
        f(fixture)
    }

    fn record(&self, call: BusCall) -> Result<(), BusError> {
        self.check_modify()?;
        self.calls.lock().push(call);
        Ok(())
    }

    fn edit_device(&self, device: Dsuid, f: impl Fn(&mut DeviceSpec)) {
        let mut topology = self.topology.lock();
        topology
            .nodes
            .iter_mut()
            .flat_map(|n| n.zones.iter_mut())
            .flat_map(|z| z.devices.iter_mut())
            .filter(|d| d.dsuid == device)
            .for_each(f);
    }
}

#[async_trait]
impl BusQuery for MemoryBus {
    async fn bus_members(&self) -> Result<Vec<BusMember>, BusError> {
        self.count("bus_members");
        let topology = self.topology.lock();
        Ok(topology
            .nodes
            .iter()
            .map(|n| BusMember {
                dsuid: n.dsuid,
                member_type: n.member_type,
            })
            .collect())
    }

    async fn node_digest(&self, node: Dsuid) -> Result<NodeDigest, BusError> {
        self.with_node("node_digest", node, |n| Ok(n.digest))
    }

    async fn node_spec(&self, node: Dsuid) -> Result<NodeSpec, BusError> {
        self.with_node("node_spec", node, |n| Ok(n.spec.clone()))
    }

    async fn zones(&self, node: Dsuid) -> Result<Vec<ZoneId>, BusError> {
        self.with_node("zones", node, |n| Ok(n.zones.iter().map(|z| z.id).collect()))
    }

    async fn devices_in_zone(&self, node: Dsuid, zone: ZoneId) -> Result<Vec<DeviceSpec>, BusError> {
        self.with_node("devices_in_zone", node, |n| Ok(n.zone(zone)?.devices.clone()))
    }

    async fn groups(&self, node: Dsuid, zone: ZoneId) -> Result<Vec<GroupId>, BusError> {
        self.with_node("groups", node, |n| Ok(n.zone(zone)?.groups.clone()))
    }

    async fn clusters(&self, node: Dsuid) -> Result<Vec<ClusterSpec>, BusError> {
        self.with_node("clusters", node, |n| Ok(n.clusters.clone()))
    }

    async fn last_called_scenes(
        &self,
        node: Dsuid,
        zone: ZoneId,
    ) -> Result<Vec<LastCalledScene>, BusError> {
        self.with_node("last_called_scenes", node, |n| {
            Ok(n.zone(zone)?.last_called.clone())
        })
    }

    async fn zone_heating_config(
        &self,
        node: Dsuid,
        zone: ZoneId,
    ) -> Result<HeatingConfig, BusError> {
        self.with_node("zone_heating_config", node, |n| Ok(n.zone(zone)?.heating))
    }

    async fn zone_heating_state(&self, node: Dsuid, zone: ZoneId) -> Result<u8, BusError> {
        self.with_node("zone_heating_state", node, |n| Ok(n.zone(zone)?.heating_state))
    }

    async fn zone_sensor_values(
        &self,
        node: Dsuid,
        zone: ZoneId,
    ) -> Result<Vec<ZoneSensorSpec>, BusError> {
        self.with_node("zone_sensor_values", node, |n| Ok(n.zone(zone)?.sensors.clone()))
    }

    async fn device_count_in_zone(
        &self,
        node: Dsuid,
        zone: ZoneId,
        only_active: bool,
    ) -> Result<u16, BusError> {
        self.with_node("device_count_in_zone", node, |n| {
            let count = n
                .zone(zone)?
                .devices
                .iter()
                .filter(|d| !only_active || d.active)
                .count();
            Ok(u16::try_from(count).unwrap_or(u16::MAX))
        })
    }

    async fn device_spec(&self, node: Dsuid, bus_addr: u16) -> Result<DeviceSpec, BusError> {
        self.with_node("device_spec", node, |n| {
            n.zones
                .iter()
                .flat_map(|z| z.devices.iter())
                .find(|d| d.bus_addr == bus_addr)
                .cloned()
                .ok_or_else(|| BusError::Rejected {
                    message: format!("no device at address {bus_addr}"),
                })
        })
    }
}

#[async_trait]
impl BusModify for MemoryBus {
    async fn add_to_group(&self, device: Dsuid, group: GroupId) -> Result<(), BusError> {
        self.record(BusCall::AddToGroup { device, group })?;
        self.edit_device(device, |d| {
            if !d.groups.contains(&group) {
                d.groups.push(group);
            }
        });
        Ok(())
    }

    async fn remove_from_group(&self, device: Dsuid, group: GroupId) -> Result<(), BusError> {
        self.record(BusCall::RemoveFromGroup { device, group })?;
        self.edit_device(device, |d| d.groups.retain(|g| *g != group));
        Ok(())
    }

    async fn update_cluster(&self, cluster: &ClusterSpec) -> Result<(), BusError> {
        self.record(BusCall::UpdateCluster(cluster.clone()))?;
        let mut topology = self.topology.lock();
        for node in &mut topology.nodes {
            match node.clusters.iter_mut().find(|c| c.id == cluster.id) {
                Some(existing) => *existing = cluster.clone(),
                None => node.clusters.push(cluster.clone()),
            }
        }
        Ok(())
    }

    async fn set_zone_heating_config(
        &self,
        node: Dsuid,
        zone: ZoneId,
        config: HeatingConfig,
    ) -> Result<(), BusError> {
        self.record(BusCall::SetZoneHeatingConfig { node, zone, config })?;
        let mut topology = self.topology.lock();
        let fixture = topology
            .nodes
            .iter_mut()
            .find(|n| n.dsuid == node)
            .ok_or(BusError::Unreachable { node })?;
        fixture.zone_mut(zone)?.heating = config;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fixture() -> BusTopology {
        serde_json::from_str(
            r#"{
                "nodes": [{
                    "dsuid": "0xa1",
                    "digest": { "hash": 1, "modification_count": 1, "pending_events": 0 },
                    "zones": [{
                        "id": 1,
                        "groups": [1, 2],
                        "devices": [
                            { "dsuid": "0x1", "bus_addr": 10, "zone": 1, "groups": [2] },
                            { "dsuid": "0x2", "bus_addr": 11, "zone": 1, "active": false }
                        ],
                        "sensors": [{ "sensor_type": 9, "value": 21.0, "age_ms": 1500 }]
                    }]
                }]
            }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn queries_read_the_topology() {
        let bus = MemoryBus::new(fixture());
        let node = Dsuid::new(0xa1);

        assert_eq!(bus.zones(node).await.unwrap(), vec![ZoneId(1)]);
        assert_eq!(bus.device_count_in_zone(node, ZoneId(1), true).await.unwrap(), 1);
        assert_eq!(bus.device_count_in_zone(node, ZoneId(1), false).await.unwrap(), 2);
        assert_eq!(bus.device_spec(node, 11).await.unwrap().dsuid, Dsuid::new(2));
        let sensors = bus.zone_sensor_values(node, ZoneId(1)).await.unwrap();
        assert_eq!(sensors[0].age, std::time::Duration::from_millis(1500));
        assert_eq!(bus.query_count("zones"), 1);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let bus = MemoryBus::new(fixture());
        let node = Dsuid::new(0xa1);
        bus.fail_node(node, 1);
        assert_eq!(
            bus.node_digest(node).await.unwrap_err(),
            BusError::Unreachable { node }
        );
        assert!(bus.node_digest(node).await.is_ok());
    }

    #[tokio::test]
    async fn modify_calls_are_recorded_and_applied() {
        let bus = MemoryBus::new(fixture());
        bus.add_to_group(Dsuid::new(1), GroupId(16)).await.unwrap();
        bus.remove_from_group(Dsuid::new(1), GroupId(2)).await.unwrap();

        let spec = bus.device_spec(Dsuid::new(0xa1), 10).await.unwrap();
        assert_eq!(spec.groups, vec![GroupId(16)]);
        assert_eq!(bus.calls().len(), 2);

        bus.fail_modify(1);
        assert!(bus.add_to_group(Dsuid::new(2), GroupId(17)).await.is_err());
        assert_eq!(bus.take_calls().len(), 2);
        assert!(bus.calls().is_empty());
    }
}
