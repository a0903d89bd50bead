// ── Apartment registry ──
//
// The apartment owns every node, zone, device and cluster in id-keyed
// maps. Cross references are ids, never owning pointers. Records are
// created on first discovery and never deleted; a vanished device or
// node is marked not-present instead.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::cluster::Cluster;
use super::device::Device;
use super::ids::{Dsuid, GroupId, ZoneId};
use super::node::BusNode;
use super::zone::Zone;
use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Apartment {
    nodes: BTreeMap<Dsuid, BusNode>,
    zones: BTreeMap<ZoneId, Zone>,
    devices: BTreeMap<Dsuid, Device>,
    clusters: BTreeMap<GroupId, Cluster>,
}

impl Default for Apartment {
    fn default() -> Self {
        Self::new()
    }
}

impl Apartment {
    /// An empty apartment with the broadcast zone and the full cluster pool.
    pub fn new() -> Self {
        let mut zones = BTreeMap::new();
        let mut broadcast = Zone::new(ZoneId::BROADCAST);
        broadcast.present = true;
        zones.insert(ZoneId::BROADCAST, broadcast);

        let clusters = GroupId::cluster_pool()
            .map(|id| (id, Cluster::new(id)))
            .collect();

        Self {
            nodes: BTreeMap::new(),
            zones,
            devices: BTreeMap::new(),
            clusters,
        }
    }

    // ── Nodes ────────────────────────────────────────────────────────

    pub fn node(&self, id: Dsuid) -> Result<&BusNode, CoreError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| CoreError::not_found("bus node", id))
    }

    pub fn node_mut(&mut self, id: Dsuid) -> Result<&mut BusNode, CoreError> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("bus node", id))
    }

    pub fn allocate_node(&mut self, id: Dsuid) -> &mut BusNode {
        self.nodes.entry(id).or_insert_with(|| BusNode::new(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &BusNode> {
        self.nodes.values()
    }

    // ── Zones ────────────────────────────────────────────────────────

    pub fn zone(&self, id: ZoneId) -> Result<&Zone, CoreError> {
        self.zones
            .get(&id)
            .ok_or_else(|| CoreError::not_found("zone", id))
    }

    pub fn zone_mut(&mut self, id: ZoneId) -> Result<&mut Zone, CoreError> {
        self.zones
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("zone", id))
    }

    pub fn allocate_zone(&mut self, id: ZoneId) -> &mut Zone {
        self.zones.entry(id).or_insert_with(|| Zone::new(id))
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub fn zones_mut(&mut self) -> impl Iterator<Item = &mut Zone> {
        self.zones.values_mut()
    }

    // ── Devices ──────────────────────────────────────────────────────

    pub fn device(&self, id: Dsuid) -> Result<&Device, CoreError> {
        self.devices
            .get(&id)
            .ok_or_else(|| CoreError::not_found("device", id))
    }

    pub fn device_mut(&mut self, id: Dsuid) -> Result<&mut Device, CoreError> {
        self.devices
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("device", id))
    }

    pub fn allocate_device(&mut self, id: Dsuid) -> &mut Device {
        self.devices.entry(id).or_insert_with(|| Device::new(id))
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    /// Resolve a node-local bus address. A null node searches every node.
    pub fn device_by_bus_addr(&self, node: Dsuid, bus_addr: u16) -> Result<&Device, CoreError> {
        self.devices
            .values()
            .find(|d| d.bus_addr == bus_addr && (node.is_null() || d.node == Some(node)))
            .ok_or_else(|| CoreError::not_found("device", format!("{node}/{bus_addr}")))
    }

    /// Devices of a zone (zone 0 means all) that belong to `group`.
    pub fn devices_in_group(&self, zone: ZoneId, group: GroupId) -> Vec<Dsuid> {
        self.devices
            .values()
            .filter(|d| zone.is_broadcast() || d.zone == zone)
            .filter(|d| d.is_in_group(group))
            .map(|d| d.dsuid)
            .collect()
    }

    /// Remove a device from its node's and zone's member sets.
    pub fn detach_device(&mut self, id: Dsuid) -> Result<(), CoreError> {
        let device = self.device(id)?;
        let (node, zone) = (device.node, device.zone);
        if let Some(node) = node.and_then(|n| self.nodes.get_mut(&n)) {
            node.devices.remove(&id);
        }
        if let Some(zone) = self.zones.get_mut(&zone) {
            zone.devices.remove(&id);
        }
        Ok(())
    }

    /// Register a device with a node and zone, creating the zone if needed.
    pub fn attach_device(&mut self, id: Dsuid, node: Dsuid, zone: ZoneId) -> Result<(), CoreError> {
        let device = self.device_mut(id)?;
        device.node = Some(node);
        device.zone = zone;

        let zone = self.allocate_zone(zone);
        zone.devices.insert(id);
        zone.nodes.insert(node);
        self.node_mut(node)?.devices.insert(id);
        Ok(())
    }

    // ── Clusters ─────────────────────────────────────────────────────

    pub fn cluster(&self, id: GroupId) -> Result<&Cluster, CoreError> {
        self.clusters
            .get(&id)
            .ok_or_else(|| CoreError::not_found("cluster", id))
    }

    pub fn cluster_mut(&mut self, id: GroupId) -> Result<&mut Cluster, CoreError> {
        self.clusters
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("cluster", id))
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    /// Devices whose group mask includes the cluster.
    pub fn cluster_members(&self, id: GroupId) -> Vec<Dsuid> {
        self.devices
            .values()
            .filter(|d| d.groups.contains(id))
            .map(|d| d.dsuid)
            .collect()
    }

    // ── Snapshot restore ─────────────────────────────────────────────

    /// Everything restored from disk is stale until the bus confirms it.
    pub fn mark_unverified(&mut self) {
        for node in self.nodes.values_mut() {
            node.present = false;
            node.connected = false;
            node.valid = false;
            node.initialized = false;
        }
        for device in self.devices.values_mut() {
            device.present = false;
            device.connected = false;
        }
        // The pool size is fixed; heal snapshots written with fewer slots.
        for id in GroupId::cluster_pool() {
            self.clusters.entry(id).or_insert_with(|| Cluster::new(id));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_apartment_has_broadcast_zone_and_cluster_pool() {
        let apt = Apartment::new();
        assert!(apt.zone(ZoneId::BROADCAST).is_ok());
        assert_eq!(apt.clusters().count(), 24);
        assert!(apt.clusters().all(|c| !c.is_configured()));
    }

    #[test]
    fn lookups_fail_with_not_found() {
        let apt = Apartment::new();
        let err = apt.device(Dsuid::new(5)).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity_type: "device", .. }));
        assert!(apt.cluster(GroupId(2)).is_err());
    }

    #[test]
    fn attach_and_detach_keep_member_sets_in_sync() {
        let mut apt = Apartment::new();
        let node = Dsuid::new(0x100);
        let dev = Dsuid::new(0x1);
        apt.allocate_node(node);
        apt.allocate_device(dev).bus_addr = 12;
        apt.attach_device(dev, node, ZoneId(4)).unwrap();

        assert!(apt.zone(ZoneId(4)).unwrap().devices.contains(&dev));
        assert!(apt.node(node).unwrap().devices.contains(&dev));
        assert_eq!(apt.device_by_bus_addr(node, 12).unwrap().dsuid, dev);
        assert_eq!(apt.device_by_bus_addr(Dsuid::NULL, 12).unwrap().dsuid, dev);

        apt.detach_device(dev).unwrap();
        assert!(apt.zone(ZoneId(4)).unwrap().devices.is_empty());
        assert!(apt.node(node).unwrap().devices.is_empty());
    }
}
