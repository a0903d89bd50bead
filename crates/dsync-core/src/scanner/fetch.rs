// ── Scan fetch ──

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::debug;

use super::{NodeScan, ScanResult, ZoneScan};
use crate::bus::BusQuery;
use crate::error::BusError;
use crate::model::{BinaryInput, Dsuid, NodeDigest, ZoneId};

/// Read one node from the bus.
///
/// `needs_full` receives the freshly fetched digest and decides between
/// the quick and the full path. Any bus failure aborts the whole scan.
pub async fn fetch_node<F>(
    bus: &dyn BusQuery,
    node: Dsuid,
    needs_full: F,
) -> Result<ScanResult, BusError>
where
    F: FnOnce(&NodeDigest) -> bool + Send,
{
    let digest = bus.node_digest(node).await?;
    let scanned_at = Utc::now();

    let body = if needs_full(&digest) {
        debug!(%node, "full node scan");
        let spec = bus.node_spec(node).await?;
        let mut zones = Vec::new();
        for zone in bus.zones(node).await? {
            zones.push(fetch_zone_scan(bus, node, zone).await?);
        }
        let clusters = bus.clusters(node).await?;
        NodeScan::Full {
            spec,
            zones,
            clusters,
        }
    } else {
        debug!(%node, "quick node scan");
        let mut active_devices = BTreeMap::new();
        for zone in bus.zones(node).await? {
            let count = bus.device_count_in_zone(node, zone, true).await?;
            active_devices.insert(zone, count);
        }
        NodeScan::Quick { active_devices }
    };

    Ok(ScanResult::Node {
        node,
        digest,
        scanned_at,
        body,
    })
}

pub async fn fetch_zone(
    bus: &dyn BusQuery,
    node: Dsuid,
    zone: ZoneId,
) -> Result<ScanResult, BusError> {
    let scanned_at = Utc::now();
    let scan = fetch_zone_scan(bus, node, zone).await?;
    Ok(ScanResult::Zone {
        node,
        scanned_at,
        scan,
    })
}

pub async fn fetch_clusters(bus: &dyn BusQuery, node: Dsuid) -> Result<ScanResult, BusError> {
    let clusters = bus.clusters(node).await?;
    Ok(ScanResult::Clusters { node, clusters })
}

pub async fn fetch_device(
    bus: &dyn BusQuery,
    node: Dsuid,
    bus_addr: u16,
) -> Result<ScanResult, BusError> {
    let spec = bus.device_spec(node, bus_addr).await?;
    Ok(ScanResult::Device { node, spec })
}

/// Re-read the binary input configuration of one device.
pub async fn fetch_binary_inputs(
    bus: &dyn BusQuery,
    node: Dsuid,
    bus_addr: u16,
) -> Result<(Dsuid, Vec<BinaryInput>), BusError> {
    let spec = bus.device_spec(node, bus_addr).await?;
    let inputs = spec
        .binary_inputs
        .iter()
        .zip(0u8..)
        .map(|(input, index)| BinaryInput {
            index,
            target_group: input.target_group,
            input_type: input.input_type,
            input_id: input.input_id,
            state: None,
        })
        .collect();
    Ok((spec.dsuid, inputs))
}

async fn fetch_zone_scan(
    bus: &dyn BusQuery,
    node: Dsuid,
    zone: ZoneId,
) -> Result<ZoneScan, BusError> {
    Ok(ZoneScan {
        zone,
        groups: bus.groups(node, zone).await?,
        devices: bus.devices_in_zone(node, zone).await?,
        last_called: bus.last_called_scenes(node, zone).await?,
        heating: bus.zone_heating_config(node, zone).await?,
        heating_state: bus.zone_heating_state(node, zone).await?,
        sensors: bus.zone_sensor_values(node, zone).await?,
        active_devices: bus.device_count_in_zone(node, zone, true).await?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::bus::{BusTopology, MemoryBus, NodeFixture, ZoneFixture};
    use crate::scanner::ScanDepth;

    fn bus() -> MemoryBus {
        let mut node = NodeFixture::new(Dsuid::new(0xa1));
        node.zones.push(ZoneFixture::new(ZoneId(1)));
        node.zones.push(ZoneFixture::new(ZoneId(2)));
        MemoryBus::new(BusTopology { nodes: vec![node] })
    }

    #[tokio::test]
    async fn quick_path_only_counts_devices() {
        let bus = bus();
        let result = fetch_node(&bus, Dsuid::new(0xa1), |_| false).await.unwrap();
        assert_eq!(result.depth(), Some(ScanDepth::Quick));
        assert_eq!(bus.query_count("node_spec"), 0);
        assert_eq!(bus.query_count("devices_in_zone"), 0);
        assert_eq!(bus.query_count("device_count_in_zone"), 2);
    }

    #[tokio::test]
    async fn full_path_enumerates_every_zone() {
        let bus = bus();
        let result = fetch_node(&bus, Dsuid::new(0xa1), |_| true).await.unwrap();
        let ScanResult::Node {
            body: NodeScan::Full { zones, .. },
            ..
        } = result
        else {
            panic!("expected a full scan");
        };
        assert_eq!(zones.len(), 2);
        assert_eq!(bus.query_count("devices_in_zone"), 2);
        assert_eq!(bus.query_count("clusters"), 1);
    }

    #[tokio::test]
    async fn digest_failure_aborts_the_scan() {
        let bus = bus();
        bus.fail_node(Dsuid::new(0xa1), 1);
        let err = fetch_node(&bus, Dsuid::new(0xa1), |_| true).await.unwrap_err();
        assert!(matches!(err, BusError::Unreachable { .. }));
        assert_eq!(bus.query_count("zones"), 0);
    }
}
