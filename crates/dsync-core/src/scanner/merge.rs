// ── Scan merge ──
//
// Applies fetched bus data to the apartment. Runs on the dispatcher
// only, so it never awaits and never talks to the bus directly; bus
// writes are returned as mirrors.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use super::{NodeScan, ScanOutcome, ScanResult, ZoneScan};
use crate::bus::{BusMirror, ClusterSpec, DeviceSpec, NodeSpec, ZoneSensorSpec};
use crate::error::CoreError;
use crate::event::SystemEvent;
use crate::model::{
    Apartment, BinaryInput, ButtonConfig, Cluster, ClusterSource, Device, DeviceSensor, Dsuid,
    GroupId, HeatingConfig, NodeDigest, SensorReading, ZoneHeating, ZoneId, binary_input_count,
};

/// Merge one scan result into the apartment.
pub fn apply(apartment: &mut Apartment, result: ScanResult) -> Result<ScanOutcome, CoreError> {
    let mut out = ScanOutcome::default();
    match result {
        ScanResult::Node {
            node,
            digest,
            scanned_at,
            body: NodeScan::Full {
                spec,
                zones,
                clusters,
            },
        } => apply_full(
            apartment,
            FullScan {
                node,
                digest,
                scanned_at,
                spec,
                zones,
                clusters,
            },
            &mut out,
        )?,
        ScanResult::Node {
            node,
            digest,
            body: NodeScan::Quick { active_devices },
            ..
        } => apply_quick(apartment, node, digest, active_devices, &mut out)?,
        ScanResult::Zone {
            node,
            scanned_at,
            scan,
        } => {
            apartment.allocate_node(node);
            let mut seen = BTreeSet::new();
            apply_zone(apartment, node, scanned_at, scan, &mut seen, &mut out)?;
            queue_cluster_checks(apartment, &seen, &mut out);
        }
        ScanResult::Clusters { node, clusters } => {
            out.dirty |= merge_clusters(apartment, node, clusters)?;
        }
        ScanResult::Device { node, spec } => {
            apartment.allocate_node(node);
            let id = merge_device(apartment, node, spec, &mut out)?;
            queue_cluster_checks(apartment, &BTreeSet::from([id]), &mut out);
        }
        ScanResult::Failed { node } => {
            if let Ok(n) = apartment.node_mut(node) {
                n.valid = false;
            }
        }
    }
    Ok(out)
}

/// Replace a device's binary input configuration, keeping known states.
pub fn apply_binary_inputs(
    apartment: &mut Apartment,
    device: Dsuid,
    inputs: Vec<BinaryInput>,
) -> Result<ScanOutcome, CoreError> {
    let device = apartment.device_mut(device)?;
    let previous = std::mem::take(&mut device.binary_inputs);
    device.binary_inputs = inputs
        .into_iter()
        .map(|mut input| {
            input.state = previous
                .iter()
                .find(|p| p.index == input.index)
                .and_then(|p| p.state);
            input
        })
        .collect();
    Ok(ScanOutcome {
        dirty: true,
        ..ScanOutcome::default()
    })
}

// ── Node ────────────────────────────────────────────────────────────

struct FullScan {
    node: Dsuid,
    digest: NodeDigest,
    scanned_at: DateTime<Utc>,
    spec: NodeSpec,
    zones: Vec<ZoneScan>,
    clusters: Vec<ClusterSpec>,
}

fn apply_full(
    apartment: &mut Apartment,
    scan: FullScan,
    out: &mut ScanOutcome,
) -> Result<(), CoreError> {
    let node = scan.node;
    let previous = {
        let n = apartment.allocate_node(node);
        if n.name.is_empty() {
            n.name = scan.spec.name;
        }
        n.software_revision = scan.spec.software_revision;
        n.hardware_version = scan.spec.hardware_version;
        n.api_version = scan.spec.api_version;
        n.capabilities = scan.spec.capabilities;
        n.present = true;
        n.connected = true;
        n.active_devices.clear();
        n.devices.clone()
    };

    let mut seen = BTreeSet::new();
    for zone in scan.zones {
        apply_zone(apartment, node, scan.scanned_at, zone, &mut seen, out)?;
    }

    for id in previous.difference(&seen) {
        apartment.detach_device(*id)?;
        let device = apartment.device_mut(*id)?;
        device.present = false;
        device.connected = false;
        debug!(%node, device = %id, "device no longer reported");
        out.events.push(SystemEvent::DeviceRemoved {
            device: *id,
            zone: device.zone,
        });
    }

    merge_clusters(apartment, node, scan.clusters)?;
    queue_cluster_checks(apartment, &seen, out);

    let n = apartment.node_mut(node)?;
    n.digest = Some(scan.digest);
    n.valid = true;
    n.initialized = true;
    out.events.push(SystemEvent::NodeReady { node });
    out.dirty = true;
    Ok(())
}

fn apply_quick(
    apartment: &mut Apartment,
    node: Dsuid,
    digest: NodeDigest,
    active_devices: BTreeMap<ZoneId, u16>,
    out: &mut ScanOutcome,
) -> Result<(), CoreError> {
    let n = apartment.node_mut(node)?;
    let was_valid = n.valid;
    n.active_devices = active_devices;
    n.present = true;
    n.connected = true;
    n.valid = true;
    n.digest = Some(digest);
    let devices = n.devices.clone();

    for id in devices {
        if let Ok(device) = apartment.device_mut(id) {
            device.connected = true;
        }
    }
    if !was_valid {
        out.events.push(SystemEvent::NodeReady { node });
    }
    Ok(())
}

// ── Zone ────────────────────────────────────────────────────────────

fn apply_zone(
    apartment: &mut Apartment,
    node: Dsuid,
    scanned_at: DateTime<Utc>,
    scan: ZoneScan,
    seen: &mut BTreeSet<Dsuid>,
    out: &mut ScanOutcome,
) -> Result<(), CoreError> {
    let zone_id = scan.zone;
    {
        let zone = apartment.allocate_zone(zone_id);
        zone.present = true;
        zone.nodes.insert(node);
        for group in scan.groups.iter().filter(|g| !g.is_broadcast()) {
            zone.allocate_group(*group).present = true;
        }
        for last in &scan.last_called {
            zone.allocate_group(last.group).last_called_scene = last.scene;
        }
    }
    apartment
        .node_mut(node)?
        .active_devices
        .insert(zone_id, scan.active_devices);

    // Zone 0 repeats every device of the node.
    if !zone_id.is_broadcast() {
        for spec in scan.devices {
            seen.insert(merge_device(apartment, node, spec, out)?);
        }
    }

    apply_heating(apartment, node, zone_id, scan.heating, scan.heating_state, out)?;
    apply_zone_sensors(apartment, zone_id, scanned_at, &scan.sensors, out)?;
    Ok(())
}

fn apply_heating(
    apartment: &mut Apartment,
    node: Dsuid,
    zone_id: ZoneId,
    config: HeatingConfig,
    state: u8,
    out: &mut ScanOutcome,
) -> Result<(), CoreError> {
    let heating = &mut apartment.zone_mut(zone_id)?.heating;
    if !config.is_active() {
        if heating.controller == Some(node) {
            *heating = ZoneHeating::default();
        }
        return Ok(());
    }

    match heating.controller {
        Some(current) if current != node => {
            warn!(
                zone = %zone_id,
                controller = %current,
                rejected = %node,
                "second heating controller for zone, disabling it"
            );
            out.mirrors.push(BusMirror::SetZoneHeatingConfig {
                node,
                zone: zone_id,
                config: HeatingConfig::DISABLED,
            });
            out.events.push(SystemEvent::HeatingConflict {
                zone: zone_id,
                controller: current,
                rejected: node,
            });
        }
        _ => {
            *heating = ZoneHeating {
                controller: Some(node),
                config,
                state,
            };
        }
    }
    Ok(())
}

fn apply_zone_sensors(
    apartment: &mut Apartment,
    zone_id: ZoneId,
    scanned_at: DateTime<Utc>,
    sensors: &[ZoneSensorSpec],
    out: &mut ScanOutcome,
) -> Result<(), CoreError> {
    let zone = apartment.zone_mut(zone_id)?;
    for sensor in sensors {
        let Some(measured_at) = TimeDelta::from_std(sensor.age)
            .ok()
            .and_then(|age| scanned_at.checked_sub_signed(age))
        else {
            continue;
        };
        let reading = SensorReading {
            value: sensor.value,
            measured_at,
        };
        if zone.update_sensor(sensor.sensor_type, reading) {
            out.events.push(SystemEvent::ZoneSensorValue {
                zone: zone_id,
                group: GroupId::BROADCAST,
                sensor_type: sensor.sensor_type,
                value: sensor.value,
            });
        }
    }
    Ok(())
}

// ── Device ──────────────────────────────────────────────────────────

/// Re-initialise a device record from its bus description.
fn merge_device(
    apartment: &mut Apartment,
    node: Dsuid,
    spec: DeviceSpec,
    out: &mut ScanOutcome,
) -> Result<Dsuid, CoreError> {
    let id = spec.dsuid;
    let known = apartment.device(id).is_ok();
    if known {
        apartment.detach_device(id)?;
    }

    let device = apartment.allocate_device(id);
    let previous_inputs = std::mem::take(&mut device.binary_inputs);
    let previous_sensors = std::mem::take(&mut device.sensors);

    if !spec.name.is_empty() {
        device.name = spec.name;
    }
    device.bus_addr = spec.bus_addr;
    device.function_id = spec.function_id;
    device.vendor_id = spec.vendor_id;
    device.product_id = spec.product_id;
    device.revision = spec.revision;
    device.output_mode = spec.output_mode;
    device.button = ButtonConfig {
        button_id: spec.button_id,
        active_group: spec.button_active_group,
        input_mode: spec.button_input_mode,
        ..device.button
    };
    device.groups = spec
        .groups
        .iter()
        .copied()
        .filter(|g| !g.is_broadcast())
        .collect();
    device.binary_inputs = spec
        .binary_inputs
        .iter()
        .zip(0u8..)
        .map(|(input, index)| BinaryInput {
            index,
            target_group: input.target_group,
            input_type: input.input_type,
            input_id: input.input_id,
            state: previous_inputs
                .iter()
                .find(|p| p.index == index)
                .and_then(|p| p.state),
        })
        .collect();
    device.sensors = spec
        .sensors
        .iter()
        .zip(0u8..)
        .map(|(sensor, index)| {
            let kept = previous_sensors
                .iter()
                .find(|p| p.index == index && p.sensor_type == sensor.sensor_type);
            DeviceSensor {
                index,
                sensor_type: sensor.sensor_type,
                value: kept.and_then(|p| p.value),
                updated_at: kept.and_then(|p| p.updated_at),
            }
        })
        .collect();
    device.output_channels = spec.output_channels;
    if let Some(shading) = spec.shading {
        device.shading = shading;
    }
    device.present = true;
    device.connected = true;
    device.valid = true;

    if usize::from(binary_input_count(device.function_id)) > device.binary_inputs.len() {
        out.binary_input_resync.push((node, device.bus_addr));
    }

    let groups = device.groups;
    apartment.attach_device(id, node, spec.zone)?;
    let zone = apartment.zone_mut(spec.zone)?;
    zone.present = true;
    for group in groups.iter().filter(|g| !g.is_cluster()) {
        zone.allocate_group(group).present = true;
    }

    if !known {
        out.events.push(SystemEvent::DeviceAdded {
            device: id,
            zone: spec.zone,
        });
    }
    out.events.push(SystemEvent::DeviceReady {
        device: id,
        zone: spec.zone,
    });
    out.dirty = true;
    Ok(id)
}

fn queue_cluster_checks(apartment: &Apartment, ids: &BTreeSet<Dsuid>, out: &mut ScanOutcome) {
    out.devices_to_check.extend(
        ids.iter()
            .filter_map(|id| apartment.device(*id).ok())
            .filter(|d| wants_cluster_check(d))
            .map(|d| d.dsuid),
    );
}

pub(crate) fn wants_cluster_check(device: &Device) -> bool {
    device.shading.is_configured() || device.groups.clusters().next().is_some()
}

// ── Clusters ────────────────────────────────────────────────────────

/// Merge cluster data reported by `node`.
///
/// The first node to report a configured cluster becomes its source and
/// stays authoritative; later reports from other nodes are ignored.
fn merge_clusters(
    apartment: &mut Apartment,
    node: Dsuid,
    specs: Vec<ClusterSpec>,
) -> Result<bool, CoreError> {
    let mut changed = false;
    for spec in specs.into_iter().filter(|s| s.id.is_cluster()) {
        let cluster = apartment.cluster_mut(spec.id)?;
        let take = match cluster.source {
            ClusterSource::Node(source) if source == node => true,
            ClusterSource::Node(source) => {
                if ClusterSpec::from(&*cluster) != spec {
                    warn!(
                        cluster = %spec.id,
                        %source,
                        ignored = %node,
                        "cluster data differs between nodes"
                    );
                }
                false
            }
            ClusterSource::Local => spec.standard_group != 0,
        };
        if take {
            changed |= overwrite_cluster(cluster, spec, node);
        }
    }
    Ok(changed)
}

fn overwrite_cluster(cluster: &mut Cluster, spec: ClusterSpec, node: Dsuid) -> bool {
    let changed = ClusterSpec::from(&*cluster) != spec;
    cluster.name = spec.name;
    cluster.location = spec.location;
    cluster.protection = spec.protection;
    cluster.standard_group = spec.standard_group;
    cluster.floor = spec.floor;
    cluster.locked_scenes = spec.locked_scenes;
    cluster.configuration_locked = spec.configuration_locked;
    cluster.automatic = spec.automatic;
    cluster.source = ClusterSource::Node(node);
    changed
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::SensorSpec;
    use crate::model::{CardinalDirection, ShadingAttributes, WindProtectionClass};
    use pretty_assertions::assert_eq;

    const NODE_A: Dsuid = Dsuid::new(0xa);
    const NODE_B: Dsuid = Dsuid::new(0xb);

    fn device_spec(id: u128, addr: u16, zone: u16) -> DeviceSpec {
        DeviceSpec {
            dsuid: Dsuid::new(id),
            bus_addr: addr,
            zone: ZoneId(zone),
            name: String::new(),
            function_id: 0,
            vendor_id: 0,
            product_id: 0,
            revision: 0,
            output_mode: 0,
            button_id: 0,
            button_active_group: 0,
            button_input_mode: 0,
            groups: vec![GroupId(1)],
            binary_inputs: Vec::new(),
            sensors: vec![SensorSpec { sensor_type: 4 }],
            output_channels: Vec::new(),
            shading: None,
            active: true,
        }
    }

    fn zone_scan(zone: u16, devices: Vec<DeviceSpec>) -> ZoneScan {
        ZoneScan {
            zone: ZoneId(zone),
            groups: vec![GroupId(1)],
            devices,
            last_called: Vec::new(),
            heating: HeatingConfig::DISABLED,
            heating_state: 0,
            sensors: Vec::new(),
            active_devices: 1,
        }
    }

    fn full(node: Dsuid, zones: Vec<ZoneScan>, clusters: Vec<ClusterSpec>) -> ScanResult {
        ScanResult::Node {
            node,
            digest: NodeDigest {
                hash: 1,
                modification_count: 1,
                pending_events: 0,
            },
            scanned_at: Utc::now(),
            body: NodeScan::Full {
                spec: NodeSpec::default(),
                zones,
                clusters,
            },
        }
    }

    fn cluster_spec(id: u8, direction: CardinalDirection) -> ClusterSpec {
        let mut cluster = Cluster::new(GroupId(id));
        cluster.configure_automatic(ShadingAttributes::new(direction, WindProtectionClass::Class1));
        ClusterSpec::from(&cluster)
    }

    #[test]
    fn full_scan_builds_topology_and_announces_devices() {
        let mut apt = Apartment::new();
        let out = apply(
            &mut apt,
            full(NODE_A, vec![zone_scan(1, vec![device_spec(1, 10, 1)])], Vec::new()),
        )
        .unwrap();

        let device = apt.device(Dsuid::new(1)).unwrap();
        assert!(device.present && device.valid);
        assert_eq!(device.node, Some(NODE_A));
        assert!(apt.zone(ZoneId(1)).unwrap().devices.contains(&Dsuid::new(1)));
        assert!(apt.node(NODE_A).unwrap().initialized);
        assert!(out.dirty);
        assert!(out.events.contains(&SystemEvent::DeviceReady {
            device: Dsuid::new(1),
            zone: ZoneId(1)
        }));
        assert!(out.events.contains(&SystemEvent::NodeReady { node: NODE_A }));
    }

    #[test]
    fn moved_device_is_detached_from_its_old_zone() {
        let mut apt = Apartment::new();
        apply(&mut apt, full(NODE_A, vec![zone_scan(1, vec![device_spec(1, 10, 1)])], Vec::new()))
            .unwrap();
        apply(&mut apt, full(NODE_A, vec![zone_scan(2, vec![device_spec(1, 10, 2)])], Vec::new()))
            .unwrap();

        assert!(apt.zone(ZoneId(1)).unwrap().devices.is_empty());
        assert_eq!(apt.device(Dsuid::new(1)).unwrap().zone, ZoneId(2));
    }

    #[test]
    fn unreported_devices_are_marked_absent() {
        let mut apt = Apartment::new();
        apply(&mut apt, full(NODE_A, vec![zone_scan(1, vec![device_spec(1, 10, 1)])], Vec::new()))
            .unwrap();
        let out = apply(&mut apt, full(NODE_A, vec![zone_scan(1, Vec::new())], Vec::new())).unwrap();

        assert!(!apt.device(Dsuid::new(1)).unwrap().present);
        assert!(out.events.contains(&SystemEvent::DeviceRemoved {
            device: Dsuid::new(1),
            zone: ZoneId(1)
        }));
    }

    #[test]
    fn bus_name_only_fills_an_empty_node_name() {
        let named = || {
            let mut scan = full(NODE_A, Vec::new(), Vec::new());
            if let ScanResult::Node {
                body: NodeScan::Full { spec, .. },
                ..
            } = &mut scan
            {
                spec.name = "meter-1".into();
            }
            scan
        };

        let mut apt = Apartment::new();
        apply(&mut apt, named()).unwrap();
        assert_eq!(apt.node(NODE_A).unwrap().name, "meter-1");

        apt.node_mut(NODE_A).unwrap().name = "Kitchen".into();
        apply(&mut apt, named()).unwrap();
        assert_eq!(apt.node(NODE_A).unwrap().name, "Kitchen");
    }

    #[test]
    fn first_configured_cluster_report_wins() {
        let mut apt = Apartment::new();
        apply(
            &mut apt,
            full(NODE_A, Vec::new(), vec![cluster_spec(16, CardinalDirection::North)]),
        )
        .unwrap();
        apply(
            &mut apt,
            full(NODE_B, Vec::new(), vec![cluster_spec(16, CardinalDirection::South)]),
        )
        .unwrap();

        let cluster = apt.cluster(GroupId(16)).unwrap();
        assert_eq!(cluster.location, CardinalDirection::North);
        assert_eq!(cluster.source, ClusterSource::Node(NODE_A));

        apply(
            &mut apt,
            ScanResult::Clusters {
                node: NODE_A,
                clusters: vec![cluster_spec(16, CardinalDirection::East)],
            },
        )
        .unwrap();
        assert_eq!(apt.cluster(GroupId(16)).unwrap().location, CardinalDirection::East);
    }

    #[test]
    fn unconfigured_cluster_reports_do_not_claim_the_slot() {
        let mut apt = Apartment::new();
        let empty = ClusterSpec::from(&Cluster::new(GroupId(17)));
        apply(&mut apt, full(NODE_B, Vec::new(), vec![empty])).unwrap();
        apply(
            &mut apt,
            full(NODE_A, Vec::new(), vec![cluster_spec(17, CardinalDirection::West)]),
        )
        .unwrap();
        assert_eq!(
            apt.cluster(GroupId(17)).unwrap().source,
            ClusterSource::Node(NODE_A)
        );
    }

    #[test]
    fn older_sensor_values_are_rejected() {
        let mut apt = Apartment::new();
        let now = Utc::now();
        let mut fresh = zone_scan(1, Vec::new());
        fresh.sensors = vec![ZoneSensorSpec {
            sensor_type: 9,
            value: 21.5,
            age: Duration::from_secs(1),
        }];
        let mut stale = fresh.clone();
        stale.sensors[0].value = 18.0;
        stale.sensors[0].age = Duration::from_secs(60);

        apply(
            &mut apt,
            ScanResult::Zone {
                node: NODE_A,
                scanned_at: now,
                scan: fresh,
            },
        )
        .unwrap();
        let out = apply(
            &mut apt,
            ScanResult::Zone {
                node: NODE_A,
                scanned_at: now,
                scan: stale,
            },
        )
        .unwrap();

        assert!(out.events.is_empty());
        let reading = apt.zone(ZoneId(1)).unwrap().sensors[&9];
        assert!((reading.value - 21.5).abs() < f64::EPSILON);
    }

    #[test]
    fn second_heating_controller_is_disabled() {
        let mut apt = Apartment::new();
        let mut claim = zone_scan(1, Vec::new());
        claim.heating = HeatingConfig { mode: 1 };
        apply(&mut apt, full(NODE_A, vec![claim.clone()], Vec::new())).unwrap();
        let out = apply(&mut apt, full(NODE_B, vec![claim], Vec::new())).unwrap();

        assert_eq!(
            apt.zone(ZoneId(1)).unwrap().heating.controller,
            Some(NODE_A)
        );
        assert_eq!(
            out.mirrors,
            vec![BusMirror::SetZoneHeatingConfig {
                node: NODE_B,
                zone: ZoneId(1),
                config: HeatingConfig::DISABLED,
            }]
        );
    }

    #[test]
    fn quick_scan_leaves_topology_alone() {
        let mut apt = Apartment::new();
        apply(&mut apt, full(NODE_A, vec![zone_scan(1, vec![device_spec(1, 10, 1)])], Vec::new()))
            .unwrap();
        let out = apply(
            &mut apt,
            ScanResult::Node {
                node: NODE_A,
                digest: NodeDigest {
                    hash: 1,
                    modification_count: 1,
                    pending_events: 3,
                },
                scanned_at: Utc::now(),
                body: NodeScan::Quick {
                    active_devices: BTreeMap::from([(ZoneId(1), 0)]),
                },
            },
        )
        .unwrap();

        assert!(!out.dirty);
        assert_eq!(apt.node(NODE_A).unwrap().active_devices[&ZoneId(1)], 0);
        assert!(apt.device(Dsuid::new(1)).unwrap().present);
    }

    #[test]
    fn missing_binary_inputs_schedule_a_resync() {
        let mut apt = Apartment::new();
        let mut spec = device_spec(1, 10, 1);
        spec.function_id = 0x1001;
        let out = apply(&mut apt, ScanResult::Device { node: NODE_A, spec }).unwrap();
        assert_eq!(out.binary_input_resync, vec![(NODE_A, 10)]);
    }

    #[test]
    fn failed_fetch_invalidates_the_node() {
        let mut apt = Apartment::new();
        apply(&mut apt, full(NODE_A, Vec::new(), Vec::new())).unwrap();
        apply(&mut apt, ScanResult::Failed { node: NODE_A }).unwrap();
        assert!(!apt.node(NODE_A).unwrap().valid);
    }
}
