// ── Zone and group domain types ──

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{Dsuid, GroupId, ZoneId};

/// A role-based device category inside a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub present: bool,
    pub last_called_scene: u8,
    pub previous_scene: u8,
}

impl Group {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            name: String::new(),
            present: false,
            last_called_scene: 0,
            previous_scene: 0,
        }
    }

    pub fn set_last_called_scene(&mut self, scene: u8) {
        if scene != self.last_called_scene {
            self.previous_scene = self.last_called_scene;
        }
        self.last_called_scene = scene;
    }

    pub fn undo_scene(&mut self, scene: Option<u8>) {
        match scene {
            Some(s) if s != self.last_called_scene => {}
            _ => self.last_called_scene = self.previous_scene,
        }
    }
}

/// Heating controller configuration as written to a bus node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeatingConfig {
    /// Controller mode, 0 = off.
    pub mode: u8,
}

impl HeatingConfig {
    pub const DISABLED: Self = Self { mode: 0 };

    /// A node with a non-zero mode claims to run the zone's controller.
    pub fn is_active(self) -> bool {
        self.mode != 0
    }
}

/// Heating controller bookkeeping of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ZoneHeating {
    /// Node currently running the controller, first claimant wins.
    pub controller: Option<Dsuid>,
    pub config: HeatingConfig,
    pub state: u8,
}

/// A sensor value tracked on zone level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub value: f64,
    pub measured_at: DateTime<Utc>,
}

/// A room or area grouping devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub present: bool,
    pub devices: BTreeSet<Dsuid>,
    pub nodes: BTreeSet<Dsuid>,
    pub groups: BTreeMap<GroupId, Group>,
    pub heating: ZoneHeating,
    /// Keyed by sensor type.
    pub sensors: BTreeMap<u8, SensorReading>,
}

impl Zone {
    pub fn new(id: ZoneId) -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(GroupId::BROADCAST, Group::new(GroupId::BROADCAST));
        Self {
            id,
            name: String::new(),
            present: false,
            devices: BTreeSet::new(),
            nodes: BTreeSet::new(),
            groups,
            heating: ZoneHeating::default(),
            sensors: BTreeMap::new(),
        }
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn group_mut(&mut self, id: GroupId) -> Option<&mut Group> {
        self.groups.get_mut(&id)
    }

    pub fn allocate_group(&mut self, id: GroupId) -> &mut Group {
        self.groups.entry(id).or_insert_with(|| Group::new(id))
    }

    /// Store a sensor value unless an equally new or newer one is known.
    ///
    /// Returns `true` if the value was accepted.
    pub fn update_sensor(&mut self, sensor_type: u8, reading: SensorReading) -> bool {
        match self.sensors.get(&sensor_type) {
            Some(known) if known.measured_at >= reading.measured_at => false,
            _ => {
                self.sensors.insert(sensor_type, reading);
                true
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn older_sensor_values_are_rejected() {
        let mut zone = Zone::new(ZoneId(3));
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).single().unwrap();
        let newer = SensorReading {
            value: 21.5,
            measured_at: t0,
        };
        let older = SensorReading {
            value: 18.0,
            measured_at: t0 - chrono::Duration::seconds(30),
        };
        assert!(zone.update_sensor(9, newer));
        assert!(!zone.update_sensor(9, older));
        assert!(!zone.update_sensor(9, newer));
        assert!((zone.sensors[&9].value - 21.5).abs() < f64::EPSILON);
    }

    #[test]
    fn new_zone_has_broadcast_group() {
        let zone = Zone::new(ZoneId(1));
        assert!(zone.group(GroupId::BROADCAST).is_some());
    }
}
