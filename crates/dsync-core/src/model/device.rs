// ── Device domain types ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use super::ids::{Dsuid, GroupId, GroupMask, ZoneId};

/// Facade orientation of a shading device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumIter)]
#[serde(rename_all = "snake_case")]
pub enum CardinalDirection {
    #[default]
    #[strum(serialize = "None")]
    None,
    North,
    #[strum(serialize = "North East")]
    NorthEast,
    East,
    #[strum(serialize = "South East")]
    SouthEast,
    South,
    #[strum(serialize = "South West")]
    SouthWest,
    West,
    #[strum(serialize = "North West")]
    NorthWest,
}

/// Wind protection class of a shading device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumIter)]
#[serde(rename_all = "snake_case")]
pub enum WindProtectionClass {
    #[default]
    #[strum(serialize = "None")]
    None,
    #[strum(serialize = "Wind Class 1")]
    Class1,
    #[strum(serialize = "Wind Class 2")]
    Class2,
    #[strum(serialize = "Wind Class 3")]
    Class3,
}

/// Cluster-relevant physical attributes of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ShadingAttributes {
    #[serde(default)]
    pub direction: CardinalDirection,
    #[serde(default)]
    pub wind_class: WindProtectionClass,
}

impl ShadingAttributes {
    pub const fn new(direction: CardinalDirection, wind_class: WindProtectionClass) -> Self {
        Self {
            direction,
            wind_class,
        }
    }

    /// Devices without orientation and wind class are never clustered.
    pub fn is_configured(&self) -> bool {
        self.direction != CardinalDirection::None || self.wind_class != WindProtectionClass::None
    }
}

/// One configured binary input of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryInput {
    pub index: u8,
    pub target_group: GroupId,
    pub input_type: u8,
    pub input_id: u8,
    /// Last reported state, `None` until the first event arrives.
    #[serde(default)]
    pub state: Option<bool>,
}

/// One sensor channel of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSensor {
    pub index: u8,
    pub sensor_type: u8,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Button configuration reported by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ButtonConfig {
    pub button_id: u8,
    pub active_group: u8,
    pub input_mode: u8,
    pub input_count: u8,
    pub input_index: u8,
}

/// A physical actuator or sensor attached through a bus node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct Device {
    pub dsuid: Dsuid,
    pub name: String,
    /// Node the device was last seen on.
    pub node: Option<Dsuid>,
    pub bus_addr: u16,
    pub zone: ZoneId,
    pub groups: GroupMask,
    pub function_id: u16,
    pub vendor_id: u16,
    pub product_id: u16,
    pub revision: u16,
    pub output_mode: u8,
    pub button: ButtonConfig,
    pub binary_inputs: Vec<BinaryInput>,
    pub sensors: Vec<DeviceSensor>,
    pub output_channels: Vec<u8>,
    pub shading: ShadingAttributes,
    pub present: bool,
    pub connected: bool,
    pub valid: bool,
    pub last_called_scene: u8,
    pub previous_scene: u8,
}

impl Device {
    pub fn new(dsuid: Dsuid) -> Self {
        Self {
            dsuid,
            name: String::new(),
            node: None,
            bus_addr: 0,
            zone: ZoneId::BROADCAST,
            groups: GroupMask::default(),
            function_id: 0,
            vendor_id: 0,
            product_id: 0,
            revision: 0,
            output_mode: 0,
            button: ButtonConfig::default(),
            binary_inputs: Vec::new(),
            sensors: Vec::new(),
            output_channels: Vec::new(),
            shading: ShadingAttributes::default(),
            present: false,
            connected: false,
            valid: false,
            last_called_scene: 0,
            previous_scene: 0,
        }
    }

    pub fn is_in_group(&self, group: GroupId) -> bool {
        group.is_broadcast() || self.groups.contains(group)
    }

    /// Record a newly called scene, remembering the one it replaced.
    pub fn set_last_called_scene(&mut self, scene: u8) {
        if scene != self.last_called_scene {
            self.previous_scene = self.last_called_scene;
        }
        self.last_called_scene = scene;
    }

    /// Undo: return to the scene before the last one (or to `scene`).
    pub fn undo_scene(&mut self, scene: Option<u8>) {
        match scene {
            Some(s) if s != self.last_called_scene => {}
            _ => self.last_called_scene = self.previous_scene,
        }
    }
}

/// Number of binary inputs a device offers, derived from its function id.
pub fn binary_input_count(function_id: u16) -> u8 {
    if function_id & 0xffc0 == 0x1000 {
        match function_id & 0x7 {
            0 => 1,
            1 => 2,
            2 => 4,
            _ => 0,
        }
    } else if function_id & 0x0fc0 == 0x0100 {
        match function_id & 0x3 {
            1 => 1,
            2 => 2,
            3 => 4,
            _ => 0,
        }
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shading_attribute_names() {
        assert_eq!(CardinalDirection::NorthEast.to_string(), "North East");
        assert_eq!(WindProtectionClass::Class2.to_string(), "Wind Class 2");
        assert!(!ShadingAttributes::default().is_configured());
        assert!(
            ShadingAttributes::new(CardinalDirection::None, WindProtectionClass::Class1)
                .is_configured()
        );
    }

    #[test]
    fn input_count_follows_function_id() {
        assert_eq!(binary_input_count(0x1000), 1);
        assert_eq!(binary_input_count(0x1002), 4);
        assert_eq!(binary_input_count(0x1007), 0);
        assert_eq!(binary_input_count(0x0103), 4);
        assert_eq!(binary_input_count(0x0500), 0);
    }

    #[test]
    fn undo_restores_previous_scene() {
        let mut dev = Device::new(Dsuid::new(1));
        dev.set_last_called_scene(5);
        dev.set_last_called_scene(17);
        dev.undo_scene(None);
        assert_eq!(dev.last_called_scene, 5);

        dev.set_last_called_scene(17);
        dev.undo_scene(Some(18));
        assert_eq!(dev.last_called_scene, 17);
    }
}
