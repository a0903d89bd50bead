// ── Cluster domain types ──
//
// Clusters are apartment-wide groups drawn from a fixed id pool.
// Membership is not stored here; it is derived from device group masks.

use serde::{Deserialize, Serialize};

use super::device::{CardinalDirection, ShadingAttributes, WindProtectionClass};
use super::ids::{Dsuid, GroupId};

/// Standard group that automatic shading clusters are bound to.
pub const SHADING_STANDARD_GROUP: u8 = 2;

/// Who supplied the current cluster configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "node")]
pub enum ClusterSource {
    /// Configured locally (restored snapshot or automatic maintenance).
    #[default]
    Local,
    /// Reported by the given bus node during a scan.
    Node(Dsuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: GroupId,
    pub name: String,
    pub location: CardinalDirection,
    pub protection: WindProtectionClass,
    /// 0 marks an unconfigured pool slot.
    pub standard_group: u8,
    pub floor: u8,
    pub locked_scenes: Vec<u8>,
    pub configuration_locked: bool,
    pub automatic: bool,
    pub source: ClusterSource,
    pub last_called_scene: u8,
}

impl Cluster {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            name: String::new(),
            location: CardinalDirection::None,
            protection: WindProtectionClass::None,
            standard_group: 0,
            floor: 0,
            locked_scenes: Vec::new(),
            configuration_locked: false,
            automatic: false,
            source: ClusterSource::Local,
            last_called_scene: 0,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.standard_group != 0
    }

    pub fn attributes(&self) -> ShadingAttributes {
        ShadingAttributes::new(self.location, self.protection)
    }

    pub fn matches(&self, attributes: ShadingAttributes) -> bool {
        self.attributes() == attributes
    }

    /// Eligible for automatic membership changes.
    pub fn is_maintained(&self) -> bool {
        self.automatic && !self.configuration_locked
    }

    /// Turn an unused slot into an automatic cluster for `attributes`.
    pub fn configure_automatic(&mut self, attributes: ShadingAttributes) {
        self.location = attributes.direction;
        self.protection = attributes.wind_class;
        self.name = if attributes.direction == CardinalDirection::None {
            attributes.wind_class.to_string()
        } else {
            format!("{} - {}", attributes.direction, attributes.wind_class)
        };
        self.standard_group = SHADING_STANDARD_GROUP;
        self.automatic = true;
        self.configuration_locked = false;
        self.source = ClusterSource::Local;
    }

    /// Return the slot to the pool.
    pub fn reset(&mut self) {
        let id = self.id;
        *self = Self::new(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn automatic_configuration_names_cluster() {
        let mut cluster = Cluster::new(GroupId(16));
        cluster.configure_automatic(ShadingAttributes::new(
            CardinalDirection::South,
            WindProtectionClass::Class1,
        ));
        assert_eq!(cluster.name, "South - Wind Class 1");
        assert!(cluster.is_configured());
        assert!(cluster.is_maintained());

        cluster.configure_automatic(ShadingAttributes::new(
            CardinalDirection::None,
            WindProtectionClass::Class3,
        ));
        assert_eq!(cluster.name, "Wind Class 3");

        cluster.reset();
        assert_eq!(cluster, Cluster::new(GroupId(16)));
    }
}
