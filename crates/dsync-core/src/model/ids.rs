// ── Core identity types ──
//
// Dsuid identifies anything physically addressable (bus nodes,
// devices). Zones and groups use small numeric ids assigned by the
// installation; clusters share the group id space.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── Dsuid ───────────────────────────────────────────────────────────

/// Globally unique id of a bus node or device.
///
/// Rendered as 32 lowercase hex digits. The all-zero value is the
/// "null" id, used as the source of loopback events raised by the
/// server itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[derive(Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dsuid(u128);

impl Dsuid {
    pub const NULL: Self = Self(0);

    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u128 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Dsuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Error returned when parsing a malformed [`Dsuid`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid dsuid: {0:?}")]
pub struct ParseDsuidError(String);

impl FromStr for Dsuid {
    type Err = ParseDsuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches("0x");
        if digits.is_empty() || digits.len() > 32 {
            return Err(ParseDsuidError(s.to_owned()));
        }
        u128::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|_| ParseDsuidError(s.to_owned()))
    }
}

impl TryFrom<String> for Dsuid {
    type Error = ParseDsuidError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Dsuid> for String {
    fn from(id: Dsuid) -> Self {
        id.to_string()
    }
}

impl From<u128> for Dsuid {
    fn from(raw: u128) -> Self {
        Self(raw)
    }
}

// ── ZoneId ──────────────────────────────────────────────────────────

/// Zone (room) id. Zone 0 is the apartment-wide broadcast zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(pub u16);

impl ZoneId {
    pub const BROADCAST: Self = Self(0);

    pub const fn is_broadcast(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── GroupId ─────────────────────────────────────────────────────────

/// Group id. Group 0 is the broadcast group; ids in
/// [`GroupId::CLUSTER_MIN`]..=[`GroupId::CLUSTER_MAX`] are clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u8);

impl GroupId {
    pub const BROADCAST: Self = Self(0);
    pub const CLUSTER_MIN: Self = Self(16);
    pub const CLUSTER_MAX: Self = Self(39);

    pub const fn is_broadcast(self) -> bool {
        self.0 == 0
    }

    pub const fn is_cluster(self) -> bool {
        self.0 >= Self::CLUSTER_MIN.0 && self.0 <= Self::CLUSTER_MAX.0
    }

    /// Every id in the cluster pool, lowest first.
    pub fn cluster_pool() -> impl Iterator<Item = Self> {
        (Self::CLUSTER_MIN.0..=Self::CLUSTER_MAX.0).map(Self)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── GroupMask ───────────────────────────────────────────────────────

/// Group membership bitmask of a device, one bit per group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupMask(u64);

impl GroupMask {
    const BITS: u8 = 64;

    pub fn contains(self, group: GroupId) -> bool {
        group.0 < Self::BITS && self.0 & (1 << group.0) != 0
    }

    /// Returns `true` if the membership was newly added.
    pub fn insert(&mut self, group: GroupId) -> bool {
        if group.0 >= Self::BITS || self.contains(group) {
            return false;
        }
        self.0 |= 1 << group.0;
        true
    }

    /// Returns `true` if the membership was present.
    pub fn remove(&mut self, group: GroupId) -> bool {
        if !self.contains(group) {
            return false;
        }
        self.0 &= !(1 << group.0);
        true
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = GroupId> {
        (0..Self::BITS)
            .map(GroupId)
            .filter(move |g| self.contains(*g))
    }

    /// Cluster memberships only, lowest id first.
    pub fn clusters(self) -> impl Iterator<Item = GroupId> {
        self.iter().filter(|g| g.is_cluster())
    }
}

impl FromIterator<GroupId> for GroupMask {
    fn from_iter<I: IntoIterator<Item = GroupId>>(iter: I) -> Self {
        let mut mask = Self::default();
        for group in iter {
            mask.insert(group);
        }
        mask
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn dsuid_parses_hex_with_and_without_prefix() {
        let a: Dsuid = "0x1f".parse().unwrap();
        let b: Dsuid = "0000000000000000000000000000001f".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "0000000000000000000000000000001f");
        assert!("zz".parse::<Dsuid>().is_err());
        assert!("".parse::<Dsuid>().is_err());
    }

    #[test]
    fn dsuid_serializes_as_string() {
        let id = Dsuid::new(0xabc);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000000000000000000000000000abc\"");
        let back: Dsuid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn group_mask_tracks_cluster_memberships() {
        let mut mask: GroupMask = [GroupId(1), GroupId(17)].into_iter().collect();
        assert!(mask.insert(GroupId(16)));
        assert!(!mask.insert(GroupId(16)));
        assert_eq!(mask.clusters().collect::<Vec<_>>(), vec![GroupId(16), GroupId(17)]);
        assert!(mask.remove(GroupId(17)));
        assert!(!mask.contains(GroupId(17)));
        assert!(!mask.insert(GroupId(200)));
    }
}
