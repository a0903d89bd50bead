// ── Auto-cluster maintenance ──
//
// Keeps shading devices in exactly one automatic cluster matching their
// orientation and wind protection class. Works on the apartment only and
// returns the bus writes that mirror each change.

use tracing::{debug, warn};

use crate::bus::{BusMirror, ClusterSpec};
use crate::error::CoreError;
use crate::model::{Apartment, Dsuid, GroupId, ShadingAttributes};

/// Bring one device's cluster memberships in line with its attributes.
///
/// Locked clusters are never touched. When several automatic clusters
/// match, the lowest id is kept.
pub fn consistency_check(
    apartment: &mut Apartment,
    device: Dsuid,
) -> Result<Vec<BusMirror>, CoreError> {
    let (attributes, memberships) = {
        let d = apartment.device(device)?;
        (d.shading, d.groups.clusters().collect::<Vec<_>>())
    };
    let mut mirrors = Vec::new();

    let mut locked_match = false;
    let mut maintained_matches = Vec::new();
    for id in memberships {
        let cluster = apartment.cluster(id)?;
        let matching = cluster.matches(attributes);
        let (maintained, locked) = (cluster.is_maintained(), cluster.configuration_locked);
        if maintained {
            if matching && attributes.is_configured() {
                maintained_matches.push(id);
            } else {
                leave(apartment, device, id, &mut mirrors)?;
            }
        } else if locked && matching {
            locked_match = true;
        }
    }

    if locked_match {
        for id in maintained_matches {
            leave(apartment, device, id, &mut mirrors)?;
        }
        return Ok(mirrors);
    }

    if let Some((_, surplus)) = maintained_matches.split_first() {
        for id in surplus {
            leave(apartment, device, *id, &mut mirrors)?;
        }
        return Ok(mirrors);
    }

    if !attributes.is_configured() {
        return Ok(mirrors);
    }

    match find_or_allocate(apartment, attributes, &mut mirrors)? {
        Some(id) => {
            if apartment.device_mut(device)?.groups.insert(id) {
                debug!(%device, cluster = %id, "device joined automatic cluster");
                mirrors.push(BusMirror::AddToGroup { device, group: id });
            }
        }
        None => {
            warn!(
                %device,
                direction = %attributes.direction,
                wind_class = %attributes.wind_class,
                "cluster pool exhausted, device left unclustered"
            );
        }
    }
    Ok(mirrors)
}

/// Merge automatic clusters that share the same attributes into the one
/// with the lowest id and release the emptied slots.
pub fn join_identical_clusters(apartment: &mut Apartment) -> Result<Vec<BusMirror>, CoreError> {
    let maintained: Vec<(GroupId, ShadingAttributes)> = apartment
        .clusters()
        .filter(|c| c.is_maintained() && c.is_configured())
        .map(|c| (c.id, c.attributes()))
        .collect();

    let mut mirrors = Vec::new();
    let mut released = Vec::new();
    for (i, (keep, attributes)) in maintained.iter().enumerate() {
        if released.contains(keep) {
            continue;
        }
        for (other, other_attributes) in &maintained[i + 1..] {
            if other_attributes != attributes || released.contains(other) {
                continue;
            }
            debug!(cluster = %other, into = %keep, "joining identical clusters");
            for device in apartment.cluster_members(*other) {
                let groups = &mut apartment.device_mut(device)?.groups;
                if groups.insert(*keep) {
                    mirrors.push(BusMirror::AddToGroup {
                        device,
                        group: *keep,
                    });
                }
                groups.remove(*other);
                mirrors.push(BusMirror::RemoveFromGroup {
                    device,
                    group: *other,
                });
            }
            let cluster = apartment.cluster_mut(*other)?;
            cluster.reset();
            mirrors.push(BusMirror::UpdateCluster(ClusterSpec::from(&*cluster)));
            released.push(*other);
        }
    }
    Ok(mirrors)
}

fn leave(
    apartment: &mut Apartment,
    device: Dsuid,
    cluster: GroupId,
    mirrors: &mut Vec<BusMirror>,
) -> Result<(), CoreError> {
    if apartment.device_mut(device)?.groups.remove(cluster) {
        debug!(%device, %cluster, "device left automatic cluster");
        mirrors.push(BusMirror::RemoveFromGroup {
            device,
            group: cluster,
        });
    }
    Ok(())
}

/// Existing automatic cluster for `attributes`, else a never-configured
/// slot, else an empty automatic cluster taken over for `attributes`.
fn find_or_allocate(
    apartment: &mut Apartment,
    attributes: ShadingAttributes,
    mirrors: &mut Vec<BusMirror>,
) -> Result<Option<GroupId>, CoreError> {
    let existing = apartment
        .clusters()
        .find(|c| c.is_maintained() && c.is_configured() && c.matches(attributes))
        .map(|c| c.id);
    if existing.is_some() {
        return Ok(existing);
    }

    let free = apartment
        .clusters()
        .find(|c| !c.is_configured() && !c.configuration_locked)
        .map(|c| c.id);
    let recycled = || {
        apartment
            .clusters()
            .find(|c| c.is_maintained() && apartment.cluster_members(c.id).is_empty())
            .map(|c| c.id)
    };
    let Some(id) = free.or_else(recycled) else {
        return Ok(None);
    };

    let cluster = apartment.cluster_mut(id)?;
    cluster.configure_automatic(attributes);
    debug!(cluster = %id, name = %cluster.name, "configured automatic cluster");
    mirrors.push(BusMirror::UpdateCluster(ClusterSpec::from(&*cluster)));
    Ok(Some(id))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{CardinalDirection, Device, WindProtectionClass};
    use pretty_assertions::assert_eq;

    const NORTH_1: ShadingAttributes =
        ShadingAttributes::new(CardinalDirection::North, WindProtectionClass::Class1);
    const NORTH_2: ShadingAttributes =
        ShadingAttributes::new(CardinalDirection::North, WindProtectionClass::Class2);

    fn apartment_with(devices: &[(u128, ShadingAttributes)]) -> Apartment {
        let mut apt = Apartment::new();
        for (id, attributes) in devices {
            let device = apt.allocate_device(Dsuid::new(*id));
            device.shading = *attributes;
            device.present = true;
        }
        apt
    }

    fn device(apt: &Apartment, id: u128) -> &Device {
        apt.device(Dsuid::new(id)).unwrap()
    }

    fn automatic_matching(apt: &Apartment, attributes: ShadingAttributes) -> Vec<GroupId> {
        apt.clusters()
            .filter(|c| c.is_maintained() && c.is_configured() && c.matches(attributes))
            .map(|c| c.id)
            .collect()
    }

    #[test]
    fn device_lands_in_one_matching_cluster() {
        let mut apt = apartment_with(&[(1, NORTH_1)]);
        let mirrors = consistency_check(&mut apt, Dsuid::new(1)).unwrap();

        assert_eq!(automatic_matching(&apt, NORTH_1), vec![GroupId(16)]);
        assert_eq!(apt.cluster_members(GroupId(16)), vec![Dsuid::new(1)]);
        assert!(matches!(mirrors[0], BusMirror::UpdateCluster(_)));
        assert_eq!(
            mirrors[1],
            BusMirror::AddToGroup {
                device: Dsuid::new(1),
                group: GroupId(16)
            }
        );
    }

    #[test]
    fn second_check_is_a_no_op() {
        let mut apt = apartment_with(&[(1, NORTH_1)]);
        consistency_check(&mut apt, Dsuid::new(1)).unwrap();
        let snapshot = apt.clone();
        assert!(consistency_check(&mut apt, Dsuid::new(1)).unwrap().is_empty());
        assert_eq!(apt, snapshot);
    }

    #[test]
    fn attribute_change_moves_device_and_keeps_old_slot() {
        let mut apt = apartment_with(&[(1, NORTH_1)]);
        consistency_check(&mut apt, Dsuid::new(1)).unwrap();

        apt.device_mut(Dsuid::new(1)).unwrap().shading = NORTH_2;
        consistency_check(&mut apt, Dsuid::new(1)).unwrap();

        let clusters: Vec<_> = device(&apt, 1).groups.clusters().collect();
        assert_eq!(clusters, vec![GroupId(17)]);
        assert!(apt.cluster(GroupId(17)).unwrap().matches(NORTH_2));
        assert!(apt.cluster(GroupId(16)).unwrap().is_configured());
        assert!(apt.cluster_members(GroupId(16)).is_empty());
    }

    #[test]
    fn devices_with_equal_attributes_share_a_cluster() {
        let mut apt = apartment_with(&[(1, NORTH_1), (2, NORTH_1)]);
        consistency_check(&mut apt, Dsuid::new(1)).unwrap();
        consistency_check(&mut apt, Dsuid::new(2)).unwrap();
        assert_eq!(apt.cluster_members(GroupId(16)).len(), 2);
        assert_eq!(automatic_matching(&apt, NORTH_1).len(), 1);
    }

    #[test]
    fn locked_membership_wins() {
        let mut apt = apartment_with(&[(1, NORTH_1)]);
        let locked = apt.cluster_mut(GroupId(20)).unwrap();
        locked.configure_automatic(NORTH_1);
        locked.configuration_locked = true;
        let d = apt.device_mut(Dsuid::new(1)).unwrap();
        d.groups.insert(GroupId(20));

        assert!(consistency_check(&mut apt, Dsuid::new(1)).unwrap().is_empty());
        let clusters: Vec<_> = device(&apt, 1).groups.clusters().collect();
        assert_eq!(clusters, vec![GroupId(20)]);
    }

    #[test]
    fn surplus_automatic_memberships_are_dropped() {
        let mut apt = apartment_with(&[(1, NORTH_1)]);
        for id in [GroupId(18), GroupId(21)] {
            apt.cluster_mut(id).unwrap().configure_automatic(NORTH_1);
            apt.device_mut(Dsuid::new(1)).unwrap().groups.insert(id);
        }
        let mirrors = consistency_check(&mut apt, Dsuid::new(1)).unwrap();
        assert_eq!(
            mirrors,
            vec![BusMirror::RemoveFromGroup {
                device: Dsuid::new(1),
                group: GroupId(21)
            }]
        );
    }

    #[test]
    fn exhausted_pool_leaves_device_unclustered() {
        let mut apt = apartment_with(&[(1, NORTH_1)]);
        for id in GroupId::cluster_pool() {
            let cluster = apt.cluster_mut(id).unwrap();
            cluster.configure_automatic(NORTH_2);
            cluster.configuration_locked = true;
        }
        assert!(consistency_check(&mut apt, Dsuid::new(1)).unwrap().is_empty());
        assert!(device(&apt, 1).groups.clusters().next().is_none());
    }

    #[test]
    fn empty_automatic_cluster_is_recycled_when_no_slot_is_free() {
        let mut apt = apartment_with(&[(1, NORTH_1)]);
        for id in GroupId::cluster_pool() {
            apt.cluster_mut(id).unwrap().configure_automatic(NORTH_2);
        }
        consistency_check(&mut apt, Dsuid::new(1)).unwrap();
        assert!(apt.cluster(GroupId(16)).unwrap().matches(NORTH_1));
        assert_eq!(apt.cluster_members(GroupId(16)), vec![Dsuid::new(1)]);
    }

    #[test]
    fn join_merges_duplicates_into_lowest_id() {
        let mut apt = apartment_with(&[(1, NORTH_1), (2, NORTH_1)]);
        for (device, cluster) in [(1, 16), (2, 19)] {
            apt.cluster_mut(GroupId(cluster))
                .unwrap()
                .configure_automatic(NORTH_1);
            apt.device_mut(Dsuid::new(device))
                .unwrap()
                .groups
                .insert(GroupId(cluster));
        }

        let mirrors = join_identical_clusters(&mut apt).unwrap();
        assert_eq!(mirrors.len(), 3);
        assert_eq!(apt.cluster_members(GroupId(16)).len(), 2);
        assert!(!apt.cluster(GroupId(19)).unwrap().is_configured());

        let snapshot = apt.clone();
        assert!(join_identical_clusters(&mut apt).unwrap().is_empty());
        assert_eq!(apt, snapshot);
    }
}
