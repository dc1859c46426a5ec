//! Grouping of device snapshots into the sets published on the node.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::domain::chip::ChipFamily;
use crate::domain::device::DeviceId;
use crate::domain::device::NpuDevice;

/// Health partition of one device snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusGroups {
    pub healthy: BTreeSet<DeviceId>,
    pub unhealthy: BTreeSet<DeviceId>,
    pub network_unhealthy: BTreeSet<DeviceId>,
}

/// Split `devices` into healthy and unhealthy sets.
///
/// Virtual devices are always allocatable; when one reports unhealthy its
/// parent card is recorded as unhealthy instead.
pub fn group_by_status(devices: &[NpuDevice]) -> StatusGroups {
    let mut groups = StatusGroups::default();
    for device in devices {
        match &device.id {
            DeviceId::Physical { .. } => {
                if device.health.is_healthy() {
                    groups.healthy.insert(device.id.clone());
                } else {
                    groups.unhealthy.insert(device.id.clone());
                }
                if !device.network_health.is_healthy() {
                    groups.network_unhealthy.insert(device.id.clone());
                }
            }
            DeviceId::Virtual { family, phy_id, .. } => {
                groups.healthy.insert(device.id.clone());
                if !device.health.is_healthy() {
                    groups
                        .unhealthy
                        .insert(DeviceId::physical(*family, *phy_id));
                }
            }
        }
    }
    groups
}

/// Annotation key to CSV of allocatable IDs, one entry per known type.
pub fn build_annotation_map(
    allocatable: &BTreeSet<DeviceId>,
    known_types: &BTreeSet<String>,
) -> BTreeMap<String, String> {
    known_types
        .iter()
        .map(|dev_type| {
            let ids = allocatable
                .iter()
                .filter(|id| id.device_type() == *dev_type)
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            (ChipFamily::annotation_key(dev_type), ids)
        })
        .collect()
}

/// Parse a CSV annotation value, dropping entries that are not device IDs.
pub fn parse_device_list(value: &str) -> BTreeSet<DeviceId> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<DeviceId>() {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(device = s, "skipping unparsable device name: {e:?}");
                None
            }
        })
        .collect()
}

pub fn join_device_list<'a>(ids: impl IntoIterator<Item = &'a DeviceId>) -> String {
    ids.into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::device::Health;

    fn device(name: &str, health: Health, network: Health) -> NpuDevice {
        let mut device = NpuDevice::new(name.parse().expect("should parse"));
        device.health = health;
        device.network_health = network;
        device
    }

    #[test]
    fn group_partitions_physical_devices() {
        let devices = vec![
            device("Ascend910-0", Health::Healthy, Health::Healthy),
            device("Ascend910-1", Health::Unhealthy, Health::Unhealthy),
            device("Ascend910-2", Health::Healthy, Health::Unhealthy),
        ];
        let groups = group_by_status(&devices);
        assert_eq!(join_device_list(&groups.healthy), "Ascend910-0,Ascend910-2");
        assert_eq!(join_device_list(&groups.unhealthy), "Ascend910-1");
        assert_eq!(
            join_device_list(&groups.network_unhealthy),
            "Ascend910-1,Ascend910-2"
        );
    }

    #[test]
    fn virtual_devices_stay_allocatable() {
        let devices = vec![device(
            "Ascend910-4c-100-3",
            Health::Unhealthy,
            Health::Healthy,
        )];
        let groups = group_by_status(&devices);
        assert_eq!(join_device_list(&groups.healthy), "Ascend910-4c-100-3");
        assert_eq!(
            join_device_list(&groups.unhealthy),
            "Ascend910-3",
            "should mark the parent card"
        );
    }

    #[test]
    fn bare_bucket_excludes_virtual_ids() {
        let allocatable = parse_device_list("Ascend910-0,Ascend910-4c-100-1,Ascend910-4c-101-1");
        let types: BTreeSet<String> = ["Ascend910", "Ascend910-4c", "Ascend910-8c"]
            .into_iter()
            .map(String::from)
            .collect();
        let map = build_annotation_map(&allocatable, &types);
        assert_eq!(map["huawei.com/Ascend910"], "Ascend910-0");
        assert_eq!(
            map["huawei.com/Ascend910-4c"],
            "Ascend910-4c-100-1,Ascend910-4c-101-1"
        );
        assert_eq!(map["huawei.com/Ascend910-8c"], "", "should still publish empty types");
    }

    #[test]
    fn parse_device_list_skips_garbage() {
        let ids = parse_device_list("Ascend910-0,,bogus, Ascend910-1");
        assert_eq!(join_device_list(&ids), "Ascend910-0,Ascend910-1");
    }
}
