//! Pod annotation keys and the device configuration payload.

use serde::Deserialize;
use serde::Serialize;

use crate::domain::chip::VisibleDevice;

/// Admission timestamp written by the batch scheduler.
pub const POD_PREDICATE_TIME: &str = "predicate-time";
/// Device IDs kubelet requested for the pod.
pub const POD_KUBELET_DEVICES: &str = "huawei.com/kltDev";
/// Device IDs this agent actually handed to the pod.
pub const POD_REAL_ALLOCATION: &str = "huawei.com/AscendReal";

pub const ALLOCATE_POD_NAME: &str = "cloud-localhost-";

/// Per-pod device configuration, serialized into the
/// `ascend.kubectl.kubernetes.io/ascend-*-configuration` annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub pod_name: String,
    pub server_id: String,
    pub devices: Vec<InstanceDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDevice {
    pub device_id: String,
    pub device_ip: String,
}

impl Instance {
    /// Virtual devices are reported under their parent card.
    pub fn new(pod_name: &str, server_id: &str, visible: &[VisibleDevice]) -> Self {
        let devices = visible
            .iter()
            .map(|v| InstanceDevice {
                device_id: if v.id.is_virtual() {
                    v.id.phy_id().to_string()
                } else {
                    v.visible_id.to_string()
                },
                device_ip: v.ip.clone(),
            })
            .collect();
        Self {
            pod_name: pod_name.to_string(),
            server_id: server_id.to_string(),
            devices,
        }
    }

    pub fn to_json(&self) -> String {
        // plain string fields only, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn virtual_devices_report_parent_card() {
        let visible = VisibleDevice {
            id: "Ascend910-4c-101-1".parse().expect("should parse"),
            visible_id: 101,
            ip: "127.0.0.1".to_string(),
        };
        let instance = Instance::new(ALLOCATE_POD_NAME, "", &[visible]);
        assert_eq!(
            instance.devices,
            vec![InstanceDevice {
                device_id: "1".to_string(),
                device_ip: "127.0.0.1".to_string(),
            }]
        );
    }

    #[test]
    fn instance_uses_snake_case_keys() {
        let instance = Instance {
            pod_name: ALLOCATE_POD_NAME.to_string(),
            server_id: String::new(),
            devices: vec![InstanceDevice {
                device_id: "0".to_string(),
                device_ip: "192.168.10.1".to_string(),
            }],
        };
        assert_eq!(
            instance.to_json(),
            r#"{"pod_name":"cloud-localhost-","server_id":"","devices":[{"device_id":"0","device_ip":"192.168.10.1"}]}"#
        );
    }
}
