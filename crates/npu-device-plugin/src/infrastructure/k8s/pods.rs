//! Pod and node inspection helpers for the scheduler-managed path.

use std::collections::BTreeSet;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::domain::chip::ChipFamily;
use crate::domain::device::DeviceId;
use crate::domain::device::MAX_DEVICES_PER_REQUEST;
use crate::infrastructure::k8s::annotations::POD_PREDICATE_TIME;

pub const MAX_PODS_SCANNED: usize = 110;
pub const MAX_CONTAINERS: usize = 300_000;
const POD_NAME_MAX_LEN: usize = 253;
const POD_NAMESPACE_MAX_LEN: usize = 63;

/// Lowercase alphanumerics with inner `-` (and `.` when `allow_dot`),
/// at least two characters.
fn is_dns_name(s: &str, max_len: usize, allow_dot: bool) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() < 2 || bytes.len() > max_len {
        return false;
    }
    let edge = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let inner = |b: &u8| edge(b) || *b == b'-' || (allow_dot && *b == b'.');
    edge(&bytes[0]) && edge(&bytes[bytes.len() - 1]) && bytes.iter().all(inner)
}

pub fn is_valid_pod_name(name: &str) -> bool {
    is_dns_name(name, POD_NAME_MAX_LEN, true)
}

pub fn is_valid_namespace(namespace: &str) -> bool {
    is_dns_name(namespace, POD_NAMESPACE_MAX_LEN, false)
}

/// DNS-1123 subdomain, as accepted for node names.
pub fn is_valid_node_name(name: &str) -> bool {
    if name.is_empty() || name.len() > POD_NAME_MAX_LEN {
        return false;
    }
    name.split('.').all(|label| {
        let bytes = label.as_bytes();
        let edge = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        !bytes.is_empty()
            && edge(&bytes[0])
            && edge(&bytes[bytes.len() - 1])
            && bytes.iter().all(|b| edge(b) || *b == b'-')
    })
}

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or_default()
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

/// Scheduler admission time; pods without a usable value sort last.
pub fn predicate_time(pod: &Pod) -> u64 {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(POD_PREDICATE_TIME))
        .and_then(|v| v.parse().ok())
        .unwrap_or(u64::MAX)
}

/// Device names the scheduler assigned to the pod for `dev_type`.
pub fn assigned_devices(pod: &Pod, dev_type: &str) -> Option<Vec<String>> {
    pod.metadata
        .annotations
        .as_ref()?
        .get(&ChipFamily::annotation_key(dev_type))
        .map(|v| v.split(',').map(str::to_string).collect())
}

/// Sum of container limits for `dev_type`; out-of-range values count as zero.
pub fn requested_devices(pod: &Pod, dev_type: &str) -> i64 {
    let Some(spec) = pod.spec.as_ref() else {
        return 0;
    };
    if spec.containers.len() > MAX_CONTAINERS {
        error!(pod = pod_name(pod), "too many containers");
        return 0;
    }
    let resource = ChipFamily::annotation_key(dev_type);
    let mut total: i64 = 0;
    for container in &spec.containers {
        let Some(quantity) = container
            .resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .and_then(|l| l.get(&resource))
        else {
            continue;
        };
        let count: i64 = quantity.0.parse().unwrap_or(0);
        if !(0..=MAX_DEVICES_PER_REQUEST as i64).contains(&count) {
            error!(
                pod = pod_name(pod),
                "device limit {count} out of range [0, {MAX_DEVICES_PER_REQUEST}]"
            );
            return 0;
        }
        total = total.saturating_add(count);
    }
    total
}

/// Pods that are gone or were rejected at admission.
pub fn is_terminating(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    let statuses = status.container_statuses.as_deref().unwrap_or_default();
    if statuses.len() > MAX_CONTAINERS {
        error!(pod = pod_name(pod), "too many container statuses");
        return true;
    }
    let prestart_failed = statuses.iter().any(|s| {
        s.state
            .as_ref()
            .and_then(|st| st.waiting.as_ref())
            .and_then(|w| w.message.as_deref())
            .is_some_and(|m| m.contains("PreStartContainer check failed"))
    });
    prestart_failed || status.reason.as_deref() == Some("UnexpectedAdmissionError")
}

/// Active pods that carry a scheduler assignment for `dev_type` and request
/// it, further narrowed by `condition`.
pub fn candidate_pods<F>(pods: Vec<Pod>, dev_type: &str, condition: F) -> Vec<Pod>
where
    F: Fn(&Pod) -> bool,
{
    if pods.len() > MAX_PODS_SCANNED {
        error!("pod count {} exceeds limit {MAX_PODS_SCANNED}", pods.len());
    }
    pods.into_iter()
        .take(MAX_PODS_SCANNED)
        .filter(|pod| {
            let (name, namespace) = (pod_name(pod), pod_namespace(pod));
            if !is_valid_pod_name(name) || !is_valid_namespace(namespace) {
                warn!(pod = name, namespace, "skipping pod with invalid name");
                return false;
            }
            true
        })
        .filter(|pod| !matches!(pod_phase(pod), "Failed" | "Succeeded"))
        .filter(|pod| condition(pod))
        .filter(|pod| {
            requested_devices(pod, dev_type) > 0
                && assigned_devices(pod, dev_type).is_some()
                && !is_terminating(pod)
        })
        .collect()
}

/// Devices of `dev_type` the scheduler has assigned to live pods.
pub fn used_devices(pods: &[Pod], dev_type: &str) -> BTreeSet<DeviceId> {
    let mut used = BTreeSet::new();
    for pod in pods.iter().take(MAX_PODS_SCANNED) {
        if pod_phase(pod) == "Succeeded" {
            continue;
        }
        let Some(devices) = assigned_devices(pod, dev_type) else {
            continue;
        };
        if devices.is_empty() || devices.len() > MAX_DEVICES_PER_REQUEST {
            warn!(pod = pod_name(pod), "invalid device annotation length {}", devices.len());
            continue;
        }
        used.extend(devices.iter().filter_map(|d| d.parse::<DeviceId>().ok()));
    }
    debug!(dev_type, used = used.len(), "devices in use");
    used
}

pub fn node_internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .take(MAX_PODS_SCANNED)
        .find(|a| a.type_ == "InternalIP" && a.address.parse::<IpAddr>().is_ok())
        .map(|a| a.address.clone())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Container;
    use k8s_openapi::api::core::v1::NodeAddress;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use similar_asserts::assert_eq;

    use super::*;

    /// Running pod requesting `count` devices of `dev_type`, assigned `devices`.
    pub(crate) fn scheduled_pod(
        name: &str,
        dev_type: &str,
        count: usize,
        devices: Option<&str>,
        predicate: Option<&str>,
    ) -> Pod {
        let mut annotations = BTreeMap::new();
        if let Some(devices) = devices {
            annotations.insert(ChipFamily::annotation_key(dev_type), devices.to_string());
        }
        if let Some(predicate) = predicate {
            annotations.insert(POD_PREDICATE_TIME.to_string(), predicate.to_string());
        }
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("uid-{name}")),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    resources: Some(ResourceRequirements {
                        limits: Some(BTreeMap::from([(
                            ChipFamily::annotation_key(dev_type),
                            Quantity(count.to_string()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn dns_names_follow_kubernetes_rules() {
        assert!(is_valid_pod_name("job-0.worker"));
        assert!(!is_valid_pod_name("a"), "should require two characters");
        assert!(!is_valid_pod_name("Job-0"));
        assert!(!is_valid_namespace("team.a"), "should reject dots in namespaces");
        assert!(is_valid_node_name("worker-1.cluster.local"));
        assert!(!is_valid_node_name("worker_1"));
        assert!(!is_valid_node_name(""));
    }

    #[test]
    fn predicate_time_defaults_to_max() {
        let pod = scheduled_pod("p1", "Ascend910", 1, Some("Ascend910-0"), None);
        assert_eq!(predicate_time(&pod), u64::MAX);
        let pod = scheduled_pod("p1", "Ascend910", 1, Some("Ascend910-0"), Some("17"));
        assert_eq!(predicate_time(&pod), 17);
        let pod = scheduled_pod("p1", "Ascend910", 1, Some("Ascend910-0"), Some("soon"));
        assert_eq!(predicate_time(&pod), u64::MAX, "should sort unparsable last");
    }

    #[test]
    fn candidates_require_assignment_request_and_liveness() {
        let mut finished = scheduled_pod("done", "Ascend910", 1, Some("Ascend910-1"), None);
        finished.status.as_mut().expect("status").phase = Some("Succeeded".to_string());
        let mut rejected = scheduled_pod("rejected", "Ascend910", 1, Some("Ascend910-2"), None);
        rejected.status.as_mut().expect("status").reason =
            Some("UnexpectedAdmissionError".to_string());

        let pods = vec![
            scheduled_pod("ok", "Ascend910", 1, Some("Ascend910-0"), None),
            scheduled_pod("unassigned", "Ascend910", 1, None, None),
            scheduled_pod("other-type", "Ascend910-4c", 1, Some("Ascend910-4c-100-0"), None),
            scheduled_pod("Bad_Name", "Ascend910", 1, Some("Ascend910-3"), None),
            finished,
            rejected,
        ];
        let names: Vec<String> = candidate_pods(pods, "Ascend910", |_| true)
            .iter()
            .map(|p| pod_name(p).to_string())
            .collect();
        assert_eq!(names, vec!["ok"]);
    }

    #[test]
    fn used_devices_skip_succeeded_pods() {
        let mut finished = scheduled_pod("done", "Ascend910", 1, Some("Ascend910-1"), None);
        finished.status.as_mut().expect("status").phase = Some("Succeeded".to_string());
        let pods = vec![
            scheduled_pod("a", "Ascend910", 2, Some("Ascend910-0,Ascend910-2"), None),
            finished,
        ];
        let used: Vec<String> = used_devices(&pods, "Ascend910")
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(used, vec!["Ascend910-0", "Ascend910-2"]);
    }

    #[test]
    fn internal_ip_must_parse() {
        let node = Node {
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        type_: "Hostname".to_string(),
                        address: "worker-1".to_string(),
                    },
                    NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: "10.0.0.7".to_string(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(node_internal_ip(&node).as_deref(), Some("10.0.0.7"));
        assert_eq!(node_internal_ip(&Node::default()), None);
    }
}
