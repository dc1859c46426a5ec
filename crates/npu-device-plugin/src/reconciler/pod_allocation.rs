//! Pod-side bookkeeping for the scheduler-managed path.
//!
//! After a restart the agent does not see past `Allocate` calls again; the
//! kubelet checkpoint is the record of what each pod was actually given.
//! This module rebuilds the scheduler to kubelet device mapping from it and
//! writes the real allocation onto pods that lack it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::domain::chip::ChipManager;
use crate::domain::device::DeviceId;
use crate::infrastructure::k8s::annotations::Instance;
use crate::infrastructure::k8s::annotations::POD_KUBELET_DEVICES;
use crate::infrastructure::k8s::annotations::POD_REAL_ALLOCATION;
use crate::infrastructure::k8s::pods::candidate_pods;
use crate::infrastructure::k8s::pods::node_internal_ip;
use crate::infrastructure::k8s::pods::pod_name;
use crate::infrastructure::k8s::pods::pod_namespace;
use crate::infrastructure::k8s::ClusterClient;
use crate::infrastructure::k8s::KubernetesError;
use crate::infrastructure::kubelet::CheckpointReader;

pub const POD_UPDATE_RETRIES: usize = 3;

/// Merge `annotations` into the pod with get-then-replace, retried a fixed
/// number of times.
pub async fn update_pod_annotations(
    cluster: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    annotations: &BTreeMap<String, String>,
) -> Result<Pod, Report<KubernetesError>> {
    let mut last_error = None;
    for attempt in 1..=POD_UPDATE_RETRIES {
        let result = async {
            let mut pod = cluster.get_pod(namespace, name).await?;
            pod.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .extend(annotations.clone());
            cluster.replace_pod(&pod).await
        }
        .await;
        match result {
            Ok(pod) => return Ok(pod),
            Err(e) => {
                warn!(pod = name, namespace, attempt, "failed to update pod annotations: {e:?}");
                last_error = Some(e);
            }
        }
    }
    let error = last_error.unwrap_or_else(|| {
        Report::new(KubernetesError::RequestFailed {
            message: format!("no attempt made to update pod {namespace}/{name}"),
        })
    });
    Err(error.attach_printable(format!("gave up after {POD_UPDATE_RETRIES} attempts")))
}

/// Give every device that has no kubelet ID yet one of the kubelet IDs not
/// in use, pairing both sides in sorted order.
pub fn complete_mapping(devices: &BTreeSet<DeviceId>, mapping: &mut BTreeMap<String, String>) {
    let names: Vec<String> = devices.iter().map(ToString::to_string).collect();
    let taken: BTreeSet<&String> = names.iter().filter_map(|name| mapping.get(name)).collect();
    let unused: Vec<String> = names
        .iter()
        .filter(|name| !taken.contains(name))
        .cloned()
        .collect();
    let unmapped: Vec<String> = names
        .iter()
        .filter(|name| !mapping.contains_key(*name))
        .cloned()
        .collect();

    if unmapped.len() > unused.len() {
        warn!(
            unmapped = unmapped.len(),
            unused = unused.len(),
            "not enough kubelet ids for unmapped devices"
        );
    }
    for (device, kubelet_id) in unmapped.into_iter().zip(unused) {
        mapping.insert(device, kubelet_id);
    }
}

/// Rebuilds real allocations from the kubelet checkpoint.
pub struct RealAllocationRepairer {
    cluster: Arc<dyn ClusterClient>,
    node_name: String,
    manager: Arc<ChipManager>,
    checkpoint: CheckpointReader,
}

impl RealAllocationRepairer {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        node_name: String,
        manager: Arc<ChipManager>,
        checkpoint: CheckpointReader,
    ) -> Self {
        Self {
            cluster,
            node_name,
            manager,
            checkpoint,
        }
    }

    /// Returns the real device name to kubelet device name mapping for
    /// `dev_type`, or `None` when the checkpoint or pod list could not be
    /// read and the previous mapping should be kept.
    #[tracing::instrument(skip(self))]
    pub async fn repair(&self, dev_type: &str) -> Option<BTreeMap<String, String>> {
        let entries = match self.checkpoint.read().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("failed to read kubelet checkpoint: {e:?}");
                return None;
            }
        };
        let pods = match self.cluster.list_node_pods(&self.node_name).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(node = %self.node_name, "failed to list pods: {e:?}");
                return None;
            }
        };

        let family = self.manager.family();
        let mut node_ip: Option<String> = None;
        let mut mapping = BTreeMap::new();

        for pod in candidate_pods(pods, dev_type, |_| true) {
            let (name, namespace) = (pod_name(&pod), pod_namespace(&pod));
            let uid = pod.metadata.uid.as_deref().unwrap_or_default();
            let Some(entry) = entries.get(uid) else {
                continue;
            };
            if entry.resource_type() != Some(dev_type) {
                continue;
            }
            let real = match entry.response_device_names(family) {
                Ok(real) => real,
                Err(e) => {
                    debug!(pod = name, namespace, "unusable checkpoint entry: {e:?}");
                    continue;
                }
            };
            if real.len() != entry.request_ids.len() {
                warn!(
                    pod = name,
                    namespace,
                    "kubelet requested {:?} but pod received {:?}",
                    entry.request_ids,
                    real
                );
                continue;
            }
            for (real_id, kubelet_id) in real.iter().zip(&entry.request_ids) {
                mapping.insert(real_id.clone(), kubelet_id.clone());
            }

            let has_real_allocation = pod
                .metadata
                .annotations
                .as_ref()
                .is_some_and(|a| a.contains_key(POD_REAL_ALLOCATION));
            if has_real_allocation {
                continue;
            }

            let server_id = match &node_ip {
                Some(ip) => ip.clone(),
                None => {
                    let id = match self.cluster.get_node(&self.node_name).await {
                        Ok(node) => node_internal_ip(&node).unwrap_or_default(),
                        Err(e) => {
                            warn!(node = %self.node_name, "failed to read node address: {e:?}");
                            continue;
                        }
                    };
                    node_ip = Some(id.clone());
                    id
                }
            };

            let mut annotations = BTreeMap::from([
                (POD_KUBELET_DEVICES.to_string(), entry.request_ids.join(",")),
                (POD_REAL_ALLOCATION.to_string(), real.join(",")),
            ]);
            if let Some(key) = family.profile().pod_configuration_key {
                let ids: Vec<DeviceId> = real.iter().filter_map(|r| r.parse().ok()).collect();
                let visible = match self.manager.resolve_visible(&ids) {
                    Ok(visible) => visible,
                    Err(e) => {
                        warn!(pod = name, namespace, "failed to resolve devices: {e:?}");
                        continue;
                    }
                };
                annotations.insert(
                    key.to_string(),
                    Instance::new(name, &server_id, &visible).to_json(),
                );
            }

            match update_pod_annotations(self.cluster.as_ref(), namespace, name, &annotations).await
            {
                Ok(_) => info!(pod = name, namespace, real = real.join(","), "recorded real allocation"),
                Err(e) => warn!(pod = name, namespace, "failed to record real allocation: {e:?}"),
            }
        }
        Some(mapping)
    }
}
