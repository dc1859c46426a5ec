//! Merges the per-type worker contributions into the Node object.
//!
//! Every worker folds its snapshot into the shared [`ReconcilerState`]; the
//! worker that completes the round patches the merged result. Patches are
//! fetch, copy, modify, patch against the fetched version, retried on any
//! failure until the timeout budget is spent.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use k8s_openapi::api::core::v1::Node;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::domain::chip::annotation::join_device_list;
use crate::domain::chip::annotation::parse_device_list;
use crate::domain::chip::build_annotation_map;
use crate::domain::chip::ChipFamily;
use crate::domain::chip::StatusGroups;
use crate::domain::device::parse_decimal;
use crate::domain::device::DeviceId;
use crate::domain::state::SharedState;
use crate::infrastructure::k8s::ClusterClient;
use crate::infrastructure::k8s::KubernetesError;

pub const NODE_PATCH_INTERVAL: Duration = Duration::from_secs(1);
pub const NODE_PATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Node metadata produced by one merged round.
#[derive(Debug, Clone)]
pub struct MergedNode {
    pub node: Node,
    /// Physical devices written into a recover label this round.
    pub recovering: BTreeSet<DeviceId>,
}

struct HealthTier {
    published: BTreeSet<DeviceId>,
    recovering: BTreeSet<DeviceId>,
}

/// Recover labels hold short ids joined by `.`.
fn parse_recover_label(value: &str, family: ChipFamily) -> BTreeSet<DeviceId> {
    value
        .split('.')
        .filter(|s| !s.is_empty())
        .filter_map(|s| match parse_decimal(s) {
            Some(phy_id) => Some(DeviceId::physical(family, phy_id)),
            None => {
                warn!(label = value, "skipping invalid recover label entry {s}");
                None
            }
        })
        .collect()
}

fn recover_label_value(ids: &BTreeSet<DeviceId>) -> String {
    ids.iter()
        .map(|id| id.short_id().to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// A device that left the unhealthy set is first published as recovering
/// and stays unhealthy; it only leaves both sets if it is still healthy on
/// the following round.
fn health_tier(
    family: ChipFamily,
    previous: Option<&String>,
    previous_recover: Option<&String>,
    current: &BTreeSet<DeviceId>,
) -> HealthTier {
    let previous = previous.map(|v| parse_device_list(v)).unwrap_or_default();
    let previous_recover = previous_recover
        .map(|v| parse_recover_label(v, family))
        .unwrap_or_default();

    let recovering: BTreeSet<DeviceId> = previous
        .difference(current)
        .filter(|id| !previous_recover.contains(*id))
        .cloned()
        .collect();
    let published = current.union(&recovering).cloned().collect();
    HealthTier {
        published,
        recovering,
    }
}

fn set_label(labels: &mut BTreeMap<String, String>, key: &str, ids: &BTreeSet<DeviceId>) {
    if ids.is_empty() {
        labels.remove(key);
    } else {
        labels.insert(key.to_string(), recover_label_value(ids));
    }
}

/// Apply one complete round to a copy of `node`.
pub fn merge_round(
    node: &Node,
    family: ChipFamily,
    known_types: &BTreeSet<String>,
    free: &BTreeSet<DeviceId>,
    unhealthy: &BTreeSet<DeviceId>,
    network_unhealthy: &BTreeSet<DeviceId>,
) -> MergedNode {
    let profile = family.profile();
    let mut modified = node.clone();
    let annotations = modified
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new);
    let labels = modified.metadata.labels.get_or_insert_with(BTreeMap::new);

    let mut recovering = BTreeSet::new();

    let chip = match profile.recover_label {
        Some(label) => {
            let tier = health_tier(
                family,
                annotations.get(profile.unhealthy_key),
                labels.get(label),
                unhealthy,
            );
            set_label(labels, label, &tier.recovering);
            tier
        }
        None => HealthTier {
            published: unhealthy.clone(),
            recovering: BTreeSet::new(),
        },
    };
    annotations.insert(
        profile.unhealthy_key.to_string(),
        join_device_list(&chip.published),
    );
    recovering.extend(chip.recovering);

    if let Some(key) = profile.network_unhealthy_key {
        let network = match profile.network_recover_label {
            Some(label) => {
                let tier = health_tier(family, annotations.get(key), labels.get(label), network_unhealthy);
                set_label(labels, label, &tier.recovering);
                tier
            }
            None => HealthTier {
                published: network_unhealthy.clone(),
                recovering: BTreeSet::new(),
            },
        };
        annotations.insert(key.to_string(), join_device_list(&network.published));
        recovering.extend(network.recovering);
    }

    let allocatable: BTreeSet<DeviceId> = free
        .iter()
        .filter(|id| !recovering.contains(&DeviceId::physical(id.family(), id.phy_id())))
        .cloned()
        .collect();
    annotations.extend(build_annotation_map(&allocatable, known_types));

    MergedNode {
        node: modified,
        recovering,
    }
}

/// Writes the merged device view onto the node.
pub struct NodeAnnotationReconciler {
    cluster: Arc<dyn ClusterClient>,
    node_name: String,
    family: ChipFamily,
    state: SharedState,
    auto_stowing_devs: bool,
    retry_interval: Duration,
    timeout: Duration,
}

impl NodeAnnotationReconciler {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        node_name: String,
        family: ChipFamily,
        state: SharedState,
        auto_stowing_devs: bool,
    ) -> Self {
        Self {
            cluster,
            node_name,
            family,
            state,
            auto_stowing_devs,
            retry_interval: NODE_PATCH_INTERVAL,
            timeout: NODE_PATCH_TIMEOUT,
        }
    }

    pub fn with_timing(mut self, retry_interval: Duration, timeout: Duration) -> Self {
        self.retry_interval = retry_interval;
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    async fn try_patch<F, T>(&self, apply: &F) -> Result<T, Report<KubernetesError>>
    where
        F: Fn(&Node) -> (Node, T),
    {
        let original = self.cluster.get_node(&self.node_name).await?;
        let (modified, outcome) = apply(&original);
        self.cluster.patch_node(&original, &modified).await?;
        Ok(outcome)
    }

    /// Retry the whole fetch and patch cycle until it succeeds or the
    /// timeout budget runs out.
    async fn patch_with_retry<F, T>(&self, apply: F) -> Result<T, Report<KubernetesError>>
    where
        F: Fn(&Node) -> (Node, T),
    {
        let attempts = async {
            loop {
                match self.try_patch(&apply).await {
                    Ok(outcome) => return outcome,
                    Err(e) => {
                        warn!(node = %self.node_name, "node patch failed, retrying: {e:?}");
                        tokio::time::sleep(self.retry_interval).await;
                    }
                }
            }
        };
        tokio::time::timeout(self.timeout, attempts)
            .await
            .map_err(|_| {
                Report::new(KubernetesError::RequestFailed {
                    message: format!(
                        "patching node {} did not succeed within {:?}",
                        self.node_name, self.timeout
                    ),
                })
            })
    }

    /// Record `dev_type`'s snapshot for the round and patch the node once
    /// every known type has contributed. A type reporting twice replaces its
    /// earlier snapshot, so the patch never waits on or publishes for a type
    /// that has not reported.
    ///
    /// Returns whether this call performed the patch. The round is reset
    /// after a patch attempt whether or not it succeeded; the next round
    /// retries.
    #[tracing::instrument(skip_all, fields(node = %self.node_name))]
    pub async fn contribute(
        &self,
        dev_type: &str,
        groups: StatusGroups,
        used: &BTreeSet<DeviceId>,
        known_types: &BTreeSet<String>,
    ) -> Result<bool, Report<KubernetesError>> {
        let mut state = self.state.lock().await;
        state.accumulate(dev_type, groups, used);
        if !state.round_complete(known_types) {
            debug!(
                dev_type,
                reported = state.round.len(),
                expected = known_types.len(),
                "round still open"
            );
            return Ok(false);
        }

        let round = state.take_round();
        let (free, unhealthy, network_unhealthy) =
            (round.free, round.unhealthy, round.network_unhealthy);

        let family = self.family;
        let recovering = self
            .patch_with_retry(|node| {
                let merged = merge_round(
                    node,
                    family,
                    known_types,
                    &free,
                    &unhealthy,
                    &network_unhealthy,
                );
                (merged.node, merged.recovering)
            })
            .await?;
        if recovering != state.recovering {
            info!(recovering = %join_device_list(&recovering), "recover set changed");
        }
        state.recovering = recovering;
        Ok(true)
    }

    /// Remove every per-type annotation (and, with auto stowing, the
    /// recover labels) once per process.
    pub async fn reset_annotations(&self) -> Result<(), Report<KubernetesError>> {
        let mut state = self.state.lock().await;
        if state.annotation_reset_done {
            return Ok(());
        }

        let family = self.family;
        let stow = self.auto_stowing_devs;
        let type_keys: Vec<String> = family
            .device_types()
            .iter()
            .map(|t| ChipFamily::annotation_key(t))
            .collect();
        self.patch_with_retry(|node| {
            let mut modified = node.clone();
            if let Some(annotations) = modified.metadata.annotations.as_mut() {
                for key in &type_keys {
                    annotations.remove(key);
                }
            }
            if stow {
                if let Some(labels) = modified.metadata.labels.as_mut() {
                    let profile = family.profile();
                    for label in [profile.recover_label, profile.network_recover_label]
                        .into_iter()
                        .flatten()
                    {
                        labels.remove(label);
                    }
                }
            }
            (modified, ())
        })
        .await?;

        if stow {
            state.recovering.clear();
        }
        state.annotation_reset_done = true;
        info!(node = %self.node_name, "node device annotations reset");
        Ok(())
    }

    /// Publish the free devices of a single type right away, outside the
    /// round gating.
    pub async fn patch_free_devices(
        &self,
        dev_type: &str,
        free: &BTreeSet<DeviceId>,
    ) -> Result<(), Report<KubernetesError>> {
        let values = build_annotation_map(free, &BTreeSet::from([dev_type.to_string()]));
        self.patch_with_retry(|node| {
            let mut modified = node.clone();
            modified
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .extend(values.clone());
            (modified, ())
        })
        .await
    }

    pub async fn is_recovering(&self, id: &DeviceId) -> bool {
        let physical = DeviceId::physical(id.family(), id.phy_id());
        self.state.lock().await.recovering.contains(&physical)
    }
}
