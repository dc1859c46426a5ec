use std::collections::BTreeMap;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::WatchStreamExt;
use kube::Api;
use kube::Client;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

use crate::infrastructure::k8s::KubernetesError;

/// The cluster operations the agent relies on.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, Report<KubernetesError>>;

    /// Apply the metadata difference between `original` and `modified`,
    /// failing with [`KubernetesError::Conflict`] when the node changed
    /// since `original` was read.
    async fn patch_node(
        &self,
        original: &Node,
        modified: &Node,
    ) -> Result<Node, Report<KubernetesError>>;

    async fn list_node_pods(&self, node_name: &str) -> Result<Vec<Pod>, Report<KubernetesError>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>>;

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, Report<KubernetesError>>;

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Report<KubernetesError>>;

    /// Stream of applied versions of one ConfigMap.
    fn watch_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> BoxStream<'static, Result<ConfigMap, Report<KubernetesError>>>;
}

/// Diff two string maps into merge-patch form: changed keys carry the new
/// value, removed keys are nulled.
fn map_patch(
    original: Option<&BTreeMap<String, String>>,
    modified: Option<&BTreeMap<String, String>>,
) -> Option<Map<String, Value>> {
    let empty = BTreeMap::new();
    let original = original.unwrap_or(&empty);
    let modified = modified.unwrap_or(&empty);

    let mut patch = Map::new();
    for (key, value) in modified {
        if original.get(key) != Some(value) {
            patch.insert(key.clone(), Value::String(value.clone()));
        }
    }
    for key in original.keys().filter(|k| !modified.contains_key(*k)) {
        patch.insert(key.clone(), Value::Null);
    }
    (!patch.is_empty()).then_some(patch)
}

/// Merge patch of annotation and label changes, pinned to the original
/// resource version. `None` when nothing changed.
pub fn node_metadata_patch(original: &Node, modified: &Node) -> Option<Value> {
    let annotations = map_patch(
        original.metadata.annotations.as_ref(),
        modified.metadata.annotations.as_ref(),
    );
    let labels = map_patch(
        original.metadata.labels.as_ref(),
        modified.metadata.labels.as_ref(),
    );
    if annotations.is_none() && labels.is_none() {
        return None;
    }

    let mut metadata = Map::new();
    if let Some(version) = &original.metadata.resource_version {
        metadata.insert("resourceVersion".to_string(), json!(version));
    }
    if let Some(annotations) = annotations {
        metadata.insert("annotations".to_string(), Value::Object(annotations));
    }
    if let Some(labels) = labels {
        metadata.insert("labels".to_string(), Value::Object(labels));
    }
    Some(json!({ "metadata": metadata }))
}

fn request_error(e: kube::Error, message: String) -> Report<KubernetesError> {
    let conflict = matches!(&e, kube::Error::Api(response) if response.code == 409);
    let context = if conflict {
        KubernetesError::Conflict { message }
    } else {
        KubernetesError::RequestFailed { message }
    };
    Report::new(e).change_context(context)
}

/// [`ClusterClient`] over a live API server connection.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_node(&self, name: &str) -> Result<Node, Report<KubernetesError>> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map_err(|e| request_error(e, format!("Failed to get node {name}")))?
            .ok_or_else(|| {
                Report::new(KubernetesError::NodeNotFound {
                    node_name: name.to_string(),
                })
            })
    }

    async fn patch_node(
        &self,
        original: &Node,
        modified: &Node,
    ) -> Result<Node, Report<KubernetesError>> {
        let name = original.metadata.name.clone().unwrap_or_default();
        let Some(patch) = node_metadata_patch(original, modified) else {
            return Ok(original.clone());
        };
        let api: Api<Node> = Api::all(self.client.clone());
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| request_error(e, format!("Failed to patch node {name}")))
    }

    async fn list_node_pods(&self, node_name: &str) -> Result<Vec<Pod>, Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let pods = api
            .list(&params)
            .await
            .map_err(|e| request_error(e, format!("Failed to list pods on {node_name}")))?;
        Ok(pods.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| request_error(e, format!("Failed to get pod {namespace}/{name}")))?
            .ok_or_else(|| {
                Report::new(KubernetesError::PodNotFound {
                    pod_name: name.to_string(),
                    namespace: namespace.to_string(),
                })
            })
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, Report<KubernetesError>> {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), pod)
            .await
            .map_err(|e| request_error(e, format!("Failed to update pod {namespace}/{name}")))
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Report<KubernetesError>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .change_context(KubernetesError::RequestFailed {
                message: format!("Failed to get config map {namespace}/{name}"),
            })
    }

    fn watch_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> BoxStream<'static, Result<ConfigMap, Report<KubernetesError>>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config = Config::default().fields(&format!("metadata.name={name}"));
        watcher(api, config)
            .applied_objects()
            .map(|event| {
                event.map_err(|e| {
                    Report::new(KubernetesError::WatchFailed {
                        message: format!("Config map watch stream error: {e}"),
                    })
                })
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use similar_asserts::assert_eq;

    use super::*;

    fn node(annotations: &[(&str, &str)], labels: &[(&str, &str)]) -> Node {
        let to_map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        Node {
            metadata: ObjectMeta {
                name: Some("worker-1".to_string()),
                resource_version: Some("41".to_string()),
                annotations: Some(to_map(annotations)),
                labels: Some(to_map(labels)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn patch_sets_changes_and_nulls_removals() {
        let original = node(
            &[("huawei.com/Ascend910", "Ascend910-0"), ("keep", "1")],
            &[("huawei.com/Ascend910-Recover", "2")],
        );
        let modified = node(
            &[("huawei.com/Ascend910", "Ascend910-0,Ascend910-1"), ("keep", "1")],
            &[],
        );
        let patch = node_metadata_patch(&original, &modified).expect("should produce patch");
        assert_eq!(
            patch,
            json!({
                "metadata": {
                    "resourceVersion": "41",
                    "annotations": {"huawei.com/Ascend910": "Ascend910-0,Ascend910-1"},
                    "labels": {"huawei.com/Ascend910-Recover": null}
                }
            })
        );
    }

    #[test]
    fn identical_metadata_needs_no_patch() {
        let original = node(&[("a", "b")], &[]);
        assert_eq!(node_metadata_patch(&original, &original.clone()), None);
    }
}
