use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use error_stack::Report;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::cluster::node_metadata_patch;
use super::ClusterClient;
use super::KubernetesError;

#[derive(Default)]
pub struct MockState {
    pub node: Node,
    pub pods: Vec<Pod>,
    pub config_map: Option<ConfigMap>,
    pub patch_calls: usize,
    pub pod_updates: usize,
    /// Bump the node resource version before the next N patches.
    pub concurrent_writers: u32,
    pub fail_get_node: u32,
    config_map_events: Option<mpsc::UnboundedReceiver<ConfigMap>>,
}

/// In-memory cluster holding a single node.
#[derive(Clone)]
pub struct MockClusterClient {
    pub state: Arc<Mutex<MockState>>,
}

impl MockClusterClient {
    pub fn new(node_name: &str) -> Self {
        let node = Node {
            metadata: ObjectMeta {
                name: Some(node_name.to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(MockState {
                node,
                ..Default::default()
            })),
        }
    }

    pub fn with_pods(self, pods: Vec<Pod>) -> Self {
        self.state.lock().expect("poisoned").pods = pods;
        self
    }

    pub fn node(&self) -> Node {
        self.state.lock().expect("poisoned").node.clone()
    }

    pub fn annotation(&self, key: &str) -> Option<String> {
        self.node()
            .metadata
            .annotations
            .and_then(|a| a.get(key).cloned())
    }

    pub fn label(&self, key: &str) -> Option<String> {
        self.node().metadata.labels.and_then(|l| l.get(key).cloned())
    }

    pub fn patch_calls(&self) -> usize {
        self.state.lock().expect("poisoned").patch_calls
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .expect("poisoned")
            .pods
            .iter()
            .find(|p| p.metadata.name.as_deref() == Some(name))
            .cloned()
    }

    pub fn set_node(&self, update: impl FnOnce(&mut Node)) {
        let mut state = self.state.lock().expect("poisoned");
        update(&mut state.node);
    }

    /// Sender for config map watch events.
    pub fn config_map_events(&self) -> mpsc::UnboundedSender<ConfigMap> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().expect("poisoned").config_map_events = Some(rx);
        tx
    }
}

fn bump(meta: &mut ObjectMeta) {
    let next = meta
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    meta.resource_version = Some(next.to_string());
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn get_node(&self, name: &str) -> Result<Node, Report<KubernetesError>> {
        let mut state = self.state.lock().expect("poisoned");
        if state.fail_get_node > 0 {
            state.fail_get_node -= 1;
            return Err(Report::new(KubernetesError::ConnectionFailed {
                message: "injected failure".to_string(),
            }));
        }
        if state.node.metadata.name.as_deref() != Some(name) {
            return Err(Report::new(KubernetesError::NodeNotFound {
                node_name: name.to_string(),
            }));
        }
        Ok(state.node.clone())
    }

    async fn patch_node(
        &self,
        original: &Node,
        modified: &Node,
    ) -> Result<Node, Report<KubernetesError>> {
        let mut state = self.state.lock().expect("poisoned");
        state.patch_calls += 1;
        if state.concurrent_writers > 0 {
            state.concurrent_writers -= 1;
            bump(&mut state.node.metadata);
        }
        if node_metadata_patch(original, modified).is_none() {
            return Ok(state.node.clone());
        }
        if state.node.metadata.resource_version != original.metadata.resource_version {
            return Err(Report::new(KubernetesError::Conflict {
                message: "resource version changed".to_string(),
            }));
        }
        state.node.metadata.annotations = modified.metadata.annotations.clone();
        state.node.metadata.labels = modified.metadata.labels.clone();
        bump(&mut state.node.metadata);
        Ok(state.node.clone())
    }

    async fn list_node_pods(&self, _node_name: &str) -> Result<Vec<Pod>, Report<KubernetesError>> {
        Ok(self.state.lock().expect("poisoned").pods.clone())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>> {
        self.pod(name).ok_or_else(|| {
            Report::new(KubernetesError::PodNotFound {
                pod_name: name.to_string(),
                namespace: namespace.to_string(),
            })
        })
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, Report<KubernetesError>> {
        let mut state = self.state.lock().expect("poisoned");
        state.pod_updates += 1;
        let slot = state
            .pods
            .iter_mut()
            .find(|p| p.metadata.name == pod.metadata.name)
            .ok_or_else(|| {
                Report::new(KubernetesError::PodNotFound {
                    pod_name: pod.metadata.name.clone().unwrap_or_default(),
                    namespace: pod.metadata.namespace.clone().unwrap_or_default(),
                })
            })?;
        *slot = pod.clone();
        Ok(pod.clone())
    }

    async fn get_config_map(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<Option<ConfigMap>, Report<KubernetesError>> {
        Ok(self.state.lock().expect("poisoned").config_map.clone())
    }

    fn watch_config_map(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> BoxStream<'static, Result<ConfigMap, Report<KubernetesError>>> {
        match self.state.lock().expect("poisoned").config_map_events.take() {
            Some(rx) => UnboundedReceiverStream::new(rx).map(Ok).boxed(),
            None => futures::stream::empty().boxed(),
        }
    }
}
