use core::error::Error;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Kubernetes request failed: {message}")]
    RequestFailed { message: String },
    #[display("Conflicting update: {message}")]
    Conflict { message: String },
    #[display("Node not found: {node_name}")]
    NodeNotFound { node_name: String },
    #[display("Pod not found: {pod_name} in namespace {namespace}")]
    PodNotFound { pod_name: String, namespace: String },
    #[display("Failed to watch resource: {message}")]
    WatchFailed { message: String },
    #[display("Failed to parse annotations: {message}")]
    AnnotationParseError { message: String },
}

impl Error for KubernetesError {}
