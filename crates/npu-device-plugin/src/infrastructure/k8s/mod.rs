pub mod annotations;
pub mod cluster;
#[cfg(test)]
pub mod mock;
pub mod pods;
pub mod types;

pub use cluster::ClusterClient;
pub use cluster::KubeClusterClient;
pub use types::KubernetesError;
