pub mod app;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod plugin;
pub mod reconciler;
pub mod supervisor;

pub use infrastructure::driver;
pub use infrastructure::k8s;
pub use infrastructure::kube_client;
pub use infrastructure::kubelet;
