//! Kubelet-facing device plugin: one gRPC server per device type.

pub mod allocate;
pub mod registry;
pub mod server;
pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use crate::domain::chip::ChipManager;
use crate::domain::device::NpuDevice;
use crate::infrastructure::k8s::ClusterClient;
use crate::reconciler::NodeAnnotationReconciler;
use crate::reconciler::RealAllocationRepairer;

pub use registry::DeviceRegistry;
pub use registry::DeviceTypeHandle;
pub use server::NpuDevicePlugin;
pub use server::PluginError;

/// Everything needed when pods are placed by the batch scheduler.
pub struct SchedulerLink {
    pub cluster: Arc<dyn ClusterClient>,
    pub node_name: String,
    pub annotations: NodeAnnotationReconciler,
    pub repairer: RealAllocationRepairer,
}

/// Settings and collaborators shared by every per-type server.
pub struct PluginContext {
    pub registry: Arc<DeviceRegistry>,
    pub list_watch_period: Duration,
    pub use_ascend_docker: bool,
    pub scheduler: Option<Arc<SchedulerLink>>,
}

impl PluginContext {
    pub fn manager(&self) -> &Arc<ChipManager> {
        self.registry.manager()
    }
}

/// Query the current chip and network health of `devices`.
pub fn probe_health(manager: &ChipManager, devices: Vec<NpuDevice>) -> Vec<NpuDevice> {
    devices
        .into_iter()
        .map(|mut device| {
            device.health = manager.device_state(&device.id);
            device.network_health = manager.network_state(&device.id);
            device
        })
        .collect()
}
