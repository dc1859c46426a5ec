use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use error_stack::Report;

use crate::app::Application;
use crate::app::ApplicationServices;
use crate::config::DaemonArgs;
use crate::domain::chip::ChipManager;
use crate::domain::state::ReconcilerState;
use crate::infrastructure::driver::DriverError;
use crate::infrastructure::driver::InventoryDriver;
use crate::infrastructure::driver::NpuDriver;
use crate::infrastructure::k8s::ClusterClient;
use crate::infrastructure::k8s::KubeClusterClient;
use crate::infrastructure::kube_client::init_kube_client;
use crate::infrastructure::kubelet::checkpoint::CheckpointReader;
use crate::plugin::DeviceRegistry;
use crate::plugin::PluginContext;
use crate::plugin::SchedulerLink;
use crate::reconciler::NodeAnnotationReconciler;
use crate::reconciler::RealAllocationRepairer;
use crate::reconciler::TopologySource;
use crate::reconciler::VirtualDeviceReconciler;

const VENDOR_DRIVER_LIBRARY: &str = "libdrvdsmi_host.so";

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        self.daemon_args
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid daemon arguments: {e:?}"))?;

        let driver = self
            .create_driver()
            .map_err(|e| anyhow::anyhow!("Failed to initialize NPU driver: {e:?}"))?;
        let manager = Arc::new(
            ChipManager::detect(driver)
                .map_err(|e| anyhow::anyhow!("Failed to detect chip family: {e:?}"))?,
        );
        tracing::info!(family = %manager.family(), "detected NPU chip family");

        let (registry, new_device_types) = DeviceRegistry::discover(manager.clone())
            .map_err(|e| anyhow::anyhow!("Failed to discover devices: {e:?}"))?;
        let registry = Arc::new(registry);
        tracing::info!(
            device_types = ?registry.device_types(),
            "discovered device types"
        );

        let cluster = self.create_cluster_client().await?;

        let scheduler = match (&cluster, self.daemon_args.use_volcano) {
            (Some(cluster), true) => Some(Arc::new(self.create_scheduler_link(
                cluster.clone(),
                manager.clone(),
            ))),
            _ => None,
        };

        let plugin_context = Arc::new(PluginContext {
            registry: registry.clone(),
            list_watch_period: self.daemon_args.list_watch_period(),
            use_ascend_docker: self.daemon_args.use_ascend_docker,
            scheduler,
        });

        let vnpu_reconciler = match (&cluster, self.daemon_args.enable_vnpu) {
            (Some(cluster), true) => Some(Arc::new(VirtualDeviceReconciler::new(
                cluster.clone(),
                registry,
                self.daemon_args.node_name.clone(),
                TopologySource::from(&self.daemon_args),
            ))),
            _ => None,
        };

        let services = ApplicationServices {
            plugin_context,
            vnpu_reconciler,
            new_device_types: Mutex::new(Some(new_device_types)),
        };

        Ok(Application::new(services, self.daemon_args))
    }

    /// The vendor driver is not linked in; only an inventory can back the
    /// driver boundary.
    fn create_driver(&self) -> Result<Arc<dyn NpuDriver>, Report<DriverError>> {
        match &self.daemon_args.driver_inventory {
            Some(path) => {
                tracing::info!(inventory = %path.display(), "loading device inventory");
                Ok(Arc::new(InventoryDriver::from_file(path)?))
            }
            None => Err(Report::new(DriverError::Unavailable {
                message: format!(
                    "vendor library {VENDOR_DRIVER_LIBRARY} is not available, \
                     pass --driver-inventory to serve a device inventory"
                ),
            })),
        }
    }

    /// Only scheduler integration and virtual device management talk to
    /// the API server.
    async fn create_cluster_client(&self) -> Result<Option<Arc<dyn ClusterClient>>> {
        if !self.daemon_args.use_volcano && !self.daemon_args.enable_vnpu {
            return Ok(None);
        }
        let client = init_kube_client(self.daemon_args.kubeconfig.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize kubernetes client: {e:?}"))?;
        Ok(Some(Arc::new(KubeClusterClient::new(client))))
    }

    fn create_scheduler_link(
        &self,
        cluster: Arc<dyn ClusterClient>,
        manager: Arc<ChipManager>,
    ) -> SchedulerLink {
        let node_name = self.daemon_args.node_name.clone();
        let annotations = NodeAnnotationReconciler::new(
            cluster.clone(),
            node_name.clone(),
            manager.family(),
            ReconcilerState::shared(),
            self.daemon_args.auto_stowing_devs,
        );
        let repairer = RealAllocationRepairer::new(
            cluster.clone(),
            node_name.clone(),
            manager,
            CheckpointReader::new(&self.daemon_args.checkpoint_path),
        );
        SchedulerLink {
            cluster,
            node_name,
            annotations,
            repairer,
        }
    }
}
