use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use error_stack::Report;

use crate::domain::errors::ConfigError;
use crate::infrastructure::k8s::pods::is_valid_node_name;
use crate::reconciler::TopologySource;

/// Accepted ListAndWatch periods, in seconds.
pub const LIST_WATCH_PERIOD_RANGE: RangeInclusive<u64> = 3..=60;

const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this agent runs on"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        default_value = "5",
        help = "Seconds between device health checks, between 3 and 60"
    )]
    pub list_watch_period: u64,

    #[arg(
        long,
        help = "Pods are placed by the volcano batch scheduler",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub use_volcano: bool,

    #[arg(
        long,
        help = "Containers are started through ascend-docker, which mounts device nodes itself",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub use_ascend_docker: bool,

    #[arg(
        long,
        default_value = "/var/lib/kubelet/device-plugins",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding kubelet and device plugin sockets"
    )]
    pub plugin_dir: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket, defaults to <plugin-dir>/kubelet.sock"
    )]
    pub kubelet_socket: Option<PathBuf>,

    #[arg(
        long,
        default_value = "/var/lib/kubelet/device-plugins/kubelet_internal_checkpoint",
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet device manager checkpoint"
    )]
    pub checkpoint_path: PathBuf,

    #[arg(
        long,
        default_value = "volcano-system",
        help = "Namespace of the virtual device topology ConfigMap"
    )]
    pub vnpu_config_namespace: String,

    #[arg(
        long,
        default_value = "mindx-dl-vnpu-manager",
        help = "Name of the virtual device topology ConfigMap"
    )]
    pub vnpu_config_name: String,

    #[arg(
        long,
        default_value = "VNPUCfg",
        help = "Data key holding the topology document"
    )]
    pub vnpu_config_key: String,

    #[arg(
        long,
        help = "Create and destroy virtual devices from the topology ConfigMap",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub enable_vnpu: bool,

    #[arg(
        long,
        default_value = "60",
        help = "Seconds between full virtual device reconciliations"
    )]
    pub vnpu_sync_interval: u64,

    #[arg(
        long,
        env = "NPU_DRIVER_INVENTORY",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML device inventory served instead of the vendor driver"
    )]
    pub driver_inventory: Option<PathBuf>,

    #[arg(
        long,
        help = "Clear recover labels when node annotations are reset",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub auto_stowing_devs: bool,
}

impl DaemonArgs {
    /// Reject arguments that would make the agent misbehave later.
    pub fn validate(&self) -> Result<(), Report<ConfigError>> {
        if !LIST_WATCH_PERIOD_RANGE.contains(&self.list_watch_period) {
            return Err(Report::new(ConfigError::InvalidArgument {
                argument: "list-watch-period".to_string(),
                message: format!(
                    "{} is outside {}..={}",
                    self.list_watch_period,
                    LIST_WATCH_PERIOD_RANGE.start(),
                    LIST_WATCH_PERIOD_RANGE.end()
                ),
            }));
        }
        if !is_valid_node_name(&self.node_name) {
            return Err(Report::new(ConfigError::InvalidArgument {
                argument: "node-name".to_string(),
                message: format!("{:?} is not a valid DNS-1123 subdomain", self.node_name),
            }));
        }
        if self.enable_vnpu && self.vnpu_sync_interval == 0 {
            return Err(Report::new(ConfigError::InvalidArgument {
                argument: "vnpu-sync-interval".to_string(),
                message: "must be at least one second".to_string(),
            }));
        }
        Ok(())
    }

    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.kubelet_socket
            .clone()
            .unwrap_or_else(|| self.plugin_dir.join(KUBELET_SOCKET_NAME))
    }

    pub fn list_watch_period(&self) -> Duration {
        Duration::from_secs(self.list_watch_period)
    }

    pub fn vnpu_sync_interval(&self) -> Duration {
        Duration::from_secs(self.vnpu_sync_interval)
    }
}

impl From<&DaemonArgs> for TopologySource {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            namespace: args.vnpu_config_namespace.clone(),
            name: args.vnpu_config_name.clone(),
            key: args.vnpu_config_key.clone(),
        }
    }
}
