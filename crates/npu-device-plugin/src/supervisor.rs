//! Keeps one registered plugin server per device type alive.
//!
//! A generation is the set of servers started against one kubelet instance.
//! The whole generation is torn down and started again when kubelet
//! re-creates its socket, on `SIGHUP`, or when registration fails.

use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use futures::future::join_all;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::signal::unix::signal;
use tokio::signal::unix::Signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::plugin::NpuDevicePlugin;
use crate::plugin::PluginContext;
use crate::plugin::PluginError;

pub const REGISTRATION_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

enum Next {
    Stop,
    Restart,
    Retry,
}

pub struct PluginSupervisor {
    ctx: Arc<PluginContext>,
    plugin_dir: PathBuf,
    kubelet_socket: PathBuf,
    retry_interval: Duration,
}

impl PluginSupervisor {
    pub fn new(
        ctx: Arc<PluginContext>,
        plugin_dir: impl Into<PathBuf>,
        kubelet_socket: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ctx,
            plugin_dir: plugin_dir.into(),
            kubelet_socket: kubelet_socket.into(),
            retry_interval: REGISTRATION_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    fn plugin(&self, dev_type: &str) -> Option<Arc<NpuDevicePlugin>> {
        let handle = self.ctx.registry.handle(dev_type)?;
        Some(NpuDevicePlugin::new(
            self.ctx.clone(),
            handle,
            self.plugin_dir.clone(),
        ))
    }

    async fn start_plugin(
        &self,
        plugin: &Arc<NpuDevicePlugin>,
        generation: &CancellationToken,
        servers: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), Report<PluginError>> {
        servers.push(plugin.start(generation.clone()).await?);
        plugin.register_with_kubelet(&self.kubelet_socket).await
    }

    async fn start_generation(
        &self,
        generation: &CancellationToken,
        servers: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), Report<PluginError>> {
        for dev_type in self.ctx.registry.device_types() {
            let Some(plugin) = self.plugin(&dev_type) else {
                continue;
            };
            self.start_plugin(&plugin, generation, servers).await?;
        }
        Ok(())
    }

    /// Serve the running generation until something asks for a restart.
    async fn supervise_generation(
        &self,
        generation: &CancellationToken,
        servers: &mut Vec<JoinHandle<()>>,
        new_types: &mut mpsc::UnboundedReceiver<String>,
        kubelet_restarts: &mut mpsc::UnboundedReceiver<()>,
        hangup: &mut Signal,
        token: &CancellationToken,
    ) -> Next {
        loop {
            tokio::select! {
                _ = token.cancelled() => return Next::Stop,
                Some(()) = kubelet_restarts.recv() => {
                    info!("kubelet socket re-created, restarting device plugins");
                    return Next::Restart;
                }
                Some(()) = hangup.recv() => {
                    info!("received SIGHUP, restarting device plugins");
                    return Next::Restart;
                }
                Some(dev_type) = new_types.recv() => {
                    let Some(plugin) = self.plugin(&dev_type) else {
                        warn!(dev_type = %dev_type, "announced device type is not registered");
                        continue;
                    };
                    if plugin.socket_path().exists() {
                        debug!(dev_type = %dev_type, "device plugin socket already exists");
                        continue;
                    }
                    if let Err(e) = self.start_plugin(&plugin, generation, servers).await {
                        error!(dev_type = %dev_type, "failed to start device plugin: {e:?}");
                        return Next::Retry;
                    }
                }
            }
        }
    }

    async fn stop_generation(generation: CancellationToken, servers: &mut Vec<JoinHandle<()>>) {
        generation.cancel();
        let joined =
            tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, join_all(servers.iter_mut())).await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("device plugin server task failed: {e}");
                    }
                }
            }
            Err(_) => {
                warn!(
                    "device plugin servers did not stop within {:?}, aborting",
                    SERVER_SHUTDOWN_TIMEOUT
                );
                for server in servers.iter() {
                    server.abort();
                }
            }
        }
        servers.clear();
    }

    /// Run until `token` is cancelled.
    #[tracing::instrument(skip_all, fields(plugin_dir = %self.plugin_dir.display()))]
    pub async fn run(
        self,
        mut new_types: mpsc::UnboundedReceiver<String>,
        token: CancellationToken,
    ) -> Result<(), Report<PluginError>> {
        let (restart_tx, mut kubelet_restarts) = mpsc::unbounded_channel();
        let _watcher = watch_kubelet_socket(&self.kubelet_socket, restart_tx)?;
        let mut hangup =
            signal(SignalKind::hangup()).change_context(PluginError::Watcher {
                target: "SIGHUP".to_string(),
            })?;

        loop {
            while kubelet_restarts.try_recv().is_ok() {}

            let generation = token.child_token();
            let mut servers = Vec::new();
            let next = match self.start_generation(&generation, &mut servers).await {
                Ok(()) => {
                    info!(servers = servers.len(), "device plugins registered with kubelet");
                    self.supervise_generation(
                        &generation,
                        &mut servers,
                        &mut new_types,
                        &mut kubelet_restarts,
                        &mut hangup,
                        &token,
                    )
                    .await
                }
                Err(e) => {
                    error!("failed to start device plugins: {e:?}");
                    Next::Retry
                }
            };
            Self::stop_generation(generation, &mut servers).await;

            match next {
                Next::Stop => {
                    info!("device plugin supervisor stopped");
                    return Ok(());
                }
                Next::Restart => {}
                Next::Retry => {
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.retry_interval) => {}
                        Some(()) = kubelet_restarts.recv() => {
                            info!("kubelet socket re-created, retrying registration");
                        }
                    }
                }
            }
        }
    }
}

/// Report every creation of the kubelet socket on `tx`.
fn watch_kubelet_socket(
    kubelet_socket: &Path,
    tx: mpsc::UnboundedSender<()>,
) -> Result<RecommendedWatcher, Report<PluginError>> {
    let watched_dir = kubelet_socket
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let watch_error = || PluginError::Watcher {
        target: watched_dir.display().to_string(),
    };
    let socket_name: Option<OsString> = kubelet_socket.file_name().map(|n| n.to_os_string());

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let created = matches!(event.kind, EventKind::Create(_))
                    && event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == socket_name.as_deref());
                if created {
                    debug!("kubelet socket created: {:?}", event.paths);
                    let _ = tx.send(());
                }
            }
            Err(e) => {
                error!("plugin directory watch error: {:?}", e);
            }
        },
        Config::default(),
    )
    .change_context_lazy(watch_error)?;

    watcher
        .watch(&watched_dir, RecursiveMode::NonRecursive)
        .change_context_lazy(watch_error)?;
    Ok(watcher)
}
