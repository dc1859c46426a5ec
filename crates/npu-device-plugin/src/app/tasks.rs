use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::reconciler::VirtualDeviceReconciler;
use crate::supervisor::PluginSupervisor;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let new_device_types = app.services().take_new_device_types()?;

        let supervisor_task = self.spawn_supervisor_task(app, new_device_types);
        self.tasks.push(supervisor_task);

        if let Some(reconciler) = app.services().vnpu_reconciler.clone() {
            let interval = app.daemon_args().vnpu_sync_interval();
            let periodic_task = self.spawn_vnpu_sync_task(reconciler.clone(), interval);
            self.tasks.push(periodic_task);

            let watch_task = self.spawn_vnpu_watch_task(reconciler);
            self.tasks.push(watch_task);
        }

        Ok(())
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            use tokio::signal::unix::signal;
            use tokio::signal::unix::SignalKind;
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            })
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();

                self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_supervisor_task(
        &self,
        app: &Application,
        new_device_types: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()> {
        let args = app.daemon_args();
        let supervisor = PluginSupervisor::new(
            app.services().plugin_context.clone(),
            args.plugin_dir.clone(),
            args.kubelet_socket_path(),
        );
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting device plugin supervisor task");
            match supervisor.run(new_device_types, token).await {
                Ok(()) => tracing::info!("Device plugin supervisor task completed"),
                Err(e) => tracing::error!("Device plugin supervisor failed: {e:?}"),
            }
        })
    }

    fn spawn_vnpu_sync_task(
        &self,
        reconciler: Arc<VirtualDeviceReconciler>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting virtual device sync task");
            reconciler.run_periodic(interval, token).await;
            tracing::info!("Virtual device sync task completed");
        })
    }

    fn spawn_vnpu_watch_task(&self, reconciler: Arc<VirtualDeviceReconciler>) -> JoinHandle<()> {
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting virtual device topology watch task");
            reconciler.run_watch(token).await;
            tracing::info!("Virtual device topology watch task completed");
        })
    }
}
