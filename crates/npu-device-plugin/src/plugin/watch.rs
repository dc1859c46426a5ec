//! The `ListAndWatch` loop of one device type.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::probe_health;
use super::DeviceTypeHandle;
use super::PluginContext;
use super::SchedulerLink;
use crate::domain::chip::group_by_status;
use crate::domain::device::DeviceId;
use crate::domain::device::Health;
use crate::domain::device::NpuDevice;
use crate::infrastructure::k8s::pods::used_devices;
use crate::infrastructure::kubelet::api::Device;
use crate::infrastructure::kubelet::api::ListAndWatchResponse;
use crate::reconciler::pod_allocation::complete_mapping;

/// Subtracted from the configured period so a cycle fits inside it.
pub const LIST_WATCH_SKEW: Duration = Duration::from_secs(3);

pub fn sleep_interval(period: Duration) -> Duration {
    period.saturating_sub(LIST_WATCH_SKEW)
}

fn health_changed(previous: &[NpuDevice], current: &[NpuDevice]) -> bool {
    let before: BTreeMap<&DeviceId, (Health, Health)> = previous
        .iter()
        .map(|d| (&d.id, (d.health, d.network_health)))
        .collect();
    current.iter().any(|d| {
        before
            .get(&d.id)
            .is_some_and(|state| *state != (d.health, d.network_health))
    })
}

/// Polls device health for one type and decides when kubelet needs a new
/// device list.
pub struct DeviceWatcher {
    ctx: Arc<PluginContext>,
    handle: Arc<DeviceTypeHandle>,
    previous: Vec<NpuDevice>,
    last_sent: Option<ListAndWatchResponse>,
}

impl DeviceWatcher {
    pub fn new(ctx: Arc<PluginContext>, handle: Arc<DeviceTypeHandle>) -> Self {
        Self {
            ctx,
            handle,
            previous: Vec::new(),
            last_sent: None,
        }
    }

    /// The device list as kubelet should see it: IDs remapped to the
    /// kubelet-side names, recovering cards held back under the scheduler.
    async fn kubelet_view(&self, devices: &[NpuDevice]) -> ListAndWatchResponse {
        let mut out = Vec::with_capacity(devices.len());
        match &self.ctx.scheduler {
            Some(link) => {
                let ids = self.handle.kubelet_ids();
                for device in devices {
                    if link.annotations.is_recovering(&device.id).await {
                        debug!(device = %device.id, "holding back recovering device");
                        continue;
                    }
                    let name = device.id.to_string();
                    out.push(Device {
                        id: ids.get(&name).cloned().unwrap_or(name),
                        health: device.health.as_str().to_string(),
                        topology: None,
                    });
                }
            }
            None => out.extend(devices.iter().map(|device| Device {
                id: device.id.to_string(),
                health: device.health.as_str().to_string(),
                topology: None,
            })),
        }
        ListAndWatchResponse { devices: out }
    }

    /// Initial full list.
    pub async fn initial(&mut self) -> ListAndWatchResponse {
        let devices = probe_health(self.ctx.manager(), self.handle.devices());
        if let Some(link) = self.ctx.scheduler.clone() {
            self.scheduler_cycle(&link, &devices).await;
        }
        let response = self.kubelet_view(&devices).await;
        self.previous = devices;
        self.last_sent = Some(response.clone());
        response
    }

    /// One polling cycle. Returns a list only when the device count changed,
    /// any device flipped health, or the published view moved (a mapping
    /// update or a card leaving recovery).
    pub async fn cycle(&mut self) -> Option<ListAndWatchResponse> {
        let devices = probe_health(self.ctx.manager(), self.handle.devices());
        let count_changed = self.handle.take_count_changed();
        let changed = count_changed || health_changed(&self.previous, &devices);

        if let Some(link) = self.ctx.scheduler.clone() {
            self.scheduler_cycle(&link, &devices).await;
        }

        let view = self.kubelet_view(&devices).await;
        self.previous = devices;
        if !changed && self.last_sent.as_ref() == Some(&view) {
            return None;
        }
        info!(
            dev_type = %self.handle.dev_type(),
            count_changed,
            "device state changed"
        );
        self.last_sent = Some(view.clone());
        Some(view)
    }

    async fn scheduler_cycle(&self, link: &SchedulerLink, devices: &[NpuDevice]) {
        let dev_type = self.handle.dev_type();
        if let Err(e) = link.annotations.reset_annotations().await {
            warn!(node = %link.node_name, "failed to reset node annotations: {e:?}");
        }

        // an unreadable checkpoint keeps the previous mapping
        let mut mapping = match link.repairer.repair(dev_type).await {
            Some(mapping) => mapping,
            None => self.handle.kubelet_ids(),
        };
        let ids: BTreeSet<DeviceId> = devices.iter().map(|d| d.id.clone()).collect();
        complete_mapping(&ids, &mut mapping);
        self.handle.set_kubelet_ids(mapping);

        let pods = match link.cluster.list_node_pods(&link.node_name).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(
                    node = %link.node_name,
                    "failed to list pods, skipping annotation update: {e:?}"
                );
                return;
            }
        };
        let used = used_devices(&pods, dev_type);
        let known_types = self.ctx.registry.device_types();
        if let Err(e) = link
            .annotations
            .contribute(dev_type, group_by_status(devices), &used, &known_types)
            .await
        {
            warn!(node = %link.node_name, "node annotation update abandoned: {e:?}");
        }
    }

    /// Push the initial list, then poll until cancelled or kubelet goes away.
    #[tracing::instrument(skip_all, fields(dev_type = %self.handle.dev_type()))]
    pub async fn run(
        mut self,
        tx: mpsc::UnboundedSender<Result<ListAndWatchResponse, Status>>,
        token: CancellationToken,
    ) {
        let initial = self.initial().await;
        if tx.send(Ok(initial)).is_err() {
            warn!("kubelet closed the stream before the initial list");
            return;
        }

        let interval = sleep_interval(self.ctx.list_watch_period);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("device watch stopped");
                    return;
                }
                _ = tx.closed() => {
                    info!("kubelet closed the stream");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if let Some(response) = self.cycle().await {
                if tx.send(Ok(response)).is_err() {
                    info!("kubelet closed the stream");
                    return;
                }
            }
        }
    }
}
