//! `Allocate` handling: validation, scheduler reconciliation and the
//! container response.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;

use super::probe_health;
use super::DeviceTypeHandle;
use super::PluginContext;
use super::SchedulerLink;
use crate::domain::chip::group_by_status;
use crate::domain::chip::ChipManager;
use crate::domain::chip::VisibleDevice;
use crate::domain::device::DeviceId;
use crate::domain::device::MAX_DEVICES_PER_REQUEST;
use crate::domain::errors::AllocateError;
use crate::infrastructure::k8s::annotations::Instance;
use crate::infrastructure::k8s::annotations::ALLOCATE_POD_NAME;
use crate::infrastructure::k8s::annotations::POD_PREDICATE_TIME;
use crate::infrastructure::k8s::pods::assigned_devices;
use crate::infrastructure::k8s::pods::candidate_pods;
use crate::infrastructure::k8s::pods::pod_name;
use crate::infrastructure::k8s::pods::pod_namespace;
use crate::infrastructure::k8s::pods::predicate_time;
use crate::infrastructure::k8s::pods::used_devices;
use crate::infrastructure::k8s::pods::MAX_CONTAINERS;
use crate::infrastructure::kubelet::api::AllocateRequest;
use crate::infrastructure::kubelet::api::AllocateResponse;
use crate::infrastructure::kubelet::api::ContainerAllocateResponse;
use crate::infrastructure::kubelet::api::DeviceSpec;
use crate::infrastructure::kubelet::ASCEND_RUNTIME_OPTIONS;
use crate::infrastructure::kubelet::ASCEND_VISIBLE_DEVICES;
use crate::reconciler::pod_allocation::update_pod_annotations;

pub const DEFAULT_DEVICE_NODES: [&str; 3] =
    ["/dev/davinci_manager", "/dev/hisi_hdc", "/dev/devmm_svm"];
const RUNTIME_VIRTUAL: &str = "VIRTUAL";

fn invalid(message: impl Into<String>) -> Report<AllocateError> {
    Report::new(AllocateError::InvalidRequest {
        message: message.into(),
    })
}

/// Parse and check every container request against the devices served for
/// `dev_type`. Nothing is allocated unless all of them pass.
pub fn validate_request(
    request: &AllocateRequest,
    dev_type: &str,
    served: &BTreeSet<DeviceId>,
) -> Result<Vec<Vec<DeviceId>>, Report<AllocateError>> {
    if request.container_requests.len() > MAX_CONTAINERS {
        return Err(invalid(format!(
            "{} container requests exceed the limit of {MAX_CONTAINERS}",
            request.container_requests.len()
        )));
    }

    request
        .container_requests
        .iter()
        .map(|container| {
            let names = &container.devices_ids;
            if names.is_empty() {
                return Err(invalid("container request names no devices"));
            }
            if names.len() > MAX_DEVICES_PER_REQUEST {
                return Err(invalid(format!(
                    "{} devices requested, at most {MAX_DEVICES_PER_REQUEST} allowed",
                    names.len()
                )));
            }
            let ids = names
                .iter()
                .map(|name| {
                    let id = name
                        .parse::<DeviceId>()
                        .change_context_lazy(|| AllocateError::UnknownDevice {
                            device_id: name.clone(),
                            device_type: dev_type.to_string(),
                        })?;
                    if id.device_type() != dev_type || !served.contains(&id) {
                        return Err(Report::new(AllocateError::UnknownDevice {
                            device_id: name.clone(),
                            device_type: dev_type.to_string(),
                        }));
                    }
                    Ok(id)
                })
                .collect::<Result<Vec<_>, _>>()?;
            if ids.len() > 1 && ids.iter().any(DeviceId::is_virtual) {
                return Err(invalid(format!(
                    "only one virtual device per container, got {}",
                    ids.len()
                )));
            }
            Ok(ids)
        })
        .collect()
}

/// Build the response for one container from its resolved devices.
pub fn container_response(
    manager: &ChipManager,
    ids: &[DeviceId],
    use_ascend_docker: bool,
) -> Result<ContainerAllocateResponse, Report<AllocateError>> {
    let visible = manager
        .resolve_visible(ids)
        .change_context_lazy(|| AllocateError::ResolutionFailed {
            device_id: ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        })?;
    let virtual_mode = ids.iter().all(DeviceId::is_virtual);

    let visible_ids = visible
        .iter()
        .map(|v| v.visible_id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let envs = HashMap::from([
        (ASCEND_VISIBLE_DEVICES.to_string(), visible_ids),
        (
            ASCEND_RUNTIME_OPTIONS.to_string(),
            if virtual_mode { RUNTIME_VIRTUAL } else { "" }.to_string(),
        ),
    ]);

    let mut annotations = HashMap::new();
    if let Some(key) = manager.family().profile().pod_configuration_key {
        annotations.insert(
            key.to_string(),
            Instance::new(ALLOCATE_POD_NAME, "", &visible).to_json(),
        );
    }

    let devices = if use_ascend_docker {
        Vec::new()
    } else {
        device_nodes(&visible, virtual_mode)
    };

    Ok(ContainerAllocateResponse {
        envs,
        mounts: Vec::new(),
        devices,
        annotations,
        cdi_devices: Vec::new(),
    })
}

fn device_nodes(visible: &[VisibleDevice], virtual_mode: bool) -> Vec<DeviceSpec> {
    let prefix = if virtual_mode {
        "/dev/vdavinci"
    } else {
        "/dev/davinci"
    };
    DEFAULT_DEVICE_NODES
        .iter()
        .map(|path| path.to_string())
        .chain(visible.iter().map(|v| format!("{prefix}{}", v.visible_id)))
        .map(|path| DeviceSpec {
            container_path: path.clone(),
            host_path: path,
            permissions: "rw".to_string(),
        })
        .collect()
}

/// Take the device set from the oldest pending pod the scheduler assigned
/// `count` devices of `dev_type`, and mark that pod as served.
async fn scheduled_devices(
    link: &SchedulerLink,
    dev_type: &str,
    count: usize,
    served: &BTreeSet<DeviceId>,
) -> Result<Vec<DeviceId>, Report<AllocateError>> {
    let no_pod = |message: String| Report::new(AllocateError::NoPendingPod { message });

    let pods = link
        .cluster
        .list_node_pods(&link.node_name)
        .await
        .change_context_lazy(|| AllocateError::NoPendingPod {
            message: format!("failed to list pods on {}", link.node_name),
        })?;
    let oldest = candidate_pods(pods, dev_type, |pod| {
        assigned_devices(pod, dev_type).is_some_and(|devices| devices.len() == count)
    })
    .into_iter()
    .min_by_key(predicate_time)
    .ok_or_else(|| no_pod(format!("no pod assigned {count} {dev_type} devices")))?;

    let (name, namespace) = (pod_name(&oldest), pod_namespace(&oldest));
    let marker = BTreeMap::from([(POD_PREDICATE_TIME.to_string(), u64::MAX.to_string())]);
    update_pod_annotations(link.cluster.as_ref(), namespace, name, &marker)
        .await
        .change_context_lazy(|| AllocateError::NoPendingPod {
            message: format!("failed to mark pod {namespace}/{name}"),
        })?;

    let assigned = assigned_devices(&oldest, dev_type).unwrap_or_default();
    let ids = assigned
        .iter()
        .map(|name| {
            name.parse::<DeviceId>()
                .ok()
                .filter(|id| served.contains(id))
                .ok_or_else(|| {
                    Report::new(AllocateError::UnknownDevice {
                        device_id: name.clone(),
                        device_type: dev_type.to_string(),
                    })
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    info!(
        pod = name,
        namespace,
        devices = %assigned.join(","),
        "allocating scheduler-assigned devices"
    );
    Ok(ids)
}

/// Publish this type's free devices right after an allocation.
async fn publish_free_devices(
    ctx: &PluginContext,
    link: &SchedulerLink,
    handle: &DeviceTypeHandle,
) -> Result<(), Report<AllocateError>> {
    let dev_type = handle.dev_type();
    let pods = link
        .cluster
        .list_node_pods(&link.node_name)
        .await
        .change_context(AllocateError::PublishFailed {
            message: format!("failed to list pods on {}", link.node_name),
        })?;
    let used = used_devices(&pods, dev_type);
    let healthy = group_by_status(&probe_health(ctx.manager(), handle.devices())).healthy;
    let free: BTreeSet<DeviceId> = healthy.difference(&used).cloned().collect();
    link.annotations
        .patch_free_devices(dev_type, &free)
        .await
        .change_context(AllocateError::PublishFailed {
            message: format!("patching free {dev_type} devices failed"),
        })
}

/// Serve one `Allocate` call. Any failure rejects the whole call.
#[tracing::instrument(skip_all, fields(dev_type = %handle.dev_type()))]
pub async fn allocate(
    ctx: &PluginContext,
    handle: &DeviceTypeHandle,
    request: &AllocateRequest,
) -> Result<AllocateResponse, Report<AllocateError>> {
    let dev_type = handle.dev_type();
    let served: BTreeSet<DeviceId> = handle.devices().into_iter().map(|d| d.id).collect();
    let requests = validate_request(request, dev_type, &served)?;

    let mut container_responses = Vec::with_capacity(requests.len());
    for mut ids in requests {
        info!(
            devices = %ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
            "allocate request"
        );
        if let Some(link) = &ctx.scheduler {
            let virtual_type = ids.iter().any(DeviceId::is_virtual);
            if !virtual_type {
                ids = scheduled_devices(link, dev_type, ids.len(), &served).await?;
            }
            publish_free_devices(ctx, link, handle).await?;
        }
        container_responses.push(container_response(
            ctx.manager(),
            &ids,
            ctx.use_ascend_docker,
        )?);
    }
    Ok(AllocateResponse {
        container_responses,
    })
}
