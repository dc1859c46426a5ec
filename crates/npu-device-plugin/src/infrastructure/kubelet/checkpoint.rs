//! Read-only access to the kubelet device manager checkpoint.
//!
//! The file is JSON of the form `{"Data": {...}, "Checksum": n}`. Kubelet
//! computes the checksum as FNV-32a over the go-spew `%#v` rendering of its
//! in-memory `Data` struct, so verification rebuilds that rendering from the
//! decoded document. The whole file is rejected when the checksum does not
//! match, so callers never see a partially trusted mapping.
//!
//! Two layouts exist. Kubelet 1.20 and later group `DeviceIDs` per NUMA node,
//! older releases store a flat list.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use error_stack::Report;
use error_stack::ResultExt;
use prost::Message;
use serde::de::Error as _;
use serde::Deserialize;
use serde::Deserializer;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::debug;
use tracing::warn;

use super::api::ContainerAllocateResponse;
use super::ASCEND_VISIBLE_DEVICES;
use crate::domain::chip::ChipFamily;
use crate::domain::device::parse_decimal;
use crate::domain::device::MAX_DEVICES_PER_REQUEST;
use crate::domain::device::RESOURCE_NAME_PREFIX;
use crate::domain::errors::ConfigError;
use crate::infrastructure::k8s::pods::MAX_PODS_SCANNED;

pub const CHECKPOINT_SIZE_CAP: u64 = 10 * 1024 * 1024;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawCheckpoint {
    data: CheckpointData,
    checksum: u64,
}

/// Mirrors kubelet's `checkpointData`. `Option` keeps a JSON `null` apart
/// from an empty collection because the two render differently.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CheckpointData {
    #[serde(default)]
    pod_device_entries: Option<Vec<PodDevicesEntry>>,
    #[serde(default)]
    registered_devices: Option<BTreeMap<String, Option<Vec<String>>>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodDevicesEntry {
    #[serde(rename = "PodUID", default)]
    pod_uid: String,
    #[serde(default)]
    container_name: String,
    #[serde(default)]
    resource_name: String,
    #[serde(rename = "DeviceIDs", default, deserialize_with = "device_ids")]
    device_ids: Option<DeviceIds>,
    /// Base64 of the protobuf `ContainerAllocateResponse`.
    #[serde(default)]
    alloc_resp: Option<String>,
}

/// Requested IDs, grouped per NUMA node on recent kubelets.
enum DeviceIds {
    PerNuma(BTreeMap<i64, Option<Vec<String>>>),
    Flat(Vec<String>),
}

/// NUMA node keys are JSON strings holding an `int64`.
fn device_ids<'de, D>(deserializer: D) -> Result<Option<DeviceIds>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(ids)) => serde_json::from_value(Value::Array(ids))
            .map(|ids| Some(DeviceIds::Flat(ids)))
            .map_err(D::Error::custom),
        Some(Value::Object(per_numa)) => {
            let mut nodes = BTreeMap::new();
            for (node, ids) in per_numa {
                let node: i64 = node.parse().map_err(|_| {
                    D::Error::custom(format!("NUMA node {node} is not an integer"))
                })?;
                let ids: Option<Vec<String>> =
                    serde_json::from_value(ids).map_err(D::Error::custom)?;
                nodes.insert(node, ids);
            }
            Ok(Some(DeviceIds::PerNuma(nodes)))
        }
        Some(other) => Err(D::Error::custom(format!("unexpected DeviceIDs {other}"))),
    }
}

impl DeviceIds {
    fn flatten(self) -> Vec<String> {
        match self {
            DeviceIds::PerNuma(per_numa) => per_numa
                .into_values()
                .take(MAX_PODS_SCANNED)
                .flat_map(|ids| {
                    ids.unwrap_or_default()
                        .into_iter()
                        .take(MAX_DEVICES_PER_REQUEST)
                })
                .collect(),
            DeviceIds::Flat(ids) => ids,
        }
    }
}

/// Which kubelet struct the document was written from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    PerNuma,
    Flat,
}

impl Layout {
    /// Layouts the entries are consistent with. Entries without `DeviceIDs`
    /// fit both.
    fn candidates(data: &CheckpointData) -> Result<Vec<Layout>, Report<ConfigError>> {
        let entries = data.pod_device_entries.as_deref().unwrap_or_default();
        let per_numa = entries
            .iter()
            .any(|e| matches!(e.device_ids, Some(DeviceIds::PerNuma(_))));
        let flat = entries
            .iter()
            .any(|e| matches!(e.device_ids, Some(DeviceIds::Flat(_))));
        match (per_numa, flat) {
            (true, true) => Err(Report::new(ConfigError::CheckpointCorrupted {
                message: "entries mix per-NUMA and flat device ids".to_string(),
            })),
            (true, false) => Ok(vec![Layout::PerNuma]),
            (false, true) => Ok(vec![Layout::Flat]),
            (false, false) => Ok(vec![Layout::PerNuma, Layout::Flat]),
        }
    }
}

/// Writes values the way go-spew formats `%#v` with sorted keys and methods
/// disabled. Struct fields carry a `(type)` prefix, slice and map elements
/// do not. Nil slices and maps print as `<nil>`.
#[derive(Default)]
struct SpewWriter {
    out: String,
}

impl SpewWriter {
    fn typed(&mut self, type_name: &str) {
        self.out.push('(');
        self.out.push_str(type_name);
        self.out.push(')');
    }

    fn field(&mut self, first: bool, name: &str, type_name: &str) {
        if !first {
            self.out.push(' ');
        }
        self.out.push_str(name);
        self.out.push(':');
        self.typed(type_name);
    }

    fn strings(&mut self, values: Option<&[String]>) {
        let Some(values) = values else {
            self.out.push_str("<nil>");
            return;
        };
        self.out.push('[');
        self.out.push_str(&values.join(" "));
        self.out.push(']');
    }

    fn bytes(&mut self, values: Option<&[u8]>) {
        let Some(values) = values else {
            self.out.push_str("<nil>");
            return;
        };
        let rendered: Vec<String> = values.iter().map(u8::to_string).collect();
        self.out.push('[');
        self.out.push_str(&rendered.join(" "));
        self.out.push(']');
    }

    fn string_map<K: ToString>(&mut self, map: Option<&BTreeMap<K, Option<Vec<String>>>>) {
        let Some(map) = map else {
            self.out.push_str("<nil>");
            return;
        };
        self.out.push_str("map[");
        for (i, (key, values)) in map.iter().enumerate() {
            if i > 0 {
                self.out.push(' ');
            }
            self.out.push_str(&key.to_string());
            self.out.push(':');
            self.strings(values.as_deref());
        }
        self.out.push(']');
    }
}

/// go-spew `%#v` of kubelet's `checkpoint.checkpointData` in `layout`.
/// `alloc_resps` holds the decoded `AllocResp` of each entry in order.
fn render_checkpoint_data(
    data: &CheckpointData,
    alloc_resps: &[Option<Vec<u8>>],
    layout: Layout,
) -> String {
    let mut w = SpewWriter::default();
    w.typed("checkpoint.checkpointData");
    w.out.push('{');
    w.field(true, "PodDeviceEntries", "[]checkpoint.PodDevicesEntry");
    match &data.pod_device_entries {
        None => w.out.push_str("<nil>"),
        Some(entries) => {
            w.out.push('[');
            for (i, entry) in entries.iter().enumerate() {
                if i > 0 {
                    w.out.push(' ');
                }
                w.out.push('{');
                w.field(true, "PodUID", "string");
                w.out.push_str(&entry.pod_uid);
                w.field(false, "ContainerName", "string");
                w.out.push_str(&entry.container_name);
                w.field(false, "ResourceName", "string");
                w.out.push_str(&entry.resource_name);
                match (layout, &entry.device_ids) {
                    (Layout::PerNuma, Some(DeviceIds::PerNuma(per_numa))) => {
                        w.field(false, "DeviceIDs", "checkpoint.DevicesPerNUMA");
                        w.string_map(Some(per_numa));
                    }
                    (Layout::Flat, Some(DeviceIds::Flat(ids))) => {
                        w.field(false, "DeviceIDs", "[]string");
                        w.strings(Some(ids.as_slice()));
                    }
                    (Layout::PerNuma, _) => {
                        w.field(false, "DeviceIDs", "checkpoint.DevicesPerNUMA");
                        w.out.push_str("<nil>");
                    }
                    (Layout::Flat, _) => {
                        w.field(false, "DeviceIDs", "[]string");
                        w.out.push_str("<nil>");
                    }
                }
                w.field(false, "AllocResp", "[]uint8");
                w.bytes(alloc_resps.get(i).and_then(Option::as_deref));
                w.out.push('}');
            }
            w.out.push(']');
        }
    }
    w.field(false, "RegisteredDevices", "map[string][]string");
    w.string_map(data.registered_devices.as_ref());
    w.out.push('}');
    w.out
}

fn fnv32a(bytes: &[u8]) -> u64 {
    let hash = bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    });
    u64::from(hash)
}

/// What kubelet recorded for one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    /// e.g. `huawei.com/Ascend910-8c`
    pub resource_name: String,
    /// Device names kubelet asked for.
    pub request_ids: Vec<String>,
    /// Visible device numbers the allocate response handed out.
    pub response_ids: Vec<String>,
}

impl CheckpointEntry {
    /// Resource type without the vendor prefix.
    pub fn resource_type(&self) -> Option<&str> {
        self.resource_name.strip_prefix(RESOURCE_NAME_PREFIX)
    }

    /// Device names actually handed to the pod, rebuilt from the visible
    /// device numbers: `<type>-<id>` for physical devices and
    /// `<type>-<vid>-<phyID>` for virtual ones.
    pub fn response_device_names(
        &self,
        family: ChipFamily,
    ) -> Result<Vec<String>, Report<ConfigError>> {
        let invalid = |message: String| Report::new(ConfigError::CheckpointCorrupted { message });

        let first = self
            .request_ids
            .first()
            .ok_or_else(|| invalid(format!("empty request for {}", self.resource_name)))?;
        let resource_type = self
            .resource_type()
            .filter(|t| family.device_types().iter().any(|known| known == t))
            .ok_or_else(|| invalid(format!("resource {} is invalid", self.resource_name)))?;

        let parts: Vec<&str> = first.split('-').collect();
        match parts.as_slice() {
            [_, _] => Ok(self
                .response_ids
                .iter()
                .map(|id| format!("{resource_type}-{id}"))
                .collect()),
            [_, _, _, phy_id] => Ok(self
                .response_ids
                .iter()
                .map(|id| format!("{resource_type}-{id}-{phy_id}"))
                .collect()),
            _ => Err(invalid(format!("device name {first} is invalid"))),
        }
    }
}

fn visible_devices(alloc_resp: &[u8]) -> Option<Vec<String>> {
    if alloc_resp.is_empty() {
        warn!("allocate response is empty");
        return None;
    }
    let response = match ContainerAllocateResponse::decode(alloc_resp) {
        Ok(response) => response,
        Err(e) => {
            warn!("failed to decode allocate response: {e}");
            return None;
        }
    };
    let Some(visible) = response.envs.get(ASCEND_VISIBLE_DEVICES) else {
        warn!("{ASCEND_VISIBLE_DEVICES} missing from allocate response");
        return None;
    };

    let mut ids = Vec::new();
    for id in visible.split(',').take(MAX_DEVICES_PER_REQUEST) {
        if parse_decimal(id).is_none() {
            warn!(device = id, "invalid visible device id");
            return None;
        }
        ids.push(id.to_string());
    }
    (!ids.is_empty()).then_some(ids)
}

/// Decode every `AllocResp` up front. Kubelet stores `[]byte` as base64, so
/// anything else means the file was not written by kubelet.
fn decode_alloc_resps(data: &CheckpointData) -> Result<Vec<Option<Vec<u8>>>, Report<ConfigError>> {
    data.pod_device_entries
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|entry| {
            entry
                .alloc_resp
                .as_deref()
                .map(|encoded| STANDARD.decode(encoded))
                .transpose()
                .change_context_lazy(|| ConfigError::CheckpointCorrupted {
                    message: format!("allocate response of pod {} is not base64", entry.pod_uid),
                })
        })
        .collect()
}

/// Verify and decode checkpoint bytes into `PodUID -> entry`.
pub fn parse_checkpoint(
    contents: &[u8],
) -> Result<BTreeMap<String, CheckpointEntry>, Report<ConfigError>> {
    let raw: RawCheckpoint =
        serde_json::from_slice(contents).change_context(ConfigError::CheckpointCorrupted {
            message: "not a checkpoint document".to_string(),
        })?;
    let alloc_resps = decode_alloc_resps(&raw.data)?;

    let layouts = Layout::candidates(&raw.data)?;
    let Some(layout) = layouts.iter().copied().find(|layout| {
        fnv32a(render_checkpoint_data(&raw.data, &alloc_resps, *layout).as_bytes()) == raw.checksum
    }) else {
        return Err(Report::new(ConfigError::CheckpointCorrupted {
            message: format!("checksum {} does not match the data", raw.checksum),
        }));
    };
    debug!(?layout, "checkpoint checksum verified");

    let mut entries = BTreeMap::new();
    for (entry, alloc_resp) in raw
        .data
        .pod_device_entries
        .unwrap_or_default()
        .into_iter()
        .zip(alloc_resps)
        .take(MAX_PODS_SCANNED)
    {
        let Some(response_ids) = alloc_resp.as_deref().and_then(visible_devices) else {
            warn!(pod_uid = %entry.pod_uid, "skipping entry without visible devices");
            continue;
        };
        entries.insert(
            entry.pod_uid,
            CheckpointEntry {
                resource_name: entry.resource_name,
                request_ids: entry.device_ids.map(DeviceIds::flatten).unwrap_or_default(),
                response_ids,
            },
        );
    }
    Ok(entries)
}

/// Reads the kubelet checkpoint from a fixed path.
#[derive(Debug, Clone)]
pub struct CheckpointReader {
    path: PathBuf,
}

impl CheckpointReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> Result<BTreeMap<String, CheckpointEntry>, Report<ConfigError>> {
        let unreadable = || ConfigError::CheckpointUnreadable {
            message: self.path.display().to_string(),
        };
        let file = tokio::fs::File::open(&self.path)
            .await
            .change_context_lazy(unreadable)?;
        let size = file.metadata().await.change_context_lazy(unreadable)?.len();
        if size > CHECKPOINT_SIZE_CAP {
            return Err(Report::new(unreadable())
                .attach_printable(format!("file is {size} bytes, cap is {CHECKPOINT_SIZE_CAP}")));
        }

        let mut contents = Vec::new();
        file.take(CHECKPOINT_SIZE_CAP)
            .read_to_end(&mut contents)
            .await
            .change_context_lazy(unreadable)?;
        parse_checkpoint(&contents).attach_printable_lazy(|| self.path.display().to_string())
    }
}
