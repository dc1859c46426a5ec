//! Desired virtual-device topology and the create/destroy plans derived from it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;

use crate::domain::chip::ChipFamily;
use crate::domain::device::core_token;
use crate::domain::device::DeviceId;
use crate::domain::device::RESOURCE_NAME_PREFIX;
use crate::domain::errors::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TopologyDocument {
    #[serde(default)]
    pub nodes: Vec<NodeTopology>,
    #[serde(default)]
    pub update_time: i64,
    #[serde(default)]
    pub check_code: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeTopology {
    pub node_name: String,
    #[serde(default)]
    pub cards: Vec<CardVnpus>,
}

/// Desired state of one physical card.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CardVnpus {
    pub card_name: String,
    /// Desired virtual devices, matched by their `<n>c` core token.
    #[serde(default)]
    pub req: Vec<String>,
    /// Virtual devices already claimed by workloads.
    #[serde(default)]
    pub alloc: Vec<String>,
}

impl CardVnpus {
    /// Physical ID named by `card_name`, e.g. `Ascend910-3` -> 3.
    pub fn phy_id(&self) -> Option<u32> {
        match self.card_name.parse::<DeviceId>() {
            Ok(DeviceId::Physical { phy_id, .. }) => Some(phy_id),
            _ => None,
        }
    }

    /// Claimed device names without the resource prefix.
    pub fn claimed(&self) -> impl Iterator<Item = &str> {
        self.alloc
            .iter()
            .map(|name| name.strip_prefix(RESOURCE_NAME_PREFIX).unwrap_or(name))
    }
}

/// Parse the topology document and select the cards of `node_name`.
pub fn parse_topology(raw: &str, node_name: &str) -> Result<Vec<CardVnpus>, Report<ConfigError>> {
    let document: TopologyDocument =
        serde_json::from_str(raw).change_context(ConfigError::MalformedTopology {
            message: "invalid JSON".to_string(),
        })?;
    if document.check_code == 0 {
        return Err(Report::new(ConfigError::CheckCodeZero));
    }
    document
        .nodes
        .into_iter()
        .find(|node| node.node_name == node_name)
        .map(|node| node.cards)
        .ok_or_else(|| {
            Report::new(ConfigError::NodeNotFound {
                node_name: node_name.to_string(),
            })
        })
}

fn count_by_core<'a>(names: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for name in names {
        if let Some(token) = core_token(name) {
            *counts.entry(token).or_insert(0) += 1;
        }
    }
    counts
}

/// Virtual devices of card `phy_id` currently published in node annotations.
pub fn annotated_for_phy(
    annotations: &BTreeMap<String, String>,
    family: ChipFamily,
    phy_id: u32,
) -> Vec<DeviceId> {
    family
        .core_classes()
        .filter_map(|class| annotations.get(&ChipFamily::annotation_key(&family.virtual_type(class))))
        .flat_map(|value| value.split(','))
        .filter_map(|name| name.trim().parse::<DeviceId>().ok())
        .filter(|id| id.is_virtual() && id.phy_id() == phy_id)
        .collect()
}

/// Core classes to create on one card: the per-class deficit of `Req`
/// against the claimed and published devices. Satisfied classes yield
/// nothing.
pub fn plan_create(card: &CardVnpus, annotated: &[DeviceId]) -> Vec<String> {
    let desired = count_by_core(card.req.iter().map(String::as_str));

    let annotated_names: Vec<String> = annotated.iter().map(ToString::to_string).collect();
    let existing: BTreeSet<&str> = card
        .claimed()
        .chain(annotated_names.iter().map(String::as_str))
        .collect();
    let existing = count_by_core(existing);

    let mut plan = Vec::new();
    for (class, want) in desired {
        let have = existing.get(&class).copied().unwrap_or(0);
        plan.extend(std::iter::repeat_n(class, want.saturating_sub(have)));
    }
    plan
}

/// Virtual devices to destroy across all cards.
///
/// Per card and core class, only devices beyond the declared `Req` count are
/// candidates, and a device is never chosen while it is claimed in `Alloc`
/// or published in the node annotations.
pub fn plan_destroy(
    cards: &[CardVnpus],
    existing: &BTreeMap<u32, Vec<DeviceId>>,
    annotated: &BTreeMap<u32, Vec<DeviceId>>,
) -> Vec<DeviceId> {
    let mut plan = Vec::new();
    for (phy_id, vdevs) in existing {
        let card = cards.iter().find(|c| c.phy_id() == Some(*phy_id));
        let desired = card
            .map(|c| count_by_core(c.req.iter().map(String::as_str)))
            .unwrap_or_default();

        let mut protected: BTreeSet<String> = card
            .map(|c| c.claimed().map(str::to_string).collect())
            .unwrap_or_default();
        if let Some(published) = annotated.get(phy_id) {
            protected.extend(published.iter().map(ToString::to_string));
        }

        let mut by_class: BTreeMap<String, Vec<&DeviceId>> = BTreeMap::new();
        for id in vdevs {
            if let Some(token) = core_token(&id.to_string()) {
                by_class.entry(token).or_default().push(id);
            }
        }

        for (class, ids) in by_class {
            let excess = ids
                .len()
                .saturating_sub(desired.get(&class).copied().unwrap_or(0));
            plan.extend(
                ids.into_iter()
                    .filter(|id| !protected.contains(&id.to_string()))
                    .take(excess)
                    .cloned(),
            );
        }
    }
    plan
}
