use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::domain::chip::StatusGroups;
use crate::domain::device::DeviceId;

/// What one device type reported in the current round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoundSnapshot {
    pub free: BTreeSet<DeviceId>,
    pub unhealthy: BTreeSet<DeviceId>,
    pub network_unhealthy: BTreeSet<DeviceId>,
}

/// Cross-worker reconciliation state, guarded by one coarse mutex.
#[derive(Debug, Default)]
pub struct ReconcilerState {
    /// Latest snapshot of every type that reported in the current round.
    pub round: BTreeMap<String, RoundSnapshot>,
    /// Physical devices currently listed in a recover label.
    pub recovering: BTreeSet<DeviceId>,
    pub annotation_reset_done: bool,
}

pub type SharedState = Arc<Mutex<ReconcilerState>>;

impl ReconcilerState {
    pub fn shared() -> SharedState {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Record `dev_type`'s snapshot for the round. A second report from the
    /// same type replaces the first.
    pub fn accumulate(
        &mut self,
        dev_type: &str,
        groups: StatusGroups,
        used: &BTreeSet<DeviceId>,
    ) {
        let snapshot = RoundSnapshot {
            free: groups
                .healthy
                .into_iter()
                .filter(|id| !used.contains(id))
                .collect(),
            unhealthy: groups.unhealthy,
            network_unhealthy: groups.network_unhealthy,
        };
        self.round.insert(dev_type.to_string(), snapshot);
    }

    /// True once every known type has reported.
    pub fn round_complete(&self, known_types: &BTreeSet<String>) -> bool {
        known_types.iter().all(|t| self.round.contains_key(t))
    }

    /// Union of all snapshots; starts a fresh round.
    pub fn take_round(&mut self) -> RoundSnapshot {
        let mut merged = RoundSnapshot::default();
        for snapshot in std::mem::take(&mut self.round).into_values() {
            merged.free.extend(snapshot.free);
            merged.unhealthy.extend(snapshot.unhealthy);
            merged.network_unhealthy.extend(snapshot.network_unhealthy);
        }
        merged
    }

    pub fn reset_round(&mut self) {
        self.round.clear();
    }
}
