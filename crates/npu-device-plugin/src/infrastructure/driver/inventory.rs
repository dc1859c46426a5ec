//! Deterministic in-memory driver loaded from a YAML device inventory.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::MutexGuard;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;

use super::template_core_count;
use super::DriverError;
use super::NpuDriver;
use super::VirtualDevice;
use super::VirtualDeviceInfo;

const FIRST_VDEV_ID: u32 = 100;

/// On-disk inventory format.
#[derive(Debug, Clone, Deserialize)]
pub struct InventorySpec {
    pub chips: Vec<ChipSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChipSpec {
    pub logic_id: u32,
    pub phy_id: u32,
    pub chip_name: String,
    #[serde(default)]
    pub health: u32,
    #[serde(default)]
    pub network_health: u32,
    #[serde(default)]
    pub error_code: u64,
    #[serde(default)]
    pub ip: Option<String>,
    pub total_cores: u32,
    #[serde(default)]
    pub vdevs: Vec<VdevSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VdevSpec {
    pub vdev_id: u32,
    pub template: String,
    #[serde(default)]
    pub container_id: u64,
}

#[derive(Debug)]
struct ChipState {
    spec: ChipSpec,
    vdevs: Vec<VirtualDevice>,
}

impl ChipState {
    fn unused_cores(&self) -> u32 {
        let used: u32 = self.vdevs.iter().map(|v| v.core_num).sum();
        self.spec.total_cores.saturating_sub(used)
    }
}

#[derive(Debug, Default)]
struct DriverState {
    // keyed by logic id
    chips: BTreeMap<u32, ChipState>,
    next_vdev_id: u32,
    pending_failures: BTreeMap<&'static str, u32>,
    calls: BTreeMap<&'static str, usize>,
}

impl DriverState {
    /// Record the call and consume one injected failure, if any.
    fn enter(&mut self, operation: &'static str) -> Result<(), Report<DriverError>> {
        *self.calls.entry(operation).or_default() += 1;
        if let Some(remaining) = self.pending_failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Report::new(DriverError::OperationFailed {
                    operation: operation.to_string(),
                    message: "injected failure".to_string(),
                }));
            }
        }
        Ok(())
    }

    fn chip(&self, logic_id: u32) -> Result<&ChipState, Report<DriverError>> {
        self.chips.get(&logic_id).ok_or_else(|| {
            Report::new(DriverError::DeviceNotFound {
                device: format!("logic id {logic_id}"),
            })
        })
    }

    fn chip_mut(&mut self, logic_id: u32) -> Result<&mut ChipState, Report<DriverError>> {
        self.chips.get_mut(&logic_id).ok_or_else(|| {
            Report::new(DriverError::DeviceNotFound {
                device: format!("logic id {logic_id}"),
            })
        })
    }

    fn logic_of(&self, phy_id: u32) -> Option<u32> {
        self.chips
            .iter()
            .find(|(_, chip)| chip.spec.phy_id == phy_id)
            .map(|(logic, _)| *logic)
    }
}

/// [`NpuDriver`] backed by an in-memory chip table.
#[derive(Debug)]
pub struct InventoryDriver {
    state: Mutex<DriverState>,
}

impl InventoryDriver {
    pub fn new(spec: InventorySpec) -> Result<Self, Report<DriverError>> {
        let mut chips = BTreeMap::new();
        let mut max_vdev = FIRST_VDEV_ID.saturating_sub(1);
        for chip in spec.chips {
            let mut vdevs = Vec::with_capacity(chip.vdevs.len());
            for vdev in &chip.vdevs {
                let core_num = template_core_count(&vdev.template).ok_or_else(|| {
                    Report::new(DriverError::InvalidResponse {
                        message: format!(
                            "unknown template {} on chip {}",
                            vdev.template, chip.phy_id
                        ),
                    })
                })?;
                max_vdev = max_vdev.max(vdev.vdev_id);
                vdevs.push(VirtualDevice {
                    vdev_id: vdev.vdev_id,
                    core_num,
                    template: Some(vdev.template.clone()),
                    container_id: vdev.container_id,
                    status: 0,
                });
            }
            let state = ChipState { spec: chip, vdevs };
            let used: u32 = state.vdevs.iter().map(|v| v.core_num).sum();
            if used > state.spec.total_cores {
                return Err(Report::new(DriverError::InvalidResponse {
                    message: format!(
                        "chip {} declares {used} virtual cores but only has {}",
                        state.spec.phy_id, state.spec.total_cores
                    ),
                }));
            }
            if chips.insert(state.spec.logic_id, state).is_some() {
                return Err(Report::new(DriverError::InvalidResponse {
                    message: "duplicate logic id in inventory".to_string(),
                }));
            }
        }

        Ok(Self {
            state: Mutex::new(DriverState {
                chips,
                next_vdev_id: max_vdev + 1,
                ..Default::default()
            }),
        })
    }

    pub fn from_yaml(contents: &str) -> Result<Self, Report<DriverError>> {
        let spec: InventorySpec =
            serde_yaml::from_str(contents).change_context(DriverError::InvalidResponse {
                message: "Failed to parse device inventory".to_string(),
            })?;
        Self::new(spec)
    }

    pub fn from_file(path: &Path) -> Result<Self, Report<DriverError>> {
        let contents =
            std::fs::read_to_string(path).change_context(DriverError::Unavailable {
                message: format!("Failed to read device inventory {}", path.display()),
            })?;
        Self::from_yaml(&contents)
    }

    fn lock(&self) -> Result<MutexGuard<'_, DriverState>, Report<DriverError>> {
        self.state.lock().map_err(|_| {
            Report::new(DriverError::Unavailable {
                message: "inventory state poisoned".to_string(),
            })
        })
    }

    pub fn set_health(&self, phy_id: u32, code: u32) -> Result<(), Report<DriverError>> {
        self.update_chip(phy_id, |chip| chip.spec.health = code)
    }

    pub fn set_network_health(&self, phy_id: u32, code: u32) -> Result<(), Report<DriverError>> {
        self.update_chip(phy_id, |chip| chip.spec.network_health = code)
    }

    /// Make the next `count` calls of `operation` fail.
    pub fn fail_next(&self, operation: &'static str, count: u32) -> Result<(), Report<DriverError>> {
        self.lock()?.pending_failures.insert(operation, count);
        Ok(())
    }

    /// Move the chip with `phy_id` to a new logic ID.
    pub fn remap_logic_id(&self, phy_id: u32, new_logic: u32) -> Result<(), Report<DriverError>> {
        let mut state = self.lock()?;
        let old = state.logic_of(phy_id).ok_or_else(|| {
            Report::new(DriverError::DeviceNotFound {
                device: format!("phy id {phy_id}"),
            })
        })?;
        if let Some(mut chip) = state.chips.remove(&old) {
            chip.spec.logic_id = new_logic;
            state.chips.insert(new_logic, chip);
        }
        Ok(())
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.lock()
            .map(|state| state.calls.get(operation).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    fn update_chip(
        &self,
        phy_id: u32,
        update: impl FnOnce(&mut ChipState),
    ) -> Result<(), Report<DriverError>> {
        let mut state = self.lock()?;
        let logic = state.logic_of(phy_id).ok_or_else(|| {
            Report::new(DriverError::DeviceNotFound {
                device: format!("phy id {phy_id}"),
            })
        })?;
        update(state.chip_mut(logic)?);
        Ok(())
    }
}

impl NpuDriver for InventoryDriver {
    fn list_devices(&self) -> Result<Vec<u32>, Report<DriverError>> {
        let mut state = self.lock()?;
        state.enter("list_devices")?;
        Ok(state.chips.keys().copied().collect())
    }

    fn get_phy_id(&self, logic_id: u32) -> Result<u32, Report<DriverError>> {
        let mut state = self.lock()?;
        state.enter("get_phy_id")?;
        Ok(state.chip(logic_id)?.spec.phy_id)
    }

    fn get_logic_id(&self, phy_id: u32) -> Result<u32, Report<DriverError>> {
        let mut state = self.lock()?;
        state.enter("get_logic_id")?;
        state.logic_of(phy_id).ok_or_else(|| {
            Report::new(DriverError::DeviceNotFound {
                device: format!("phy id {phy_id}"),
            })
        })
    }

    fn get_device_health(&self, logic_id: u32) -> Result<u32, Report<DriverError>> {
        let mut state = self.lock()?;
        state.enter("get_device_health")?;
        Ok(state.chip(logic_id)?.spec.health)
    }

    fn get_device_network_health(&self, logic_id: u32) -> Result<u32, Report<DriverError>> {
        let mut state = self.lock()?;
        state.enter("get_device_network_health")?;
        Ok(state.chip(logic_id)?.spec.network_health)
    }

    fn get_vdevices_info(&self, logic_id: u32) -> Result<VirtualDeviceInfo, Report<DriverError>> {
        let mut state = self.lock()?;
        state.enter("get_vdevices_info")?;
        let chip = state.chip(logic_id)?;
        Ok(VirtualDeviceInfo {
            total_cores: chip.spec.total_cores,
            unused_cores: chip.unused_cores(),
            vdevs: chip.vdevs.clone(),
        })
    }

    fn create_virtual_device(
        &self,
        logic_id: u32,
        template: &str,
    ) -> Result<u32, Report<DriverError>> {
        let mut state = self.lock()?;
        state.enter("create_virtual_device")?;
        let cores = template_core_count(template).ok_or_else(|| {
            Report::new(DriverError::OperationFailed {
                operation: "create_virtual_device".to_string(),
                message: format!("unknown template {template}"),
            })
        })?;
        let vdev_id = state.next_vdev_id;
        let chip = state.chip_mut(logic_id)?;
        if chip.unused_cores() < cores {
            return Err(Report::new(DriverError::OperationFailed {
                operation: "create_virtual_device".to_string(),
                message: format!(
                    "chip {} has {} free cores, {template} needs {cores}",
                    chip.spec.phy_id,
                    chip.unused_cores()
                ),
            }));
        }
        chip.vdevs.push(VirtualDevice {
            vdev_id,
            core_num: cores,
            template: Some(template.to_string()),
            container_id: 0,
            status: 0,
        });
        state.next_vdev_id += 1;
        Ok(vdev_id)
    }

    fn destroy_virtual_device(
        &self,
        logic_id: u32,
        vdev_id: u32,
    ) -> Result<(), Report<DriverError>> {
        let mut state = self.lock()?;
        state.enter("destroy_virtual_device")?;
        let chip = state.chip_mut(logic_id)?;
        let before = chip.vdevs.len();
        chip.vdevs.retain(|v| v.vdev_id != vdev_id);
        if chip.vdevs.len() == before {
            return Err(Report::new(DriverError::DeviceNotFound {
                device: format!("vdev {vdev_id} on logic id {logic_id}"),
            }));
        }
        Ok(())
    }

    fn get_device_error_code(&self, logic_id: u32) -> Result<u64, Report<DriverError>> {
        let mut state = self.lock()?;
        state.enter("get_device_error_code")?;
        Ok(state.chip(logic_id)?.spec.error_code)
    }

    fn get_device_ip(&self, logic_id: u32) -> Result<String, Report<DriverError>> {
        let mut state = self.lock()?;
        state.enter("get_device_ip")?;
        let chip = state.chip(logic_id)?;
        chip.spec.ip.clone().ok_or_else(|| {
            Report::new(DriverError::InvalidResponse {
                message: format!("no ip configured for phy id {}", chip.spec.phy_id),
            })
        })
    }

    fn get_chip_name(&self, logic_id: u32) -> Result<String, Report<DriverError>> {
        let mut state = self.lock()?;
        state.enter("get_chip_name")?;
        Ok(state.chip(logic_id)?.spec.chip_name.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    pub(crate) const TWO_CARD_910: &str = r#"
chips:
  - logic_id: 0
    phy_id: 0
    chip_name: "910B"
    ip: "192.168.10.1"
    total_cores: 32
  - logic_id: 1
    phy_id: 1
    chip_name: "910B"
    ip: "192.168.10.2"
    total_cores: 32
    vdevs:
      - vdev_id: 100
        template: vir08
      - vdev_id: 101
        template: vir04
"#;

    #[test]
    fn loads_inventory_and_reports_layout() {
        let driver = InventoryDriver::from_yaml(TWO_CARD_910).expect("should load inventory");
        assert_eq!(driver.list_devices().expect("should list"), vec![0, 1]);

        let info = driver.get_vdevices_info(1).expect("should query vdevs");
        assert_eq!(info.total_cores, 32);
        assert_eq!(info.unused_cores, 20, "should subtract 8 + 4 cores");
        assert!(info.is_conserved());
    }

    #[test]
    fn create_allocates_ids_after_existing_ones_and_keeps_conservation() {
        let driver = InventoryDriver::from_yaml(TWO_CARD_910).expect("should load inventory");
        let first = driver
            .create_virtual_device(0, "vir16")
            .expect("should create");
        let second = driver
            .create_virtual_device(0, "vir16")
            .expect("should create");
        assert_eq!((first, second), (102, 103), "should continue after 101");

        let err = driver.create_virtual_device(0, "vir02");
        assert!(err.is_err(), "should refuse when no cores remain");

        let info = driver.get_vdevices_info(0).expect("should query vdevs");
        assert_eq!(info.unused_cores, 0);
        assert!(info.is_conserved());
    }

    #[test]
    fn destroy_frees_cores() {
        let driver = InventoryDriver::from_yaml(TWO_CARD_910).expect("should load inventory");
        driver
            .destroy_virtual_device(1, 100)
            .expect("should destroy");
        let info = driver.get_vdevices_info(1).expect("should query vdevs");
        assert_eq!(info.unused_cores, 28);
        assert!(driver.destroy_virtual_device(1, 100).is_err());
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let driver = InventoryDriver::from_yaml(TWO_CARD_910).expect("should load inventory");
        driver
            .fail_next("get_device_health", 1)
            .expect("should inject");
        assert!(driver.get_device_health(0).is_err());
        assert_eq!(driver.get_device_health(0).expect("should recover"), 0);
        assert_eq!(driver.call_count("get_device_health"), 2);
    }

    #[test]
    fn remapped_logic_id_resolves_from_phy_id() {
        let driver = InventoryDriver::from_yaml(TWO_CARD_910).expect("should load inventory");
        driver.remap_logic_id(1, 7).expect("should remap");
        assert_eq!(driver.get_logic_id(1).expect("should resolve"), 7);
        assert_eq!(driver.get_phy_id(7).expect("should resolve"), 1);
    }

    #[test]
    fn overcommitted_inventory_is_rejected() {
        let yaml = r#"
chips:
  - logic_id: 0
    phy_id: 0
    chip_name: "310P3"
    total_cores: 4
    vdevs:
      - vdev_id: 100
        template: vir04
      - vdev_id: 101
        template: vir02
"#;
        assert!(InventoryDriver::from_yaml(yaml).is_err());
    }
}
