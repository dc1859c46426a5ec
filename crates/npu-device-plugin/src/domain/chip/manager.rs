use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::warn;

use crate::domain::chip::ChipFamily;
use crate::domain::device::DeviceId;
use crate::domain::device::Health;
use crate::domain::device::LOOPBACK_DEVICE_IP;
use crate::domain::device::NpuDevice;
use crate::domain::device::MAX_DEVICES_PER_REQUEST;
use crate::infrastructure::driver::DriverError;
use crate::infrastructure::driver::NpuDriver;

const HEALTH_NORMAL: u32 = 0;
const HEALTH_GENERAL_ALARM: u32 = 1;
const NETWORK_OK: u32 = 0;
const NETWORK_INIT: u32 = 6;

/// Result of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub devices: Vec<NpuDevice>,
    pub device_types: BTreeSet<String>,
    pub phy_ids: BTreeSet<u32>,
    /// Virtual devices present on each physical card.
    pub phy_to_vdevs: BTreeMap<u32, Vec<DeviceId>>,
}

impl Inventory {
    pub fn devices_of_type<'a>(&'a self, dev_type: &'a str) -> impl Iterator<Item = &'a NpuDevice> {
        self.devices.iter().filter(move |d| d.dev_type == dev_type)
    }
}

/// A device as exposed to a container: the number in the visible-devices
/// env and the IP reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleDevice {
    pub id: DeviceId,
    pub visible_id: u32,
    pub ip: String,
}

/// Family-aware view over the driver.
pub struct ChipManager {
    driver: Arc<dyn NpuDriver>,
    family: ChipFamily,
}

impl ChipManager {
    /// Detect the chip family from the first device the driver reports.
    pub fn detect(driver: Arc<dyn NpuDriver>) -> Result<Self, Report<DriverError>> {
        let logic_ids = driver.list_devices()?;
        let first = logic_ids.first().copied().ok_or_else(|| {
            Report::new(DriverError::DeviceNotFound {
                device: "no NPU devices reported by driver".to_string(),
            })
        })?;
        let chip_name = driver.get_chip_name(first)?;
        let family = ChipFamily::detect(&chip_name).ok_or_else(|| {
            Report::new(DriverError::InvalidResponse {
                message: format!("unsupported chip {chip_name}"),
            })
        })?;
        Ok(Self { driver, family })
    }

    pub fn with_family(driver: Arc<dyn NpuDriver>, family: ChipFamily) -> Self {
        Self { driver, family }
    }

    pub fn family(&self) -> ChipFamily {
        self.family
    }

    pub fn driver(&self) -> &Arc<dyn NpuDriver> {
        &self.driver
    }

    /// Enumerate every device. Any driver failure aborts the whole pass.
    pub fn discover(&self) -> Result<Inventory, Report<DriverError>> {
        let logic_ids = self.driver.list_devices()?;
        if logic_ids.len() > MAX_DEVICES_PER_REQUEST {
            return Err(Report::new(DriverError::InvalidResponse {
                message: format!(
                    "driver reported {} devices, at most {MAX_DEVICES_PER_REQUEST} supported",
                    logic_ids.len()
                ),
            }));
        }

        let mut inventory = Inventory::default();

        for logic_id in logic_ids {
            let phy_id = self.driver.get_phy_id(logic_id)?;
            let info = self
                .driver
                .get_vdevices_info(logic_id)
                .attach_printable_lazy(|| format!("phy id {phy_id}"))?;
            if !info.is_conserved() {
                return Err(Report::new(DriverError::InvalidResponse {
                    message: format!(
                        "phy id {phy_id}: virtual cores do not add up to {} total",
                        info.total_cores
                    ),
                }));
            }
            inventory.phy_ids.insert(phy_id);

            if info.vdevs.is_empty() {
                let id = DeviceId::physical(self.family, phy_id);
                inventory.device_types.insert(id.device_type());
                inventory.devices.push(NpuDevice::new(id));
                continue;
            }

            let vdevs = inventory.phy_to_vdevs.entry(phy_id).or_default();
            for vdev in info.vdevs.iter().filter(|v| v.core_num > 0) {
                let core_class = vdev
                    .template
                    .as_deref()
                    .and_then(|t| self.family.class_for_template(t))
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}c", vdev.core_num));
                let id = DeviceId::Virtual {
                    family: self.family,
                    core_class,
                    vdev_id: vdev.vdev_id,
                    phy_id,
                };
                inventory.device_types.insert(id.device_type());
                vdevs.push(id.clone());
                inventory.devices.push(NpuDevice::new(id));
            }
        }

        debug!(
            family = %self.family,
            devices = inventory.devices.len(),
            "discovered devices"
        );
        Ok(inventory)
    }

    /// Chip health of the card behind `id`. Lookup failures count as unhealthy.
    pub fn device_state(&self, id: &DeviceId) -> Health {
        let phy_id = id.phy_id();
        let logic_id = match self.driver.get_logic_id(phy_id) {
            Ok(logic_id) => logic_id,
            Err(e) => {
                warn!(device = %id, "failed to resolve logic id: {e:?}");
                return Health::Unhealthy;
            }
        };
        match self.driver.get_device_health(logic_id) {
            Ok(HEALTH_NORMAL | HEALTH_GENERAL_ALARM) => Health::Healthy,
            Ok(code) => {
                match self.driver.get_device_error_code(logic_id) {
                    Ok(error_code) => {
                        warn!(device = %id, health = code, error_code = %format!("{error_code:#x}"), "device unhealthy")
                    }
                    Err(e) => {
                        warn!(device = %id, health = code, "device unhealthy, error code unavailable: {e:?}")
                    }
                }
                Health::Unhealthy
            }
            Err(e) => {
                warn!(device = %id, "failed to query device health: {e:?}");
                Health::Unhealthy
            }
        }
    }

    /// Network health of the card behind `id`; always healthy for families
    /// without network health.
    pub fn network_state(&self, id: &DeviceId) -> Health {
        if !self.family.profile().network_health {
            return Health::Healthy;
        }
        let code = self
            .driver
            .get_logic_id(id.phy_id())
            .and_then(|logic_id| self.driver.get_device_network_health(logic_id));
        match code {
            Ok(NETWORK_OK | NETWORK_INIT) => Health::Healthy,
            Ok(code) => {
                warn!(device = %id, network_health = code, "device network unhealthy");
                Health::Unhealthy
            }
            Err(e) => {
                warn!(device = %id, "failed to query network health: {e:?}");
                Health::Unhealthy
            }
        }
    }

    /// Device IP for families that report one, empty otherwise.
    pub fn device_ip(&self, phy_id: u32) -> Result<String, Report<DriverError>> {
        if !self.family.profile().device_ip {
            return Ok(String::new());
        }
        let logic_id = self.driver.get_logic_id(phy_id)?;
        self.driver
            .get_device_ip(logic_id)
            .attach_printable_lazy(|| format!("phy id {phy_id}"))
    }

    /// Resolve devices to their visible numbers, sorted and deduplicated.
    ///
    /// When every ID is virtual only the virtual device number and the
    /// loopback IP are exposed; otherwise the physical ID and the card IP.
    pub fn resolve_visible(
        &self,
        ids: &[DeviceId],
    ) -> Result<Vec<VisibleDevice>, Report<DriverError>> {
        let virtual_mode = !ids.is_empty() && ids.iter().all(DeviceId::is_virtual);
        let mut visible = BTreeMap::new();
        for id in ids {
            let device = if virtual_mode {
                VisibleDevice {
                    id: id.clone(),
                    visible_id: id.short_id(),
                    ip: LOOPBACK_DEVICE_IP.to_string(),
                }
            } else {
                VisibleDevice {
                    id: id.clone(),
                    visible_id: id.phy_id(),
                    ip: self
                        .device_ip(id.phy_id())
                        .attach_printable_lazy(|| format!("device {id}"))?,
                }
            };
            visible.insert(device.visible_id, device);
        }
        Ok(visible.into_values().collect())
    }
}
