//! The set of device types this node serves and the devices behind each.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use error_stack::Report;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;

use crate::domain::chip::ChipManager;
use crate::domain::chip::Inventory;
use crate::domain::device::NpuDevice;
use crate::infrastructure::driver::DriverError;

/// Devices of one type plus the per-type bookkeeping its worker needs.
#[derive(Debug)]
pub struct DeviceTypeHandle {
    dev_type: String,
    devices: RwLock<Vec<NpuDevice>>,
    count_changed: AtomicBool,
    /// Real device name to the kubelet device ID it is published under.
    kubelet_ids: Mutex<BTreeMap<String, String>>,
}

impl DeviceTypeHandle {
    pub fn new(dev_type: impl Into<String>, devices: Vec<NpuDevice>) -> Self {
        Self {
            dev_type: dev_type.into(),
            devices: RwLock::new(devices),
            count_changed: AtomicBool::new(false),
            kubelet_ids: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn dev_type(&self) -> &str {
        &self.dev_type
    }

    pub fn devices(&self) -> Vec<NpuDevice> {
        self.devices
            .read()
            .map(|devices| devices.clone())
            .unwrap_or_default()
    }

    fn replace_devices(&self, devices: Vec<NpuDevice>) {
        let Ok(mut current) = self.devices.write() else {
            return;
        };
        let before: BTreeSet<_> = current.iter().map(|d| &d.id).collect();
        let after: BTreeSet<_> = devices.iter().map(|d| &d.id).collect();
        if before != after {
            info!(
                dev_type = %self.dev_type,
                before = before.len(),
                after = after.len(),
                "device set changed"
            );
            self.count_changed.store(true, Ordering::SeqCst);
        }
        *current = devices;
    }

    /// Whether the device set changed since the last call.
    pub fn take_count_changed(&self) -> bool {
        self.count_changed.swap(false, Ordering::SeqCst)
    }

    pub fn kubelet_ids(&self) -> BTreeMap<String, String> {
        self.kubelet_ids
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    pub fn set_kubelet_ids(&self, ids: BTreeMap<String, String>) {
        if let Ok(mut current) = self.kubelet_ids.lock() {
            *current = ids;
        }
    }
}

/// Every device type discovered on this node.
pub struct DeviceRegistry {
    manager: Arc<ChipManager>,
    types: RwLock<BTreeMap<String, Arc<DeviceTypeHandle>>>,
    new_types: mpsc::UnboundedSender<String>,
}

fn split_by_type(inventory: Inventory) -> BTreeMap<String, Vec<NpuDevice>> {
    let mut by_type: BTreeMap<String, Vec<NpuDevice>> = inventory
        .device_types
        .into_iter()
        .map(|t| (t, Vec::new()))
        .collect();
    for device in inventory.devices {
        by_type
            .entry(device.dev_type.clone())
            .or_default()
            .push(device);
    }
    by_type
}

impl DeviceRegistry {
    /// Run the first discovery. Types appearing later are announced on the
    /// returned receiver.
    pub fn discover(
        manager: Arc<ChipManager>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>), Report<DriverError>> {
        let inventory = manager.discover()?;
        let types = split_by_type(inventory)
            .into_iter()
            .map(|(t, devices)| {
                let handle = Arc::new(DeviceTypeHandle::new(t.clone(), devices));
                (t, handle)
            })
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                manager,
                types: RwLock::new(types),
                new_types: tx,
            },
            rx,
        ))
    }

    pub fn manager(&self) -> &Arc<ChipManager> {
        &self.manager
    }

    pub fn handle(&self, dev_type: &str) -> Option<Arc<DeviceTypeHandle>> {
        self.types
            .read()
            .ok()
            .and_then(|types| types.get(dev_type).cloned())
    }

    pub fn device_types(&self) -> BTreeSet<String> {
        self.types
            .read()
            .map(|types| types.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Rediscover devices, updating every handle and announcing types not
    /// seen before. Types that vanished keep their handle with no devices.
    #[tracing::instrument(skip(self))]
    pub fn refresh(&self) -> Result<Vec<String>, Report<DriverError>> {
        let mut by_type = split_by_type(self.manager.discover()?);
        let mut types = self.types.write().map_err(|_| {
            Report::new(DriverError::Unavailable {
                message: "device registry poisoned".to_string(),
            })
        })?;

        for (dev_type, handle) in types.iter() {
            handle.replace_devices(by_type.remove(dev_type).unwrap_or_default());
        }

        let mut added = Vec::new();
        for (dev_type, devices) in by_type {
            info!(dev_type = %dev_type, devices = devices.len(), "new device type discovered");
            types.insert(
                dev_type.clone(),
                Arc::new(DeviceTypeHandle::new(dev_type.clone(), devices)),
            );
            if self.new_types.send(dev_type.clone()).is_err() {
                warn!(dev_type = %dev_type, "nobody is listening for new device types");
            }
            added.push(dev_type);
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::infrastructure::driver::inventory::tests::TWO_CARD_910;
    use crate::infrastructure::driver::InventoryDriver;
    use crate::infrastructure::driver::NpuDriver;

    fn registry() -> (
        Arc<InventoryDriver>,
        DeviceRegistry,
        mpsc::UnboundedReceiver<String>,
    ) {
        let driver = Arc::new(InventoryDriver::from_yaml(TWO_CARD_910).expect("should load"));
        let manager = Arc::new(ChipManager::detect(driver.clone()).expect("should detect"));
        let (registry, rx) = DeviceRegistry::discover(manager).expect("should discover");
        (driver, registry, rx)
    }

    #[test]
    fn discovery_splits_devices_by_type() {
        let (_driver, registry, _rx) = registry();
        assert_eq!(
            registry.device_types(),
            BTreeSet::from([
                "Ascend910".to_string(),
                "Ascend910-4c".to_string(),
                "Ascend910-8c".to_string(),
            ])
        );
        let physical = registry.handle("Ascend910").expect("should exist");
        assert_eq!(physical.devices().len(), 1);
        assert!(!physical.take_count_changed());
    }

    #[test]
    fn refresh_flags_changed_types_and_announces_new_ones() {
        let (driver, registry, mut rx) = registry();
        let logic = driver.get_logic_id(1).expect("should resolve");
        driver
            .create_virtual_device(logic, "vir02")
            .expect("should create");
        driver
            .create_virtual_device(logic, "vir04")
            .expect("should create");

        let added = registry.refresh().expect("should refresh");
        assert_eq!(added, vec!["Ascend910-2c".to_string()]);
        assert_eq!(rx.try_recv().ok(), Some("Ascend910-2c".to_string()));

        let four = registry.handle("Ascend910-4c").expect("should exist");
        assert!(four.take_count_changed(), "should flag the grown type");
        assert!(!four.take_count_changed(), "should clear the flag once read");
        assert_eq!(four.devices().len(), 2);

        let eight = registry.handle("Ascend910-8c").expect("should exist");
        assert!(!eight.take_count_changed(), "should leave unchanged types alone");
    }

    #[test]
    fn vanished_types_keep_an_empty_handle() {
        let (driver, registry, _rx) = registry();
        let logic = driver.get_logic_id(1).expect("should resolve");
        driver
            .destroy_virtual_device(logic, 100)
            .expect("should destroy");

        registry.refresh().expect("should refresh");
        let eight = registry.handle("Ascend910-8c").expect("should keep handle");
        assert!(eight.devices().is_empty());
        assert!(eight.take_count_changed());
    }
}
