use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::plugin::PluginContext;
use crate::reconciler::VirtualDeviceReconciler;

/// Application dependencies
pub struct ApplicationServices {
    pub plugin_context: Arc<PluginContext>,
    /// Present only when virtual device management is enabled.
    pub vnpu_reconciler: Option<Arc<VirtualDeviceReconciler>>,
    /// Device types discovered after startup. Taken once by the supervisor.
    pub new_device_types: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl ApplicationServices {
    /// Hand the new-type channel to the supervisor. Fails on a second call.
    pub fn take_new_device_types(&self) -> Result<mpsc::UnboundedReceiver<String>> {
        self.new_device_types
            .lock()
            .map_err(|_| anyhow::anyhow!("device type channel poisoned"))?
            .take()
            .ok_or_else(|| anyhow::anyhow!("device plugin supervisor already started"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::chip::ChipManager;
    use crate::infrastructure::driver::inventory::tests::TWO_CARD_910;
    use crate::infrastructure::driver::InventoryDriver;
    use crate::plugin::DeviceRegistry;

    #[test]
    fn new_device_types_are_handed_out_once() {
        let driver = Arc::new(InventoryDriver::from_yaml(TWO_CARD_910).expect("should load"));
        let manager = Arc::new(ChipManager::detect(driver).expect("should detect"));
        let (registry, rx) = DeviceRegistry::discover(manager).expect("should discover");
        let services = ApplicationServices {
            plugin_context: Arc::new(PluginContext {
                registry: Arc::new(registry),
                list_watch_period: Duration::from_secs(5),
                use_ascend_docker: true,
                scheduler: None,
            }),
            vnpu_reconciler: None,
            new_device_types: Mutex::new(Some(rx)),
        };

        assert!(services.take_new_device_types().is_ok(), "should hand out the channel");
        assert!(
            services.take_new_device_types().is_err(),
            "should refuse a second supervisor"
        );
    }
}
