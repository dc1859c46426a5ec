//! Vendor driver boundary.
//!
//! Everything the agent needs from the accelerator driver goes through
//! [`NpuDriver`]. The only implementation shipped here is the in-memory
//! [`InventoryDriver`].

pub mod inventory;

use core::error::Error;

use error_stack::Report;

pub use inventory::InventoryDriver;

/// Errors raised by the driver boundary.
#[derive(Debug, derive_more::Display)]
pub enum DriverError {
    #[display("Driver operation {operation} failed: {message}")]
    OperationFailed { operation: String, message: String },
    #[display("Device not found: {device}")]
    DeviceNotFound { device: String },
    #[display("Invalid driver response: {message}")]
    InvalidResponse { message: String },
    #[display("Driver unavailable: {message}")]
    Unavailable { message: String },
}

impl Error for DriverError {}

/// One existing virtual device on a physical card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDevice {
    pub vdev_id: u32,
    pub core_num: u32,
    /// Driver template the device was created from, if reported.
    pub template: Option<String>,
    pub container_id: u64,
    pub status: u32,
}

/// Virtual-device layout of one physical card.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualDeviceInfo {
    pub total_cores: u32,
    pub unused_cores: u32,
    pub vdevs: Vec<VirtualDevice>,
}

impl VirtualDeviceInfo {
    /// Allocated plus unused cores must add up to the card total.
    pub fn is_conserved(&self) -> bool {
        let used: u64 = self.vdevs.iter().map(|v| u64::from(v.core_num)).sum();
        used + u64::from(self.unused_cores) == u64::from(self.total_cores)
    }
}

/// Synchronous driver primitives, keyed by logic ID unless stated otherwise.
pub trait NpuDriver: Send + Sync {
    fn list_devices(&self) -> Result<Vec<u32>, Report<DriverError>>;

    fn get_phy_id(&self, logic_id: u32) -> Result<u32, Report<DriverError>>;

    fn get_logic_id(&self, phy_id: u32) -> Result<u32, Report<DriverError>>;

    fn get_device_health(&self, logic_id: u32) -> Result<u32, Report<DriverError>>;

    fn get_device_network_health(&self, logic_id: u32) -> Result<u32, Report<DriverError>>;

    fn get_vdevices_info(&self, logic_id: u32) -> Result<VirtualDeviceInfo, Report<DriverError>>;

    /// Create one virtual device from `template` and return its vDevID.
    fn create_virtual_device(
        &self,
        logic_id: u32,
        template: &str,
    ) -> Result<u32, Report<DriverError>>;

    fn destroy_virtual_device(&self, logic_id: u32, vdev_id: u32)
        -> Result<(), Report<DriverError>>;

    /// Diagnostic only.
    fn get_device_error_code(&self, logic_id: u32) -> Result<u64, Report<DriverError>>;

    fn get_device_ip(&self, logic_id: u32) -> Result<String, Report<DriverError>>;

    fn get_chip_name(&self, logic_id: u32) -> Result<String, Report<DriverError>>;
}

/// Core count encoded in a template name, e.g. `vir04_3c` -> 4.
pub fn template_core_count(template: &str) -> Option<u32> {
    let digits = template.strip_prefix("vir")?;
    let digits = digits.split('_').next()?;
    digits.parse().ok().filter(|n| *n > 0)
}
