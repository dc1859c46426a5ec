pub mod annotation;
pub mod family;
pub mod manager;

pub use annotation::build_annotation_map;
pub use annotation::group_by_status;
pub use annotation::StatusGroups;
pub use family::ChipFamily;
pub use manager::ChipManager;
pub use manager::Inventory;
pub use manager::VisibleDevice;
