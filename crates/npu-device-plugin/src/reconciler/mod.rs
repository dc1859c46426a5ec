pub mod node_annotation;
pub mod pod_allocation;
pub mod vnpu;

pub use node_annotation::NodeAnnotationReconciler;
pub use pod_allocation::RealAllocationRepairer;
pub use vnpu::TopologySource;
pub use vnpu::VirtualDeviceReconciler;
