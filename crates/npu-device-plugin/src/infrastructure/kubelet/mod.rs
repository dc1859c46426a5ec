//! Kubelet-owned interfaces: the device plugin protobuf API and the device
//! manager checkpoint.

pub mod checkpoint;

pub mod api {
    tonic::include_proto!("v1beta1");
}

pub use checkpoint::CheckpointEntry;
pub use checkpoint::CheckpointReader;

/// Env var carrying the visible device list handed to a container.
pub const ASCEND_VISIBLE_DEVICES: &str = "ASCEND_VISIBLE_DEVICES";
pub const ASCEND_RUNTIME_OPTIONS: &str = "ASCEND_RUNTIME_OPTIONS";
