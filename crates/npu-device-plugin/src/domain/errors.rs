use core::error::Error;

/// A device name that cannot be decoded with the naming scheme.
#[derive(Debug, derive_more::Display)]
pub enum IdentityFormatError {
    #[display("Malformed device name: {name}")]
    Malformed { name: String },
    #[display("Unknown chip family in device name: {name}")]
    UnknownFamily { name: String },
}

impl Error for IdentityFormatError {}

/// Errors for configuration: daemon arguments, the virtual device topology
/// and the kubelet checkpoint.
#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("Invalid argument {argument}: {message}")]
    InvalidArgument { argument: String, message: String },
    #[display("Malformed topology document: {message}")]
    MalformedTopology { message: String },
    #[display("Topology check code is 0, document ignored")]
    CheckCodeZero,
    #[display("Node {node_name} not found in topology document")]
    NodeNotFound { node_name: String },
    #[display("Failed to read checkpoint: {message}")]
    CheckpointUnreadable { message: String },
    #[display("Checkpoint corrupted: {message}")]
    CheckpointCorrupted { message: String },
}

impl Error for ConfigError {}

/// Reasons a kubelet `Allocate` call is rejected as a whole.
#[derive(Debug, derive_more::Display)]
pub enum AllocateError {
    #[display("Invalid allocate request: {message}")]
    InvalidRequest { message: String },
    #[display("Device {device_id} is not served by {device_type}")]
    UnknownDevice {
        device_id: String,
        device_type: String,
    },
    #[display("Failed to resolve device {device_id}")]
    ResolutionFailed { device_id: String },
    #[display("No pending pod matches the request: {message}")]
    NoPendingPod { message: String },
    #[display("Failed to publish free devices: {message}")]
    PublishFailed { message: String },
}

impl Error for AllocateError {}
