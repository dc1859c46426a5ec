pub mod chip;
pub mod device;
pub mod errors;
pub mod state;
pub mod topology;
