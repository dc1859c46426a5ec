//! Application module
//!
//! Wires the configured collaborators together and owns the lifecycle of
//! the long-running tasks.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::ApplicationServices;
