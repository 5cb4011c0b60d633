//! Engine Hub - Core Library
//! Provider session multiplexing and ring-buffer event pipelines for engine servers

// Public modules
pub mod core;
pub mod gateways;
pub mod pipeline;
pub mod server;
pub mod session;

// Re-exports
pub use core::{Config, Error, Result};
pub use server::ApplicationController;
