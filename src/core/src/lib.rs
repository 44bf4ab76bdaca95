//! Keel Core - Foundational Types and Abstractions
//!
//! This crate provides the types shared by the keel runtime and CLI:
//! the error taxonomy, the configuration model, and the on-disk layout
//! of the keel home directory.

pub mod config;
pub mod error;
pub mod paths;

// Re-export commonly used types
pub use config::{
    AgentConfig, AgentMode, AgentSettings, CheckpointSettings, Provider, RetentionSettings,
    SandboxMode, SandboxSettings, Settings,
};
pub use error::{KeelError, Result};
pub use paths::KeelPaths;

/// Keel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
