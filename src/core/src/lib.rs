//! Tarbox Core - Foundational Types and Abstractions
//!
//! Error types, configuration, save options and the export engine trait
//! shared by the runtime and the command line.

pub mod config;
pub mod engine;
pub mod error;
pub mod options;

// Re-export commonly used types
pub use config::{EngineConfig, StorageConfig, TarboxConfig};
pub use engine::ImageEngine;
pub use error::{Result, TarboxError};
pub use options::{ArchiveFormat, CompressionAlgorithm, SaveFlags, SaveOptions};

/// Tarbox version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
