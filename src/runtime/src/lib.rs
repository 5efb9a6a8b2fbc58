//! Tarbox Runtime - local image store and archive export engine.
//!
//! This crate provides the concrete [`ImageEngine`](tarbox_core::ImageEngine)
//! used by the command line: images are read from an on-disk OCI image
//! store and written out as OCI or Docker archives and directories.

pub mod export;
pub mod oci;

// Re-export common types
pub use export::LocalImageEngine;
pub use oci::{ImageStore, LayerBlob, OciImage, StoredImage};

/// Tarbox Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
