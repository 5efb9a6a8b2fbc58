//! Tarbox CLI - save container images to archives or stdout.

pub mod commands;
pub mod destination;
pub mod pipe;
