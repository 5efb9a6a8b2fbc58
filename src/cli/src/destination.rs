//! Output destination negotiation for `save`.
//!
//! An explicit `--output` is used as is. Without one the archive goes to
//! stdout, which must not be a terminal, through a [`Conduit`].

use std::io::IsTerminal;
use std::path::Path;

use tarbox_core::error::{Result, TarboxError};
use tarbox_core::SaveOptions;

use crate::pipe::{ForwardSignal, PipeConduit};

/// A filesystem endpoint whose contents are relayed elsewhere.
pub trait Conduit: Send {
    /// Path the export engine writes to.
    fn path(&self) -> &Path;

    /// Tear down the endpoint and hand back the forwarder's completion
    /// signal. Does not wait for the forwarder.
    fn cleanup(self: Box<Self>) -> ForwardSignal;
}

/// The process's standard output, as seen by `save`.
pub trait StdoutTarget: Sync {
    /// Whether stdout is attached to an interactive terminal.
    fn is_terminal(&self) -> bool;

    /// Create a conduit relaying to stdout.
    fn acquire_conduit(&self) -> Result<Box<dyn Conduit>>;
}

/// The real stdout of this process.
pub struct ProcessStdout;

impl StdoutTarget for ProcessStdout {
    fn is_terminal(&self) -> bool {
        std::io::stdout().is_terminal()
    }

    fn acquire_conduit(&self) -> Result<Box<dyn Conduit>> {
        Ok(Box::new(PipeConduit::acquire()?))
    }
}

/// Options with a final output path, plus the conduit backing it if any.
pub struct ResolvedOutput {
    pub options: SaveOptions,
    pub conduit: Option<Box<dyn Conduit>>,
}

/// Settle where the archive is written.
///
/// Streaming to stdout forces quiet mode, since progress would interleave
/// with the archive bytes.
pub fn resolve_output(mut options: SaveOptions, stdout: &dyn StdoutTarget) -> Result<ResolvedOutput> {
    if !options.output.is_empty() {
        validate_file_name(&options.output)?;
        return Ok(ResolvedOutput {
            options,
            conduit: None,
        });
    }

    options.quiet = true;
    if stdout.is_terminal() {
        return Err(TarboxError::TerminalOutput);
    }

    let conduit = stdout.acquire_conduit()?;
    let path = conduit.path().to_string_lossy().into_owned();
    if let Err(e) = validate_file_name(&path) {
        // Nobody will write to it; release the forwarder
        drop(conduit.cleanup());
        return Err(e);
    }

    tracing::debug!(path = %path, "Streaming archive to stdout");
    options.output = path;
    Ok(ResolvedOutput {
        options,
        conduit: Some(conduit),
    })
}

/// Reject file names the export engine cannot take as a destination.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.contains(':') {
        return Err(TarboxError::Validation(format!(
            "invalid filename (should not contain ':') {name:?}"
        )));
    }
    Ok(())
}
