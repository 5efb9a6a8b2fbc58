//! Named pipe conduit bridging a file-writing export to stdout.
//!
//! The export engine only knows how to write to a path. When the archive
//! has to go to stdout, a FIFO is created in a private temporary directory
//! and a forwarder thread copies everything written into it onward.
//!
//! ```text
//!   engine ──write──▶ $TMP/tarbox-save-XXXX/saveio ──forwarder──▶ stdout
//!                                                     │
//!                                   oneshot<io::Result<u64>> ◀┘
//! ```
//!
//! The forwarder is a detached OS thread rather than a runtime task: it may
//! sit blocked in `open(2)` waiting for a writer that never arrives (export
//! failed before opening its output), and must not hold up process exit.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tarbox_core::error::{Result, TarboxError};
use tempfile::TempDir;
use tokio::sync::oneshot;

use crate::destination::Conduit;

/// File name of the FIFO inside the conduit directory.
const PIPE_NAME: &str = "saveio";

/// Completion signal of a forwarder.
///
/// Resolves once the forwarder has relayed everything written to the pipe,
/// or failed doing so. Dropping it abandons the forwarder.
pub struct ForwardSignal {
    done: oneshot::Receiver<io::Result<u64>>,
}

impl ForwardSignal {
    pub fn new(done: oneshot::Receiver<io::Result<u64>>) -> Self {
        Self { done }
    }

    /// Wait for the forwarder to finish.
    pub async fn wait(self) -> Result<()> {
        match self.done.await {
            Ok(Ok(bytes)) => {
                tracing::debug!(bytes, "Forwarded archive to stdout");
                Ok(())
            }
            Ok(Err(e)) => Err(TarboxError::Forward(e.to_string())),
            Err(_) => Err(TarboxError::Forward(
                "forwarder exited without reporting".to_string(),
            )),
        }
    }
}

/// A FIFO whose contents are relayed to a sink by a background thread.
pub struct PipeConduit {
    dir: TempDir,
    path: PathBuf,
    done: oneshot::Receiver<io::Result<u64>>,
}

impl PipeConduit {
    /// Create a conduit forwarding to the process's stdout.
    pub fn acquire() -> Result<Self> {
        Self::acquire_with(io::stdout())
    }

    /// Create a conduit forwarding to `sink`.
    ///
    /// The forwarder is running when this returns, so a writer opening
    /// [`path`](Self::path) will not block indefinitely.
    pub fn acquire_with<W: Write + Send + 'static>(mut sink: W) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("tarbox-save-")
            .tempdir()
            .map_err(|e| TarboxError::conduit("Failed to create pipe directory", e))?;
        let path = dir.path().join(PIPE_NAME);
        mkfifo(&path)?;

        let (tx, done) = oneshot::channel();
        let fifo = path.clone();
        std::thread::Builder::new()
            .name("save-forwarder".to_string())
            .spawn(move || {
                let result = forward(&fifo, &mut sink);
                if let Err(e) = &result {
                    tracing::debug!(error = %e, "Forwarder failed");
                }
                let _ = tx.send(result);
            })
            .map_err(|e| TarboxError::conduit("Failed to start pipe forwarder", e))?;

        tracing::debug!(path = %path.display(), "Created stdout pipe");
        Ok(Self { dir, path, done })
    }
}

impl Conduit for PipeConduit {
    fn path(&self) -> &Path {
        &self.path
    }

    fn cleanup(self: Box<Self>) -> ForwardSignal {
        let Self { dir, path, done } = *self;

        release_waiting_reader(&path);
        let dir_path = dir.path().to_path_buf();
        if let Err(e) = dir.close() {
            tracing::warn!(
                dir = %dir_path.display(),
                error = %e,
                "Failed to remove pipe directory"
            );
        }

        ForwardSignal::new(done)
    }
}

/// Copy everything written into the FIFO to `sink`.
fn forward<W: Write>(fifo: &Path, sink: &mut W) -> io::Result<u64> {
    // Blocks until a writer opens the other end
    let mut pipe = File::open(fifo)?;
    let copied = io::copy(&mut pipe, sink)?;
    sink.flush()?;
    Ok(copied)
}

/// Unblock a forwarder stuck in `open(2)` because no writer ever came.
///
/// Opening the write end non-blocking succeeds only while a reader is
/// present; closing it straight away hands the reader an EOF. With no
/// reader the open fails with ENXIO. Returns whether a reader was there.
fn release_waiting_reader(fifo: &Path) -> bool {
    match OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(fifo)
    {
        Ok(_) => {
            tracing::trace!("Released pipe reader");
            true
        }
        Err(e) => {
            tracing::trace!(error = %e, "No pipe reader to release");
            false
        }
    }
}

fn mkfifo(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| {
        TarboxError::conduit(
            "Invalid pipe path",
            io::Error::new(io::ErrorKind::InvalidInput, e),
        )
    })?;

    // SAFETY: c_path is a valid NUL-terminated string for the call's duration.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(TarboxError::conduit(
            "Failed to create named pipe",
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}
