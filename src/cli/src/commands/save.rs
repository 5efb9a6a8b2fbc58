//! `tarbox save` command — Save one or more images to an archive.
//!
//! Writes to `--output` when given. Otherwise the archive is streamed to
//! stdout through a named pipe, which requires stdout to be redirected.

use clap::Args;
use tarbox_core::error::Result;
use tarbox_core::{ImageEngine, SaveFlags, TarboxConfig, TarboxError};

use crate::destination::{resolve_output, ProcessStdout, StdoutTarget};

#[derive(Args, Debug, Clone)]
pub struct SaveArgs {
    /// Image to save, followed by additional tags (or images with -m)
    #[arg(required = true, value_name = "IMAGE")]
    pub images: Vec<String>,

    /// Compress tarball image layers when saving to a directory using the
    /// 'dir' transport
    #[arg(long)]
    pub compress: bool,

    /// Compress tarball layers with this algorithm. Valid algs are bzip2,
    /// gzip, xz, zstd
    #[arg(long, value_name = "ALG")]
    pub compression_alg: Option<String>,

    /// Algorithm specific compression level to use
    #[arg(long, value_name = "LEVEL", allow_negative_numbers = true)]
    pub compression_level: Option<i32>,

    /// Save image to oci-archive, oci-dir (directory with oci manifest
    /// type), docker-archive, docker-dir (directory with v2s2 manifest type)
    #[arg(long, default_value = "docker-archive")]
    pub format: String,

    /// Write to a specified file (default: stdout, which must be redirected)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<String>,

    /// Suppress the output
    #[arg(short, long)]
    pub quiet: bool,

    /// Interpret additional arguments as images not tags and create a
    /// multi-image-archive (only for docker-archive)
    #[arg(
        short,
        long,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_name = "BOOL"
    )]
    pub multi_image_archive: Option<bool>,
}

impl SaveArgs {
    /// Raw flag state, with unset flags taken from `config`.
    pub fn flags(&self, config: &TarboxConfig) -> SaveFlags {
        SaveFlags {
            format: self.format.clone(),
            output: self.output.clone().unwrap_or_default(),
            compress: self.compress,
            compression_alg: self.compression_alg.clone(),
            compression_level: self.compression_level,
            quiet: self.quiet,
            multi_image_archive: self
                .multi_image_archive
                .unwrap_or(config.engine.multi_image_archive),
        }
    }
}

pub async fn execute(
    args: SaveArgs,
    config: &TarboxConfig,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let engine = super::open_engine(config);
    let flags = args.flags(config);
    save(&engine, &ProcessStdout, &args.images, flags).await?;
    Ok(())
}

/// Validate `flags`, settle the destination and run the export.
///
/// When streaming through a conduit, the conduit is always cleaned up. The
/// forwarder is only awaited after a successful export, so an export error
/// is never replaced by the broken pipe it causes downstream.
pub async fn save(
    engine: &dyn ImageEngine,
    stdout: &dyn StdoutTarget,
    images: &[String],
    flags: SaveFlags,
) -> Result<()> {
    let options = flags.validate()?;
    let Some((name_or_id, tags)) = images.split_first() else {
        return Err(TarboxError::Validation(
            "at least one image name or ID must be specified".to_string(),
        ));
    };

    let resolved = resolve_output(options, stdout)?;
    let options = resolved.options;

    tracing::debug!(
        image = %name_or_id,
        tags = tags.len(),
        format = %options.format,
        output = %options.output,
        "Saving image"
    );
    let exported = engine.save(name_or_id, tags, &options).await;

    let Some(conduit) = resolved.conduit else {
        return exported;
    };
    let signal = conduit.cleanup();
    match exported {
        Ok(()) => signal.wait().await,
        Err(e) => {
            tracing::debug!(error = %e, "Export failed, not waiting for forwarder");
            Err(e)
        }
    }
}
