//! Image export engine abstraction.

use async_trait::async_trait;

use crate::error::Result;
use crate::options::SaveOptions;

/// Writes images to an archive.
///
/// `options.output` is always a non-empty path when `save` is called. It may
/// name a FIFO, so implementations must write archive formats sequentially
/// and must not seek or reopen the destination.
#[async_trait]
pub trait ImageEngine: Send + Sync {
    /// Export `name_or_id` (plus `tags`) according to `options`.
    ///
    /// With `options.multi_image_archive` set, `tags` are additional images
    /// rather than additional names for the first one.
    async fn save(&self, name_or_id: &str, tags: &[String], options: &SaveOptions) -> Result<()>;
}
