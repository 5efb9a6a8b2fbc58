//! Local archive export engine.
//!
//! Implements [`ImageEngine`] on top of the on-disk [`ImageStore`],
//! producing the four supported archive formats:
//!
//! ```text
//! oci-archive     tar { oci-layout, index.json, blobs/sha256/* }
//! oci-dir         <dir>/{ oci-layout, index.json, blobs/sha256/* }
//! docker-archive  tar { manifest.json, <config>.json, <diff-id>.tar ... }
//! docker-dir      <dir>/{ version, manifest.json, <digest> ... }
//! ```
//!
//! Archive formats are written strictly sequentially so the destination
//! may be a FIFO.

mod docker;
mod oci;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tarbox_core::error::{Result, TarboxError};
use tarbox_core::{ArchiveFormat, CompressionAlgorithm, ImageEngine, SaveOptions};

use crate::oci::compress::{self, DigestWriter};
use crate::oci::{ImageStore, LayerBlob, OciImage};

/// An image resolved from the store, with the names it is exported under.
pub(crate) struct ExportImage {
    pub image: OciImage,
    pub names: Vec<String>,
}

/// Layer compression applied when writing directory formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LayerCompression {
    pub algorithm: CompressionAlgorithm,
    pub level: i32,
}

/// A layer as written to the destination.
#[derive(Debug, Clone)]
pub(crate) struct WrittenLayer {
    pub digest: String,
    pub size: u64,
    /// Compression of the written blob, `None` when uncompressed
    pub compression: Option<CompressionAlgorithm>,
    /// Whether the blob differs from the source blob
    pub rewritten: bool,
}

/// Progress reporter writing to stderr; stdout may carry archive bytes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Progress {
    quiet: bool,
}

impl Progress {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    pub fn report(&self, message: impl AsRef<str>) {
        if !self.quiet {
            eprintln!("{}", message.as_ref());
        }
    }
}

/// Export engine backed by the local image store.
///
/// The store is opened on first use, so constructing the engine touches
/// nothing on disk.
pub struct LocalImageEngine {
    store_dir: PathBuf,
    store: OnceCell<Arc<ImageStore>>,
}

impl LocalImageEngine {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            store: OnceCell::new(),
        }
    }

    /// Engine over an already opened store.
    pub fn with_store(store: Arc<ImageStore>) -> Self {
        Self {
            store_dir: store.store_dir().to_path_buf(),
            store: OnceCell::new_with(Some(store)),
        }
    }

    async fn store(&self) -> Result<&Arc<ImageStore>> {
        self.store
            .get_or_try_init(|| async {
                tracing::debug!(dir = %self.store_dir.display(), "Opening image store");
                ImageStore::new(&self.store_dir).map(Arc::new)
            })
            .await
    }

    /// Resolve the arguments of a save call into the images to export.
    async fn resolve_images(
        &self,
        name_or_id: &str,
        tags: &[String],
        options: &SaveOptions,
    ) -> Result<Vec<(PathBuf, Vec<String>)>> {
        if options.multi_image_archive {
            if options.format != ArchiveFormat::DockerArchive {
                return Err(TarboxError::Validation(format!(
                    "multi-image archives are only supported in the docker-archive format, not {}",
                    options.format
                )));
            }
            let store = self.store().await?;
            let mut resolved = Vec::with_capacity(tags.len() + 1);
            for name in std::iter::once(name_or_id).chain(tags.iter().map(String::as_str)) {
                let stored = store.resolve(name).await?;
                resolved.push((stored.path, export_names(&stored.reference, &[])));
            }
            return Ok(resolved);
        }

        if !tags.is_empty() && options.format != ArchiveFormat::DockerArchive {
            tracing::warn!(
                format = %options.format,
                "Additional tags are only recorded in docker-archive, ignoring"
            );
        }
        let stored = self.store().await?.resolve(name_or_id).await?;
        Ok(vec![(stored.path, export_names(&stored.reference, tags))])
    }
}

#[async_trait]
impl ImageEngine for LocalImageEngine {
    async fn save(&self, name_or_id: &str, tags: &[String], options: &SaveOptions) -> Result<()> {
        if options.output.is_empty() {
            return Err(TarboxError::Validation(
                "no output destination given to export engine".to_string(),
            ));
        }

        let compression = layer_compression(options)?;
        let resolved = self.resolve_images(name_or_id, tags, options).await?;
        let options = options.clone();

        tracing::debug!(
            image = name_or_id,
            format = %options.format,
            output = %options.output,
            images = resolved.len(),
            "Exporting images"
        );

        tokio::task::spawn_blocking(move || {
            let images = resolved
                .into_iter()
                .map(|(path, names)| {
                    Ok(ExportImage {
                        image: OciImage::from_path(&path)?,
                        names,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            write_export(&images, &options, compression)
        })
        .await
        .map_err(|e| TarboxError::Export(format!("Export task failed: {e}")))?
    }
}

/// Names an image is exported under: its stored reference plus any tags.
fn export_names(reference: &str, tags: &[String]) -> Vec<String> {
    let mut names = vec![reference.to_string()];
    for tag in tags {
        let tag = normalize_tag(tag);
        if !names.contains(&tag) {
            names.push(tag);
        }
    }
    names
}

/// Append `:latest` to a name without a tag.
fn normalize_tag(name: &str) -> String {
    let last = name.rsplit('/').next().unwrap_or(name);
    if last.contains(':') || name.contains('@') {
        name.to_string()
    } else {
        format!("{name}:latest")
    }
}

/// Compression settings for directory formats, checked up front.
fn layer_compression(options: &SaveOptions) -> Result<Option<LayerCompression>> {
    if !options.compress {
        if options.compression_algorithm.is_some() || options.compression_level.is_some() {
            tracing::debug!("Compression settings given without --compress, layers kept as is");
        }
        return Ok(None);
    }

    let algorithm = options.effective_algorithm();
    if options.format == ArchiveFormat::DockerDir && algorithm != CompressionAlgorithm::Gzip {
        return Err(TarboxError::Validation(format!(
            "docker-dir only supports gzip layer compression, not {algorithm}"
        )));
    }
    let level = compress::resolve_level(algorithm, options.compression_level)?;
    Ok(Some(LayerCompression { algorithm, level }))
}

fn write_export(
    images: &[ExportImage],
    options: &SaveOptions,
    compression: Option<LayerCompression>,
) -> Result<()> {
    let progress = Progress::new(options.quiet);
    let output = Path::new(&options.output);

    match options.format {
        ArchiveFormat::OciArchive => {
            let out = open_archive(output)?;
            oci::write_archive(&images[0], out, progress)
        }
        ArchiveFormat::DockerArchive => {
            let out = open_archive(output)?;
            docker::write_archive(images, out, progress)
        }
        ArchiveFormat::OciDir => {
            prepare_dir(output)?;
            oci::write_dir(&images[0], output, compression, progress)
        }
        ArchiveFormat::DockerDir => {
            docker::check_dir_layers(&images[0].image, compression)?;
            prepare_dir(output)?;
            docker::write_dir(&images[0], output, compression, progress)
        }
    }
}

/// Open an archive destination for sequential writing.
fn open_archive(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| TarboxError::Export(format!("Failed to create {}: {e}", path.display())))
}

/// Create a directory destination, refusing an existing non-directory.
fn prepare_dir(path: &Path) -> Result<()> {
    if path.exists() && !path.is_dir() {
        return Err(TarboxError::Export(format!(
            "{} exists and is not a directory",
            path.display()
        )));
    }
    std::fs::create_dir_all(path)
        .map_err(|e| TarboxError::Export(format!("Failed to create {}: {e}", path.display())))
}

/// Append an in-memory file to a tar stream.
pub(crate) fn append_bytes<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<()> {
    append_reader(builder, name, data.len() as u64, data)
}

/// Append `size` bytes from `reader` to a tar stream under `name`.
pub(crate) fn append_reader<W: Write, R: Read>(
    builder: &mut tar::Builder<W>,
    name: &str,
    size: u64,
    reader: R,
) -> Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    builder
        .append_data(&mut header, name, reader)
        .map_err(|e| TarboxError::Export(format!("Failed to write {name} to archive: {e}")))
}

/// Copy or recompress layers into a directory destination.
///
/// `dest_for` maps a digest hex to the blob's destination path. Layers that
/// are already compressed are copied unchanged.
pub(crate) fn write_layers(
    layers: &[LayerBlob],
    compression: Option<LayerCompression>,
    progress: Progress,
    dest_for: impl Fn(&str) -> PathBuf,
) -> Result<Vec<WrittenLayer>> {
    let mut written = Vec::with_capacity(layers.len());
    for layer in layers {
        progress.report(format!("Copying blob {}", short_digest(&layer.digest)));
        let source_compression = compress::detect_file(&layer.path)?;

        match (compression, source_compression) {
            (Some(target), None) => {
                let tmp_path = dest_for("layer.tmp");
                let file = File::create(&tmp_path)?;
                let mut source = File::open(&layer.path)?;
                let writer = compress::compress(
                    &mut source,
                    DigestWriter::new(file),
                    target.algorithm,
                    target.level,
                )?;
                let (file, digest, size) = writer.finish();
                file.sync_all()?;
                drop(file);
                std::fs::rename(&tmp_path, dest_for(digest_hex(&digest)))?;
                tracing::debug!(
                    from = %layer.digest,
                    to = %digest,
                    algorithm = %target.algorithm,
                    "Compressed layer"
                );
                written.push(WrittenLayer {
                    digest,
                    size,
                    compression: Some(target.algorithm),
                    rewritten: true,
                });
            }
            (_, existing) => {
                std::fs::copy(&layer.path, dest_for(digest_hex(&layer.digest)))?;
                written.push(WrittenLayer {
                    digest: layer.digest.clone(),
                    size: layer.size,
                    compression: existing,
                    rewritten: false,
                });
            }
        }
    }
    Ok(written)
}

/// Decompress a layer into an anonymous temp file, returning it with its
/// uncompressed digest (diff ID) and size.
pub(crate) fn decompress_layer(layer: &LayerBlob) -> Result<(File, String, u64)> {
    let mut reader = compress::open_decompressed(&layer.path)?;
    let mut writer = DigestWriter::new(tempfile::tempfile()?);
    io::copy(&mut reader, &mut writer)?;
    let (mut file, diff_id, size) = writer.finish();
    io::Seek::rewind(&mut file)?;
    Ok((file, diff_id, size))
}

pub(crate) fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}

pub(crate) fn short_digest(digest: &str) -> &str {
    let hex = digest_hex(digest);
    &hex[..hex.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::image::tests::create_test_image;
    use tempfile::TempDir;

    fn options(format: ArchiveFormat, output: &Path) -> SaveOptions {
        SaveOptions {
            format,
            output: output.to_string_lossy().to_string(),
            compress: false,
            compression_algorithm: None,
            compression_level: None,
            quiet: true,
            multi_image_archive: false,
        }
    }

    async fn engine_with_images(tmp: &TempDir) -> LocalImageEngine {
        let store = ImageStore::new(&tmp.path().join("store")).unwrap();
        for (reference, dir) in [("docker.io/library/alpine:latest", "a"), ("busybox:1.36", "b")] {
            let source = tmp.path().join(dir);
            let digest = create_test_image(&source);
            // Distinct store entries for the two references
            let digest = format!("{digest}{dir}");
            store.put(reference, &digest, &source).await.unwrap();
        }
        LocalImageEngine::with_store(Arc::new(store))
    }

    fn archive_entries(path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_normalize_tag() {
        assert_eq!(normalize_tag("alpine"), "alpine:latest");
        assert_eq!(normalize_tag("alpine:3.18"), "alpine:3.18");
        assert_eq!(normalize_tag("localhost:5000/app"), "localhost:5000/app:latest");
        assert_eq!(normalize_tag("app@sha256:abc"), "app@sha256:abc");
    }

    #[test]
    fn test_export_names_dedupes_tags() {
        let names = export_names(
            "docker.io/library/alpine:latest",
            &["docker.io/library/alpine".to_string(), "mine/alpine".to_string()],
        );
        assert_eq!(
            names,
            vec!["docker.io/library/alpine:latest", "mine/alpine:latest"]
        );
    }

    #[test]
    fn test_layer_compression_rules() {
        let out = Path::new("out");
        assert_eq!(layer_compression(&options(ArchiveFormat::OciDir, out)).unwrap(), None);

        let mut opts = options(ArchiveFormat::OciDir, out);
        opts.compress = true;
        opts.compression_algorithm = Some(CompressionAlgorithm::Zstd);
        opts.compression_level = Some(19);
        assert_eq!(
            layer_compression(&opts).unwrap(),
            Some(LayerCompression {
                algorithm: CompressionAlgorithm::Zstd,
                level: 19
            })
        );

        opts.format = ArchiveFormat::DockerDir;
        assert!(layer_compression(&opts).is_err());

        opts.compression_algorithm = None;
        opts.compression_level = Some(42);
        assert!(layer_compression(&opts)
            .unwrap_err()
            .to_string()
            .contains("out of range"));
    }

    #[tokio::test]
    async fn test_save_requires_output() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_with_images(&tmp).await;
        let mut opts = options(ArchiveFormat::DockerArchive, Path::new(""));
        opts.output.clear();
        assert!(engine.save("busybox:1.36", &[], &opts).await.is_err());
    }

    #[tokio::test]
    async fn test_store_opened_lazily() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let engine = LocalImageEngine::new(&store_dir);
        assert!(!store_dir.exists());

        let err = engine
            .save("alpine", &[], &options(ArchiveFormat::DockerArchive, &tmp.path().join("x.tar")))
            .await
            .unwrap_err();
        assert!(matches!(err, TarboxError::ImageNotFound(_)));
        assert!(store_dir.exists());
    }

    #[tokio::test]
    async fn test_save_unknown_image() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_with_images(&tmp).await;
        let out = tmp.path().join("out.tar");
        let err = engine
            .save("nginx", &[], &options(ArchiveFormat::OciArchive, &out))
            .await
            .unwrap_err();
        assert!(matches!(err, TarboxError::ImageNotFound(_)));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_save_oci_archive() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_with_images(&tmp).await;
        let out = tmp.path().join("alpine.tar");

        engine
            .save("alpine", &[], &options(ArchiveFormat::OciArchive, &out))
            .await
            .unwrap();

        let entries = archive_entries(&out);
        assert_eq!(entries[0], "oci-layout");
        assert_eq!(entries[1], "index.json");
        assert_eq!(entries.iter().filter(|e| e.starts_with("blobs/sha256/")).count(), 4);
    }

    #[tokio::test]
    async fn test_save_docker_archive() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_with_images(&tmp).await;
        let out = tmp.path().join("busybox.tar");

        engine
            .save(
                "busybox:1.36",
                &["mirror/busybox".to_string()],
                &options(ArchiveFormat::DockerArchive, &out),
            )
            .await
            .unwrap();

        let entries = archive_entries(&out);
        assert!(entries.contains(&"manifest.json".to_string()));
        assert_eq!(entries.iter().filter(|e| e.ends_with(".tar")).count(), 2);
    }

    #[tokio::test]
    async fn test_multi_image_requires_docker_archive() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_with_images(&tmp).await;
        let mut opts = options(ArchiveFormat::OciArchive, &tmp.path().join("x.tar"));
        opts.multi_image_archive = true;

        let err = engine
            .save("alpine", &["busybox:1.36".to_string()], &opts)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("only supported in the docker-archive"));
    }

    #[tokio::test]
    async fn test_docker_dir_unsupported_layer_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("z");
        let digest = create_test_image(&source);

        // Swap the gzip layer for zstd data under the same blob name
        let image = OciImage::from_path(&source).unwrap();
        let layer = &image.layers()[1];
        let mut plain = Vec::new();
        compress::open_decompressed(&layer.path)
            .unwrap()
            .read_to_end(&mut plain)
            .unwrap();
        std::fs::write(&layer.path, zstd::encode_all(plain.as_slice(), 3).unwrap()).unwrap();

        let store = ImageStore::new(&tmp.path().join("store")).unwrap();
        store.put("zimage:1", &digest, &source).await.unwrap();
        let engine = LocalImageEngine::with_store(Arc::new(store));

        let out = tmp.path().join("zimage-dir");
        let err = engine
            .save("zimage:1", &[], &options(ArchiveFormat::DockerDir, &out))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not supported"));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_directory_format_refuses_existing_file() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_with_images(&tmp).await;
        let out = tmp.path().join("not-a-dir");
        std::fs::write(&out, b"").unwrap();

        let err = engine
            .save("alpine", &[], &options(ArchiveFormat::OciDir, &out))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("is not a directory"));
    }
}
