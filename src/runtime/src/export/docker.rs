//! Docker image exports (`docker-archive`, `docker-dir`).

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tarbox_core::error::{Result, TarboxError};
use tarbox_core::CompressionAlgorithm;

use super::{
    append_bytes, append_reader, decompress_layer, digest_hex, short_digest, write_layers,
    ExportImage, LayerCompression, Progress,
};
use crate::oci::compress;
use crate::oci::OciImage;

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar";
const DIR_VERSION: &[u8] = b"Directory Transport Version: 1.1\n";

/// One entry of a docker-archive `manifest.json`.
#[derive(Debug, Serialize)]
struct ArchiveManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Write one or more images as a `docker save` compatible tar stream.
///
/// Layers are stored uncompressed and named by their diff ID; blobs shared
/// between images are written once.
pub(crate) fn write_archive<W: Write>(
    images: &[ExportImage],
    out: W,
    progress: Progress,
) -> Result<()> {
    let mut builder = tar::Builder::new(out);
    let mut written: HashSet<String> = HashSet::new();
    let mut entries = Vec::with_capacity(images.len());

    for export in images {
        let image = &export.image;
        let mut layer_names = Vec::with_capacity(image.layers().len());

        for layer in image.layers() {
            progress.report(format!("Copying blob {}", short_digest(&layer.digest)));
            let (file, diff_id, size) = decompress_layer(layer)?;
            let name = format!("{}.tar", digest_hex(&diff_id));
            if written.insert(name.clone()) {
                append_reader(&mut builder, &name, size, file)?;
            }
            layer_names.push(name);
        }

        progress.report(format!("Copying config {}", short_digest(image.config_digest())));
        let config_name = format!("{}.json", digest_hex(image.config_digest()));
        if written.insert(config_name.clone()) {
            append_bytes(&mut builder, &config_name, image.config_bytes())?;
        }

        entries.push(ArchiveManifestEntry {
            config: config_name,
            repo_tags: export
                .names
                .iter()
                .filter(|name| !name.contains('@'))
                .cloned()
                .collect(),
            layers: layer_names,
        });
    }

    progress.report("Writing manifest to image destination");
    append_bytes(&mut builder, "manifest.json", &serde_json::to_vec(&entries)?)?;

    let mut out = builder
        .into_inner()
        .map_err(|e| TarboxError::Export(format!("Failed to finalize archive: {e}")))?;
    out.flush()?;
    Ok(())
}

/// Write the image as a Docker v2s2 directory (`version`, `manifest.json`,
/// and blobs named by digest hex).
pub(crate) fn write_dir(
    export: &ExportImage,
    dir: &Path,
    compression: Option<LayerCompression>,
    progress: Progress,
) -> Result<()> {
    let image = &export.image;
    std::fs::write(dir.join("version"), DIR_VERSION)?;

    let written = write_layers(image.layers(), compression, progress, |hex| dir.join(hex))?;

    progress.report(format!("Copying config {}", short_digest(image.config_digest())));
    std::fs::write(
        dir.join(digest_hex(image.config_digest())),
        image.config_bytes(),
    )?;

    let layers = written
        .iter()
        .map(|layer| {
            Ok(serde_json::json!({
                "mediaType": layer_media_type(layer.compression)?,
                "size": layer.size,
                "digest": layer.digest,
            }))
        })
        .collect::<Result<Vec<_>>>()?;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_MEDIA_TYPE,
        "config": {
            "mediaType": CONFIG_MEDIA_TYPE,
            "size": image.config_bytes().len(),
            "digest": image.config_digest(),
        },
        "layers": layers,
    });

    progress.report("Writing manifest to image destination");
    std::fs::write(
        dir.join("manifest.json"),
        serde_json::to_vec_pretty(&manifest)?,
    )?;
    Ok(())
}

/// Fail unless every layer of `image` will be representable in a v2s2
/// manifest once `compression` is applied.
pub(crate) fn check_dir_layers(
    image: &OciImage,
    compression: Option<LayerCompression>,
) -> Result<()> {
    for layer in image.layers() {
        let written = match (compression, compress::detect_file(&layer.path)?) {
            (Some(target), None) => Some(target.algorithm),
            (_, existing) => existing,
        };
        layer_media_type(written).map_err(|_| {
            TarboxError::Export(format!(
                "docker-dir cannot carry layer {}: {} compressed layers are not supported",
                short_digest(&layer.digest),
                written.map(|alg| alg.as_str()).unwrap_or("uncompressed")
            ))
        })?;
    }
    Ok(())
}

/// Docker v2s2 media type for a layer; only gzip is representable.
fn layer_media_type(compression: Option<CompressionAlgorithm>) -> Result<String> {
    match compression {
        None => Ok(LAYER_MEDIA_TYPE.to_string()),
        Some(CompressionAlgorithm::Gzip) => Ok(format!("{LAYER_MEDIA_TYPE}.gzip")),
        Some(other) => Err(TarboxError::Export(format!(
            "docker-dir cannot carry {other} compressed layers"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::image::tests::create_test_image;
    use std::io::Read;
    use tempfile::TempDir;

    fn export_image(tmp: &TempDir, dir: &str, names: &[&str]) -> ExportImage {
        let src = tmp.path().join(dir);
        create_test_image(&src);
        ExportImage {
            image: OciImage::from_path(&src).unwrap(),
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn read_entries(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut archive = tar::Archive::new(bytes);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().to_string();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (name, data)
            })
            .collect()
    }

    #[test]
    fn test_archive_manifest_lists_tags_and_layers() {
        let tmp = TempDir::new().unwrap();
        let export = export_image(&tmp, "a", &["alpine:latest", "mirror/alpine:latest"]);

        let mut bytes = Vec::new();
        write_archive(&[export], &mut bytes, Progress::new(true)).unwrap();

        let entries = read_entries(&bytes);
        let (_, manifest) = entries.iter().find(|(n, _)| n == "manifest.json").unwrap();
        let manifest: serde_json::Value = serde_json::from_slice(manifest).unwrap();

        assert_eq!(manifest.as_array().unwrap().len(), 1);
        assert_eq!(
            manifest[0]["RepoTags"],
            serde_json::json!(["alpine:latest", "mirror/alpine:latest"])
        );
        let layers = manifest[0]["Layers"].as_array().unwrap();
        assert_eq!(layers.len(), 2);

        // Every referenced layer is an uncompressed tar present in the archive
        for layer in layers {
            let name = layer.as_str().unwrap();
            let (_, data) = entries.iter().find(|(n, _)| n == name).unwrap();
            let mut inner = tar::Archive::new(data.as_slice());
            assert!(inner.entries().unwrap().count() > 0);
        }
    }

    #[test]
    fn test_multi_image_archive_dedupes_shared_blobs() {
        let tmp = TempDir::new().unwrap();
        let first = export_image(&tmp, "a", &["alpine:latest"]);
        let second = export_image(&tmp, "b", &["busybox:1.36"]);

        let mut bytes = Vec::new();
        write_archive(&[first, second], &mut bytes, Progress::new(true)).unwrap();

        let entries = read_entries(&bytes);
        let (_, manifest) = entries.iter().find(|(n, _)| n == "manifest.json").unwrap();
        let manifest: serde_json::Value = serde_json::from_slice(manifest).unwrap();
        assert_eq!(manifest.as_array().unwrap().len(), 2);
        assert_eq!(manifest[1]["RepoTags"], serde_json::json!(["busybox:1.36"]));

        // Identical images share two layers and a config
        assert_eq!(entries.len(), 4);
    }

    #[test]
    fn test_dir_layout() {
        let tmp = TempDir::new().unwrap();
        let export = export_image(&tmp, "a", &["alpine:latest"]);
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();

        write_dir(&export, &out, None, Progress::new(true)).unwrap();

        assert_eq!(std::fs::read(out.join("version")).unwrap(), DIR_VERSION);
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest["mediaType"], MANIFEST_MEDIA_TYPE);
        assert_eq!(manifest["layers"][0]["mediaType"], LAYER_MEDIA_TYPE);
        assert_eq!(
            manifest["layers"][1]["mediaType"],
            "application/vnd.docker.image.rootfs.diff.tar.gzip"
        );
        for layer in export.image.layers() {
            assert!(out.join(digest_hex(&layer.digest)).exists());
        }
    }

    #[test]
    fn test_dir_with_gzip_compression() {
        let tmp = TempDir::new().unwrap();
        let export = export_image(&tmp, "a", &["alpine:latest"]);
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();

        let compression = LayerCompression {
            algorithm: CompressionAlgorithm::Gzip,
            level: 9,
        };
        write_dir(&export, &out, Some(compression), Progress::new(true)).unwrap();

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("manifest.json")).unwrap()).unwrap();
        for layer in manifest["layers"].as_array().unwrap() {
            assert_eq!(
                layer["mediaType"],
                "application/vnd.docker.image.rootfs.diff.tar.gzip"
            );
            let digest = layer["digest"].as_str().unwrap();
            assert!(out.join(digest_hex(digest)).exists());
        }
    }

    /// Replace the gzip layer of an exported test image with zstd data.
    fn recompress_second_layer_zstd(export: &ExportImage) {
        let layer = &export.image.layers()[1];
        let mut plain = Vec::new();
        compress::open_decompressed(&layer.path)
            .unwrap()
            .read_to_end(&mut plain)
            .unwrap();
        let zstd = zstd::encode_all(plain.as_slice(), 3).unwrap();
        std::fs::write(&layer.path, zstd).unwrap();
    }

    #[test]
    fn test_check_dir_layers() {
        let tmp = TempDir::new().unwrap();
        let export = export_image(&tmp, "a", &["alpine:latest"]);
        assert!(check_dir_layers(&export.image, None).is_ok());

        let gzip = LayerCompression {
            algorithm: CompressionAlgorithm::Gzip,
            level: 6,
        };
        assert!(check_dir_layers(&export.image, Some(gzip)).is_ok());

        let zstd = LayerCompression {
            algorithm: CompressionAlgorithm::Zstd,
            level: 3,
        };
        assert!(check_dir_layers(&export.image, Some(zstd)).is_err());
    }

    #[test]
    fn test_check_dir_layers_rejects_zstd_source_layer() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("z");
        create_test_image(&src);
        let export = ExportImage {
            image: OciImage::from_path(&src).unwrap(),
            names: vec!["zimage:1".to_string()],
        };
        recompress_second_layer_zstd(&export);

        let err = check_dir_layers(&export.image, None).unwrap_err();
        assert!(err.to_string().contains("zstd compressed layers are not supported"));
    }

    #[test]
    fn test_layer_media_type_rejects_zstd() {
        assert!(layer_media_type(Some(CompressionAlgorithm::Zstd)).is_err());
    }
}
