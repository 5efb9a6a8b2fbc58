//! OCI image layout exports (`oci-archive`, `oci-dir`).

use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};
use tarbox_core::error::{Result, TarboxError};
use tarbox_core::CompressionAlgorithm;

use super::{
    append_bytes, append_reader, digest_hex, short_digest, write_layers, ExportImage,
    LayerCompression, Progress,
};
use crate::oci::image::blob_path;

const OCI_LAYOUT: &[u8] = br#"{"imageLayoutVersion":"1.0.0"}"#;
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Write the image as an OCI layout packed into a tar stream.
pub(crate) fn write_archive<W: Write>(
    export: &ExportImage,
    out: W,
    progress: Progress,
) -> Result<()> {
    let image = &export.image;
    let mut builder = tar::Builder::new(out);

    append_bytes(&mut builder, "oci-layout", OCI_LAYOUT)?;
    let index = index_json(
        image.manifest_digest(),
        image.manifest_bytes().len(),
        export.names.first().map(String::as_str),
    )?;
    append_bytes(&mut builder, "index.json", &index)?;

    for layer in image.layers() {
        progress.report(format!("Copying blob {}", short_digest(&layer.digest)));
        let file = std::fs::File::open(&layer.path)?;
        append_reader(
            &mut builder,
            &format!("blobs/sha256/{}", digest_hex(&layer.digest)),
            layer.size,
            file,
        )?;
    }

    progress.report(format!("Copying config {}", short_digest(image.config_digest())));
    append_bytes(
        &mut builder,
        &format!("blobs/sha256/{}", digest_hex(image.config_digest())),
        image.config_bytes(),
    )?;

    progress.report("Writing manifest to image destination");
    append_bytes(
        &mut builder,
        &format!("blobs/sha256/{}", digest_hex(image.manifest_digest())),
        image.manifest_bytes(),
    )?;

    let mut out = builder
        .into_inner()
        .map_err(|e| TarboxError::Export(format!("Failed to finalize archive: {e}")))?;
    out.flush()?;
    Ok(())
}

/// Write the image as an OCI layout directory, optionally compressing layers.
pub(crate) fn write_dir(
    export: &ExportImage,
    dir: &Path,
    compression: Option<LayerCompression>,
    progress: Progress,
) -> Result<()> {
    let image = &export.image;
    let blobs_dir = dir.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs_dir)?;

    let written = write_layers(image.layers(), compression, progress, |hex| {
        blobs_dir.join(hex)
    })?;

    progress.report(format!("Copying config {}", short_digest(image.config_digest())));
    std::fs::write(
        blob_path(dir, image.config_digest()),
        image.config_bytes(),
    )?;

    let (manifest_digest, manifest_bytes) = if written.iter().any(|l| l.rewritten) {
        let mut manifest: serde_json::Value = serde_json::from_slice(image.manifest_bytes())?;
        let layers = manifest["layers"]
            .as_array_mut()
            .ok_or_else(|| TarboxError::Export("Manifest has no layers array".to_string()))?;
        for (descriptor, layer) in layers.iter_mut().zip(&written) {
            if layer.rewritten {
                descriptor["mediaType"] = layer_media_type(layer.compression).into();
                descriptor["digest"] = layer.digest.clone().into();
                descriptor["size"] = layer.size.into();
            }
        }
        let bytes = serde_json::to_vec(&manifest)?;
        (format!("sha256:{:x}", Sha256::digest(&bytes)), bytes)
    } else {
        (
            image.manifest_digest().to_string(),
            image.manifest_bytes().to_vec(),
        )
    };

    progress.report("Writing manifest to image destination");
    std::fs::write(blob_path(dir, &manifest_digest), &manifest_bytes)?;
    std::fs::write(dir.join("oci-layout"), OCI_LAYOUT)?;
    std::fs::write(
        dir.join("index.json"),
        index_json(
            &manifest_digest,
            manifest_bytes.len(),
            export.names.first().map(String::as_str),
        )?,
    )?;
    Ok(())
}

/// OCI media type for a layer with the given compression.
fn layer_media_type(compression: Option<CompressionAlgorithm>) -> String {
    match compression {
        None => LAYER_MEDIA_TYPE.to_string(),
        Some(algorithm) => format!("{LAYER_MEDIA_TYPE}+{algorithm}"),
    }
}

/// Build an `index.json` pointing at a single manifest.
fn index_json(
    manifest_digest: &str,
    manifest_size: usize,
    ref_name: Option<&str>,
) -> Result<Vec<u8>> {
    let mut descriptor = serde_json::json!({
        "mediaType": MANIFEST_MEDIA_TYPE,
        "digest": manifest_digest,
        "size": manifest_size,
    });
    if let Some(name) = ref_name {
        descriptor["annotations"] = serde_json::json!({ REF_NAME_ANNOTATION: name });
    }
    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [descriptor],
    });
    Ok(serde_json::to_vec(&index)?)
}
