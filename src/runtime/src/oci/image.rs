//! OCI image layout reading.
//!
//! Loads the manifest, config and layer descriptors of an image stored
//! as an OCI image layout, keeping the raw manifest and config bytes so
//! exports can reproduce them byte for byte.

use oci_spec::image::{ImageIndex, ImageManifest};
use std::path::{Path, PathBuf};
use tarbox_core::error::{Result, TarboxError};

/// A layer blob referenced by an image manifest.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    /// Content digest (e.g., "sha256:abc123...")
    pub digest: String,
    /// Media type as written in the manifest
    pub media_type: String,
    /// Blob size in bytes
    pub size: u64,
    /// Path to the blob on disk
    pub path: PathBuf,
}

/// Represents an OCI image loaded from disk.
#[derive(Debug)]
pub struct OciImage {
    /// Root directory of the OCI image layout
    root_dir: PathBuf,

    /// Digest of the manifest referenced by index.json
    manifest_digest: String,

    /// Raw manifest bytes
    manifest_bytes: Vec<u8>,

    /// Config blob digest
    config_digest: String,

    /// Raw config bytes
    config_bytes: Vec<u8>,

    /// Layer blobs (in order, bottom to top)
    layers: Vec<LayerBlob>,
}

impl OciImage {
    /// Load an OCI image from a directory.
    ///
    /// The directory must contain a valid OCI image layout:
    /// - oci-layout file
    /// - index.json
    /// - blobs/sha256/ directory with manifest, config, and layers
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();

        Self::validate_oci_layout(&root_dir)?;

        let index = Self::load_index(&root_dir)?;
        let manifest_digest = index
            .manifests()
            .first()
            .ok_or_else(|| TarboxError::Export("No manifests in index.json".to_string()))?
            .digest()
            .to_string();

        let manifest_path = blob_path(&root_dir, &manifest_digest);
        let manifest_bytes = read_blob(&manifest_path, "manifest")?;
        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| TarboxError::Export(format!("Failed to parse manifest: {}", e)))?;

        let config_digest = manifest.config().digest().to_string();
        let config_bytes = read_blob(&blob_path(&root_dir, &config_digest), "config")?;

        let layers = manifest
            .layers()
            .iter()
            .map(|layer| {
                let digest = layer.digest().to_string();
                let path = blob_path(&root_dir, &digest);
                let size = std::fs::metadata(&path)
                    .map_err(|e| {
                        TarboxError::Export(format!(
                            "Missing layer blob {}: {}",
                            path.display(),
                            e
                        ))
                    })?
                    .len();
                Ok(LayerBlob {
                    digest,
                    media_type: layer.media_type().to_string(),
                    size,
                    path,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root_dir,
            manifest_digest,
            manifest_bytes,
            config_digest,
            config_bytes,
            layers,
        })
    }

    /// Get the root directory of the OCI image.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest_bytes
    }

    pub fn config_digest(&self) -> &str {
        &self.config_digest
    }

    pub fn config_bytes(&self) -> &[u8] {
        &self.config_bytes
    }

    /// Layer blobs (in order, bottom to top).
    pub fn layers(&self) -> &[LayerBlob] {
        &self.layers
    }

    /// Validate that the directory contains a valid OCI layout.
    fn validate_oci_layout(root_dir: &Path) -> Result<()> {
        for required in ["oci-layout", "index.json", "blobs"] {
            if !root_dir.join(required).exists() {
                return Err(TarboxError::Export(format!(
                    "Not a valid OCI layout: missing {} in {}",
                    required,
                    root_dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Load the image index from index.json.
    fn load_index(root_dir: &Path) -> Result<ImageIndex> {
        let index_path = root_dir.join("index.json");
        let content = std::fs::read_to_string(&index_path).map_err(|e| {
            TarboxError::Export(format!(
                "Failed to read index.json at {}: {}",
                index_path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| TarboxError::Export(format!("Failed to parse index.json: {}", e)))
    }
}

/// Get the path to a blob by digest.
pub fn blob_path(root_dir: &Path, digest: &str) -> PathBuf {
    // Digest format: "sha256:abc123..."
    let (algorithm, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
    root_dir.join("blobs").join(algorithm).join(hash)
}

fn read_blob(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        TarboxError::Export(format!(
            "Failed to read {} at {}: {}",
            what,
            path.display(),
            e
        ))
    })
}
