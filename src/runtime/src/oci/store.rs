//! Disk-based OCI image store.
//!
//! Stores OCI image layouts on disk with an in-memory index backed by
//! a persistent `index.json` file. Images are addressed by reference,
//! by bare repository name (implying `:latest`), or by digest prefix.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tarbox_core::error::{Result, TarboxError};
use tokio::sync::RwLock;

/// Shortest digest prefix accepted as an image ID.
const MIN_ID_PREFIX: usize = 3;

/// Metadata for a stored OCI image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    /// Image reference string (e.g., "docker.io/library/alpine:latest")
    pub reference: String,
    /// Manifest digest (e.g., "sha256:abc123...")
    pub digest: String,
    /// Total size in bytes
    pub size_bytes: u64,
    /// When the image was added to the store
    pub stored_at: DateTime<Utc>,
    /// Path to the OCI image layout on disk
    pub path: PathBuf,
}

/// Persistent index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// Disk-based image store with in-memory index.
pub struct ImageStore {
    /// Root directory for image storage
    store_dir: PathBuf,
    /// In-memory index: reference → StoredImage
    index: Arc<RwLock<HashMap<String, StoredImage>>>,
}

impl ImageStore {
    /// Open an image store.
    ///
    /// Creates the store directory if it doesn't exist and loads
    /// any existing index from disk.
    pub fn new(store_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(store_dir).map_err(|e| {
            TarboxError::Config(format!(
                "Failed to create image store directory {}: {}",
                store_dir.display(),
                e
            ))
        })?;

        let index = Self::load_index(store_dir)?;
        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            index: Arc::new(RwLock::new(index)),
        })
    }

    /// Get a stored image by exact reference.
    pub async fn get(&self, reference: &str) -> Option<StoredImage> {
        self.index.read().await.get(reference).cloned()
    }

    /// Resolve a user supplied name or ID to a stored image.
    ///
    /// Tries, in order: the reference as given and its short-name
    /// expansions (see [`candidate_references`]), then a full digest or
    /// unique digest-hex prefix.
    pub async fn resolve(&self, name_or_id: &str) -> Result<StoredImage> {
        for candidate in candidate_references(name_or_id) {
            if let Some(image) = self.get(&candidate).await {
                return Ok(image);
            }
        }

        let id = name_or_id.strip_prefix("sha256:").unwrap_or(name_or_id);
        if id.len() >= MIN_ID_PREFIX && id.chars().all(|c| c.is_ascii_hexdigit()) {
            let index = self.index.read().await;
            let mut matches: Vec<&StoredImage> = index
                .values()
                .filter(|img| {
                    img.digest
                        .strip_prefix("sha256:")
                        .unwrap_or(&img.digest)
                        .starts_with(id)
                })
                .collect();
            matches.sort_by(|a, b| {
                a.digest
                    .cmp(&b.digest)
                    .then_with(|| a.reference.cmp(&b.reference))
            });
            matches.dedup_by(|a, b| a.digest == b.digest);
            match matches.as_slice() {
                [image] => return Ok((*image).clone()),
                [] => {}
                _ => {
                    return Err(TarboxError::Validation(format!(
                        "ambiguous image ID {name_or_id}: matches {} images",
                        matches.len()
                    )))
                }
            }
        }

        Err(TarboxError::ImageNotFound(name_or_id.to_string()))
    }

    /// Store an image from a source directory.
    ///
    /// Copies the OCI image layout from `source_dir` into the store
    /// under `sha256/<digest>/`.
    pub async fn put(
        &self,
        reference: &str,
        digest: &str,
        source_dir: &Path,
    ) -> Result<StoredImage> {
        let digest_hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        let target_dir = self.store_dir.join("sha256").join(digest_hex);

        if !target_dir.exists() {
            copy_dir_recursive(source_dir, &target_dir).map_err(|e| {
                TarboxError::Export(format!("Failed to copy image to store: {}", e))
            })?;
        }

        let stored = StoredImage {
            reference: reference.to_string(),
            digest: digest.to_string(),
            size_bytes: dir_size(&target_dir),
            stored_at: Utc::now(),
            path: target_dir,
        };

        let mut index = self.index.write().await;
        index.insert(reference.to_string(), stored.clone());
        drop(index);

        self.save_index().await?;
        Ok(stored)
    }

    /// List all stored images.
    pub async fn list(&self) -> Vec<StoredImage> {
        let index = self.index.read().await;
        index.values().cloned().collect()
    }

    /// Get the store directory path.
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Load index from disk, skipping images whose layout is gone.
    fn load_index(store_dir: &Path) -> Result<HashMap<String, StoredImage>> {
        let index_path = store_dir.join("index.json");
        if !index_path.exists() {
            return Ok(HashMap::new());
        }

        let data = std::fs::read_to_string(&index_path).map_err(|e| {
            TarboxError::Config(format!(
                "Failed to read image store index {}: {}",
                index_path.display(),
                e
            ))
        })?;

        let store_index: StoreIndex = serde_json::from_str(&data).map_err(|e| {
            TarboxError::Config(format!("Failed to parse image store index: {}", e))
        })?;

        Ok(store_index
            .images
            .into_iter()
            .filter(|image| image.path.exists())
            .map(|image| (image.reference.clone(), image))
            .collect())
    }

    async fn save_index(&self) -> Result<()> {
        let index = self.index.read().await;
        let store_index = StoreIndex {
            images: index.values().cloned().collect(),
        };
        drop(index);

        let data = serde_json::to_string_pretty(&store_index)?;
        let index_path = self.store_dir.join("index.json");
        let tmp_path = self.store_dir.join("index.json.tmp");

        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &index_path).await.map_err(|e| {
            TarboxError::Config(format!(
                "Failed to write image store index {}: {}",
                index_path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

/// References a user supplied name may stand for.
///
/// `alpine` expands to `alpine`, `alpine:latest`,
/// `docker.io/library/alpine` and `docker.io/library/alpine:latest`; a name
/// whose first component is not a registry host gets a `docker.io/` prefix.
fn candidate_references(name: &str) -> Vec<String> {
    let mut names = vec![name.to_string()];
    match name.split_once('/') {
        None => names.push(format!("docker.io/library/{name}")),
        Some((first, _))
            if !first.contains('.') && !first.contains(':') && first != "localhost" =>
        {
            names.push(format!("docker.io/{name}"))
        }
        Some(_) => {}
    }

    if has_tag_or_digest(name) {
        return names;
    }
    names
        .into_iter()
        .flat_map(|n| {
            let latest = format!("{n}:latest");
            [n, latest]
        })
        .collect()
}

/// Whether the last path component of a reference carries a tag or digest.
fn has_tag_or_digest(reference: &str) -> bool {
    if reference.contains('@') {
        return true;
    }
    let last = reference.rsplit('/').next().unwrap_or(reference);
    last.contains(':')
}

/// Recursively copy a directory.
fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Calculate total size of a directory recursively.
fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path);
            } else if let Ok(meta) = path.metadata() {
                total += meta.len();
            }
        }
    }
    total
}
