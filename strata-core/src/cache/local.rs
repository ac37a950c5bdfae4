//! Local layer cache.
//!
//! A directory of blobs named by their cache key with a sidecar `.json`
//! manifest per entry. TTL is enforced against the blob's mtime; expired
//! entries surface as [`CacheResult::Expired`] so callers can rebuild and
//! refresh. The filename-is-key property makes concurrent writers safe:
//! last write wins and both wrote equivalent content.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheResult, CachedLayer, LayerStore};
use crate::error::{Result, StrataError};
use crate::image::Layer;

/// Sidecar metadata stored next to each blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMetadata {
    /// An empty entry records a step that changed nothing; it has no blob.
    #[serde(default)]
    empty: bool,
    #[serde(default)]
    diff_id: String,
    #[serde(default)]
    digest: String,
    #[serde(default)]
    media_type: String,
    #[serde(default)]
    size: u64,
    created_by: String,
}

/// A layer cache in a local directory.
#[derive(Debug, Clone)]
pub struct LocalLayerStore {
    dir: PathBuf,
    ttl: Duration,
}

impl LocalLayerStore {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
        Ok(Self { dir, ttl })
    }

    pub fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn validate_key(key: &str) -> Result<()> {
        let ok = !key.is_empty()
            && key.len() <= 128
            && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ':'));
        if ok {
            Ok(())
        } else {
            Err(StrataError::CacheCorruption {
                key: key.to_string(),
                reason: "invalid cache key".to_string(),
            })
        }
    }

    /// Whether a blob at `path` is past the TTL.
    pub fn expired(path: &Path, ttl: Duration) -> bool {
        let Ok(meta) = path.metadata() else { return true };
        let Ok(mtime) = meta.modified() else { return true };
        match SystemTime::now().duration_since(mtime) {
            Ok(age) => age > ttl,
            // Future mtimes count as fresh.
            Err(_) => false,
        }
    }
}

#[async_trait]
impl LayerStore for LocalLayerStore {
    async fn lookup(&self, fingerprint: &str) -> Result<CacheResult> {
        Self::validate_key(fingerprint)?;
        let blob = self.blob_path(fingerprint);
        let metadata_path = self.metadata_path(fingerprint);
        if !metadata_path.exists() {
            debug!(fingerprint, "local cache miss");
            return Ok(CacheResult::Miss);
        }
        if Self::expired(&metadata_path, self.ttl) {
            info!(fingerprint, "local cache entry expired");
            return Ok(CacheResult::Expired);
        }

        let raw = std::fs::read(&metadata_path).map_err(|e| StrataError::io(&metadata_path, e))?;
        let meta: EntryMetadata = match serde_json::from_slice(&raw) {
            Ok(meta) => meta,
            Err(e) => {
                // Corrupt sidecars degrade to a rebuild, never a failure.
                warn!(fingerprint, error = %e, "corrupt cache metadata, treating as miss");
                return Ok(CacheResult::Miss);
            }
        };

        if meta.empty {
            info!(fingerprint, created_by = %meta.created_by, "local cache hit (empty layer)");
            return Ok(CacheResult::Hit(CachedLayer { layer: None, created_by: meta.created_by }));
        }
        if !blob.exists() {
            warn!(fingerprint, "cache metadata without blob, treating as miss");
            return Ok(CacheResult::Miss);
        }

        info!(fingerprint, created_by = %meta.created_by, "local cache hit");
        Ok(CacheResult::Hit(CachedLayer {
            layer: Some(Layer {
                diff_id: meta.diff_id,
                digest: meta.digest,
                media_type: meta.media_type,
                size: meta.size,
                path: blob,
            }),
            created_by: meta.created_by,
        }))
    }

    async fn store(
        &self,
        fingerprint: &str,
        layer: Option<&Layer>,
        created_by: &str,
    ) -> Result<()> {
        Self::validate_key(fingerprint)?;

        let meta = match layer {
            Some(layer) => {
                let blob = self.blob_path(fingerprint);
                if layer.path != blob {
                    std::fs::copy(&layer.path, &blob).map_err(|e| StrataError::io(&blob, e))?;
                }
                EntryMetadata {
                    empty: false,
                    diff_id: layer.diff_id.clone(),
                    digest: layer.digest.clone(),
                    media_type: layer.media_type.clone(),
                    size: layer.size,
                    created_by: created_by.to_string(),
                }
            }
            None => EntryMetadata {
                empty: true,
                diff_id: String::new(),
                digest: String::new(),
                media_type: String::new(),
                size: 0,
                created_by: created_by.to_string(),
            },
        };

        let metadata_path = self.metadata_path(fingerprint);
        std::fs::write(&metadata_path, serde_json::to_vec_pretty(&meta)?)
            .map_err(|e| StrataError::io(&metadata_path, e))?;

        debug!(fingerprint, size = meta.size, "stored layer in local cache");
        Ok(())
    }
}
