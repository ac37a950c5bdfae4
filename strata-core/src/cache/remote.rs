//! Registry-backed layer cache.
//!
//! Each cache entry is an image with exactly one layer, pushed to the
//! cache repository under a tag equal to the fingerprint hex (which
//! trivially satisfies the registry tag lexicon). Expiry is judged from
//! the cached image's `created` timestamp.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use oci_distribution::client::{Config as OciConfig, ImageLayer};
use tracing::{debug, info, warn};

use crate::cache::{CacheResult, CachedLayer, LayerStore};
use crate::error::{Result, StrataError};
use crate::image::assemble::HistoryRecord;
use crate::image::remote::{normalize_reference, ImageClient};
use crate::image::{assemble, ImageConfigFile, Layer};

/// Layer cache stored in a registry repository.
pub struct RemoteLayerStore {
    client: ImageClient,
    repo: String,
    /// Where fetched blobs are written for extraction and reuse.
    scratch: PathBuf,
    ttl: Duration,
}

impl RemoteLayerStore {
    pub fn new(
        client: ImageClient,
        repo: impl Into<String>,
        scratch: impl Into<PathBuf>,
        ttl: Duration,
    ) -> Result<Self> {
        let scratch = scratch.into();
        std::fs::create_dir_all(&scratch).map_err(|e| StrataError::io(&scratch, e))?;
        Ok(Self { client, repo: repo.into(), scratch, ttl })
    }

    fn cache_reference(&self, fingerprint: &str) -> Result<oci_distribution::Reference> {
        normalize_reference(&format!("{}:{fingerprint}", self.repo))
    }

    fn is_expired(&self, config: &ImageConfigFile) -> bool {
        let Some(created) = &config.created else { return false };
        let Ok(created) = humantime::parse_rfc3339(created) else { return false };
        match SystemTime::now().duration_since(created) {
            Ok(age) => age > self.ttl,
            Err(_) => false,
        }
    }
}

#[async_trait]
impl LayerStore for RemoteLayerStore {
    async fn lookup(&self, fingerprint: &str) -> Result<CacheResult> {
        let reference = self.cache_reference(fingerprint)?;
        let pulled = match self.client.pull(&reference.whole()).await {
            Ok(pulled) => pulled,
            Err(e) => {
                debug!(fingerprint, error = %e, "remote cache miss");
                return Ok(CacheResult::Miss);
            }
        };

        if self.is_expired(&pulled.config) {
            info!(fingerprint, "remote cache entry expired");
            return Ok(CacheResult::Expired);
        }

        let created_by_of = |config: &ImageConfigFile| {
            config.history.first().map(|h| h.created_by.clone()).unwrap_or_default()
        };
        if pulled.layers.is_empty() {
            // An empty image records a step with no filesystem effect.
            info!(fingerprint, "remote cache hit (empty layer)");
            return Ok(CacheResult::Hit(CachedLayer {
                layer: None,
                created_by: created_by_of(&pulled.config),
            }));
        }
        if pulled.layers.len() != 1 {
            // A malformed cache entry degrades to a rebuild.
            warn!(
                fingerprint,
                layers = pulled.layers.len(),
                "cache entry does not have exactly one layer, treating as miss"
            );
            return Ok(CacheResult::Miss);
        }
        let Some(diff_id) = pulled.config.rootfs.diff_ids.first().cloned() else {
            warn!(fingerprint, "cache entry config has no diff_ids, treating as miss");
            return Ok(CacheResult::Miss);
        };

        let blob = &pulled.layers[0];
        let blob_path = self.scratch.join(fingerprint);
        std::fs::write(&blob_path, &blob.data).map_err(|e| StrataError::io(&blob_path, e))?;

        info!(fingerprint, "remote cache hit");
        Ok(CacheResult::Hit(CachedLayer {
            layer: Some(Layer {
                diff_id,
                digest: crate::image::sha256_digest(&blob.data),
                media_type: blob.media_type.clone(),
                size: blob.data.len() as u64,
                path: blob_path,
            }),
            created_by: created_by_of(&pulled.config),
        }))
    }

    async fn store(
        &self,
        fingerprint: &str,
        layer: Option<&Layer>,
        created_by: &str,
    ) -> Result<()> {
        let reference = self.cache_reference(fingerprint)?;

        let config = ImageConfigFile::scratch(self.client.platform());
        let image = assemble::assemble(
            config,
            Vec::new(),
            vec![HistoryRecord { created_by: created_by.to_string(), layer: layer.cloned() }],
            self.client.platform(),
            true,
            &BTreeMap::new(),
            false,
        )?;

        let layers = match layer {
            Some(layer) => {
                let data =
                    std::fs::read(&layer.path).map_err(|e| StrataError::io(&layer.path, e))?;
                vec![ImageLayer::new(data, layer.media_type.clone(), None)]
            }
            None => Vec::new(),
        };
        let oci_config = OciConfig::new(
            image.config_data.clone(),
            image.manifest.config.media_type.clone(),
            None,
        );
        let auth = self.client.auth_for(reference.registry());

        self.client
            .client()
            .push(&reference, &layers, oci_config, &auth, Some(image.manifest.clone()))
            .await
            .map_err(|e| StrataError::ImagePush {
                image: reference.whole(),
                reason: e.to_string(),
            })?;

        info!(fingerprint, "stored layer in cache repo");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Platform;
    use crate::config::RegistryOptions;
    use tempfile::TempDir;

    fn store(ttl: Duration) -> RemoteLayerStore {
        let tmp = TempDir::new().unwrap();
        RemoteLayerStore::new(
            ImageClient::for_pull(&RegistryOptions::default(), &Platform::host()),
            "registry.example.com/team/cache",
            tmp.path().join("scratch"),
            ttl,
        )
        .unwrap()
    }

    #[test]
    fn test_cache_reference_uses_fingerprint_as_tag() {
        let store = store(Duration::from_secs(3600));
        let fp = "f".repeat(64);
        let reference = store.cache_reference(&fp).unwrap();
        assert_eq!(reference.registry(), "registry.example.com");
        assert_eq!(reference.repository(), "team/cache");
        assert_eq!(reference.tag(), Some(fp.as_str()));
    }

    #[test]
    fn test_expiry_judged_from_created() {
        let fresh = store(Duration::from_secs(3600));
        let mut config = ImageConfigFile::default();
        config.created = Some(humantime::format_rfc3339_seconds(SystemTime::now()).to_string());
        assert!(!fresh.is_expired(&config));

        config.created = Some("2000-01-01T00:00:00Z".to_string());
        assert!(fresh.is_expired(&config));

        // Entries without a timestamp never expire.
        config.created = None;
        assert!(!fresh.is_expired(&config));
    }
}
