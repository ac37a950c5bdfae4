//! Content-addressed layer caching.
//!
//! The engine exposes two operations, `lookup` and `store`, over a
//! [`LayerStore`] seam with a local-directory implementation and a
//! registry-repository implementation (one single-layer image per entry,
//! tagged with the fingerprint hex).

pub mod key;
pub mod local;
pub mod remote;

use async_trait::async_trait;

use crate::error::Result;
use crate::image::Layer;

pub use key::{compose, digest_sources, SourceDigest, CACHE_SCHEMA_VERSION};
pub use local::LocalLayerStore;
pub use remote::RemoteLayerStore;

/// A cached step result plus the instruction that produced it. A step
/// that changed nothing on the filesystem caches as an *empty* entry
/// (`layer: None`) so replays can skip it entirely.
#[derive(Debug, Clone)]
pub struct CachedLayer {
    pub layer: Option<Layer>,
    pub created_by: String,
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone)]
pub enum CacheResult {
    Hit(CachedLayer),
    Miss,
    /// Present but older than the TTL. Upper layers treat this as a miss
    /// and refresh the entry.
    Expired,
}

impl CacheResult {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// A store of layers keyed by step fingerprint.
#[async_trait]
pub trait LayerStore: Send + Sync {
    async fn lookup(&self, fingerprint: &str) -> Result<CacheResult>;
    async fn store(
        &self,
        fingerprint: &str,
        layer: Option<&Layer>,
        created_by: &str,
    ) -> Result<()>;
}
