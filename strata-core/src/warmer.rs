//! Cache warmer.
//!
//! Pre-fetches base images into the local cache directory so builds can
//! materialize them without a registry round-trip. Images come from
//! `--image` flags and/or from parsing a Dockerfile the way the planner
//! does (internal stage references are skipped).
//!
//! Entries are keyed by manifest digest: `<digest>` is a tar bundling the
//! config and layer blobs, `<digest>.json` is the sidecar manifest. A
//! digest reference that turns out to name an image *index* misses the
//! local lookup (only manifest digests are stored), so the warmer
//! re-resolves through the registry and retries with the platform
//! manifest digest; if the key is unchanged the miss is final.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use oci_distribution::client::ImageLayer;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cache::LocalLayerStore;
use crate::config::WarmerOptions;
use crate::dockerfile::expand::{expand, ExpansionEnv};
use crate::dockerfile::parser;
use crate::error::{Result, StrataError};
use crate::image::remote::{normalize_reference, ImageClient, PulledImage};
use crate::image::{ImageConfigFile, Platform};

/// Outcome of warming one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarmResult {
    /// Fetched and written under this manifest digest.
    Warmed(String),
    AlreadyCached,
}

/// Sidecar metadata for a warmed image.
#[derive(Debug, Serialize, Deserialize)]
struct WarmedManifest {
    reference: String,
    digest: String,
    layer_media_types: Vec<String>,
}

/// State of a local cache entry.
enum LocalState {
    Fresh,
    Expired,
    Miss,
}

/// Populate the cache for every requested image. Fails only when every
/// image fails.
pub async fn warm_cache(opts: &WarmerOptions) -> Result<()> {
    let mut images = opts.images.clone();
    if let Some(dockerfile) = &opts.dockerfile_path {
        images.extend(discover_base_images(dockerfile, &opts.build_args).await?);
    }
    if images.is_empty() {
        return Err(StrataError::InvalidOptions {
            reason: "no images to warm; pass --image or --dockerfile".to_string(),
        });
    }

    let platform = opts
        .custom_platform
        .as_deref()
        .map(Platform::parse)
        .unwrap_or_else(Platform::host);
    let client = ImageClient::for_pull(&opts.registry, &platform);
    std::fs::create_dir_all(&opts.cache.cache_dir)
        .map_err(|e| StrataError::io(&opts.cache.cache_dir, e))?;

    let mut failures = 0usize;
    for image in &images {
        match warm_one(&client, opts, image).await {
            Ok(WarmResult::Warmed(digest)) => {
                info!(image, %digest, "warmed image into cache");
            }
            Ok(WarmResult::AlreadyCached) => {
                info!("Image already in cache: {image}");
            }
            Err(e) => {
                warn!(image, error = %e, "error while trying to warm image");
                failures += 1;
            }
        }
    }

    if failures == images.len() {
        return Err(StrataError::Internal(
            "failed to warm any of the given images".to_string(),
        ));
    }
    Ok(())
}

#[instrument(skip(client, opts), fields(image = %image))]
async fn warm_one(client: &ImageClient, opts: &WarmerOptions, image: &str) -> Result<WarmResult> {
    let reference = normalize_reference(image)?;
    let cache_dir = &opts.cache.cache_dir;
    let ttl = opts.cache.cache_ttl;

    // A digest reference can be checked locally before any network I/O.
    // It may still be an image-index digest, which is never a stored key,
    // so a miss here is not final.
    let mut old_key = None;
    if !opts.force {
        if let Some(digest) = reference.digest() {
            match local_state(cache_dir, digest, ttl) {
                LocalState::Fresh | LocalState::Expired => return Ok(WarmResult::AlreadyCached),
                LocalState::Miss => old_key = Some(digest.to_string()),
            }
        }
    }

    let pulled = client.pull(image).await?;
    let digest = pulled
        .digest
        .clone()
        .ok_or_else(|| StrataError::ImagePull {
            image: image.to_string(),
            reason: "registry did not report a manifest digest".to_string(),
        })?;

    if !opts.force {
        if old_key.as_deref() == Some(digest.as_str()) {
            // The key did not change under re-resolution: the earlier
            // miss was for a plain manifest digest and stands.
            debug!(%digest, "digest unchanged after remote lookup, cache miss is final");
        } else {
            match local_state(cache_dir, &digest, ttl) {
                LocalState::Fresh | LocalState::Expired => return Ok(WarmResult::AlreadyCached),
                LocalState::Miss => {}
            }
        }
    }

    write_cached_image(cache_dir, &digest, &reference, &pulled)?;
    Ok(WarmResult::Warmed(digest))
}

fn local_state(cache_dir: &Path, digest: &str, ttl: Duration) -> LocalState {
    let path = cache_dir.join(digest);
    if !path.exists() {
        return LocalState::Miss;
    }
    if LocalLayerStore::expired(&path, ttl) {
        return LocalState::Expired;
    }
    LocalState::Fresh
}

/// Write an image into the cache: a tar of config + layers, renamed into
/// place so concurrent warmers only ever see complete entries.
fn write_cached_image(
    cache_dir: &Path,
    digest: &str,
    reference: &oci_distribution::Reference,
    pulled: &PulledImage,
) -> Result<()> {
    let staging = tempfile::NamedTempFile::new_in(cache_dir)
        .map_err(|e| StrataError::io(cache_dir, e))?;

    let mut builder = tar::Builder::new(staging);
    append_bytes(&mut builder, "config.json", &pulled.config_data)?;
    for (i, layer) in pulled.layers.iter().enumerate() {
        append_bytes(&mut builder, &format!("layers/{i:04}"), &layer.data)?;
    }
    let staging = builder.into_inner().map_err(|e| StrataError::io(cache_dir, e))?;

    let final_path = cache_dir.join(digest);
    staging.persist(&final_path).map_err(|e| StrataError::io(&final_path, e.error))?;

    let sidecar = WarmedManifest {
        reference: reference.whole(),
        digest: digest.to_string(),
        layer_media_types: pulled.layers.iter().map(|l| l.media_type.clone()).collect(),
    };
    let sidecar_path = cache_dir.join(format!("{digest}.json"));
    std::fs::write(&sidecar_path, serde_json::to_vec_pretty(&sidecar)?)
        .map_err(|e| StrataError::io(&sidecar_path, e))?;
    Ok(())
}

/// Load a warmed image back, if present and fresh. Expired entries are
/// reported as absent so the caller re-pulls.
pub fn load_cached_image(
    cache_dir: &Path,
    digest: &str,
    ttl: Duration,
) -> Result<Option<PulledImage>> {
    let path = cache_dir.join(digest);
    match local_state(cache_dir, digest, ttl) {
        LocalState::Miss => return Ok(None),
        LocalState::Expired => {
            info!(%digest, "cached base image expired");
            return Ok(None);
        }
        LocalState::Fresh => {}
    }

    let sidecar_path = cache_dir.join(format!("{digest}.json"));
    let sidecar: WarmedManifest = match std::fs::read(&sidecar_path)
        .ok()
        .and_then(|raw| serde_json::from_slice(&raw).ok())
    {
        Some(sidecar) => sidecar,
        None => {
            warn!(%digest, "cached image has no readable manifest sidecar, ignoring entry");
            return Ok(None);
        }
    };

    let data = std::fs::read(&path).map_err(|e| StrataError::io(&path, e))?;
    let mut archive = tar::Archive::new(&data[..]);
    let mut config_data = Vec::new();
    let mut blobs: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for entry in archive.entries().map_err(|e| StrataError::io(&path, e))? {
        let mut entry = entry.map_err(|e| StrataError::io(&path, e))?;
        let name = entry.path().map_err(|e| StrataError::io(&path, e))?.display().to_string();
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).map_err(|e| StrataError::io(&path, e))?;
        if name == "config.json" {
            config_data = buf;
        } else if name.starts_with("layers/") {
            blobs.insert(name, buf);
        }
    }

    let config = ImageConfigFile::parse(&config_data).map_err(|e| StrataError::CacheCorruption {
        key: digest.to_string(),
        reason: format!("unparseable cached config: {e}"),
    })?;
    let layers = blobs
        .into_values()
        .enumerate()
        .map(|(i, data)| {
            let media_type = sidecar
                .layer_media_types
                .get(i)
                .cloned()
                .unwrap_or_else(|| {
                    oci_distribution::manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE.to_string()
                });
            ImageLayer::new(data, media_type, None)
        })
        .collect();

    Ok(Some(PulledImage {
        reference: normalize_reference(&sidecar.reference)?,
        digest: Some(digest.to_string()),
        config_data,
        config,
        layers,
    }))
}

/// The external base images a Dockerfile pulls, with meta-args resolved
/// and internal stage references skipped.
pub async fn discover_base_images(
    dockerfile_path: &str,
    build_args: &[String],
) -> Result<Vec<String>> {
    let content = if dockerfile_path.starts_with("http://")
        || dockerfile_path.starts_with("https://")
    {
        reqwest::get(dockerfile_path)
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| StrataError::Context {
                reason: format!("fetching Dockerfile {dockerfile_path}: {e}"),
            })?
            .text()
            .await
            .map_err(|e| StrataError::Context {
                reason: format!("reading Dockerfile {dockerfile_path}: {e}"),
            })?
    } else {
        std::fs::read_to_string(dockerfile_path)
            .map_err(|e| StrataError::io(dockerfile_path, e))?
    };

    let dockerfile = parser::parse(&content).map_err(|e| StrataError::InvalidDockerfile {
        path: dockerfile_path.into(),
        source: e,
    })?;

    let mut env_map: BTreeMap<String, String> = dockerfile
        .meta_args
        .iter()
        .filter_map(|arg| arg.value.clone().map(|v| (arg.name.clone(), v)))
        .collect();
    for arg in build_args {
        if let Some((k, v)) = arg.split_once('=') {
            env_map.insert(k.to_string(), v.to_string());
        }
    }

    let mut out: Vec<String> = Vec::new();
    'stages: for (i, stage) in dockerfile.stages.iter().enumerate() {
        let env = ExpansionEnv::new().push(&env_map);
        let mut used = BTreeMap::new();
        let resolved = expand(&stage.base_name, &env, &mut used).map_err(|e| {
            StrataError::ArgResolution { name: stage.base_name.clone(), reason: e.to_string() }
        })?;

        if resolved.eq_ignore_ascii_case(crate::dockerfile::NO_BASE_IMAGE) {
            continue;
        }
        // Skip references to earlier stages.
        for earlier in &dockerfile.stages[..i] {
            if earlier.name.as_deref() == Some(resolved.to_lowercase().as_str()) {
                continue 'stages;
            }
        }
        if !out.contains(&resolved) {
            out.push(resolved);
        }
    }
    Ok(out)
}

fn append_bytes<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data).map_err(|e| StrataError::io(name, e))
}
