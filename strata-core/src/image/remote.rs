//! Registry client: base image pulls, config fetches, rootfs extraction.
//!
//! Wraps `oci_distribution` with reference normalization, registry
//! remapping and mirrors, per-registry TLS policy, a platform resolver for
//! multi-arch indexes, and retrying downloads with exponential backoff.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use oci_distribution::client::{
    Certificate, CertificateEncoding, Client, ClientConfig, ClientProtocol, ImageLayer,
};
use oci_distribution::manifest::ImageIndexEntry;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use tracing::{debug, info, instrument, warn};

use crate::config::RegistryOptions;
use crate::creds;
use crate::error::{Result, StrataError};
use crate::image::{ImageConfigFile, Platform};

/// Whiteout file prefix in layer tars (AUFS convention).
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Opaque whiteout marker: the directory's prior contents are deleted.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// A pulled image, ready for config inspection or rootfs extraction.
pub struct PulledImage {
    pub reference: Reference,
    /// The manifest digest, when the registry reported one.
    pub digest: Option<String>,
    pub config_data: Vec<u8>,
    pub config: ImageConfigFile,
    pub layers: Vec<ImageLayer>,
}

/// Registry client for pulling images and manifests.
pub struct ImageClient {
    client: Client,
    registry_opts: RegistryOptions,
    platform: Platform,
}

impl ImageClient {
    /// Create a client honoring the pull-side TLS and plaintext policy.
    pub fn for_pull(opts: &RegistryOptions, platform: &Platform) -> Self {
        Self::new(opts, platform, opts.insecure_pull, opts.skip_tls_verify_pull)
    }

    /// Create a client honoring the push-side TLS and plaintext policy.
    pub fn for_push(opts: &RegistryOptions, platform: &Platform) -> Self {
        Self::new(opts, platform, opts.insecure, opts.skip_tls_verify)
    }

    fn new(opts: &RegistryOptions, platform: &Platform, insecure: bool, skip_tls: bool) -> Self {
        let protocol = if insecure {
            ClientProtocol::Http
        } else {
            let mut http_hosts = opts.insecure_registries.clone();
            http_hosts.push("localhost".to_string());
            ClientProtocol::HttpsExcept(http_hosts)
        };

        let mut extra_root_certificates = Vec::new();
        for (host, path) in &opts.registry_certificates {
            match std::fs::read(path) {
                Ok(data) => extra_root_certificates
                    .push(Certificate { encoding: CertificateEncoding::Pem, data }),
                Err(e) => {
                    warn!(host, path = %path.display(), error = %e, "could not read registry certificate");
                }
            }
        }

        let resolver_platform = platform.clone();
        let config = ClientConfig {
            protocol,
            accept_invalid_certificates: skip_tls || !opts.skip_tls_verify_registries.is_empty(),
            extra_root_certificates,
            platform_resolver: Some(Box::new(move |entries: &[ImageIndexEntry]| {
                platform_manifest_digest(entries, &resolver_platform)
            })),
            ..Default::default()
        };

        Self { client: Client::new(config), registry_opts: opts.clone(), platform: platform.clone() }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Pull an image: manifest, config blob and all layer blobs.
    ///
    /// Registry maps and mirrors are tried in order; the original registry
    /// is the final fallback unless disabled.
    #[instrument(skip(self), fields(image = %image))]
    pub async fn pull(&self, image: &str) -> Result<PulledImage> {
        let mut last_err = None;
        for candidate in self.candidates(image)? {
            match self.pull_candidate(&candidate).await {
                Ok(pulled) => return Ok(pulled),
                Err(e) => {
                    warn!(candidate = %candidate, error = %e, "pull attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| StrataError::ImagePull {
            image: image.to_string(),
            reason: "no registry candidates".to_string(),
        }))
    }

    async fn pull_candidate(&self, image: &Reference) -> Result<PulledImage> {
        let auth = self.auth_for(image.registry());
        let retries = self.registry_opts.image_download_retry;
        let image_data = with_retry(retries, "image download", || async {
            self.client
                .pull(
                    image,
                    &auth,
                    vec![
                        oci_distribution::manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
                        oci_distribution::manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
                        oci_distribution::manifest::IMAGE_LAYER_MEDIA_TYPE,
                        crate::image::OCI_LAYER_ZSTD_MEDIA_TYPE,
                    ],
                )
                .await
                .map_err(|e| StrataError::ImagePull {
                    image: image.whole(),
                    reason: e.to_string(),
                })
        })
        .await?;

        info!(layers = image_data.layers.len(), "image pulled");
        let config = ImageConfigFile::parse(&image_data.config.data).map_err(|e| {
            StrataError::ImagePull {
                image: image.whole(),
                reason: format!("unparseable image config: {e}"),
            }
        })?;

        Ok(PulledImage {
            reference: image.clone(),
            digest: image_data.digest,
            config_data: image_data.config.data,
            config,
            layers: image_data.layers,
        })
    }

    /// Fetch only the config file of an image (for ONBUILD unfolding).
    #[instrument(skip(self), fields(image = %image))]
    pub async fn fetch_config(&self, image: &str) -> Result<ImageConfigFile> {
        let mut last_err = None;
        for candidate in self.candidates(image)? {
            let auth = self.auth_for(candidate.registry());
            match self.client.pull_manifest_and_config(&candidate, &auth).await {
                Ok((_manifest, _digest, config_json)) => {
                    return ImageConfigFile::parse(config_json.as_bytes()).map_err(|e| {
                        StrataError::ImagePull {
                            image: image.to_string(),
                            reason: format!("unparseable image config: {e}"),
                        }
                    });
                }
                Err(e) => {
                    last_err = Some(StrataError::ImagePull {
                        image: candidate.whole(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Err(last_err.unwrap_or_else(|| StrataError::ImagePull {
            image: image.to_string(),
            reason: "no registry candidates".to_string(),
        }))
    }

    /// Resolve an image reference to its manifest digest.
    pub async fn manifest_digest(&self, image: &str) -> Result<String> {
        let reference = normalize_reference(image)?;
        let auth = self.auth_for(reference.registry());
        self.client.fetch_manifest_digest(&reference, &auth).await.map_err(|e| {
            StrataError::ImagePull { image: image.to_string(), reason: e.to_string() }
        })
    }

    pub(crate) fn auth_for(&self, registry: &str) -> RegistryAuth {
        creds::auth_for(registry, &self.registry_opts)
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn registry_options(&self) -> &RegistryOptions {
        &self.registry_opts
    }

    /// Candidate references in probe order: registry maps, then mirrors,
    /// then the original (unless the default fallback is disabled and an
    /// alternative exists).
    fn candidates(&self, image: &str) -> Result<Vec<Reference>> {
        let original = normalize_reference(image)?;
        let mut out = Vec::new();

        if let Some(mapped) = self.registry_opts.registry_maps.get(original.registry()) {
            for dest in mapped {
                out.push(reroot_reference(&original, dest)?);
            }
        }
        for mirror in &self.registry_opts.registry_mirrors {
            out.push(reroot_reference(&original, mirror)?);
        }
        if out.is_empty() || !self.registry_opts.skip_default_registry_fallback {
            out.push(original);
        }
        Ok(out)
    }
}

/// Normalize a Dockerfile image reference to a fully-qualified one.
///
/// `nginx` becomes `docker.io/library/nginx:latest`, `user/repo` becomes
/// `docker.io/user/repo:latest`; fully-qualified references are untouched.
pub fn normalize_reference(image: &str) -> Result<Reference> {
    Reference::try_from(image).map_err(|e| StrataError::InvalidImageRef {
        image: image.to_string(),
        reason: e.to_string(),
    })
}

/// Replace the registry (and for bare hosts, keep the repository) of a
/// reference, preserving tag or digest.
fn reroot_reference(original: &Reference, new_registry: &str) -> Result<Reference> {
    let repo = original.repository();
    let suffix = match original.digest() {
        Some(digest) => format!("@{digest}"),
        None => format!(":{}", original.tag().unwrap_or("latest")),
    };
    let remapped = format!("{}/{repo}{suffix}", new_registry.trim_end_matches('/'));
    normalize_reference(&remapped)
}

/// Pick the manifest digest matching the target platform from an index.
fn platform_manifest_digest(entries: &[ImageIndexEntry], platform: &Platform) -> Option<String> {
    let matches = |entry: &&ImageIndexEntry| {
        entry.platform.as_ref().is_some_and(|p| {
            p.os == platform.os
                && p.architecture == platform.architecture
                && platform
                    .variant
                    .as_ref()
                    .map_or(true, |v| p.variant.as_deref() == Some(v.as_str()))
        })
    };
    if let Some(entry) = entries.iter().find(matches) {
        debug!(digest = %entry.digest, "resolved platform manifest");
        return Some(entry.digest.clone());
    }
    debug!(platform = %platform, "no matching platform in image index");
    None
}

/// Run an async operation with up to `retries` additional attempts and
/// exponential backoff.
pub async fn with_retry<T, F, Fut>(retries: u32, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(500);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt > retries {
                    return Err(err);
                }
                warn!(what, attempt, error = %err, "retrying after backoff");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
}

/// Extract an image's layers into `root`, applying whiteouts.
///
/// Returns every path the extraction touched (created or deleted),
/// absolute under `root`, for targeted snapshotting.
pub fn extract_rootfs(image: &PulledImage, root: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(root).map_err(|e| StrataError::io(root, e))?;
    let mut touched = Vec::new();
    for (i, layer) in image.layers.iter().enumerate() {
        debug!(layer = i + 1, total = image.layers.len(), size = layer.data.len(), "extracting layer");
        touched.extend(apply_layer_tar(&layer.data, root)?);
    }
    Ok(touched)
}

/// Apply one layer tar (possibly compressed) onto a root directory.
///
/// Whiteout markers delete their targets instead of being written out.
/// Returns the affected paths, including deleted ones.
pub fn apply_layer_tar(data: &[u8], root: &Path) -> Result<Vec<PathBuf>> {
    let reader = decompress_reader(data);
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(cfg!(unix));

    let mut touched = Vec::new();
    let entries = archive.entries().map_err(|e| StrataError::CacheCorruption {
        key: root.display().to_string(),
        reason: format!("unreadable tar stream: {e}"),
    })?;

    for entry in entries {
        let mut entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable tar entry");
                continue;
            }
        };

        let rel = match entry.path() {
            Ok(p) => sanitize_tar_path(&p),
            Err(_) => None,
        };
        let Some(rel) = rel else { continue };

        let file_name = rel.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if file_name == OPAQUE_WHITEOUT {
            let dir = root.join(rel.parent().unwrap_or(Path::new("")));
            if dir.is_dir() {
                for child in std::fs::read_dir(&dir).map_err(|e| StrataError::io(&dir, e))? {
                    let child = child.map_err(|e| StrataError::io(&dir, e))?;
                    remove_any(&child.path())?;
                    touched.push(child.path());
                }
            }
            continue;
        }
        if let Some(victim) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let target = root.join(rel.parent().unwrap_or(Path::new(""))).join(victim);
            if target.symlink_metadata().is_ok() {
                remove_any(&target)?;
            }
            touched.push(target);
            continue;
        }

        if let Err(e) = entry.unpack_in(root) {
            // Hardlinks to pruned targets and device nodes can fail on
            // restricted filesystems; the build is still usable.
            warn!(path = %rel.display(), error = %e, "failed to unpack entry, continuing");
            continue;
        }
        touched.push(root.join(&rel));
    }

    Ok(touched)
}

/// Reject absolute components and parent traversals in tar entry paths.
fn sanitize_tar_path(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

fn remove_any(path: &Path) -> Result<()> {
    let meta = match path.symlink_metadata() {
        Ok(m) => m,
        Err(_) => return Ok(()),
    };
    let result = if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(|e| StrataError::io(path, e))
}

/// Wrap layer bytes in the right decompressor based on magic bytes.
fn decompress_reader(data: &[u8]) -> Box<dyn std::io::Read + '_> {
    if data.starts_with(&[0x1f, 0x8b]) {
        Box::new(flate2::read::GzDecoder::new(data))
    } else if data.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        match zstd::stream::read::Decoder::new(data) {
            Ok(decoder) => Box::new(decoder),
            Err(_) => Box::new(data),
        }
    } else {
        Box::new(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_normalize_reference() {
        let r = normalize_reference("nginx").unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.repository(), "library/nginx");

        let r = normalize_reference("ghcr.io/org/repo:v1").unwrap();
        assert_eq!(r.registry(), "ghcr.io");
        assert_eq!(r.tag(), Some("v1"));
    }

    #[test]
    fn test_reroot_reference_keeps_repo_and_tag() {
        let original = normalize_reference("docker.io/library/nginx:1.25").unwrap();
        let rerooted = reroot_reference(&original, "mirror.internal:5000").unwrap();
        assert_eq!(rerooted.registry(), "mirror.internal:5000");
        assert_eq!(rerooted.repository(), "library/nginx");
        assert_eq!(rerooted.tag(), Some("1.25"));
    }

    #[test]
    fn test_sanitize_tar_path() {
        assert_eq!(sanitize_tar_path(Path::new("usr/bin/env")), Some(PathBuf::from("usr/bin/env")));
        assert_eq!(sanitize_tar_path(Path::new("./etc/passwd")), Some(PathBuf::from("etc/passwd")));
        assert_eq!(sanitize_tar_path(Path::new("../escape")), None);
        assert_eq!(sanitize_tar_path(Path::new("a/../../b")), None);
    }

    #[test]
    fn test_apply_layer_creates_files() {
        let tmp = TempDir::new().unwrap();
        let tar = tar_with(&[("etc/motd", b"hello")]);
        let touched = apply_layer_tar(&tar, tmp.path()).unwrap();
        assert_eq!(touched, vec![tmp.path().join("etc/motd")]);
        assert_eq!(std::fs::read(tmp.path().join("etc/motd")).unwrap(), b"hello");
    }

    #[test]
    fn test_apply_layer_whiteout_deletes() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("opt")).unwrap();
        std::fs::write(tmp.path().join("opt/gone"), b"x").unwrap();

        let tar = tar_with(&[("opt/.wh.gone", b"")]);
        let touched = apply_layer_tar(&tar, tmp.path()).unwrap();
        assert!(!tmp.path().join("opt/gone").exists());
        assert_eq!(touched, vec![tmp.path().join("opt/gone")]);
    }

    #[test]
    fn test_apply_layer_opaque_whiteout() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("data/sub")).unwrap();
        std::fs::write(tmp.path().join("data/a"), b"x").unwrap();

        let tar = tar_with(&[("data/.wh..wh..opq", b"")]);
        apply_layer_tar(&tar, tmp.path()).unwrap();
        assert!(tmp.path().join("data").exists());
        assert!(!tmp.path().join("data/a").exists());
        assert!(!tmp.path().join("data/sub").exists());
    }

    #[test]
    fn test_apply_layer_gzip() {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let tmp = TempDir::new().unwrap();
        let tar = tar_with(&[("file", b"compressed")]);
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar).unwrap();
        let gz = encoder.finish().unwrap();

        apply_layer_tar(&gz, tmp.path()).unwrap();
        assert_eq!(std::fs::read(tmp.path().join("file")).unwrap(), b"compressed");
    }
}
