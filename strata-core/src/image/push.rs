//! Pushing assembled images and writing local image outputs.
//!
//! Pushes go through the registry client: blobs the registry already has
//! are skipped by digest, each destination tag gets the same manifest, and
//! transient failures retry with exponential backoff. `--no-push` builds
//! can still be exported as a docker-load tarball or an OCI layout.

use std::io::Write;
use std::path::Path;

use oci_distribution::client::{Config, ImageLayer};
use tracing::{info, instrument, warn};

use crate::error::{Result, StrataError};
use crate::image::remote::{normalize_reference, with_retry, ImageClient};
use crate::image::AssembledImage;

/// One pushed destination and the digest it received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedTag {
    pub destination: String,
    pub digest: String,
}

/// Push an image to every destination tag.
#[instrument(skip(client, image), fields(digest = %image.digest))]
pub async fn push_image(
    client: &ImageClient,
    image: &AssembledImage,
    destinations: &[String],
) -> Result<Vec<PushedTag>> {
    let mut pushed = Vec::new();
    let opts = client.registry_options().clone();

    let mut layers = Vec::with_capacity(image.layers.len());
    for layer in &image.layers {
        let data = std::fs::read(&layer.path).map_err(|e| StrataError::io(&layer.path, e))?;
        layers.push(ImageLayer::new(data, layer.media_type.clone(), None));
    }

    for destination in destinations {
        let reference = normalize_reference(destination)?;

        let result = with_retry(opts.push_retry, "image push", || {
            let config = Config::new(
                image.config_data.clone(),
                image.manifest.config.media_type.clone(),
                None,
            );
            let layers = layers.clone();
            let manifest = image.manifest.clone();
            let reference = reference.clone();
            let auth = client.auth_for(reference.registry());
            async move {
                client
                    .client()
                    .push(&reference, &layers, config, &auth, Some(manifest))
                    .await
                    .map_err(|e| StrataError::ImagePush {
                        image: reference.whole(),
                        reason: e.to_string(),
                    })
            }
        })
        .await;

        match result {
            Ok(_) => {
                info!(destination = %destination, "pushed");
                pushed.push(PushedTag {
                    destination: destination.clone(),
                    digest: image.digest.clone(),
                });
            }
            Err(e) if opts.push_ignore_immutable_tag_errors && is_immutable_tag_error(&e) => {
                warn!(destination = %destination, "tag is immutable and already exists, ignoring");
                pushed.push(PushedTag {
                    destination: destination.clone(),
                    digest: image.digest.clone(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    Ok(pushed)
}

/// The documented registry responses for a rejected overwrite of an
/// immutable tag.
fn is_immutable_tag_error(err: &StrataError) -> bool {
    let text = err.to_string().to_ascii_lowercase();
    text.contains("immutable") || (text.contains("tag") && text.contains("already exists"))
}

/// Write the digest output files requested on the command line.
pub fn write_digest_files(
    digest: &str,
    pushed: &[PushedTag],
    digest_file: Option<&Path>,
    image_name_digest_file: Option<&Path>,
    image_name_tag_digest_file: Option<&Path>,
) -> Result<()> {
    if let Some(path) = digest_file {
        std::fs::write(path, digest).map_err(|e| StrataError::io(path, e))?;
    }
    if let Some(path) = image_name_digest_file {
        let contents: String = pushed
            .iter()
            .map(|p| {
                // Strip a trailing tag, but not a registry port.
                let name = match p.destination.rsplit_once(':') {
                    Some((name, tag)) if !tag.contains('/') => name,
                    _ => p.destination.as_str(),
                };
                format!("{name}@{}\n", p.digest)
            })
            .collect();
        std::fs::write(path, contents).map_err(|e| StrataError::io(path, e))?;
    }
    if let Some(path) = image_name_tag_digest_file {
        let contents: String =
            pushed.iter().map(|p| format!("{}@{}\n", p.destination, p.digest)).collect();
        std::fs::write(path, contents).map_err(|e| StrataError::io(path, e))?;
    }
    Ok(())
}

/// Export as a `docker load`-compatible tarball.
pub fn write_tarball(image: &AssembledImage, destinations: &[String], path: &Path) -> Result<()> {
    let file = std::fs::File::create(path).map_err(|e| StrataError::io(path, e))?;
    let mut builder = tar::Builder::new(file);

    let config_name = format!("{}.json", image.config_digest.trim_start_matches("sha256:"));
    append_tar_file(&mut builder, &config_name, &image.config_data)?;

    let mut layer_names = Vec::new();
    for layer in &image.layers {
        let name = format!("{}.tar.gz", layer.digest.trim_start_matches("sha256:"));
        let data = std::fs::read(&layer.path).map_err(|e| StrataError::io(&layer.path, e))?;
        append_tar_file(&mut builder, &name, &data)?;
        layer_names.push(name);
    }

    let repo_tags: Vec<String> = destinations.to_vec();
    let manifest = serde_json::json!([{
        "Config": config_name,
        "RepoTags": repo_tags,
        "Layers": layer_names,
    }]);
    append_tar_file(&mut builder, "manifest.json", &serde_json::to_vec(&manifest)?)?;

    builder.finish().map_err(|e| StrataError::io(path, e))?;
    info!(path = %path.display(), "wrote image tarball");
    Ok(())
}

/// Export as an OCI image layout directory.
pub fn write_oci_layout(image: &AssembledImage, dir: &Path) -> Result<()> {
    let blobs = dir.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs).map_err(|e| StrataError::io(&blobs, e))?;

    let write_blob = |digest: &str, data: &[u8]| -> Result<()> {
        let path = blobs.join(digest.trim_start_matches("sha256:"));
        std::fs::write(&path, data).map_err(|e| StrataError::io(&path, e))
    };

    write_blob(&image.config_digest, &image.config_data)?;
    for layer in &image.layers {
        let data = std::fs::read(&layer.path).map_err(|e| StrataError::io(&layer.path, e))?;
        write_blob(&layer.digest, &data)?;
    }
    write_blob(&image.digest, &image.manifest_data)?;

    let layout = dir.join("oci-layout");
    std::fs::write(&layout, br#"{"imageLayoutVersion":"1.0.0"}"#)
        .map_err(|e| StrataError::io(&layout, e))?;

    let media_type = image
        .manifest
        .media_type
        .clone()
        .unwrap_or_else(|| oci_distribution::manifest::OCI_IMAGE_MEDIA_TYPE.to_string());
    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": media_type,
            "digest": image.digest,
            "size": image.manifest_data.len(),
        }],
    });
    let index_path = dir.join("index.json");
    let mut file =
        std::fs::File::create(&index_path).map_err(|e| StrataError::io(&index_path, e))?;
    file.write_all(&serde_json::to_vec(&index)?).map_err(|e| StrataError::io(&index_path, e))?;

    info!(path = %dir.display(), "wrote OCI layout");
    Ok(())
}

fn append_tar_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| StrataError::io(name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{assemble, HistoryRecord, ImageConfigFile, Layer, Platform};
    use oci_distribution::manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE;
    use tempfile::TempDir;

    fn assembled_with_layer(dir: &Path) -> AssembledImage {
        let layer_path = dir.join("layer.tar.gz");
        std::fs::write(&layer_path, b"pretend-compressed-tar").unwrap();
        let layer = Layer {
            diff_id: crate::image::sha256_digest(b"uncompressed"),
            digest: crate::image::sha256_digest(b"pretend-compressed-tar"),
            media_type: IMAGE_LAYER_GZIP_MEDIA_TYPE.to_string(),
            size: 22,
            path: layer_path,
        };
        let config = ImageConfigFile::scratch(&Platform::parse("linux/amd64"));
        assemble(
            config,
            Vec::new(),
            vec![HistoryRecord { created_by: "COPY x /x".into(), layer: Some(layer) }],
            &Platform::parse("linux/amd64"),
            true,
            &std::collections::BTreeMap::new(),
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_immutable_tag_detection() {
        let err = StrataError::ImagePush {
            image: "x".into(),
            reason: "DENIED: tag v1 already exists and the repository is immutable".into(),
        };
        assert!(is_immutable_tag_error(&err));

        let err = StrataError::ImagePush { image: "x".into(), reason: "connection reset".into() };
        assert!(!is_immutable_tag_error(&err));
    }

    #[test]
    fn test_write_digest_files() {
        let tmp = TempDir::new().unwrap();
        let pushed = vec![
            PushedTag { destination: "reg.io/app:v1".into(), digest: "sha256:abc".into() },
            PushedTag { destination: "reg.io/app:latest".into(), digest: "sha256:abc".into() },
        ];
        let digest_file = tmp.path().join("digest");
        let name_digest = tmp.path().join("name-digest");
        let name_tag_digest = tmp.path().join("name-tag-digest");

        write_digest_files(
            "sha256:abc",
            &pushed,
            Some(&digest_file),
            Some(&name_digest),
            Some(&name_tag_digest),
        )
        .unwrap();

        assert_eq!(std::fs::read_to_string(&digest_file).unwrap(), "sha256:abc");
        let names = std::fs::read_to_string(&name_digest).unwrap();
        assert!(names.contains("reg.io/app@sha256:abc"));
        let tags = std::fs::read_to_string(&name_tag_digest).unwrap();
        assert!(tags.contains("reg.io/app:v1@sha256:abc"));
    }

    #[test]
    fn test_write_oci_layout() {
        let tmp = TempDir::new().unwrap();
        let image = assembled_with_layer(tmp.path());
        let layout = tmp.path().join("layout");
        write_oci_layout(&image, &layout).unwrap();

        assert!(layout.join("oci-layout").exists());
        assert!(layout.join("index.json").exists());
        let blob = layout
            .join("blobs")
            .join("sha256")
            .join(image.digest.trim_start_matches("sha256:"));
        assert!(blob.exists());

        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(layout.join("index.json")).unwrap()).unwrap();
        assert_eq!(index["manifests"][0]["digest"], image.digest.as_str());
    }

    #[test]
    fn test_write_tarball_layout() {
        let tmp = TempDir::new().unwrap();
        let image = assembled_with_layer(tmp.path());
        let tar_path = tmp.path().join("image.tar");
        write_tarball(&image, &["reg.io/app:v1".into()], &tar_path).unwrap();

        let mut archive = tar::Archive::new(std::fs::File::open(&tar_path).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "manifest.json"));
        assert!(names.iter().any(|n| n.ends_with(".json") && n != "manifest.json"));
        assert!(names.iter().any(|n| n.ends_with(".tar.gz")));
    }
}
