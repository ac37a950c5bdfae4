//! Final image composition.
//!
//! Stacks the layers a build produced onto the base image's config,
//! appends matching history entries, and renders the manifest in either
//! Docker schema-2 or OCI media types.

use std::collections::BTreeMap;
use std::time::SystemTime;

use oci_distribution::manifest::{
    OciDescriptor, OciImageManifest, IMAGE_CONFIG_MEDIA_TYPE, IMAGE_DOCKER_CONFIG_MEDIA_TYPE,
    IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_GZIP_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE,
};

use crate::error::{Result, StrataError};
use crate::image::{
    sha256_digest, HistoryEntry, ImageConfigFile, Layer, Platform, OCI_LAYER_ZSTD_MEDIA_TYPE,
};

/// One executed step: its instruction text and the layer it produced, if
/// any. History entries with `empty_layer == false` correspond 1:1 to
/// layers, in order.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub created_by: String,
    pub layer: Option<Layer>,
}

/// A fully composed image, ready to push or export.
#[derive(Debug, Clone)]
pub struct AssembledImage {
    pub config: ImageConfigFile,
    pub config_data: Vec<u8>,
    pub config_digest: String,
    pub manifest: OciImageManifest,
    pub manifest_data: Vec<u8>,
    /// `sha256:<hex>` of the manifest bytes: the image digest.
    pub digest: String,
    /// All layers of the image in order: base layers then produced layers.
    pub layers: Vec<Layer>,
}

/// Compose the final image from the target stage's mutated config.
///
/// `base_layers` are the compressed blobs of the base image whose
/// `diff_ids` are already present in `config.rootfs`; `steps` contribute
/// history and any produced layers.
pub fn assemble(
    mut config: ImageConfigFile,
    base_layers: Vec<Layer>,
    steps: Vec<HistoryRecord>,
    platform: &Platform,
    oci: bool,
    annotations: &BTreeMap<String, String>,
    reproducible: bool,
) -> Result<AssembledImage> {
    config.os = platform.os.clone();
    config.architecture = platform.architecture.clone();
    config.variant = platform.variant.clone();

    let created = if reproducible {
        "1970-01-01T00:00:00Z".to_string()
    } else {
        humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
    };
    config.created = Some(created.clone());

    let mut layers = base_layers;
    for step in steps {
        let empty_layer = step.layer.is_none();
        config.history.push(HistoryEntry {
            created: Some(created.clone()),
            created_by: step.created_by,
            empty_layer,
            ..Default::default()
        });
        if let Some(layer) = step.layer {
            config.rootfs.diff_ids.push(layer.diff_id.clone());
            layers.push(layer);
        }
    }

    if config.rootfs.diff_ids.len() != layers.len() {
        return Err(StrataError::Internal(format!(
            "diff_id count {} does not match layer count {}",
            config.rootfs.diff_ids.len(),
            layers.len()
        )));
    }

    let config_data = serde_json::to_vec(&config)?;
    let config_digest = sha256_digest(&config_data);

    let (manifest_media, config_media) = if oci {
        (OCI_IMAGE_MEDIA_TYPE, IMAGE_CONFIG_MEDIA_TYPE)
    } else {
        (IMAGE_MANIFEST_MEDIA_TYPE, IMAGE_DOCKER_CONFIG_MEDIA_TYPE)
    };

    let layer_descriptors = layers
        .iter()
        .map(|layer| OciDescriptor {
            media_type: manifest_layer_media_type(&layer.media_type, oci).to_string(),
            digest: layer.digest.clone(),
            size: layer.size as i64,
            ..Default::default()
        })
        .collect();

    let manifest = OciImageManifest {
        schema_version: 2,
        media_type: Some(manifest_media.to_string()),
        config: OciDescriptor {
            media_type: config_media.to_string(),
            digest: config_digest.clone(),
            size: config_data.len() as i64,
            ..Default::default()
        },
        layers: layer_descriptors,
        annotations: if oci && !annotations.is_empty() {
            Some(annotations.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        } else {
            None
        },
        ..Default::default()
    };

    let manifest_data = serde_json::to_vec(&manifest)?;
    let digest = sha256_digest(&manifest_data);

    Ok(AssembledImage {
        config,
        config_data,
        config_digest,
        manifest,
        manifest_data,
        digest,
        layers,
    })
}

/// Map a layer's media type into the manifest's family.
fn manifest_layer_media_type(media_type: &str, oci: bool) -> &str {
    match (oci, media_type) {
        (true, IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE) => IMAGE_LAYER_GZIP_MEDIA_TYPE,
        (false, IMAGE_LAYER_GZIP_MEDIA_TYPE) => IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
        // zstd layers only exist in the OCI family; options validation
        // rejects docker+zstd up front.
        (_, OCI_LAYER_ZSTD_MEDIA_TYPE) => OCI_LAYER_ZSTD_MEDIA_TYPE,
        (_, other) => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fake_layer(id: u8) -> Layer {
        Layer {
            diff_id: format!("sha256:{:064x}", id),
            digest: format!("sha256:{:064x}", 0xf0 + id as u32),
            media_type: IMAGE_LAYER_GZIP_MEDIA_TYPE.to_string(),
            size: 123,
            path: PathBuf::from(format!("/layers/{id}")),
        }
    }

    fn assemble_simple(oci: bool) -> AssembledImage {
        let mut config = ImageConfigFile::scratch(&Platform::parse("linux/amd64"));
        config.rootfs.diff_ids.push("sha256:aaa".to_string());
        let base = Layer { diff_id: "sha256:aaa".into(), ..fake_layer(0) };

        assemble(
            config,
            vec![base],
            vec![
                HistoryRecord { created_by: "ENV A=1".into(), layer: None },
                HistoryRecord { created_by: "RUN touch /x".into(), layer: Some(fake_layer(1)) },
            ],
            &Platform::parse("linux/amd64"),
            oci,
            &BTreeMap::new(),
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_history_and_diff_ids_align() {
        let image = assemble_simple(true);
        assert_eq!(image.config.rootfs.diff_ids.len(), 2);
        assert_eq!(image.config.history.len(), 2);
        assert!(image.config.history[0].empty_layer);
        assert!(!image.config.history[1].empty_layer);
        assert_eq!(image.layers.len(), 2);
        assert_eq!(image.manifest.layers.len(), 2);
    }

    #[test]
    fn test_media_type_families() {
        let oci = assemble_simple(true);
        assert_eq!(oci.manifest.media_type.as_deref(), Some(OCI_IMAGE_MEDIA_TYPE));
        assert_eq!(oci.manifest.config.media_type, IMAGE_CONFIG_MEDIA_TYPE);
        assert_eq!(oci.manifest.layers[0].media_type, IMAGE_LAYER_GZIP_MEDIA_TYPE);

        let docker = assemble_simple(false);
        assert_eq!(docker.manifest.media_type.as_deref(), Some(IMAGE_MANIFEST_MEDIA_TYPE));
        assert_eq!(docker.manifest.layers[0].media_type, IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE);
    }

    #[test]
    fn test_reproducible_created_is_epoch() {
        let image = assemble_simple(true);
        assert_eq!(image.config.created.as_deref(), Some("1970-01-01T00:00:00Z"));
        for entry in &image.config.history {
            assert_eq!(entry.created.as_deref(), Some("1970-01-01T00:00:00Z"));
        }
    }

    #[test]
    fn test_mismatched_layer_count_rejected() {
        let mut config = ImageConfigFile::scratch(&Platform::parse("linux/amd64"));
        config.rootfs.diff_ids.push("sha256:phantom".to_string());
        let err = assemble(
            config,
            Vec::new(),
            Vec::new(),
            &Platform::parse("linux/amd64"),
            true,
            &BTreeMap::new(),
            true,
        )
        .unwrap_err();
        assert!(matches!(err, StrataError::Internal(_)));
    }

    #[test]
    fn test_annotations_only_on_oci() {
        let mut annotations = BTreeMap::new();
        annotations.insert("org.opencontainers.image.source".into(), "repo".into());
        let config = ImageConfigFile::scratch(&Platform::parse("linux/amd64"));

        let oci = assemble(
            config.clone(),
            Vec::new(),
            Vec::new(),
            &Platform::parse("linux/amd64"),
            true,
            &annotations,
            true,
        )
        .unwrap();
        assert!(oci.manifest.annotations.is_some());

        let docker = assemble(
            config,
            Vec::new(),
            Vec::new(),
            &Platform::parse("linux/amd64"),
            false,
            &annotations,
            true,
        )
        .unwrap();
        assert!(docker.manifest.annotations.is_none());
    }
}
