//! Image data model: configs, layers, platforms and media types.
//!
//! The config serialization follows the Docker image spec field names,
//! which the OCI image spec is wire-compatible with. Maps are `BTreeMap`
//! so serialized configs are byte-stable across runs.

pub mod assemble;
pub mod push;
pub mod remote;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use assemble::{assemble, AssembledImage, HistoryRecord};
pub use remote::{ImageClient, PulledImage};

/// OCI zstd layer media type; gzip types come from `oci_distribution`.
pub const OCI_LAYER_ZSTD_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

/// Target platform of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    /// The platform of the machine running the build.
    pub fn host() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: crate::dockerfile::args::normalize_arch(std::env::consts::ARCH)
                .to_string(),
            variant: None,
        }
    }

    /// Parse `os/arch[/variant]`; missing pieces fall back to the host.
    pub fn parse(s: &str) -> Self {
        let host = Self::host();
        let mut parts = s.splitn(3, '/');
        let os = parts.next().filter(|p| !p.is_empty()).unwrap_or(&host.os).to_string();
        let architecture =
            parts.next().filter(|p| !p.is_empty()).unwrap_or(&host.architecture).to_string();
        let variant = parts.next().filter(|p| !p.is_empty()).map(String::from);
        Self { os, architecture, variant }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.architecture, v),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

/// A produced filesystem layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    /// `sha256:<hex>` of the uncompressed tar stream.
    pub diff_id: String,
    /// `sha256:<hex>` of the compressed blob.
    pub digest: String,
    pub media_type: String,
    /// Compressed size in bytes.
    pub size: u64,
    /// Compressed blob on disk.
    pub path: PathBuf,
}

/// `HEALTHCHECK` configuration in the image config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(rename = "Test", default, skip_serializing_if = "Vec::is_empty")]
    pub test: Vec<String>,
    #[serde(rename = "Interval", default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    #[serde(rename = "Timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(rename = "StartPeriod", default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<i64>,
    #[serde(rename = "Retries", default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

/// The `config` object of an image config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "User", default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(rename = "ExposedPorts", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Healthcheck", default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthConfig>,
    #[serde(rename = "Volumes", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "StopSignal", default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    #[serde(rename = "Shell", default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<Vec<String>>,
    #[serde(rename = "OnBuild", default, skip_serializing_if = "Vec::is_empty")]
    pub onbuild: Vec<String>,
}

impl ContainerConfig {
    /// The env vector as a map; later entries win.
    pub fn env_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for entry in &self.env {
            if let Some((k, v)) = entry.split_once('=') {
                map.insert(k.to_string(), v.to_string());
            }
        }
        map
    }

    /// Set or replace one environment variable, preserving vector order
    /// for existing keys.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let prefix = format!("{key}=");
        for entry in &mut self.env {
            if entry.starts_with(&prefix) {
                *entry = format!("{key}={value}");
                return;
            }
        }
        self.env.push(format!("{key}={value}"));
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        let prefix = format!("{key}=");
        self.env.iter().rev().find_map(|e| e.strip_prefix(&prefix))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self { fs_type: "layers".to_string(), diff_ids: Vec::new() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// A full image config file (the config blob of a manifest).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

impl ImageConfigFile {
    /// An empty config for `FROM scratch`.
    pub fn scratch(platform: &Platform) -> Self {
        Self {
            os: platform.os.clone(),
            architecture: platform.architecture.clone(),
            variant: platform.variant.clone(),
            ..Default::default()
        }
    }

    pub fn parse(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    /// The part of the config that participates in cache fingerprints:
    /// everything that changes the semantics of a step, excluding
    /// `created`, labels and history.
    pub fn fingerprint_fragment(&self) -> String {
        let c = &self.config;
        serde_json::json!({
            "architecture": self.architecture,
            "os": self.os,
            "variant": self.variant,
            "user": c.user,
            "env": c.env,
            "entrypoint": c.entrypoint,
            "cmd": c.cmd,
            "working_dir": c.working_dir,
            "shell": c.shell,
            "onbuild": c.onbuild,
            "exposed_ports": c.exposed_ports.keys().collect::<Vec<_>>(),
            "volumes": c.volumes.keys().collect::<Vec<_>>(),
            "diff_ids": self.rootfs.diff_ids,
        })
        .to_string()
    }
}

/// `sha256:<hex>` of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{:x}", hasher.finalize())
}

/// Plain hex sha256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse() {
        let p = Platform::parse("linux/arm64/v8");
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "arm64");
        assert_eq!(p.variant.as_deref(), Some("v8"));
        assert_eq!(p.to_string(), "linux/arm64/v8");

        let p = Platform::parse("linux/amd64");
        assert_eq!(p.variant, None);
        assert_eq!(p.to_string(), "linux/amd64");
    }

    #[test]
    fn test_env_roundtrip() {
        let mut config = ContainerConfig::default();
        config.set_env("PATH", "/usr/bin");
        config.set_env("HOME", "/root");
        config.set_env("PATH", "/usr/local/bin:/usr/bin");

        assert_eq!(config.env, vec!["PATH=/usr/local/bin:/usr/bin", "HOME=/root"]);
        assert_eq!(config.env_value("PATH"), Some("/usr/local/bin:/usr/bin"));
        assert_eq!(config.env_map().get("HOME").map(String::as_str), Some("/root"));
    }

    #[test]
    fn test_config_serialization_field_names() {
        let mut config = ImageConfigFile::scratch(&Platform::parse("linux/amd64"));
        config.config.set_env("A", "1");
        config.config.working_dir = "/app".into();
        config.config.exposed_ports.insert("80/tcp".into(), serde_json::json!({}));

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"Env\":[\"A=1\"]"));
        assert!(json.contains("\"WorkingDir\":\"/app\""));
        assert!(json.contains("\"ExposedPorts\":{\"80/tcp\":{}}"));
        assert!(json.contains("\"diff_ids\":[]"));

        let parsed = ImageConfigFile::parse(json.as_bytes()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_fingerprint_fragment_excludes_labels_and_created() {
        let mut a = ImageConfigFile::scratch(&Platform::parse("linux/amd64"));
        let mut b = a.clone();
        b.created = Some("2026-01-01T00:00:00Z".into());
        b.config.labels.insert("maintainer".into(), "someone".into());
        b.history.push(HistoryEntry { created_by: "RUN x".into(), ..Default::default() });
        assert_eq!(a.fingerprint_fragment(), b.fingerprint_fragment());

        a.config.set_env("X", "1");
        assert_ne!(a.fingerprint_fragment(), b.fingerprint_fragment());
    }

    #[test]
    fn test_sha256_helpers() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(!sha256_hex(b"x").starts_with("sha256:"));
    }
}
