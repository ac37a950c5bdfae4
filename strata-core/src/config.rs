//! Build configuration for strata.
//!
//! All command-line and environment configuration is collected into plain
//! option structs at startup; nothing in the core reads flags or the
//! environment at use sites. Feature toggles keep their kaniko-compatible
//! `FF_KANIKO_*` names so strata is a drop-in replacement in existing
//! pipelines.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StrataError};

/// Default TTL for cached base images and layers: two weeks.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(336 * 60 * 60);

/// Base image cache options.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub cache_dir: PathBuf,
    pub cache_ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self { cache_dir: PathBuf::from("/cache"), cache_ttl: DEFAULT_CACHE_TTL }
    }
}

/// Registry-related options shared by the executor and the warmer.
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// `source=dest[;dest...]` remaps applied before any pull.
    pub registry_maps: BTreeMap<String, Vec<String>>,
    /// Mirrors tried before the original registry.
    pub registry_mirrors: Vec<String>,
    pub insecure_registries: Vec<String>,
    pub skip_tls_verify_registries: Vec<String>,
    /// `host=path` pairs for custom CA certificates.
    pub registry_certificates: BTreeMap<String, PathBuf>,
    /// `host=path` pairs for mTLS client certificates.
    pub registry_client_certificates: BTreeMap<String, PathBuf>,
    pub skip_default_registry_fallback: bool,
    pub insecure: bool,
    pub skip_tls_verify: bool,
    pub insecure_pull: bool,
    pub skip_tls_verify_pull: bool,
    pub push_ignore_immutable_tag_errors: bool,
    pub push_retry: u32,
    pub image_download_retry: u32,
    pub credential_helpers: Vec<String>,
}

/// Snapshot fingerprinting mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Hash file contents; slowest, most precise.
    #[default]
    Full,
    /// Compare file attributes (mode, owner, size, mtime) without hashing.
    Redo,
    /// Compare mtime only.
    Time,
}

impl SnapshotMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(Self::Full),
            "redo" => Ok(Self::Redo),
            "time" => Ok(Self::Time),
            other => Err(StrataError::InvalidOptions {
                reason: format!("snapshot mode must be full, redo or time, got {other:?}"),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Redo => "redo",
            Self::Time => "time",
        }
    }
}

/// Layer compression algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    Gzip,
    Zstd,
}

impl Compression {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            other => Err(StrataError::InvalidOptions {
                reason: format!("compression must be gzip or zstd, got {other:?}"),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        }
    }
}

/// Git checkout options for `--context git://...`.
#[derive(Debug, Clone, Default)]
pub struct GitOptions {
    pub branch: Option<String>,
    pub single_branch: bool,
    pub depth: Option<u32>,
    pub recurse_submodules: bool,
    pub insecure_skip_tls: bool,
}

impl GitOptions {
    /// Parse a `key=value[,key=value...]` list as accepted by `--git`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut opts = Self::default();
        for part in s.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| StrataError::InvalidOptions {
                reason: format!("invalid git flag, must be in the key=value format: {part:?}"),
            })?;
            let bad = |e: String| StrataError::InvalidOptions {
                reason: format!("invalid value for git option {key}: {e}"),
            };
            match key {
                "branch" => opts.branch = Some(value.to_string()),
                "single-branch" => {
                    opts.single_branch = value.parse().map_err(|e: std::str::ParseBoolError| bad(e.to_string()))?
                }
                "depth" => {
                    opts.depth = Some(value.parse().map_err(|e: std::num::ParseIntError| bad(e.to_string()))?)
                }
                "recurse-submodules" => {
                    opts.recurse_submodules =
                        value.parse().map_err(|e: std::str::ParseBoolError| bad(e.to_string()))?
                }
                "insecure-skip-tls" => {
                    opts.insecure_skip_tls =
                        value.parse().map_err(|e: std::str::ParseBoolError| bad(e.to_string()))?
                }
                other => {
                    return Err(StrataError::InvalidOptions {
                        reason: format!("unknown git option: {other}"),
                    })
                }
            }
        }
        Ok(opts)
    }
}

/// Where a build secret's payload comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// Read from a file path.
    File(PathBuf),
    /// Read from an environment variable at build time.
    Env(String),
}

/// Parsed `--secret` options, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct SecretOptions(pub BTreeMap<String, SecretSource>);

impl SecretOptions {
    /// Parse one `--secret` value using the buildx grammar:
    /// `id=ID[,src=PATH][,env=VAR][,type=file|env]`.
    pub fn add(&mut self, val: &str) -> Result<()> {
        let mut id = None;
        let mut ty = None;
        let mut src = None;
        let mut env = None;

        for part in val.split(',') {
            let (k, v) = part.split_once('=').ok_or_else(|| StrataError::InvalidOptions {
                reason: format!("invalid secret format: {part:?}"),
            })?;
            match k {
                "id" => id = Some(v.to_string()),
                "type" => match v {
                    "file" | "env" => ty = Some(v.to_string()),
                    other => {
                        return Err(StrataError::InvalidOptions {
                            reason: format!("invalid secret type: {other:?} (file|env)"),
                        })
                    }
                },
                "src" | "source" => src = Some(v.to_string()),
                "env" => env = Some(v.to_string()),
                other => {
                    return Err(StrataError::InvalidOptions {
                        reason: format!("unknown key {other:?} in secret"),
                    })
                }
            }
        }

        let id = id.ok_or_else(|| StrataError::InvalidOptions {
            reason: "secret requires id=ID".into(),
        })?;
        if src.is_some() && env.is_some() {
            return Err(StrataError::InvalidOptions {
                reason: "only one of src or env may be specified".into(),
            });
        }
        if ty.as_deref() == Some("file") && env.is_some() {
            return Err(StrataError::InvalidOptions {
                reason: "env cannot be specified for file type secrets".into(),
            });
        }
        // `type=env,src=VAR` is accepted as an alias for env=VAR.
        if ty.as_deref() == Some("env") {
            if let Some(s) = src.take() {
                env = Some(s);
            }
        }

        let source = match (ty.as_deref(), src, env) {
            (_, _, Some(var)) => SecretSource::Env(var),
            (_, Some(path), None) => SecretSource::File(PathBuf::from(path)),
            // Bare `id=FOO`: prefer an env var of the same name, else a file.
            (None, None, None) if std::env::var_os(&id).is_some() => SecretSource::Env(id.clone()),
            (None, None, None) => SecretSource::File(PathBuf::from(&id)),
            (Some("env"), None, None) => SecretSource::Env(id.clone()),
            (Some(_), None, None) => SecretSource::File(PathBuf::from(&id)),
        };

        if self.0.contains_key(&id) {
            return Err(StrataError::InvalidOptions {
                reason: format!("secret with ID {id:?} is already defined"),
            });
        }
        self.0.insert(id, source);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&SecretSource> {
        self.0.get(id)
    }
}

/// Options that drive a build, set by command line arguments.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub registry: RegistryOptions,
    pub cache: CacheOptions,
    pub destinations: Vec<String>,
    pub build_args: Vec<String>,
    pub labels: Vec<String>,
    pub annotations: BTreeMap<String, String>,
    pub git: GitOptions,
    pub ignore_paths: Vec<PathBuf>,
    pub dockerfile_path: String,
    pub src_context: String,
    pub context_sub_path: Option<String>,
    pub snapshot_mode: SnapshotMode,
    pub custom_platform: Option<String>,
    pub tar_path: Option<PathBuf>,
    pub oci_layout_path: Option<PathBuf>,
    pub builder_dir: PathBuf,
    pub target: Option<String>,
    pub cache_repo: Option<String>,
    pub digest_file: Option<PathBuf>,
    pub image_name_digest_file: Option<PathBuf>,
    pub image_name_tag_digest_file: Option<PathBuf>,
    pub compression: Compression,
    pub compression_level: Option<i32>,
    pub image_fs_extract_retry: u32,
    pub single_snapshot: bool,
    pub reproducible: bool,
    pub no_push: bool,
    pub no_push_cache: bool,
    pub cache_enabled: bool,
    pub pre_cleanup: bool,
    pub cleanup: bool,
    pub compressed_caching: bool,
    pub ignore_var_run: bool,
    pub skip_unused_stages: bool,
    pub cache_copy_layers: bool,
    pub cache_run_layers: bool,
    pub preserve_context: bool,
    pub materialize: bool,
    pub secrets: SecretOptions,
    pub dryrun: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            registry: RegistryOptions::default(),
            cache: CacheOptions::default(),
            destinations: Vec::new(),
            build_args: Vec::new(),
            labels: Vec::new(),
            annotations: BTreeMap::new(),
            git: GitOptions::default(),
            ignore_paths: Vec::new(),
            dockerfile_path: "Dockerfile".into(),
            src_context: ".".into(),
            context_sub_path: None,
            snapshot_mode: SnapshotMode::Full,
            custom_platform: None,
            tar_path: None,
            oci_layout_path: None,
            builder_dir: default_builder_dir(),
            target: None,
            cache_repo: None,
            digest_file: None,
            image_name_digest_file: None,
            image_name_tag_digest_file: None,
            compression: Compression::Gzip,
            compression_level: None,
            image_fs_extract_retry: 0,
            single_snapshot: false,
            reproducible: false,
            no_push: false,
            no_push_cache: false,
            cache_enabled: false,
            pre_cleanup: false,
            cleanup: false,
            compressed_caching: true,
            ignore_var_run: true,
            skip_unused_stages: true,
            cache_copy_layers: false,
            cache_run_layers: true,
            preserve_context: false,
            materialize: false,
            secrets: SecretOptions::default(),
            dryrun: false,
        }
    }
}

/// Options for the cache warmer.
#[derive(Debug, Clone)]
pub struct WarmerOptions {
    pub cache: CacheOptions,
    pub registry: RegistryOptions,
    pub custom_platform: Option<String>,
    pub images: Vec<String>,
    pub force: bool,
    pub dockerfile_path: Option<String>,
    pub build_args: Vec<String>,
}

/// The builder directory, `KANIKO_DIR` or `/kaniko`.
pub fn default_builder_dir() -> PathBuf {
    std::env::var("KANIKO_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/kaniko"))
}

/// Read a boolean feature toggle from the environment.
pub fn env_bool(key: &str) -> bool {
    env_bool_default(key, false)
}

/// Read a boolean feature toggle from the environment with a default.
///
/// Unset or unparseable values yield the default; `1`/`true`/`0`/`false`
/// (any case) are accepted.
pub fn env_bool_default(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "t" | "yes" => true,
            "0" | "false" | "f" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Feature toggles, read once at startup.
#[derive(Debug, Clone)]
pub struct FeatureFlags {
    pub squash_stages: bool,
    pub oci_stages: bool,
    pub ignore_cached_manifest: bool,
    pub copy_as_root: bool,
    pub run_mount_cache: bool,
    pub run_mount_secret: bool,
    pub new_cache_layout: bool,
    pub skip_interstage_cleanup: bool,
}

impl FeatureFlags {
    pub fn from_env() -> Self {
        Self {
            squash_stages: env_bool_default("FF_KANIKO_SQUASH_STAGES", true),
            oci_stages: env_bool_default("FF_KANIKO_OCI_STAGES", true),
            ignore_cached_manifest: env_bool("FF_KANIKO_IGNORE_CACHED_MANIFEST"),
            copy_as_root: env_bool("FF_KANIKO_COPY_AS_ROOT"),
            run_mount_cache: env_bool_default("FF_KANIKO_RUN_MOUNT_CACHE", true),
            run_mount_secret: env_bool("FF_KANIKO_RUN_MOUNT_SECRET"),
            new_cache_layout: env_bool_default("FF_KANIKO_NEW_CACHE_LAYOUT", true),
            skip_interstage_cleanup: env_bool("FF_KANIKO_SKIP_INTERSTAGE_CLEANUP"),
        }
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            squash_stages: true,
            oci_stages: true,
            ignore_cached_manifest: false,
            copy_as_root: false,
            run_mount_cache: true,
            run_mount_secret: false,
            new_cache_layout: true,
            skip_interstage_cleanup: false,
        }
    }
}
