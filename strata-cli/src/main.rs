//! The strata executor binary.
//!
//! Flag-compatible with kaniko's executor so it can drop into existing CI
//! jobs: build behavior is driven entirely by flags, plus a `login`
//! subcommand that writes the standard Docker config.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use strata_core::config::{
    BuildOptions, CacheOptions, Compression, GitOptions, RegistryOptions, SecretOptions,
    SnapshotMode,
};
use strata_core::paths::BuilderDirs;
use tracing::warn;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Daemon-less OCI image builder", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    build: BuildFlags,
}

#[derive(Subcommand)]
enum Commands {
    /// Store registry credentials in the Docker config file
    Login {
        /// Registry host (e.g. "ghcr.io")
        registry: String,

        #[arg(short, long)]
        username: String,

        #[arg(short, long)]
        password: Option<String>,

        /// Read the password from stdin
        #[arg(long)]
        password_stdin: bool,
    },
}

#[derive(Args)]
struct BuildFlags {
    /// Path to the Dockerfile (or an http(s) URL)
    #[arg(short = 'f', long, default_value = "Dockerfile")]
    dockerfile: String,

    /// Build context: local dir, tar://, git://, s3://, gs://
    #[arg(short = 'c', long, default_value = ".")]
    context: String,

    /// Subdirectory within the build context
    #[arg(long)]
    context_sub_path: Option<String>,

    /// Build argument (K=V, repeatable)
    #[arg(long = "build-arg")]
    build_arg: Vec<String>,

    /// Target build stage
    #[arg(long)]
    target: Option<String>,

    /// Paths excluded from snapshots (repeatable)
    #[arg(long = "ignore-path")]
    ignore_path: Vec<PathBuf>,

    /// Destination image reference (repeatable)
    #[arg(short = 'd', long = "destination")]
    destination: Vec<String>,

    /// Build without pushing
    #[arg(long, action = ArgAction::SetTrue)]
    no_push: bool,

    /// Do not push cache layers to the cache repo
    #[arg(long, action = ArgAction::SetTrue)]
    no_push_cache: bool,

    /// Write the image as a docker-load tarball
    #[arg(long)]
    tar_path: Option<PathBuf>,

    /// Write the image as an OCI layout directory
    #[arg(long)]
    oci_layout_path: Option<PathBuf>,

    /// Write the image digest to this file
    #[arg(long)]
    digest_file: Option<PathBuf>,

    #[arg(long)]
    image_name_digest_file: Option<PathBuf>,

    #[arg(long)]
    image_name_tag_digest_file: Option<PathBuf>,

    /// OCI manifest annotation (K=V, repeatable)
    #[arg(long = "annotation")]
    annotation: Vec<String>,

    /// Image label (K=V, repeatable)
    #[arg(long = "label")]
    label: Vec<String>,

    /// Enable layer caching
    #[arg(long, action = ArgAction::SetTrue)]
    cache: bool,

    /// Registry repository for cached layers
    #[arg(long)]
    cache_repo: Option<String>,

    /// Local directory for warmed base images
    #[arg(long, default_value = "/cache")]
    cache_dir: PathBuf,

    /// Cache time-to-live
    #[arg(long, default_value = "336h")]
    cache_ttl: String,

    #[arg(long, action = ArgAction::SetTrue)]
    cache_copy_layers: bool,

    #[arg(long, num_args = 0..=1, default_value_t = true, default_missing_value = "true", action = ArgAction::Set)]
    cache_run_layers: bool,

    /// Push over plain http
    #[arg(long, action = ArgAction::SetTrue)]
    insecure: bool,

    /// Skip TLS verification when pushing
    #[arg(long, action = ArgAction::SetTrue)]
    skip_tls_verify: bool,

    /// Pull over plain http
    #[arg(long, action = ArgAction::SetTrue)]
    insecure_pull: bool,

    /// Skip TLS verification when pulling
    #[arg(long, action = ArgAction::SetTrue)]
    skip_tls_verify_pull: bool,

    /// Registry allowed over plain http (repeatable)
    #[arg(long = "insecure-registry")]
    insecure_registry: Vec<String>,

    /// Registry with TLS verification disabled (repeatable)
    #[arg(long = "skip-tls-verify-registry")]
    skip_tls_verify_registry: Vec<String>,

    /// Custom CA certificate (host=path, repeatable)
    #[arg(long = "registry-certificate")]
    registry_certificate: Vec<String>,

    /// Client TLS certificate (host=path, repeatable)
    #[arg(long = "registry-client-cert")]
    registry_client_cert: Vec<String>,

    /// Registry mirror tried before the original (repeatable)
    #[arg(long = "registry-mirror")]
    registry_mirror: Vec<String>,

    /// Registry remap (source=dest[;dest...], repeatable)
    #[arg(long = "registry-map", env = "KANIKO_REGISTRY_MAP")]
    registry_map: Vec<String>,

    #[arg(long, action = ArgAction::SetTrue)]
    skip_default_registry_fallback: bool,

    /// Treat immutable-tag push rejections as success
    #[arg(long, action = ArgAction::SetTrue)]
    push_ignore_immutable_tag_errors: bool,

    /// Push attempts on transient failure
    #[arg(long, default_value_t = 0)]
    push_retry: u32,

    /// Retries when extracting the base image filesystem
    #[arg(long, default_value_t = 0)]
    image_fs_extract_retry: u32,

    /// Retries when downloading images
    #[arg(long, default_value_t = 0)]
    image_download_retry: u32,

    /// Credential helper names (repeatable)
    #[arg(long = "credential-helpers")]
    credential_helpers: Vec<String>,

    /// Snapshot fingerprinting: full, redo or time
    #[arg(long, default_value = "full")]
    snapshot_mode: String,

    /// One layer for the whole stage
    #[arg(long, action = ArgAction::SetTrue)]
    single_snapshot: bool,

    /// Strip timestamps for bit-reproducible images
    #[arg(long, action = ArgAction::SetTrue)]
    reproducible: bool,

    #[arg(long, num_args = 0..=1, default_value_t = true, default_missing_value = "true", action = ArgAction::Set)]
    skip_unused_stages: bool,

    /// Copy the build context instead of using it in place
    #[arg(long, action = ArgAction::SetTrue)]
    preserve_context: bool,

    #[arg(long, action = ArgAction::SetTrue)]
    materialize: bool,

    /// Target platform (os/arch[/variant])
    #[arg(long)]
    custom_platform: Option<String>,

    #[arg(long, num_args = 0..=1, default_value_t = true, default_missing_value = "true", action = ArgAction::Set)]
    compressed_caching: bool,

    #[arg(long, num_args = 0..=1, default_value_t = true, default_missing_value = "true", action = ArgAction::Set)]
    ignore_var_run: bool,

    /// Layer compression: gzip or zstd
    #[arg(long, default_value = "gzip")]
    compression: String,

    #[arg(long)]
    compression_level: Option<i32>,

    /// The builder's own directory
    #[arg(long = "kaniko-dir", env = "KANIKO_DIR", default_value = "/kaniko")]
    kaniko_dir: PathBuf,

    /// Print the build plan and exit without building
    #[arg(long, action = ArgAction::SetTrue)]
    dryrun: bool,

    /// Build secret (id=ID[,src=PATH][,env=VAR], repeatable)
    #[arg(long = "secret")]
    secret: Vec<String>,

    /// Git context options (key=value list)
    #[arg(long)]
    git: Option<String>,

    /// Wipe leftover builder state before starting
    #[arg(long, action = ArgAction::SetTrue)]
    pre_cleanup: bool,

    /// Clean the filesystem at the end of the build
    #[arg(long, action = ArgAction::SetTrue)]
    cleanup: bool,
}

impl BuildFlags {
    fn into_options(self) -> Result<BuildOptions> {
        let compression = Compression::parse(&self.compression)?;
        let snapshot_mode = SnapshotMode::parse(&self.snapshot_mode)?;
        let cache_ttl = humantime::parse_duration(&self.cache_ttl)
            .with_context(|| format!("invalid --cache-ttl {:?}", self.cache_ttl))?;

        if !self.no_push && self.destination.is_empty() && !self.dryrun {
            bail!("at least one --destination is required (or pass --no-push)");
        }

        let mut secrets = SecretOptions::default();
        for secret in &self.secret {
            secrets.add(secret)?;
        }

        let mut registry_maps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for map in &self.registry_map {
            let (source, dests) = map
                .split_once('=')
                .with_context(|| format!("invalid --registry-map {map:?}"))?;
            registry_maps
                .entry(source.to_string())
                .or_default()
                .extend(dests.split(';').map(String::from));
        }

        let annotations = parse_kv_pairs(&self.annotation, "--annotation")?;
        let registry_certificates = parse_kv_paths(&self.registry_certificate)?;
        let registry_client_certificates = parse_kv_paths(&self.registry_client_cert)?;

        Ok(BuildOptions {
            registry: RegistryOptions {
                registry_maps,
                registry_mirrors: self.registry_mirror,
                insecure_registries: self.insecure_registry,
                skip_tls_verify_registries: self.skip_tls_verify_registry,
                registry_certificates,
                registry_client_certificates,
                skip_default_registry_fallback: self.skip_default_registry_fallback,
                insecure: self.insecure,
                skip_tls_verify: self.skip_tls_verify,
                insecure_pull: self.insecure_pull,
                skip_tls_verify_pull: self.skip_tls_verify_pull,
                push_ignore_immutable_tag_errors: self.push_ignore_immutable_tag_errors,
                push_retry: self.push_retry,
                image_download_retry: self.image_download_retry,
                credential_helpers: self.credential_helpers,
            },
            cache: CacheOptions { cache_dir: self.cache_dir, cache_ttl },
            destinations: self.destination,
            build_args: self.build_arg,
            labels: self.label,
            annotations,
            git: match self.git.as_deref() {
                Some(value) => GitOptions::parse(value)?,
                None => GitOptions::default(),
            },
            ignore_paths: self.ignore_path,
            dockerfile_path: self.dockerfile,
            src_context: self.context,
            context_sub_path: self.context_sub_path,
            snapshot_mode,
            custom_platform: self.custom_platform,
            tar_path: self.tar_path,
            oci_layout_path: self.oci_layout_path,
            builder_dir: self.kaniko_dir,
            target: self.target,
            cache_repo: self.cache_repo,
            digest_file: self.digest_file,
            image_name_digest_file: self.image_name_digest_file,
            image_name_tag_digest_file: self.image_name_tag_digest_file,
            compression,
            compression_level: self.compression_level,
            image_fs_extract_retry: self.image_fs_extract_retry,
            single_snapshot: self.single_snapshot,
            reproducible: self.reproducible,
            no_push: self.no_push,
            no_push_cache: self.no_push_cache,
            cache_enabled: self.cache,
            pre_cleanup: self.pre_cleanup,
            cleanup: self.cleanup,
            compressed_caching: self.compressed_caching,
            ignore_var_run: self.ignore_var_run,
            skip_unused_stages: self.skip_unused_stages,
            cache_copy_layers: self.cache_copy_layers,
            cache_run_layers: self.cache_run_layers,
            preserve_context: self.preserve_context,
            materialize: self.materialize,
            secrets,
            dryrun: self.dryrun,
        })
    }
}

fn parse_kv_pairs(values: &[String], flag: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for value in values {
        let (k, v) =
            value.split_once('=').with_context(|| format!("invalid {flag} value {value:?}"))?;
        out.insert(k.to_string(), v.to_string());
    }
    Ok(out)
}

fn parse_kv_paths(values: &[String]) -> Result<BTreeMap<String, PathBuf>> {
    let mut out = BTreeMap::new();
    for value in values {
        let (host, path) =
            value.split_once('=').with_context(|| format!("expected host=path, got {value:?}"))?;
        out.insert(host.to_string(), PathBuf::from(path));
    }
    Ok(out)
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

fn login(registry: &str, username: &str, password: Option<&str>, password_stdin: bool) -> Result<()> {
    let password = match (password, password_stdin) {
        (Some(_), true) => bail!("--password and --password-stdin are mutually exclusive"),
        (Some(p), false) => p.to_string(),
        (None, true) => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading password from stdin")?;
            buf.trim_end_matches(['\r', '\n']).to_string()
        }
        (None, false) => bail!("provide --password or --password-stdin"),
    };
    let path = strata_core::creds::write_login(registry, username, &password)?;
    println!("credentials for {registry} written to {}", path.display());
    Ok(())
}

/// Best-effort cleanup of intermediate state on SIGINT/SIGTERM.
async fn handle_signals(builder_dir: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => return,
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    warn!("interrupted, cleaning up intermediate state");
    let _ = BuilderDirs::new(builder_dir).cleanup_intermediate();
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Some(Commands::Login { registry, username, password, password_stdin }) = cli.command {
        if let Err(e) = login(&registry, &username, password.as_deref(), password_stdin) {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    let opts = match cli.build.into_options() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("error building image: {e:#}");
            std::process::exit(1);
        }
    };

    tokio::spawn(handle_signals(opts.builder_dir.clone()));

    match strata_core::do_build(&opts).await {
        Ok(_) => {}
        Err(e) => {
            eprintln!("error building image: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["strata", "--no-push"]);
        let opts = cli.build.into_options().unwrap();
        assert_eq!(opts.dockerfile_path, "Dockerfile");
        assert_eq!(opts.src_context, ".");
        assert!(opts.skip_unused_stages);
        assert!(opts.cache_run_layers);
        assert!(!opts.cache_copy_layers);
        assert!(opts.ignore_var_run);
        assert_eq!(opts.cache.cache_ttl, std::time::Duration::from_secs(336 * 3600));
    }

    #[test]
    fn test_requires_destination_or_no_push() {
        let cli = Cli::parse_from(["strata"]);
        assert!(cli.build.into_options().is_err());

        let cli = Cli::parse_from(["strata", "-d", "reg.io/app:v1"]);
        assert!(cli.build.into_options().is_ok());
    }

    #[test]
    fn test_boolean_flag_overrides() {
        let cli = Cli::parse_from([
            "strata",
            "--no-push",
            "--skip-unused-stages=false",
            "--cache-run-layers=false",
            "--ignore-var-run=false",
        ]);
        let opts = cli.build.into_options().unwrap();
        assert!(!opts.skip_unused_stages);
        assert!(!opts.cache_run_layers);
        assert!(!opts.ignore_var_run);
    }

    #[test]
    fn test_registry_map_parsing() {
        let cli = Cli::parse_from([
            "strata",
            "--no-push",
            "--registry-map",
            "docker.io=mirror.internal;backup.internal",
            "--registry-map",
            "gcr.io=proxy.internal",
        ]);
        let opts = cli.build.into_options().unwrap();
        assert_eq!(
            opts.registry.registry_maps.get("docker.io").unwrap(),
            &vec!["mirror.internal".to_string(), "backup.internal".to_string()]
        );
        assert_eq!(
            opts.registry.registry_maps.get("gcr.io").unwrap(),
            &vec!["proxy.internal".to_string()]
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cli = Cli::parse_from(["strata", "--no-push", "--compression", "lz4"]);
        assert!(cli.build.into_options().is_err());

        let cli = Cli::parse_from(["strata", "--no-push", "--snapshot-mode", "quick"]);
        assert!(cli.build.into_options().is_err());

        let cli = Cli::parse_from(["strata", "--no-push", "--cache-ttl", "fortnight"]);
        assert!(cli.build.into_options().is_err());
    }

    #[test]
    fn test_secret_and_annotation_parsing() {
        let cli = Cli::parse_from([
            "strata",
            "--no-push",
            "--secret",
            "id=tok,src=/run/tok",
            "--annotation",
            "org.opencontainers.image.source=https://example.com/repo",
        ]);
        let opts = cli.build.into_options().unwrap();
        assert!(opts.secrets.get("tok").is_some());
        assert_eq!(
            opts.annotations.get("org.opencontainers.image.source").map(String::as_str),
            Some("https://example.com/repo")
        );
    }
}
