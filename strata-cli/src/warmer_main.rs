//! The strata cache warmer binary.
//!
//! Pre-fetches base images into the local cache directory, either listed
//! explicitly with `--image` or discovered by parsing a Dockerfile.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use strata_core::config::{CacheOptions, RegistryOptions, WarmerOptions};

#[derive(Parser)]
#[command(name = "strata-warmer")]
#[command(about = "Pre-fetch base images into the strata cache", long_about = None)]
#[command(version)]
struct Cli {
    /// Image to warm (repeatable)
    #[arg(short = 'i', long = "image")]
    image: Vec<String>,

    /// Discover base images from this Dockerfile
    #[arg(short = 'f', long)]
    dockerfile: Option<String>,

    /// Build argument for Dockerfile discovery (K=V, repeatable)
    #[arg(long = "build-arg")]
    build_arg: Vec<String>,

    /// Local cache directory
    #[arg(long, default_value = "/cache")]
    cache_dir: PathBuf,

    /// Cache time-to-live
    #[arg(long, default_value = "336h")]
    cache_ttl: String,

    /// Re-download even when already cached
    #[arg(long, action = clap::ArgAction::SetTrue)]
    force: bool,

    /// Target platform (os/arch[/variant])
    #[arg(long)]
    custom_platform: Option<String>,

    /// Pull over plain http
    #[arg(long, action = clap::ArgAction::SetTrue)]
    insecure_pull: bool,

    /// Skip TLS verification when pulling
    #[arg(long, action = clap::ArgAction::SetTrue)]
    skip_tls_verify_pull: bool,

    /// Registry allowed over plain http (repeatable)
    #[arg(long = "insecure-registry")]
    insecure_registry: Vec<String>,

    /// Registry mirror tried before the original (repeatable)
    #[arg(long = "registry-mirror")]
    registry_mirror: Vec<String>,

    /// Retries when downloading images
    #[arg(long, default_value_t = 0)]
    image_download_retry: u32,
}

impl Cli {
    fn into_options(self) -> Result<WarmerOptions> {
        let cache_ttl = humantime::parse_duration(&self.cache_ttl)
            .with_context(|| format!("invalid --cache-ttl {:?}", self.cache_ttl))?;
        Ok(WarmerOptions {
            cache: CacheOptions { cache_dir: self.cache_dir, cache_ttl },
            registry: RegistryOptions {
                insecure_pull: self.insecure_pull,
                skip_tls_verify_pull: self.skip_tls_verify_pull,
                insecure_registries: self.insecure_registry,
                registry_mirrors: self.registry_mirror,
                image_download_retry: self.image_download_retry,
                ..Default::default()
            },
            custom_platform: self.custom_platform,
            images: self.image,
            force: self.force,
            dockerfile_path: self.dockerfile,
            build_args: self.build_arg,
        })
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let opts = match cli.into_options() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("failed warming cache: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = strata_core::warm_cache(&opts).await {
        eprintln!("failed warming cache: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_mapping() {
        let cli = Cli::parse_from([
            "strata-warmer",
            "-i",
            "alpine:3.19",
            "-i",
            "debian:bookworm",
            "--cache-dir",
            "/tmp/warm",
            "--force",
        ]);
        let opts = cli.into_options().unwrap();
        assert_eq!(opts.images, vec!["alpine:3.19", "debian:bookworm"]);
        assert_eq!(opts.cache.cache_dir, PathBuf::from("/tmp/warm"));
        assert!(opts.force);
        assert!(opts.dockerfile_path.is_none());
    }

    #[test]
    fn test_invalid_ttl_rejected() {
        let cli = Cli::parse_from(["strata-warmer", "-i", "alpine", "--cache-ttl", "soon"]);
        assert!(cli.into_options().is_err());
    }
}
