//! Registry credentials.
//!
//! Resolution walks a prioritized chain: the env keychain
//! (`KANIKO_<HOST>_USER`/`_PASSWORD`), `DOCKER_AUTH_CONFIG`,
//! `REGISTRY_AUTH_FILE`, the Docker config file, then any configured
//! credential helper binaries. The first source with an entry for the
//! registry wins; everything else falls through to anonymous access.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use oci_distribution::secrets::RegistryAuth;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RegistryOptions;
use crate::error::{Result, StrataError};

/// The Docker Hub registry aliases found in config files.
const DOCKER_HUB_ALIASES: &[&str] =
    &["docker.io", "index.docker.io", "https://index.docker.io/v1/", "registry-1.docker.io"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AuthEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
}

impl AuthEntry {
    fn credentials(&self) -> Option<(String, String)> {
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            return Some((user.clone(), pass.clone()));
        }
        let encoded = self.auth.as_deref()?;
        let decoded = BASE64.decode(encoded).ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let (user, pass) = text.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }
}

/// Resolve authentication for a registry host.
pub fn auth_for(registry: &str, opts: &RegistryOptions) -> RegistryAuth {
    if let Some((user, pass)) = env_keychain(registry) {
        debug!(registry, "using env keychain credentials");
        return RegistryAuth::Basic(user, pass);
    }
    if let Some((user, pass)) = from_config_sources(registry) {
        debug!(registry, "using docker config credentials");
        return RegistryAuth::Basic(user, pass);
    }
    for helper in &opts.credential_helpers {
        if let Some((user, pass)) = from_helper(helper, registry) {
            debug!(registry, helper, "using credential helper");
            return RegistryAuth::Basic(user, pass);
        }
    }
    RegistryAuth::Anonymous
}

/// `KANIKO_<HOST>_USER` / `KANIKO_<HOST>_PASSWORD`, host uppercased with
/// dots, dashes and colons mapped to underscores.
fn env_keychain(registry: &str) -> Option<(String, String)> {
    let host = registry
        .to_uppercase()
        .chars()
        .map(|c| if matches!(c, '.' | '-' | ':') { '_' } else { c })
        .collect::<String>();
    let user = std::env::var(format!("KANIKO_{host}_USER")).ok()?;
    let pass = std::env::var(format!("KANIKO_{host}_PASSWORD")).ok()?;
    Some((user, pass))
}

fn from_config_sources(registry: &str) -> Option<(String, String)> {
    // Inline JSON config beats files.
    if let Ok(raw) = std::env::var("DOCKER_AUTH_CONFIG") {
        if let Ok(config) = serde_json::from_str::<DockerConfig>(&raw) {
            if let Some(creds) = config_lookup(&config, registry) {
                return Some(creds);
            }
        }
    }
    if let Ok(path) = std::env::var("REGISTRY_AUTH_FILE") {
        if let Some(creds) = read_config(&PathBuf::from(path))
            .and_then(|config| config_lookup(&config, registry))
        {
            return Some(creds);
        }
    }
    read_config(&docker_config_path()).and_then(|config| config_lookup(&config, registry))
}

fn config_lookup(config: &DockerConfig, registry: &str) -> Option<(String, String)> {
    let keys: Vec<&str> = if DOCKER_HUB_ALIASES.contains(&registry) {
        DOCKER_HUB_ALIASES.to_vec()
    } else {
        vec![registry]
    };
    for key in keys {
        if let Some(creds) = config.auths.get(key).and_then(AuthEntry::credentials) {
            return Some(creds);
        }
        let with_scheme = format!("https://{key}");
        if let Some(creds) = config.auths.get(&with_scheme).and_then(AuthEntry::credentials) {
            return Some(creds);
        }
    }
    None
}

fn read_config(path: &PathBuf) -> Option<DockerConfig> {
    let raw = std::fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// `$DOCKER_CONFIG/config.json` or `~/.docker/config.json`.
fn docker_config_path() -> PathBuf {
    match std::env::var("DOCKER_CONFIG") {
        Ok(dir) => PathBuf::from(dir).join("config.json"),
        Err(_) => dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")).join(".docker/config.json"),
    }
}

/// Ask a `docker-credential-<helper>` binary for credentials.
fn from_helper(helper: &str, registry: &str) -> Option<(String, String)> {
    #[derive(Deserialize)]
    struct HelperOutput {
        #[serde(rename = "Username")]
        username: String,
        #[serde(rename = "Secret")]
        secret: String,
    }

    let mut child = Command::new(format!("docker-credential-{helper}"))
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    child.stdin.take()?.write_all(registry.as_bytes()).ok()?;
    let output = child.wait_with_output().ok()?;
    if !output.status.success() {
        warn!(helper, registry, "credential helper returned non-zero");
        return None;
    }
    let parsed: HelperOutput = serde_json::from_slice(&output.stdout).ok()?;
    Some((parsed.username, parsed.secret))
}

/// `strata login`: persist credentials to the standard Docker config.
pub fn write_login(registry: &str, username: &str, password: &str) -> Result<PathBuf> {
    let path = docker_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StrataError::io(parent, e))?;
    }

    let mut config = read_config(&path).unwrap_or_default();
    let encoded = BASE64.encode(format!("{username}:{password}"));
    config.auths.insert(
        registry.to_string(),
        AuthEntry { auth: Some(encoded), username: None, password: None },
    );

    let data = serde_json::to_vec_pretty(&config)?;
    std::fs::write(&path, data).map_err(|e| StrataError::io(&path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| StrataError::io(&path, e))?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Env-var based tests share process state; keep each var unique.

    #[test]
    fn test_env_keychain_host_mapping() {
        std::env::set_var("KANIKO_REGISTRY_EXAMPLE_COM_5000_USER", "bob");
        std::env::set_var("KANIKO_REGISTRY_EXAMPLE_COM_5000_PASSWORD", "s3cret");
        let creds = env_keychain("registry.example-com:5000");
        assert_eq!(creds, Some(("bob".to_string(), "s3cret".to_string())));
        std::env::remove_var("KANIKO_REGISTRY_EXAMPLE_COM_5000_USER");
        std::env::remove_var("KANIKO_REGISTRY_EXAMPLE_COM_5000_PASSWORD");
    }

    #[test]
    fn test_auth_entry_decodes_base64() {
        let entry = AuthEntry {
            auth: Some(BASE64.encode("alice:hunter2")),
            username: None,
            password: None,
        };
        assert_eq!(entry.credentials(), Some(("alice".to_string(), "hunter2".to_string())));
    }

    #[test]
    fn test_docker_hub_aliases() {
        let mut config = DockerConfig::default();
        config.auths.insert(
            "https://index.docker.io/v1/".to_string(),
            AuthEntry {
                auth: Some(BASE64.encode("hub:token")),
                username: None,
                password: None,
            },
        );
        assert_eq!(
            config_lookup(&config, "docker.io"),
            Some(("hub".to_string(), "token".to_string()))
        );
        assert_eq!(config_lookup(&config, "ghcr.io"), None);
    }

    #[test]
    fn test_write_login_roundtrip() {
        let tmp = TempDir::new().unwrap();
        std::env::set_var("DOCKER_CONFIG", tmp.path());

        let path = write_login("registry.internal", "ci", "token123").unwrap();
        assert_eq!(path, tmp.path().join("config.json"));

        let config = read_config(&path).unwrap();
        let creds = config.auths.get("registry.internal").unwrap().credentials().unwrap();
        assert_eq!(creds, ("ci".to_string(), "token123".to_string()));

        // A second login for another registry keeps the first entry.
        write_login("other.registry", "ci2", "tok2").unwrap();
        let config = read_config(&path).unwrap();
        assert!(config.auths.contains_key("registry.internal"));
        assert!(config.auths.contains_key("other.registry"));

        std::env::remove_var("DOCKER_CONFIG");
    }
}
