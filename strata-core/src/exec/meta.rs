//! Metadata-only instructions.
//!
//! These mutate the image config without touching the filesystem, with one
//! exception: `WORKDIR` creates its directory when missing and marks it
//! for snapshotting.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::dockerfile::parser::{Command, HealthcheckSpec};
use crate::dockerfile::BuildArgs;
use crate::error::{ParseError, Result, StrataError};
use crate::exec::passwd;
use crate::image::{HealthConfig, ImageConfigFile};

/// Expand a word with the step's replacement environment.
pub fn expand_word(
    word: &str,
    config: &ImageConfigFile,
    args: &BuildArgs,
    used: &mut BTreeMap<String, String>,
    line: usize,
) -> Result<String> {
    let image_env = config.config.env_map();
    let env = args.expansion_env(&image_env);
    crate::dockerfile::expand::expand_at_line(word, &env, used, line)
        .map_err(|e: ParseError| StrataError::ArgResolution {
            name: word.to_string(),
            reason: e.to_string(),
        })
}

pub fn apply_env(
    pairs: &[(String, String)],
    config: &mut ImageConfigFile,
    args: &BuildArgs,
    used: &mut BTreeMap<String, String>,
    line: usize,
) -> Result<()> {
    for (key, value) in pairs {
        let value = expand_word(value, config, args, used, line)?;
        config.config.set_env(key, &value);
    }
    Ok(())
}

pub fn apply_label(
    pairs: &[(String, String)],
    config: &mut ImageConfigFile,
    args: &BuildArgs,
    used: &mut BTreeMap<String, String>,
    line: usize,
) -> Result<()> {
    for (key, value) in pairs {
        let value = expand_word(value, config, args, used, line)?;
        config.config.labels.insert(key.clone(), value);
    }
    Ok(())
}

/// `ARG name` takes the command-line override; `ARG name=value` uses the
/// value as the default. Never surfaces in the image config.
pub fn apply_arg(
    decls: &[(String, Option<String>)],
    config: &ImageConfigFile,
    args: &mut BuildArgs,
    used: &mut BTreeMap<String, String>,
    line: usize,
) -> Result<()> {
    for (name, default) in decls {
        let default = match default {
            Some(v) => Some(expand_word(v, config, args, used, line)?),
            None => None,
        };
        args.declare(name, default.as_deref());
    }
    Ok(())
}

pub fn apply_expose(
    ports: &[String],
    config: &mut ImageConfigFile,
    args: &BuildArgs,
    used: &mut BTreeMap<String, String>,
    line: usize,
) -> Result<()> {
    for port in ports {
        let port = expand_word(port, config, args, used, line)?;
        let normalized = if port.contains('/') { port } else { format!("{port}/tcp") };
        config.config.exposed_ports.insert(normalized, serde_json::json!({}));
    }
    Ok(())
}

/// `USER user[:group]` with env expansion of both parts.
pub fn apply_user(
    user: &str,
    config: &mut ImageConfigFile,
    args: &BuildArgs,
    used: &mut BTreeMap<String, String>,
    line: usize,
) -> Result<()> {
    let (user_part, group_part) = passwd::split_user_group(user);
    let mut resolved = expand_word(user_part, config, args, used, line)?;
    if let Some(group) = group_part {
        let group = expand_word(group, config, args, used, line)?;
        resolved = format!("{resolved}:{group}");
    }
    config.config.user = resolved;
    Ok(())
}

pub fn apply_volume(
    paths: &[String],
    config: &mut ImageConfigFile,
    args: &BuildArgs,
    used: &mut BTreeMap<String, String>,
    line: usize,
) -> Result<()> {
    for path in paths {
        let path = expand_word(path, config, args, used, line)?;
        config.config.volumes.insert(path, serde_json::json!({}));
    }
    Ok(())
}

/// Shell-form CMD/ENTRYPOINT is stored wrapped in the image shell, the way
/// the docker builder records it.
fn command_argv(command: &Command, config: &ImageConfigFile) -> Vec<String> {
    match command {
        Command::Exec(argv) => argv.clone(),
        Command::Shell(cmd) => {
            let mut argv = config
                .config
                .shell
                .clone()
                .unwrap_or_else(|| vec!["/bin/sh".to_string(), "-c".to_string()]);
            argv.push(cmd.clone());
            argv
        }
    }
}

pub fn apply_cmd(command: &Command, config: &mut ImageConfigFile) {
    config.config.cmd = Some(command_argv(command, config));
}

pub fn apply_entrypoint(command: &Command, config: &mut ImageConfigFile) {
    config.config.entrypoint = Some(command_argv(command, config));
}

pub fn apply_shell(argv: &[String], config: &mut ImageConfigFile) {
    config.config.shell = Some(argv.to_vec());
}

pub fn apply_stopsignal(
    signal: &str,
    config: &mut ImageConfigFile,
    args: &BuildArgs,
    used: &mut BTreeMap<String, String>,
    line: usize,
) -> Result<()> {
    let signal = expand_word(signal, config, args, used, line)?;
    config.config.stop_signal = Some(signal);
    Ok(())
}

pub fn apply_maintainer(name: &str, config: &mut ImageConfigFile) {
    config.author = Some(name.to_string());
}

pub fn apply_onbuild(expression: &str, config: &mut ImageConfigFile) {
    config.config.onbuild.push(expression.to_string());
}

pub fn apply_healthcheck(health: &HealthcheckSpec, config: &mut ImageConfigFile) -> Result<()> {
    let test = match &health.test {
        None => vec!["NONE".to_string()],
        Some(Command::Exec(argv)) => {
            let mut test = vec!["CMD".to_string()];
            test.extend(argv.iter().cloned());
            test
        }
        Some(Command::Shell(cmd)) => vec!["CMD-SHELL".to_string(), cmd.clone()],
    };

    let nanos = |text: &Option<String>| -> Result<Option<i64>> {
        match text {
            None => Ok(None),
            Some(t) => {
                let duration = humantime::parse_duration(t).map_err(|e| {
                    StrataError::Instruction {
                        instruction: "HEALTHCHECK".to_string(),
                        reason: format!("invalid duration {t:?}: {e}"),
                    }
                })?;
                Ok(Some(duration.as_nanos() as i64))
            }
        }
    };

    config.config.healthcheck = Some(HealthConfig {
        test,
        interval: nanos(&health.interval)?,
        timeout: nanos(&health.timeout)?,
        start_period: nanos(&health.start_period)?,
        retries: health.retries,
    });
    Ok(())
}

/// Join a possibly-relative path onto the working directory.
pub fn to_abs_path(path: &str, workdir: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    if workdir.is_empty() {
        Path::new("/").join(path)
    } else {
        Path::new(workdir).join(path)
    }
}

/// `WORKDIR`: update the config and create the directory when missing.
///
/// Returns the paths to snapshot (the created directory, or nothing).
/// `WORKDIR /` never produces a layer.
pub fn apply_workdir(
    path: &str,
    root: &Path,
    config: &mut ImageConfigFile,
    args: &BuildArgs,
    used: &mut BTreeMap<String, String>,
    line: usize,
) -> Result<Vec<PathBuf>> {
    let resolved = expand_word(path, config, args, used, line)?;
    let abs = to_abs_path(&resolved, &config.config.working_dir);
    config.config.working_dir = abs.display().to_string();
    info!(workdir = %config.config.working_dir, "changed working directory");

    if config.config.working_dir == "/" {
        return Ok(Vec::new());
    }

    let on_disk = crate::exec::rooted(root, &abs);
    if on_disk.exists() {
        return Ok(Vec::new());
    }

    let (uid, gid) = passwd::active_user_group(root, &config.config.user);
    debug!(path = %on_disk.display(), uid, gid, "creating working directory");
    crate::exec::mkdir_all_with_owner(&on_disk, 0o755, uid, gid)?;
    Ok(vec![abs])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Platform;
    use tempfile::TempDir;

    fn empty_config() -> ImageConfigFile {
        ImageConfigFile::scratch(&Platform::parse("linux/amd64"))
    }

    #[test]
    fn test_env_expansion_uses_prior_env() {
        let mut config = empty_config();
        let args = BuildArgs::new(&[]);
        let mut used = BTreeMap::new();
        apply_env(
            &[("BASE".into(), "/opt".into()), ("BIN".into(), "$BASE/bin".into())],
            &mut config,
            &args,
            &mut used,
            1,
        )
        .unwrap();
        assert_eq!(config.config.env_value("BIN"), Some("/opt/bin"));
        assert_eq!(used.get("BASE").map(String::as_str), Some("/opt"));
    }

    #[test]
    fn test_arg_declaration_and_use() {
        let mut config = empty_config();
        let mut args = BuildArgs::new(&["NAME=world".to_string()]);
        let mut used = BTreeMap::new();
        apply_arg(&[("NAME".into(), None)], &config, &mut args, &mut used, 1).unwrap();

        apply_env(&[("GREETING".into(), "hello $NAME".into())], &mut config, &args, &mut used, 2)
            .unwrap();
        assert_eq!(config.config.env_value("GREETING"), Some("hello world"));
    }

    #[test]
    fn test_expose_normalizes_protocol() {
        let mut config = empty_config();
        let args = BuildArgs::new(&[]);
        let mut used = BTreeMap::new();
        apply_expose(
            &["80".into(), "53/udp".into()],
            &mut config,
            &args,
            &mut used,
            1,
        )
        .unwrap();
        assert!(config.config.exposed_ports.contains_key("80/tcp"));
        assert!(config.config.exposed_ports.contains_key("53/udp"));
    }

    #[test]
    fn test_user_with_group_expansion() {
        let mut config = empty_config();
        config.config.set_env("APP_USER", "svc");
        let args = BuildArgs::new(&[]);
        let mut used = BTreeMap::new();
        apply_user("$APP_USER:wheel", &mut config, &args, &mut used, 1).unwrap();
        assert_eq!(config.config.user, "svc:wheel");
    }

    #[test]
    fn test_shell_form_cmd_wrapped() {
        let mut config = empty_config();
        apply_cmd(&Command::Shell("echo hi".into()), &mut config);
        assert_eq!(
            config.config.cmd,
            Some(vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()])
        );

        config.config.shell = Some(vec!["/bin/bash".into(), "-c".into()]);
        apply_entrypoint(&Command::Shell("serve".into()), &mut config);
        assert_eq!(
            config.config.entrypoint,
            Some(vec!["/bin/bash".to_string(), "-c".to_string(), "serve".to_string()])
        );
    }

    #[test]
    fn test_healthcheck_durations() {
        let mut config = empty_config();
        let health = HealthcheckSpec {
            test: Some(Command::Shell("curl -f http://localhost/".into())),
            interval: Some("30s".into()),
            timeout: None,
            start_period: None,
            retries: Some(3),
        };
        apply_healthcheck(&health, &mut config).unwrap();
        let hc = config.config.healthcheck.unwrap();
        assert_eq!(hc.test[0], "CMD-SHELL");
        assert_eq!(hc.interval, Some(30_000_000_000));
        assert_eq!(hc.retries, Some(3));
    }

    #[test]
    fn test_workdir_absolute_and_relative() {
        let tmp = TempDir::new().unwrap();
        let mut config = empty_config();
        let args = BuildArgs::new(&[]);
        let mut used = BTreeMap::new();

        let files =
            apply_workdir("/app", tmp.path(), &mut config, &args, &mut used, 1).unwrap();
        assert_eq!(config.config.working_dir, "/app");
        assert_eq!(files, vec![PathBuf::from("/app")]);
        assert!(tmp.path().join("app").is_dir());

        let files = apply_workdir("src", tmp.path(), &mut config, &args, &mut used, 2).unwrap();
        assert_eq!(config.config.working_dir, "/app/src");
        assert_eq!(files, vec![PathBuf::from("/app/src")]);
    }

    #[test]
    fn test_workdir_existing_dir_is_metadata_only() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("srv")).unwrap();
        let mut config = empty_config();
        let args = BuildArgs::new(&[]);
        let mut used = BTreeMap::new();

        let files = apply_workdir("/srv", tmp.path(), &mut config, &args, &mut used, 1).unwrap();
        assert!(files.is_empty());

        let files = apply_workdir("/", tmp.path(), &mut config, &args, &mut used, 2).unwrap();
        assert!(files.is_empty());
        assert_eq!(config.config.working_dir, "/");
    }
}
