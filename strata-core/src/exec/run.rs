//! `RUN` execution.
//!
//! Spawns the command against the live root filesystem in its own process
//! group, with the image's environment, user and working directory. Cache
//! mounts swap a persistent directory into place for the duration of the
//! command; secret mounts materialize their payload at mode 0400 and
//! remove it afterwards. A non-zero exit propagates the child's exact
//! status.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command as Process, Stdio};

use tracing::{debug, info, warn};

use crate::config::SecretSource;
use crate::dockerfile::parser::{Command, Mount, RunSpec};
use crate::dockerfile::BuildArgs;
use crate::error::{Result, StrataError};
use crate::exec::passwd;
use crate::exec::{rooted, StepContext};
use crate::image::{sha256_hex, ImageConfigFile};

/// The PATH a child sees when the image config does not define one.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Execute a RUN instruction.
pub fn execute_run(
    spec: &RunSpec,
    config: &ImageConfigFile,
    args: &BuildArgs,
    used: &mut BTreeMap<String, String>,
    ctx: &StepContext<'_>,
) -> Result<()> {
    if let Some(network) = &spec.network {
        warn!(network, "RUN --network is not supported and is ignored");
    }
    if let Some(security) = &spec.security {
        warn!(security, "RUN --security is not supported and is ignored");
    }

    let mut guards: Vec<MountGuard> = Vec::new();
    let setup = setup_mounts(spec, config, args, used, ctx, &mut guards);
    let result = setup.and_then(|_| spawn_and_wait(spec, config, args, ctx));

    // Mounts unwind in reverse order even when the command failed.
    let mut release_err = None;
    for guard in guards.into_iter().rev() {
        if let Err(e) = guard.release() {
            warn!(error = %e, "failed to release RUN mount");
            release_err.get_or_insert(e);
        }
    }

    result?;
    match release_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The argv the child runs: the shell wrapping (with heredoc handling) for
/// shell form, the literal vector for exec form. Also the canonical
/// command for cache fingerprints.
pub fn resolved_argv(spec: &RunSpec, config: &ImageConfigFile) -> Vec<String> {
    match &spec.command {
        Command::Shell(cmd) => {
            let mut argv = config
                .config
                .shell
                .clone()
                .unwrap_or_else(|| vec!["/bin/sh".to_string(), "-c".to_string()]);

            let mut cmd = cmd.clone();
            // `RUN <<EOF` with a single heredoc runs the body as a script.
            if spec.files.len() == 1 && cmd == format!("<<{}", spec.files[0].name) {
                cmd.push_str(" sh");
            }
            for heredoc in &spec.files {
                cmd.push('\n');
                cmd.push_str(&heredoc.data);
                cmd.push_str(&heredoc.name);
            }
            argv.push(cmd);
            argv
        }
        Command::Exec(argv) => {
            if !spec.files.is_empty() {
                warn!("heredocs are not supported in exec-form RUN and are ignored");
            }
            argv.clone()
        }
    }
}

fn spawn_and_wait(
    spec: &RunSpec,
    config: &ImageConfigFile,
    args: &BuildArgs,
    ctx: &StepContext<'_>,
) -> Result<()> {
    let argv = resolved_argv(spec, config);
    let command_display = argv.join(" ");
    info!(command = %command_display, "running");

    let (program, argv_rest) = argv.split_first().ok_or_else(|| StrataError::Instruction {
        instruction: "RUN".to_string(),
        reason: "empty command".to_string(),
    })?;

    let mut child = Process::new(program);
    child.args(argv_rest);
    child.stdout(Stdio::inherit());
    child.stderr(Stdio::inherit());

    // Environment: image env, declared args, and HOME when absent.
    let mut env: Vec<(String, String)> = config
        .config
        .env
        .iter()
        .filter_map(|e| e.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect();
    for (key, value) in args.declared_pairs() {
        if !env.iter().any(|(k, _)| *k == key) {
            env.push((key, value));
        }
    }
    let user = config.config.user.clone();
    let (user_part, _) = passwd::split_user_group(&user);
    if !env.iter().any(|(k, _)| k == "HOME") {
        let home = passwd::home_for(ctx.root, user_part)?;
        env.push(("HOME".to_string(), home));
    }
    if !env.iter().any(|(k, _)| k == "PATH") {
        env.push(("PATH".to_string(), DEFAULT_PATH.to_string()));
    }
    child.env_clear();
    child.envs(env);

    // Working directory only when it exists, the way docker runs it.
    let workdir = &config.config.working_dir;
    if !workdir.is_empty() {
        let on_disk = rooted(ctx.root, Path::new(workdir));
        if on_disk.is_dir() {
            child.current_dir(on_disk);
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group so grandchildren can be reaped after wait.
        child.process_group(0);
        if !user_part.is_empty() {
            let resolved = passwd::lookup(ctx.root, user_part, passwd::split_user_group(&user).1)?;
            child.uid(resolved.uid);
            child.gid(resolved.gid);
        }
    }

    let mut handle = child.spawn().map_err(|e| StrataError::ChildSpawn {
        command: command_display.clone(),
        source: e,
    })?;

    // Group id is only queryable while the child is alive.
    #[cfg(unix)]
    let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(handle.id() as i32))).ok();

    let status = handle.wait().map_err(|e| StrataError::ChildSpawn {
        command: command_display.clone(),
        source: e,
    })?;

    #[cfg(unix)]
    if let Some(pgid) = pgid {
        reap_process_group(pgid);
    }

    if !status.success() {
        let code = exit_code_of(&status);
        return Err(StrataError::ChildExit { code, command: command_display });
    }
    Ok(())
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Kill anything left in the child's process group; finished groups are
/// not an error.
#[cfg(unix)]
fn reap_process_group(pgid: nix::unistd::Pid) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(-pgid.as_raw()), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(errno) => warn!(%errno, "failed to kill process group"),
    }
}

fn setup_mounts(
    spec: &RunSpec,
    config: &ImageConfigFile,
    args: &BuildArgs,
    used: &mut BTreeMap<String, String>,
    ctx: &StepContext<'_>,
    guards: &mut Vec<MountGuard>,
) -> Result<()> {
    for mount in &spec.mounts {
        match mount.mount_type() {
            "cache" if ctx.flags.run_mount_cache => {
                guards.push(setup_cache_mount(mount, config, args, used, ctx)?);
            }
            "secret" if ctx.flags.run_mount_secret => {
                guards.push(setup_secret_mount(mount, ctx)?);
            }
            other => {
                warn!(
                    mount_type = other,
                    "RUN --mount type is not supported; relying on unsupported mounts can lead to invalid builds"
                );
            }
        }
    }
    Ok(())
}

/// Swap a persistent cache directory into the mount target for the
/// duration of the command. The swap directory stages the target's
/// original content and must be drained by release.
fn setup_cache_mount(
    mount: &Mount,
    config: &ImageConfigFile,
    args: &BuildArgs,
    used: &mut BTreeMap<String, String>,
    ctx: &StepContext<'_>,
) -> Result<MountGuard> {
    let target = mount.target().ok_or_else(|| StrataError::Instruction {
        instruction: "RUN".to_string(),
        reason: "--mount=type=cache requires target=".to_string(),
    })?;
    let target = crate::exec::meta::expand_word(target, config, args, used, 0)?;

    let normalized = clean_path(&target);
    let key = sha256_hex(normalized.as_bytes());
    let cache_dir = ctx.dirs.run_cache(&key);
    std::fs::create_dir_all(&cache_dir).map_err(|e| StrataError::io(&cache_dir, e))?;

    let target_disk = rooted(ctx.root, Path::new(&normalized));
    let created = ensure_dir_tracking_first(&target_disk)?;

    let staging = ctx.dirs.swap().join(&key);
    debug!(target = %target_disk.display(), cache = %cache_dir.display(), "swapping in cache mount");
    std::fs::rename(&target_disk, &staging).map_err(|e| StrataError::io(&target_disk, e))?;
    if let Err(e) = std::fs::rename(&cache_dir, &target_disk) {
        // Unwind the first rename so the rootfs is intact.
        let _ = std::fs::rename(&staging, &target_disk);
        return Err(StrataError::io(&cache_dir, e));
    }

    Ok(MountGuard::CacheSwap { target: target_disk, cache_dir, staging, created })
}

/// Materialize a secret at its target for the duration of the command.
fn setup_secret_mount(mount: &Mount, ctx: &StepContext<'_>) -> Result<MountGuard> {
    let id = mount.id().ok_or_else(|| StrataError::Instruction {
        instruction: "RUN".to_string(),
        reason: "--mount=type=secret requires id=".to_string(),
    })?;

    let payload = match ctx.secrets.get(id) {
        Some(SecretSource::File(path)) => {
            std::fs::read(path).map_err(|e| StrataError::Secret {
                id: id.to_string(),
                reason: format!("reading {}: {e}", path.display()),
            })?
        }
        Some(SecretSource::Env(var)) => std::env::var(var)
            .map_err(|_| StrataError::Secret {
                id: id.to_string(),
                reason: format!("environment variable {var} is not set"),
            })?
            .into_bytes(),
        None => {
            return Err(StrataError::Secret {
                id: id.to_string(),
                reason: "no --secret provided for this id".to_string(),
            })
        }
    };

    let target = match mount.target() {
        Some(t) => PathBuf::from(t),
        None => PathBuf::from("/run/secrets").join(id),
    };
    let target_disk = rooted(ctx.root, &target);
    let created = ensure_parent_tracking_first(&target_disk)?;

    // Written exclusively, readable only by root.
    std::fs::write(&target_disk, &payload).map_err(|e| StrataError::io(&target_disk, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&target_disk, std::fs::Permissions::from_mode(0o400))
            .map_err(|e| StrataError::io(&target_disk, e))?;
        if let Err(e) = std::os::unix::fs::chown(&target_disk, Some(0), Some(0)) {
            if e.kind() != std::io::ErrorKind::PermissionDenied {
                return Err(StrataError::io(&target_disk, e));
            }
        }
    }

    Ok(MountGuard::Secret { target: target_disk, created })
}

/// Scoped unwind for a RUN mount.
enum MountGuard {
    CacheSwap {
        target: PathBuf,
        cache_dir: PathBuf,
        staging: PathBuf,
        created: Option<PathBuf>,
    },
    Secret {
        target: PathBuf,
        created: Option<PathBuf>,
    },
}

impl MountGuard {
    fn release(self) -> Result<()> {
        match self {
            Self::CacheSwap { target, cache_dir, staging, created } => {
                std::fs::rename(&target, &cache_dir).map_err(|e| StrataError::io(&target, e))?;
                std::fs::rename(&staging, &target).map_err(|e| StrataError::io(&staging, e))?;
                if let Some(created) = created {
                    std::fs::remove_dir_all(&created)
                        .map_err(|e| StrataError::io(&created, e))?;
                }
                Ok(())
            }
            Self::Secret { target, created } => {
                std::fs::remove_file(&target).map_err(|e| StrataError::io(&target, e))?;
                if let Some(created) = created {
                    let _ = std::fs::remove_dir_all(&created);
                }
                Ok(())
            }
        }
    }
}

/// Lexically clean a path: collapse `//`, resolve `.` and `..`.
fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let absolute = path.starts_with('/');
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Create `target` (and parents), returning the shallowest directory that
/// did not exist before, so it can be removed on unwind.
fn ensure_dir_tracking_first(target: &Path) -> Result<Option<PathBuf>> {
    let mut first_created = None;
    let mut current = target;
    loop {
        if current.exists() {
            break;
        }
        first_created = Some(current.to_path_buf());
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    if first_created.is_some() {
        std::fs::create_dir_all(target).map_err(|e| StrataError::io(target, e))?;
    }
    Ok(first_created)
}

fn ensure_parent_tracking_first(target: &Path) -> Result<Option<PathBuf>> {
    match target.parent() {
        Some(parent) => ensure_dir_tracking_first(parent),
        None => Ok(None),
    }
}
