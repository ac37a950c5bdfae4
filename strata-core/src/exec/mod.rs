//! Step execution.
//!
//! One resolved instruction comes in; either the image config mutates
//! (metadata-only) or files change on the live root filesystem and their
//! paths come back for the snapshotter. The instruction set is a closed
//! enum: adding an instruction means adding an arm here.

pub mod copy;
pub mod meta;
pub mod passwd;
pub mod run;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{BuildOptions, FeatureFlags, SecretOptions};
use crate::dockerfile::parser::{Instruction, InstructionKind};
use crate::dockerfile::BuildArgs;
use crate::error::{Result, StrataError};
use crate::image::ImageConfigFile;
use crate::paths::BuilderDirs;

/// Everything a step can touch besides the config.
pub struct StepContext<'a> {
    /// The live root filesystem being built.
    pub root: &'a Path,
    /// The acquired build context directory.
    pub context_dir: &'a Path,
    pub dirs: &'a BuilderDirs,
    pub opts: &'a BuildOptions,
    pub flags: &'a FeatureFlags,
    pub http: &'a reqwest::Client,
    /// Materialized `--from` source trees, keyed by the resolved stage
    /// index or image reference.
    pub from_dirs: &'a BTreeMap<String, PathBuf>,
    pub secrets: &'a SecretOptions,
}

impl StepContext<'_> {
    pub fn from_source_dir(&self, from: &str) -> Result<PathBuf> {
        self.from_dirs.get(from).cloned().ok_or_else(|| {
            StrataError::Internal(format!("COPY --from={from} source was not materialized"))
        })
    }
}

/// What a step did to the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Config-only mutation; no layer.
    Metadata,
    /// These image-absolute paths changed; snapshot exactly them.
    Files(Vec<PathBuf>),
    /// Arbitrary filesystem mutation; a full scan is required.
    FullScan,
}

/// The result of executing one step, including the arg/env pairs its
/// expansion actually read (for cache fingerprints).
#[derive(Debug, Clone)]
pub struct ExecutedStep {
    pub outcome: StepOutcome,
    pub used_vars: BTreeMap<String, String>,
}

/// Execute one instruction against the config and root filesystem.
pub async fn execute_step(
    inst: &Instruction,
    config: &mut ImageConfigFile,
    args: &mut BuildArgs,
    ctx: &StepContext<'_>,
) -> Result<ExecutedStep> {
    let mut used = BTreeMap::new();
    let line = inst.line;

    let outcome = match &inst.kind {
        InstructionKind::Env { pairs } => {
            meta::apply_env(pairs, config, args, &mut used, line)?;
            StepOutcome::Metadata
        }
        InstructionKind::Label { pairs } => {
            meta::apply_label(pairs, config, args, &mut used, line)?;
            StepOutcome::Metadata
        }
        InstructionKind::Arg { args: decls } => {
            meta::apply_arg(decls, config, args, &mut used, line)?;
            StepOutcome::Metadata
        }
        InstructionKind::Expose { ports } => {
            meta::apply_expose(ports, config, args, &mut used, line)?;
            StepOutcome::Metadata
        }
        InstructionKind::User { user } => {
            meta::apply_user(user, config, args, &mut used, line)?;
            StepOutcome::Metadata
        }
        InstructionKind::Volume { paths } => {
            meta::apply_volume(paths, config, args, &mut used, line)?;
            StepOutcome::Metadata
        }
        InstructionKind::Cmd { command } => {
            meta::apply_cmd(command, config);
            StepOutcome::Metadata
        }
        InstructionKind::Entrypoint { command } => {
            meta::apply_entrypoint(command, config);
            StepOutcome::Metadata
        }
        InstructionKind::Healthcheck { health } => {
            meta::apply_healthcheck(health, config)?;
            StepOutcome::Metadata
        }
        InstructionKind::Shell { argv } => {
            meta::apply_shell(argv, config);
            StepOutcome::Metadata
        }
        InstructionKind::StopSignal { signal } => {
            meta::apply_stopsignal(signal, config, args, &mut used, line)?;
            StepOutcome::Metadata
        }
        InstructionKind::Maintainer { name } => {
            meta::apply_maintainer(name, config);
            StepOutcome::Metadata
        }
        InstructionKind::Onbuild { expression } => {
            meta::apply_onbuild(expression, config);
            StepOutcome::Metadata
        }
        InstructionKind::Workdir { path } => {
            let files = meta::apply_workdir(path, ctx.root, config, args, &mut used, line)?;
            if files.is_empty() {
                StepOutcome::Metadata
            } else {
                StepOutcome::Files(files)
            }
        }
        InstructionKind::Copy(spec) => {
            let files = copy::execute_copy(spec, line, config, args, &mut used, ctx).await?;
            StepOutcome::Files(files)
        }
        InstructionKind::Add(spec) => {
            let files = copy::execute_add(spec, line, config, args, &mut used, ctx).await?;
            StepOutcome::Files(files)
        }
        InstructionKind::Run(spec) => {
            run::execute_run(spec, config, args, &mut used, ctx)?;
            StepOutcome::FullScan
        }
    };

    Ok(ExecutedStep { outcome, used_vars: used })
}

/// Whether a step participates in layer caching.
pub fn is_cacheable(inst: &Instruction, opts: &BuildOptions) -> bool {
    match &inst.kind {
        InstructionKind::Run(_) => opts.cache_run_layers,
        InstructionKind::Copy(_) | InstructionKind::Add(_) => opts.cache_copy_layers,
        InstructionKind::Workdir { .. } => opts.cache_copy_layers,
        _ => false,
    }
}

/// Whether a step can only mutate the config, never the filesystem.
pub fn is_metadata_only(inst: &Instruction) -> bool {
    !matches!(
        inst.kind,
        InstructionKind::Run(_)
            | InstructionKind::Copy(_)
            | InstructionKind::Add(_)
            | InstructionKind::Workdir { .. }
    )
}

/// Whether the step's fingerprint must include the declared args and envs.
pub fn requires_args_in_cache_key(inst: &Instruction) -> bool {
    matches!(inst.kind, InstructionKind::Run(_))
}

/// The canonical command text for cache fingerprints.
///
/// `RUN` uses the shell-wrapped argv so a `SHELL` change invalidates the
/// cache; `COPY`/`ADD` use a normalized rendering with flags in a fixed
/// order (`--from` has already been rewritten to a stage index by the
/// planner); everything else uses the source text.
pub fn canonical_command(inst: &Instruction, config: &ImageConfigFile) -> String {
    match &inst.kind {
        InstructionKind::Run(spec) => {
            let argv = run::resolved_argv(spec, config);
            serde_json::to_string(&argv).unwrap_or_else(|_| argv.join(" "))
        }
        InstructionKind::Copy(spec) => {
            let mut out = String::from("COPY");
            if let Some(from) = &spec.from {
                out.push_str(&format!(" --from={from}"));
            }
            if let Some(chown) = &spec.chown {
                out.push_str(&format!(" --chown={chown}"));
            }
            if let Some(chmod) = &spec.chmod {
                out.push_str(&format!(" --chmod={chmod}"));
            }
            if spec.link {
                out.push_str(" --link");
            }
            for source in &spec.sources {
                out.push_str(&format!(" {source}"));
            }
            out.push_str(&format!(" {}", spec.dest));
            out
        }
        InstructionKind::Add(spec) => {
            let mut out = String::from("ADD");
            if let Some(from) = &spec.from {
                out.push_str(&format!(" --from={from}"));
            }
            if let Some(chown) = &spec.chown {
                out.push_str(&format!(" --chown={chown}"));
            }
            if let Some(chmod) = &spec.chmod {
                out.push_str(&format!(" --chmod={chmod}"));
            }
            if let Some(checksum) = &spec.checksum {
                out.push_str(&format!(" --checksum={checksum}"));
            }
            for source in &spec.sources {
                out.push_str(&format!(" {source}"));
            }
            out.push_str(&format!(" {}", spec.dest));
            out
        }
        _ => inst.raw.clone(),
    }
}

/// Map an image-absolute path onto the on-disk root.
pub fn rooted(root: &Path, abs: &Path) -> PathBuf {
    match abs.strip_prefix("/") {
        Ok(rel) => root.join(rel),
        Err(_) => root.join(abs),
    }
}

/// Create a directory tree owned by `uid:gid` with the given mode.
pub fn mkdir_all_with_owner(path: &Path, mode: u32, uid: u32, gid: u32) -> Result<()> {
    let mut missing = Vec::new();
    let mut current = path;
    while !current.exists() {
        missing.push(current.to_path_buf());
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    std::fs::create_dir_all(path).map_err(|e| StrataError::io(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for dir in missing.iter().rev() {
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode))
                .map_err(|e| StrataError::io(dir, e))?;
            if let Err(e) = std::os::unix::fs::chown(dir, Some(uid), Some(gid)) {
                if e.kind() != std::io::ErrorKind::PermissionDenied {
                    return Err(StrataError::io(dir, e));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dockerfile::parser::parse;
    use crate::image::Platform;

    fn instruction(line: &str) -> Instruction {
        let parsed = parse(&format!("FROM scratch\n{line}\n")).unwrap();
        parsed.stages[0].instructions[0].clone()
    }

    #[test]
    fn test_cacheability_rules() {
        let opts = BuildOptions { cache_copy_layers: true, cache_run_layers: true, ..Default::default() };
        assert!(is_cacheable(&instruction("RUN echo x"), &opts));
        assert!(is_cacheable(&instruction("COPY a /a"), &opts));
        assert!(is_cacheable(&instruction("WORKDIR /app"), &opts));
        assert!(!is_cacheable(&instruction("ENV A=1"), &opts));
        assert!(!is_cacheable(&instruction("USER app"), &opts));

        let no_copy = BuildOptions { cache_copy_layers: false, cache_run_layers: true, ..Default::default() };
        assert!(!is_cacheable(&instruction("COPY a /a"), &no_copy));
        assert!(is_cacheable(&instruction("RUN echo x"), &no_copy));
    }

    #[test]
    fn test_metadata_only_classification() {
        assert!(is_metadata_only(&instruction("ENV A=1")));
        assert!(is_metadata_only(&instruction("EXPOSE 80")));
        assert!(!is_metadata_only(&instruction("RUN true")));
        assert!(!is_metadata_only(&instruction("WORKDIR /app")));
        assert!(!is_metadata_only(&instruction("COPY a /a")));
    }

    #[test]
    fn test_canonical_command_includes_shell() {
        let config = ImageConfigFile::scratch(&Platform::parse("linux/amd64"));
        let inst = instruction("RUN echo hi");
        let canonical = canonical_command(&inst, &config);
        assert!(canonical.contains("/bin/sh"));
        assert!(canonical.contains("echo hi"));

        let mut bash = config.clone();
        bash.config.shell = Some(vec!["/bin/bash".into(), "-c".into()]);
        assert_ne!(canonical, canonical_command(&inst, &bash));
    }

    #[test]
    fn test_canonical_copy_normalizes_flag_order() {
        let config = ImageConfigFile::scratch(&Platform::parse("linux/amd64"));
        let a = instruction("COPY --chmod=0644 --chown=app:app a b /dst/");
        let b = instruction("COPY --chown=app:app --chmod=0644 a b /dst/");
        assert_eq!(canonical_command(&a, &config), canonical_command(&b, &config));
    }

    #[test]
    fn test_canonical_copy_includes_link() {
        let config = ImageConfigFile::scratch(&Platform::parse("linux/amd64"));
        let plain = instruction("COPY a /dst");
        let linked = instruction("COPY --link a /dst");
        assert_ne!(canonical_command(&plain, &config), canonical_command(&linked, &config));
        assert!(canonical_command(&linked, &config).contains("--link"));
    }

    #[test]
    fn test_rooted() {
        assert_eq!(rooted(Path::new("/tmp/root"), Path::new("/a/b")), PathBuf::from("/tmp/root/a/b"));
        assert_eq!(rooted(Path::new("/"), Path::new("/a")), PathBuf::from("/a"));
    }
}
