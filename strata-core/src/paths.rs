//! Builder directory layout.
//!
//! All paths the builder writes to live under a single directory (the
//! `--kaniko-dir` flag or `KANIKO_DIR`, `/kaniko` by default) and are
//! resolved once at orchestrator construction. Nothing outside this module
//! derives paths from the executable location or the environment.

use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};

/// The on-disk layout of the builder's own directory.
///
/// ```text
/// <root>/
///   Dockerfile          resolved Dockerfile copy
///   buildcontext/       acquired build context
///   stages/<i>          intermediate stage tarballs
///   deps/<i>/           extracted inter-stage COPY --from trees
///   layers/<fp>         locally cached step layers
///   caches/<sha>        RUN --mount=type=cache persistent dirs
///   swap/               staging for cache-mount swaps; empty between stages
///   secrets/            materialized secrets during a RUN
///   .docker/            docker config written by `strata login`
/// ```
#[derive(Debug, Clone)]
pub struct BuilderDirs {
    root: PathBuf,
}

impl BuilderDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dockerfile(&self) -> PathBuf {
        self.root.join("Dockerfile")
    }

    pub fn build_context(&self) -> PathBuf {
        self.root.join("buildcontext")
    }

    pub fn stage_tarball(&self, index: usize) -> PathBuf {
        self.root.join("stages").join(index.to_string())
    }

    pub fn stage_deps(&self, key: &str) -> PathBuf {
        self.root.join("deps").join(key)
    }

    pub fn layer_cache(&self) -> PathBuf {
        self.root.join("layers")
    }

    pub fn run_cache(&self, target_hash: &str) -> PathBuf {
        self.root.join("caches").join(target_hash)
    }

    pub fn swap(&self) -> PathBuf {
        self.root.join("swap")
    }

    pub fn secrets(&self) -> PathBuf {
        self.root.join("secrets")
    }

    pub fn docker_config(&self) -> PathBuf {
        self.root.join(".docker")
    }

    /// Create the directories a build needs up front.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.root.join("stages"),
            self.root.join("deps"),
            self.layer_cache(),
            self.root.join("caches"),
            self.swap(),
            self.secrets(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
        }
        Ok(())
    }

    /// The swap directory must be empty at every stage boundary; a leftover
    /// entry means a mount swap did not unwind and the rootfs is suspect.
    pub fn assert_swap_empty(&self) -> Result<()> {
        let swap = self.swap();
        if !swap.exists() {
            return Ok(());
        }
        let mut entries =
            std::fs::read_dir(&swap).map_err(|e| StrataError::io(&swap, e))?;
        if entries.next().is_some() {
            return Err(StrataError::FilesystemInvariant {
                reason: format!("swap directory {} is not empty at stage boundary", swap.display()),
            });
        }
        Ok(())
    }

    /// Remove intermediate state left over from previous runs.
    ///
    /// Refuses to operate outside the builder root.
    pub fn cleanup_intermediate(&self) -> Result<()> {
        for sub in ["stages", "deps", "swap", "secrets"] {
            let dir = self.root.join(sub);
            if !dir.starts_with(&self.root) {
                return Err(StrataError::FilesystemInvariant {
                    reason: format!("refusing to remove {} outside builder dir", dir.display()),
                });
            }
            if dir.exists() {
                std::fs::remove_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
            }
            std::fs::create_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
        }
        Ok(())
    }
}

/// Paths never included in a filesystem snapshot.
///
/// `/var/run` is excluded by default (`--ignore-var-run`); user entries come
/// from `--ignore-path`.
#[derive(Debug, Clone)]
pub struct IgnoreList {
    prefixes: Vec<PathBuf>,
}

impl IgnoreList {
    pub fn new(builder_root: &Path, ignore_var_run: bool, extra: &[PathBuf]) -> Self {
        let mut prefixes = vec![
            PathBuf::from("/proc"),
            PathBuf::from("/sys"),
            PathBuf::from("/dev"),
            PathBuf::from("/tmp/apt-key-gpghome"),
            builder_root.to_path_buf(),
        ];
        if ignore_var_run {
            prefixes.push(PathBuf::from("/var/run"));
        }
        prefixes.extend(extra.iter().cloned());
        Self { prefixes }
    }

    /// Whether `path` (absolute, rooted at the snapshot root) is ignored.
    pub fn is_ignored(&self, path: &Path) -> bool {
        self.prefixes.iter().any(|prefix| path.starts_with(prefix))
    }

    pub fn add(&mut self, path: PathBuf) {
        self.prefixes.push(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let dirs = BuilderDirs::new("/kaniko");
        assert_eq!(dirs.stage_tarball(2), PathBuf::from("/kaniko/stages/2"));
        assert_eq!(dirs.stage_deps("0"), PathBuf::from("/kaniko/deps/0"));
        assert_eq!(dirs.run_cache("abc"), PathBuf::from("/kaniko/caches/abc"));
        assert_eq!(dirs.swap(), PathBuf::from("/kaniko/swap"));
    }

    #[test]
    fn test_swap_invariant() {
        let tmp = TempDir::new().unwrap();
        let dirs = BuilderDirs::new(tmp.path());
        dirs.ensure().unwrap();
        dirs.assert_swap_empty().unwrap();

        std::fs::write(dirs.swap().join("leftover"), b"x").unwrap();
        let err = dirs.assert_swap_empty().unwrap_err();
        assert!(matches!(err, StrataError::FilesystemInvariant { .. }));
    }

    #[test]
    fn test_cleanup_recreates_dirs() {
        let tmp = TempDir::new().unwrap();
        let dirs = BuilderDirs::new(tmp.path());
        dirs.ensure().unwrap();
        std::fs::write(dirs.root().join("stages").join("0"), b"old").unwrap();

        dirs.cleanup_intermediate().unwrap();
        assert!(dirs.root().join("stages").exists());
        assert!(!dirs.root().join("stages").join("0").exists());
    }

    #[test]
    fn test_ignore_list() {
        let ignore = IgnoreList::new(Path::new("/kaniko"), true, &[PathBuf::from("/busybox")]);
        assert!(ignore.is_ignored(Path::new("/proc/self/status")));
        assert!(ignore.is_ignored(Path::new("/kaniko/stages/0")));
        assert!(ignore.is_ignored(Path::new("/var/run/lock")));
        assert!(ignore.is_ignored(Path::new("/busybox/sh")));
        assert!(!ignore.is_ignored(Path::new("/usr/bin/env")));

        let ignore = IgnoreList::new(Path::new("/kaniko"), false, &[]);
        assert!(!ignore.is_ignored(Path::new("/var/run/lock")));
    }
}
