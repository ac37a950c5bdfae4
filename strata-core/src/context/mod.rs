//! Build context acquisition.
//!
//! The `--context` argument names a source by scheme: a local directory
//! (default or `dir://`), a local tarball (`tar://`), or a git repository
//! (`git://`, or an https URL ending in `.git`). Object-store contexts
//! (`s3://`, `gs://`) belong to an external provider and are rejected
//! with an actionable error.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::config::{BuildOptions, GitOptions};
use crate::error::{Result, StrataError};

/// Materialize the build context, returning the directory COPY/ADD
/// sources resolve against.
pub fn acquire(opts: &BuildOptions, dest: &Path) -> Result<PathBuf> {
    let src = opts.src_context.as_str();
    let root = if let Some(path) = src.strip_prefix("dir://") {
        local_dir(Path::new(path), dest, opts.preserve_context)?
    } else if let Some(path) = src.strip_prefix("tar://") {
        extract_tarball(Path::new(path), dest)?
    } else if src.starts_with("git://") || (src.starts_with("https://") && src.ends_with(".git")) {
        clone_git(src, dest, &opts.git)?
    } else if src.starts_with("s3://") || src.starts_with("gs://") {
        return Err(StrataError::Context {
            reason: format!(
                "context scheme of {src:?} requires an object-store context provider, which is not configured"
            ),
        });
    } else {
        local_dir(Path::new(src), dest, opts.preserve_context)?
    };

    match &opts.context_sub_path {
        Some(sub) => {
            let sub_root = root.join(sub.trim_start_matches('/'));
            if !sub_root.is_dir() {
                return Err(StrataError::Context {
                    reason: format!("context sub path {sub:?} does not exist"),
                });
            }
            Ok(sub_root)
        }
        None => Ok(root),
    }
}

/// A plain directory context. With `--preserve-context` the tree is
/// copied into the builder directory so in-place builds cannot mutate the
/// caller's files; otherwise it is used where it is.
fn local_dir(path: &Path, dest: &Path, preserve: bool) -> Result<PathBuf> {
    let canonical = path.canonicalize().map_err(|e| StrataError::Context {
        reason: format!("context directory {}: {e}", path.display()),
    })?;
    if !preserve {
        debug!(context = %canonical.display(), "using build context in place");
        return Ok(canonical);
    }

    info!(context = %canonical.display(), "copying build context");
    copy_tree(&canonical, dest)?;
    Ok(dest.to_path_buf())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).map_err(|e| StrataError::io(dest, e))?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| StrataError::Context {
            reason: format!("reading context: {e}"),
        })?;
        let rel = entry.path().strip_prefix(src).expect("walkdir stays under src");
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| StrataError::io(&target, e))?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())
                .map_err(|e| StrataError::io(entry.path(), e))?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(link, &target)
                .map_err(|e| StrataError::io(&target, e))?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| StrataError::io(&target, e))?;
        }
    }
    Ok(())
}

fn extract_tarball(path: &Path, dest: &Path) -> Result<PathBuf> {
    info!(tarball = %path.display(), "extracting build context");
    let data = std::fs::read(path).map_err(|e| StrataError::Context {
        reason: format!("context tarball {}: {e}", path.display()),
    })?;
    std::fs::create_dir_all(dest).map_err(|e| StrataError::io(dest, e))?;
    crate::image::remote::apply_layer_tar(&data, dest)?;
    Ok(dest.to_path_buf())
}

/// Clone a git context with the options from `--git`.
fn clone_git(url: &str, dest: &Path, git: &GitOptions) -> Result<PathBuf> {
    let https_url = url.strip_prefix("git://").map(|rest| {
        // `git://host/repo#ref` selects a branch the way kaniko contexts do.
        format!("https://{rest}")
    });
    let (url, fragment_branch) = match &https_url {
        Some(rewritten) => match rewritten.split_once('#') {
            Some((base, fragment)) => (base.to_string(), Some(fragment.to_string())),
            None => (rewritten.clone(), None),
        },
        None => (url.to_string(), None),
    };

    let mut cmd = Command::new("git");
    cmd.arg("clone");
    if let Some(branch) = git.branch.as_deref().or(fragment_branch.as_deref()) {
        cmd.args(["--branch", branch]);
    }
    if git.single_branch {
        cmd.arg("--single-branch");
    }
    if let Some(depth) = git.depth {
        cmd.args(["--depth", &depth.to_string()]);
    }
    if git.recurse_submodules {
        cmd.arg("--recurse-submodules");
    }
    if git.insecure_skip_tls {
        cmd.args(["-c", "http.sslVerify=false"]);
    }
    cmd.arg(&url).arg(dest);

    info!(url = %url, "cloning build context");
    let output = cmd.output().map_err(|e| StrataError::Context {
        reason: format!("running git: {e}"),
    })?;
    if !output.status.success() {
        return Err(StrataError::Context {
            reason: format!(
                "git clone of {url} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(dest.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn opts_with_context(src: &str) -> BuildOptions {
        BuildOptions { src_context: src.to_string(), ..Default::default() }
    }

    #[test]
    fn test_local_dir_in_place() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("file"), b"x").unwrap();
        let dest = TempDir::new().unwrap();

        let opts = opts_with_context(tmp.path().to_str().unwrap());
        let root = acquire(&opts, dest.path()).unwrap();
        assert_eq!(root, tmp.path().canonicalize().unwrap());
    }

    #[test]
    fn test_local_dir_preserved_copies() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/file"), b"x").unwrap();
        let dest = TempDir::new().unwrap();
        let dest_dir = dest.path().join("ctx");

        let mut opts = opts_with_context(tmp.path().to_str().unwrap());
        opts.preserve_context = true;
        let root = acquire(&opts, &dest_dir).unwrap();
        assert_eq!(root, dest_dir);
        assert_eq!(std::fs::read(dest_dir.join("sub/file")).unwrap(), b"x");
    }

    #[test]
    fn test_tar_context() {
        let tmp = TempDir::new().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(9);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "Dockerfile", &b"FROM a:b\n"[..]).unwrap();
        let tar_path = tmp.path().join("ctx.tar");
        std::fs::write(&tar_path, builder.into_inner().unwrap()).unwrap();

        let dest = TempDir::new().unwrap();
        let dest_dir = dest.path().join("ctx");
        let opts = opts_with_context(&format!("tar://{}", tar_path.display()));
        let root = acquire(&opts, &dest_dir).unwrap();
        assert_eq!(std::fs::read(root.join("Dockerfile")).unwrap(), b"FROM a:b\n");
    }

    #[test]
    fn test_sub_path() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("services/api")).unwrap();
        let dest = TempDir::new().unwrap();

        let mut opts = opts_with_context(tmp.path().to_str().unwrap());
        opts.context_sub_path = Some("services/api".to_string());
        let root = acquire(&opts, dest.path()).unwrap();
        assert!(root.ends_with("services/api"));

        opts.context_sub_path = Some("missing".to_string());
        assert!(acquire(&opts, dest.path()).is_err());
    }

    #[test]
    fn test_object_store_rejected() {
        let dest = TempDir::new().unwrap();
        let err = acquire(&opts_with_context("s3://bucket/ctx.tar"), dest.path()).unwrap_err();
        assert!(matches!(err, StrataError::Context { .. }));
    }
}
