//! Cache fingerprints.
//!
//! A fingerprint is a pure function of a step's semantic inputs: the
//! canonical command, the relevant build args, the salient base config,
//! and the content of every source file the step would read. No
//! timestamps, no map-iteration order, no base-image labels. A schema
//! version byte leads the input so future layout changes cannot poison
//! caches written by other versions.

use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Result, StrataError};

/// Bumped whenever the fingerprint composition changes.
pub const CACHE_SCHEMA_VERSION: u8 = 1;

/// Input separator. Command text, env pairs and path metadata cannot
/// contain NUL; file contents only enter as their own hex digest.
const SEPARATOR: u8 = 0;

/// The per-source-file tuple entering a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceDigest {
    pub rel_path: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Content hash; symlinks hash their target instead.
    pub sha256: String,
}

/// Compose a fingerprint from its inputs. Sources must be pre-sorted
/// (lexicographically by path); arg/env pairs are sorted here.
pub fn compose(
    command: &str,
    args_envs: Option<&[(String, String)]>,
    config_fragment: &str,
    sources: &[SourceDigest],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update([CACHE_SCHEMA_VERSION]);
    hasher.update([SEPARATOR]);
    hasher.update(command.as_bytes());
    hasher.update([SEPARATOR]);

    if let Some(pairs) = args_envs {
        let mut sorted: Vec<String> =
            pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        sorted.sort();
        for pair in sorted {
            hasher.update(pair.as_bytes());
            hasher.update([SEPARATOR]);
        }
    }
    hasher.update([SEPARATOR]);

    hasher.update(config_fragment.as_bytes());
    hasher.update([SEPARATOR]);

    for source in sources {
        hasher.update(source.rel_path.as_bytes());
        hasher.update([SEPARATOR]);
        hasher.update(source.mode.to_le_bytes());
        hasher.update(source.uid.to_le_bytes());
        hasher.update(source.gid.to_le_bytes());
        hasher.update(source.size.to_le_bytes());
        hasher.update(source.sha256.as_bytes());
        hasher.update([SEPARATOR]);
    }

    format!("{:x}", hasher.finalize())
}

/// Digest a set of resolved source paths relative to their base.
///
/// Directories are walked; every contained file contributes its own
/// entry. The result is sorted by relative path.
pub fn digest_sources(base: &Path, resolved: &[std::path::PathBuf]) -> Result<Vec<SourceDigest>> {
    let mut out = Vec::new();
    for path in resolved {
        let meta = path.symlink_metadata().map_err(|e| StrataError::io(path, e))?;
        if meta.is_dir() {
            for entry in WalkDir::new(path).min_depth(1).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    StrataError::Internal(format!("walking sources: {e}"))
                })?;
                if !entry.file_type().is_dir() {
                    out.push(digest_one(base, entry.path())?);
                }
            }
        } else {
            out.push(digest_one(base, path)?);
        }
    }
    out.sort();
    Ok(out)
}

fn digest_one(base: &Path, path: &Path) -> Result<SourceDigest> {
    let meta = path.symlink_metadata().map_err(|e| StrataError::io(path, e))?;
    let rel_path = path
        .strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned();

    #[cfg(unix)]
    let (mode, uid, gid) = {
        use std::os::unix::fs::MetadataExt;
        (meta.mode(), meta.uid(), meta.gid())
    };
    #[cfg(not(unix))]
    let (mode, uid, gid) = (0u32, 0u32, 0u32);

    let sha256 = if meta.file_type().is_symlink() {
        let target = std::fs::read_link(path).map_err(|e| StrataError::io(path, e))?;
        crate::image::sha256_hex(target.to_string_lossy().as_bytes())
    } else {
        let mut file = std::fs::File::open(path).map_err(|e| StrataError::io(path, e))?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher).map_err(|e| StrataError::io(path, e))?;
        format!("{:x}", hasher.finalize())
    };

    Ok(SourceDigest { rel_path, mode, uid, gid, size: meta.len(), sha256 })
}
