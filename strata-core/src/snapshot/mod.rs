//! Filesystem snapshotting.
//!
//! Tracks a baseline of the root filesystem (the last committed layer
//! state) and diffs the live tree against it to produce layer tarballs:
//! additions and modifications carry content, deletions become whiteouts.
//! A full scan walks everything outside the ignore list; a targeted scan
//! visits exactly the hinted paths and their ancestors.

pub mod tarball;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::config::{Compression, SnapshotMode};
use crate::error::{Result, StrataError};
use crate::exec::rooted;
use crate::image::Layer;
use crate::paths::IgnoreList;
pub use tarball::LayerEntry;

/// Files larger than this are fingerprinted by size and mtime instead of
/// content hash.
const LARGE_FILE_THRESHOLD: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// The per-path fingerprint tuple held in the baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileState {
    kind: FileKind,
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    mtime: i64,
    link_target: Option<PathBuf>,
    content_hash: Option<String>,
}

/// A pending baseline mutation, applied after the layer is written.
enum BaselineOp {
    Set(FileState),
    RemoveTree,
    ReplaceTree(FileState),
    PurgeChildren,
}

/// Where and how a layer gets written.
#[derive(Debug, Clone)]
pub struct LayerSink {
    pub output: PathBuf,
    pub compression: Compression,
    pub compression_level: Option<i32>,
    pub reproducible: bool,
}

/// Snapshot engine for one build's root filesystem.
pub struct Snapshotter {
    root: PathBuf,
    ignore: IgnoreList,
    mode: SnapshotMode,
    baseline: BTreeMap<PathBuf, FileState>,
}

impl Snapshotter {
    pub fn new(root: impl Into<PathBuf>, ignore: IgnoreList, mode: SnapshotMode) -> Self {
        Self { root: root.into(), ignore, mode, baseline: BTreeMap::new() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan the current tree into the baseline without producing a layer.
    /// Called after the base image is extracted.
    pub fn seed_baseline(&mut self) -> Result<()> {
        self.baseline = self.scan_all()?;
        debug!(files = self.baseline.len(), "seeded snapshot baseline");
        Ok(())
    }

    /// Diff the whole filesystem against the baseline and write a layer.
    pub fn take_full_snapshot(&mut self, sink: &LayerSink) -> Result<Option<Layer>> {
        let current = self.scan_all()?;

        // A directory whose entire prior child set is gone gets one
        // opaque marker instead of a whiteout per child; a directory
        // replaced by a non-directory gets its old tree whited out before
        // the new entry.
        let opaque_dirs = self.replaced_directories(&current);
        let mut kind_changed_dirs: Vec<PathBuf> = Vec::new();

        let mut entries = Vec::new();
        for (path, state) in &current {
            match self.baseline.get(path) {
                Some(old) if !self.changed(old, state) => {}
                Some(old) if old.kind == FileKind::Dir && state.kind != FileKind::Dir => {
                    entries.push(LayerEntry::Whiteout(path.clone()));
                    entries.push(LayerEntry::Path(path.clone()));
                    kind_changed_dirs.push(path.clone());
                }
                _ => entries.push(LayerEntry::Path(path.clone())),
            }
        }
        for dir in &opaque_dirs {
            entries.push(LayerEntry::Opaque(dir.clone()));
        }
        for path in self.baseline.keys() {
            if current.contains_key(path) {
                continue;
            }
            if covered_by_deleted_ancestor(&self.baseline, &current, path)
                || has_strict_ancestor_in(&opaque_dirs, path)
                || has_strict_ancestor_in(&kind_changed_dirs, path)
            {
                continue;
            }
            entries.push(LayerEntry::Whiteout(path.clone()));
        }

        trace!(changed = entries.len(), "full snapshot diff");
        let layer = tarball::write_layer(
            &self.root,
            entries,
            &sink.output,
            sink.compression,
            sink.compression_level,
            sink.reproducible,
        )?;
        self.baseline = current;
        Ok(layer)
    }

    /// Baseline directories that still exist as directories but whose
    /// entire prior child set is gone from the current tree.
    fn replaced_directories(&self, current: &BTreeMap<PathBuf, FileState>) -> Vec<PathBuf> {
        let mut children_of: BTreeMap<&Path, Vec<&PathBuf>> = BTreeMap::new();
        for path in self.baseline.keys() {
            if let Some(parent) = path.parent() {
                children_of.entry(parent).or_default().push(path);
            }
        }

        let mut out = Vec::new();
        for (path, old) in &self.baseline {
            if old.kind != FileKind::Dir {
                continue;
            }
            if !current.get(path).is_some_and(|s| s.kind == FileKind::Dir) {
                continue;
            }
            let Some(children) = children_of.get(path.as_path()) else { continue };
            if !children.is_empty() && children.iter().all(|c| !current.contains_key(*c)) {
                out.push(path.clone());
            }
        }
        out
    }

    /// Snapshot exactly the hinted paths (and their new ancestors).
    /// Hinted paths that disappeared since the baseline become whiteouts;
    /// a hinted directory whose entire prior child set is gone gets an
    /// opaque marker.
    pub fn take_targeted_snapshot(
        &mut self,
        hints: &[PathBuf],
        sink: &LayerSink,
    ) -> Result<Option<Layer>> {
        let mut entries = Vec::new();
        let mut ops: Vec<(PathBuf, BaselineOp)> = Vec::new();

        for hint in hints {
            let abs = normalize_abs(hint);
            if abs == Path::new("/") {
                return Err(StrataError::FilesystemInvariant {
                    reason: "refusing to snapshot the root directory as a file".to_string(),
                });
            }
            if self.ignore.is_ignored(&abs) {
                continue;
            }

            // New ancestors must appear in the tar before their children.
            for ancestor in ancestors_of(&abs) {
                if !self.baseline.contains_key(&ancestor) {
                    if let Some(state) = self.state_of(&ancestor)? {
                        entries.push(LayerEntry::Path(ancestor.clone()));
                        ops.push((ancestor, BaselineOp::Set(state)));
                    }
                }
            }

            match self.state_of(&abs)? {
                Some(state) => {
                    let old = self.baseline.get(&abs);
                    if old.is_some_and(|o| o.kind == FileKind::Dir)
                        && state.kind != FileKind::Dir
                    {
                        // A directory replaced by a non-directory: the old
                        // tree is whited out before the new entry applies.
                        entries.push(LayerEntry::Whiteout(abs.clone()));
                        entries.push(LayerEntry::Path(abs.clone()));
                        ops.push((abs, BaselineOp::ReplaceTree(state)));
                        continue;
                    }
                    if state.kind == FileKind::Dir
                        && old.is_some()
                        && self.hint_dir_emptied(&abs)
                    {
                        entries.push(LayerEntry::Opaque(abs.clone()));
                        ops.push((abs.clone(), BaselineOp::PurgeChildren));
                    }
                    let changed = old.map_or(true, |o| self.changed(o, &state));
                    if changed {
                        entries.push(LayerEntry::Path(abs.clone()));
                        ops.push((abs, BaselineOp::Set(state)));
                    }
                }
                None => {
                    if self.baseline.contains_key(&abs) {
                        entries.push(LayerEntry::Whiteout(abs.clone()));
                        ops.push((abs, BaselineOp::RemoveTree));
                    }
                }
            }
        }

        trace!(changed = entries.len(), "targeted snapshot diff");
        let layer = tarball::write_layer(
            &self.root,
            entries,
            &sink.output,
            sink.compression,
            sink.compression_level,
            sink.reproducible,
        )?;

        // Removals first so a purge cannot erase a sibling hint's insert,
        // whatever order the hints arrived in.
        for (path, op) in &ops {
            match op {
                BaselineOp::RemoveTree | BaselineOp::ReplaceTree(_) => {
                    self.baseline.retain(|p, _| p != path && !p.starts_with(path));
                }
                BaselineOp::PurgeChildren => {
                    self.baseline.retain(|p, _| p == path || !p.starts_with(path));
                }
                BaselineOp::Set(_) => {}
            }
        }
        for (path, op) in ops {
            match op {
                BaselineOp::Set(state) | BaselineOp::ReplaceTree(state) => {
                    self.baseline.insert(path, state);
                }
                BaselineOp::RemoveTree | BaselineOp::PurgeChildren => {}
            }
        }
        Ok(layer)
    }

    /// Whether a hinted directory had baseline children and every one of
    /// them is gone from disk.
    fn hint_dir_emptied(&self, dir: &Path) -> bool {
        let mut had_children = false;
        for child in self.baseline.keys().filter(|p| p.parent() == Some(dir)) {
            had_children = true;
            if rooted(&self.root, child).symlink_metadata().is_ok() {
                return false;
            }
        }
        had_children
    }

    /// Absorb out-of-band changes to the given paths into the baseline
    /// without producing a layer. Used after extracting a cached layer,
    /// whose tarball already is the step's layer.
    pub fn refresh_paths(&mut self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            let abs = normalize_abs(path);
            for ancestor in ancestors_of(&abs) {
                if !self.baseline.contains_key(&ancestor) {
                    if let Some(state) = self.state_of(&ancestor)? {
                        self.baseline.insert(ancestor, state);
                    }
                }
            }
            match self.state_of(&abs)? {
                Some(state) => {
                    self.baseline.insert(abs, state);
                }
                None => {
                    self.baseline.retain(|p, _| p != &abs && !p.starts_with(&abs));
                }
            }
        }
        Ok(())
    }

    fn scan_all(&self) -> Result<BTreeMap<PathBuf, FileState>> {
        let mut out = BTreeMap::new();
        let walker = WalkDir::new(&self.root).min_depth(1).sort_by_file_name().into_iter();
        let mut it = walker;
        loop {
            let entry = match it.next() {
                None => break,
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    // Unreadable subtrees (permissions) are skipped, the
                    // way the ignore list skips virtual filesystems.
                    trace!(error = %e, "skipping unreadable path during scan");
                    continue;
                }
            };
            let abs = Path::new("/").join(
                entry.path().strip_prefix(&self.root).expect("walkdir stays under root"),
            );
            if self.ignore.is_ignored(&abs) {
                if entry.file_type().is_dir() {
                    it.skip_current_dir();
                }
                continue;
            }
            if let Some(state) = self.state_of(&abs)? {
                out.insert(abs, state);
            }
        }
        Ok(out)
    }

    fn state_of(&self, abs: &Path) -> Result<Option<FileState>> {
        let disk = rooted(&self.root, abs);
        let meta = match disk.symlink_metadata() {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StrataError::io(&disk, e)),
        };

        #[cfg(unix)]
        let (mode, uid, gid, mtime) = {
            use std::os::unix::fs::MetadataExt;
            (meta.mode(), meta.uid(), meta.gid(), meta.mtime())
        };
        #[cfg(not(unix))]
        let (mode, uid, gid, mtime) = (0u32, 0u32, 0u32, 0i64);

        let file_type = meta.file_type();
        let (kind, link_target, content_hash) = if file_type.is_symlink() {
            let target = std::fs::read_link(&disk).map_err(|e| StrataError::io(&disk, e))?;
            (FileKind::Symlink, Some(target), None)
        } else if file_type.is_dir() {
            (FileKind::Dir, None, None)
        } else if file_type.is_file() {
            let hash = match self.mode {
                SnapshotMode::Full if meta.len() <= LARGE_FILE_THRESHOLD => {
                    Some(hash_file(&disk)?)
                }
                _ => None,
            };
            (FileKind::File, None, hash)
        } else {
            (FileKind::Other, None, None)
        };

        Ok(Some(FileState {
            kind,
            mode,
            uid,
            gid,
            size: meta.len(),
            mtime,
            link_target,
            content_hash,
        }))
    }

    /// Whether a path's state counts as changed under the snapshot mode.
    fn changed(&self, old: &FileState, new: &FileState) -> bool {
        if old.kind != new.kind || old.link_target != new.link_target {
            return true;
        }
        match self.mode {
            SnapshotMode::Time => old.mtime != new.mtime,
            SnapshotMode::Redo => {
                old.mode != new.mode
                    || old.uid != new.uid
                    || old.gid != new.gid
                    || old.size != new.size
                    || old.mtime != new.mtime
            }
            SnapshotMode::Full => {
                old.mode != new.mode
                    || old.uid != new.uid
                    || old.gid != new.gid
                    || old.size != new.size
                    || old.content_hash != new.content_hash
                    // Large files fall back to mtime comparison.
                    || (new.content_hash.is_none()
                        && new.kind == FileKind::File
                        && old.mtime != new.mtime)
            }
        }
    }
}

/// A deleted path does not need its own whiteout when a deleted ancestor
/// already produces one.
fn covered_by_deleted_ancestor(
    baseline: &BTreeMap<PathBuf, FileState>,
    current: &BTreeMap<PathBuf, FileState>,
    path: &Path,
) -> bool {
    let mut ancestor = path.parent();
    while let Some(a) = ancestor {
        if a == Path::new("/") {
            break;
        }
        if baseline.contains_key(a) && !current.contains_key(a) {
            return true;
        }
        ancestor = a.parent();
    }
    false
}

/// Whether any entry in `dirs` is a strict ancestor of `path`.
fn has_strict_ancestor_in(dirs: &[PathBuf], path: &Path) -> bool {
    dirs.iter().any(|dir| path != dir && path.starts_with(dir))
}

fn normalize_abs(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new("/").join(path)
    }
}

/// Proper ancestors of an absolute path, outermost first, excluding `/`.
fn ancestors_of(abs: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = abs
        .ancestors()
        .skip(1)
        .filter(|a| *a != Path::new("/") && !a.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .collect();
    out.reverse();
    out
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| StrataError::io(path, e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| StrataError::io(path, e))?;
    Ok(format!("{:x}", hasher.finalize()))
}
