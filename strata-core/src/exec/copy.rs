//! `COPY` and `ADD` execution.
//!
//! Sources resolve against the build context (or a previous stage's
//! captured filesystem, or an unpacked remote image, via `--from`);
//! destinations resolve against the current working directory. `ADD`
//! additionally accepts http(s) URLs (with optional checksum pinning) and
//! auto-extracts local archives.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use globset::GlobBuilder;
use tracing::debug;
use walkdir::WalkDir;

use crate::dockerfile::parser::{AddSpec, CopySpec};
use crate::dockerfile::BuildArgs;
use crate::error::{Result, StrataError};
use crate::exec::passwd;
use crate::exec::{meta, rooted, StepContext};
use crate::image::{sha256_digest, ImageConfigFile};

/// Execute a COPY instruction. Returns the image-absolute paths to
/// snapshot.
pub async fn execute_copy(
    spec: &CopySpec,
    line: usize,
    config: &ImageConfigFile,
    args: &BuildArgs,
    used: &mut BTreeMap<String, String>,
    ctx: &StepContext<'_>,
) -> Result<Vec<PathBuf>> {
    let sources = expand_all(&spec.sources, config, args, used, line)?;
    let dest = meta::expand_word(&spec.dest, config, args, used, line)?;

    let source_root = match &spec.from {
        Some(from) => ctx.from_source_dir(from)?,
        None => ctx.context_dir.to_path_buf(),
    };

    let mut job = CopyJob::new(ctx, config, spec.chown.as_deref(), spec.chmod.as_deref(), args, used, line)?;
    // COPY --from preserves source ownership unless --chown overrides it.
    if spec.from.is_some() && spec.chown.is_none() {
        job.ownership = None;
    }
    copy_resolved_sources(&mut job, &source_root, &sources, &dest, &config.config.working_dir)?;
    Ok(job.created)
}

/// Execute an ADD instruction. Returns the image-absolute paths to
/// snapshot.
pub async fn execute_add(
    spec: &AddSpec,
    line: usize,
    config: &ImageConfigFile,
    args: &BuildArgs,
    used: &mut BTreeMap<String, String>,
    ctx: &StepContext<'_>,
) -> Result<Vec<PathBuf>> {
    let sources = expand_all(&spec.sources, config, args, used, line)?;
    let dest = meta::expand_word(&spec.dest, config, args, used, line)?;
    let workdir = config.config.working_dir.clone();

    let mut job = CopyJob::new(ctx, config, spec.chown.as_deref(), spec.chmod.as_deref(), args, used, line)?;

    let mut local_sources = Vec::new();
    for source in &sources {
        if source.starts_with("http://") || source.starts_with("https://") {
            add_url_source(&mut job, source, spec.checksum.as_deref(), &dest, &workdir, ctx)
                .await?;
        } else {
            local_sources.push(source.clone());
        }
    }

    if !local_sources.is_empty() {
        let source_root = match &spec.from {
            Some(from) => ctx.from_source_dir(from)?,
            None => ctx.context_dir.to_path_buf(),
        };
        // Local archives are auto-extracted rather than copied.
        let mut plain = Vec::new();
        for source in &local_sources {
            let resolved = resolve_sources(&source_root, std::slice::from_ref(source))?;
            let all_archives = !resolved.is_empty()
                && resolved.iter().all(|p| p.is_file() && is_archive(p));
            if all_archives {
                let dest_abs = meta::to_abs_path(&dest, &workdir);
                for archive in resolved {
                    extract_archive(&mut job, &archive, &dest_abs)?;
                }
            } else {
                plain.push(source.clone());
            }
        }
        if !plain.is_empty() {
            copy_resolved_sources(&mut job, &source_root, &plain, &dest, &workdir)?;
        }
    }

    Ok(job.created)
}

fn expand_all(
    words: &[String],
    config: &ImageConfigFile,
    args: &BuildArgs,
    used: &mut BTreeMap<String, String>,
    line: usize,
) -> Result<Vec<String>> {
    words.iter().map(|w| meta::expand_word(w, config, args, used, line)).collect()
}

/// State shared by every file operation of one COPY/ADD.
struct CopyJob<'a> {
    root: &'a Path,
    /// `Some((uid, gid))` forces ownership; `None` preserves the source's.
    ownership: Option<(u32, u32)>,
    /// `Some(mode)` applies literally; `None` preserves the source mode.
    chmod: Option<u32>,
    /// Image-absolute paths created, for targeted snapshotting.
    created: Vec<PathBuf>,
}

impl<'a> CopyJob<'a> {
    fn new(
        ctx: &'a StepContext<'_>,
        config: &ImageConfigFile,
        chown: Option<&str>,
        chmod: Option<&str>,
        args: &BuildArgs,
        used: &mut BTreeMap<String, String>,
        line: usize,
    ) -> Result<Self> {
        let ownership = match chown {
            Some(spec) => {
                let expanded = meta::expand_word(spec, config, args, used, line)?;
                let (user, group) = passwd::split_user_group(&expanded);
                let resolved = passwd::lookup(ctx.root, user, group)?;
                Some((resolved.uid, resolved.gid))
            }
            // Docker copies as root unless told otherwise; the legacy
            // toggle preserves source ownership instead.
            None if !ctx.flags.copy_as_root => Some((0, 0)),
            None => None,
        };

        let chmod = match chmod {
            Some(text) => Some(u32::from_str_radix(text, 8).map_err(|_| {
                StrataError::Instruction {
                    instruction: "COPY".to_string(),
                    reason: format!("invalid --chmod value: {text}"),
                }
            })?),
            None => None,
        };

        Ok(Self { root: ctx.root, ownership, chmod, created: Vec::new() })
    }

    /// Copy one resolved source entry to an image-absolute destination.
    fn copy_entry(&mut self, src: &Path, dest_abs: &Path) -> Result<()> {
        let meta = src.symlink_metadata().map_err(|e| StrataError::io(src, e))?;
        let dest_disk = rooted(self.root, dest_abs);

        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(src).map_err(|e| StrataError::io(src, e))?;
            if dest_disk.symlink_metadata().is_ok() {
                std::fs::remove_file(&dest_disk).map_err(|e| StrataError::io(&dest_disk, e))?;
            }
            ensure_parent(&dest_disk)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &dest_disk)
                .map_err(|e| StrataError::io(&dest_disk, e))?;
            self.apply_ownership(&dest_disk, &meta, true)?;
            self.created.push(dest_abs.to_path_buf());
            return Ok(());
        }

        if meta.is_dir() {
            self.make_dir(dest_abs, &meta)?;
            for entry in std::fs::read_dir(src).map_err(|e| StrataError::io(src, e))? {
                let entry = entry.map_err(|e| StrataError::io(src, e))?;
                let child_dest = dest_abs.join(entry.file_name());
                self.copy_entry(&entry.path(), &child_dest)?;
            }
            return Ok(());
        }

        ensure_parent(&dest_disk)?;
        std::fs::copy(src, &dest_disk).map_err(|e| StrataError::io(&dest_disk, e))?;
        self.apply_mode(&dest_disk, &meta)?;
        self.apply_ownership(&dest_disk, &meta, false)?;
        copy_times(&meta, &dest_disk);
        self.created.push(dest_abs.to_path_buf());
        Ok(())
    }

    fn make_dir(&mut self, dest_abs: &Path, src_meta: &std::fs::Metadata) -> Result<()> {
        let dest_disk = rooted(self.root, dest_abs);
        if !dest_disk.exists() {
            std::fs::create_dir_all(&dest_disk).map_err(|e| StrataError::io(&dest_disk, e))?;
            self.apply_mode(&dest_disk, src_meta)?;
            self.apply_ownership(&dest_disk, src_meta, false)?;
            copy_times(src_meta, &dest_disk);
            self.created.push(dest_abs.to_path_buf());
        }
        Ok(())
    }

    fn apply_mode(&self, dest_disk: &Path, src_meta: &std::fs::Metadata) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = match self.chmod {
                Some(mode) => mode,
                None => src_meta.permissions().mode() & 0o7777,
            };
            std::fs::set_permissions(dest_disk, std::fs::Permissions::from_mode(mode))
                .map_err(|e| StrataError::io(dest_disk, e))?;
        }
        Ok(())
    }

    fn apply_ownership(
        &self,
        dest_disk: &Path,
        src_meta: &std::fs::Metadata,
        symlink: bool,
    ) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let (uid, gid) = match self.ownership {
                Some(ids) => ids,
                None => (src_meta.uid(), src_meta.gid()),
            };
            let result = if symlink {
                std::os::unix::fs::lchown(dest_disk, Some(uid), Some(gid))
            } else {
                std::os::unix::fs::chown(dest_disk, Some(uid), Some(gid))
            };
            if let Err(e) = result {
                // Unprivileged builds cannot change ownership; the files
                // stay owned by the builder.
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    debug!(path = %dest_disk.display(), uid, gid, "chown not permitted");
                } else {
                    return Err(StrataError::io(dest_disk, e));
                }
            }
        }
        Ok(())
    }
}

fn copy_resolved_sources(
    job: &mut CopyJob<'_>,
    source_root: &Path,
    sources: &[String],
    dest: &str,
    workdir: &str,
) -> Result<()> {
    let resolved = resolve_sources(source_root, sources)?;
    let dest_abs = meta::to_abs_path(dest, workdir);
    let dest_disk = rooted(job.root, &dest_abs);
    let dest_is_dir = dest.ends_with('/')
        || resolved.len() > 1
        || dest_disk.is_dir()
        || resolved.iter().any(|p| p.is_dir());

    for src in &resolved {
        let meta = src.symlink_metadata().map_err(|e| StrataError::io(src, e))?;
        if meta.is_dir() {
            // A directory source copies its contents, not the directory.
            job.make_dir(&dest_abs, &meta)?;
            for entry in std::fs::read_dir(src).map_err(|e| StrataError::io(src, e))? {
                let entry = entry.map_err(|e| StrataError::io(src, e))?;
                job.copy_entry(&entry.path(), &dest_abs.join(entry.file_name()))?;
            }
        } else {
            let target = if dest_is_dir {
                dest_abs.join(src.file_name().ok_or_else(|| StrataError::Instruction {
                    instruction: "COPY".to_string(),
                    reason: format!("source {} has no file name", src.display()),
                })?)
            } else {
                dest_abs.clone()
            };
            job.copy_entry(src, &target)?;
        }
    }
    Ok(())
}

/// Resolve source patterns to absolute paths under the source root.
/// Wildcards match the way shell globs do, with `*` stopping at `/`.
pub(crate) fn resolve_sources(source_root: &Path, sources: &[String]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for source in sources {
        let cleaned = source.trim_start_matches('/');
        if cleaned.contains(['*', '?', '[']) {
            let glob = GlobBuilder::new(cleaned)
                .literal_separator(true)
                .build()
                .map_err(|e| StrataError::Instruction {
                    instruction: "COPY".to_string(),
                    reason: format!("invalid source pattern {source:?}: {e}"),
                })?
                .compile_matcher();

            let mut matched = Vec::new();
            for entry in WalkDir::new(source_root).min_depth(1).sort_by_file_name() {
                let entry = entry.map_err(|e| StrataError::Instruction {
                    instruction: "COPY".to_string(),
                    reason: format!("walking build context: {e}"),
                })?;
                let rel = entry
                    .path()
                    .strip_prefix(source_root)
                    .expect("walkdir yields children of its root");
                if glob.is_match(rel) {
                    matched.push(entry.path().to_path_buf());
                }
            }
            if matched.is_empty() {
                return Err(StrataError::Instruction {
                    instruction: "COPY".to_string(),
                    reason: format!("no files match pattern {source:?}"),
                });
            }
            out.extend(matched);
        } else {
            let path = source_root.join(cleaned);
            if !path.exists() {
                return Err(StrataError::Instruction {
                    instruction: "COPY".to_string(),
                    reason: format!("source {source:?} not found in build context"),
                });
            }
            out.push(path);
        }
    }
    Ok(out)
}

async fn add_url_source(
    job: &mut CopyJob<'_>,
    url: &str,
    checksum: Option<&str>,
    dest: &str,
    workdir: &str,
    ctx: &StepContext<'_>,
) -> Result<()> {
    debug!(url, "fetching ADD source");
    let response = ctx
        .http
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| StrataError::Instruction {
            instruction: "ADD".to_string(),
            reason: format!("fetching {url}: {e}"),
        })?;
    let body = response.bytes().await.map_err(|e| StrataError::Instruction {
        instruction: "ADD".to_string(),
        reason: format!("reading {url}: {e}"),
    })?;

    if let Some(expected) = checksum {
        let actual = sha256_digest(&body);
        if actual != expected {
            return Err(StrataError::ChecksumMismatch {
                source_url: url.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
    }

    let dest_abs = meta::to_abs_path(dest, workdir);
    let dest_abs = if dest.ends_with('/') || rooted(job.root, &dest_abs).is_dir() {
        let name = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| StrataError::Instruction {
                instruction: "ADD".to_string(),
                reason: format!("cannot derive a file name from {url}"),
            })?;
        dest_abs.join(name)
    } else {
        dest_abs
    };

    let dest_disk = rooted(job.root, &dest_abs);
    ensure_parent(&dest_disk)?;
    std::fs::write(&dest_disk, &body).map_err(|e| StrataError::io(&dest_disk, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = job.chmod.unwrap_or(0o600);
        std::fs::set_permissions(&dest_disk, std::fs::Permissions::from_mode(mode))
            .map_err(|e| StrataError::io(&dest_disk, e))?;
    }
    if job.ownership.is_some() {
        let meta = dest_disk.metadata().map_err(|e| StrataError::io(&dest_disk, e))?;
        job.apply_ownership(&dest_disk, &meta, false)?;
    }
    job.created.push(dest_abs);
    Ok(())
}

fn extract_archive(job: &mut CopyJob<'_>, archive: &Path, dest_abs: &Path) -> Result<()> {
    debug!(archive = %archive.display(), dest = %dest_abs.display(), "extracting archive");
    let data = std::fs::read(archive).map_err(|e| StrataError::io(archive, e))?;
    let dest_disk = rooted(job.root, dest_abs);
    std::fs::create_dir_all(&dest_disk).map_err(|e| StrataError::io(&dest_disk, e))?;
    let touched = crate::image::remote::apply_layer_tar(&data, &dest_disk)?;
    for path in touched {
        if let Ok(rel) = path.strip_prefix(job.root) {
            job.created.push(Path::new("/").join(rel));
        }
    }
    Ok(())
}

/// Sniff whether a local file is a tar archive (optionally compressed).
fn is_archive(path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else { return false };
    let mut head = [0u8; 4];
    if file.read_exact(&mut head).is_err() {
        return false;
    }
    if head.starts_with(&[0x1f, 0x8b]) || head == [0x28, 0xb5, 0x2f, 0xfd] {
        // Compressed; assume tar inside, which is what ADD supports.
        return true;
    }
    // Plain tar: "ustar" magic at offset 257.
    let mut block = vec![0u8; 262];
    let Ok(mut file) = std::fs::File::open(path) else { return false };
    if file.read_exact(&mut block).is_err() {
        return false;
    }
    &block[257..262] == b"ustar"
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StrataError::io(parent, e))?;
    }
    Ok(())
}

/// Preserve atime/mtime from the source on the copied file.
fn copy_times(src_meta: &std::fs::Metadata, dest_disk: &Path) {
    let times = std::fs::FileTimes::new()
        .set_accessed(src_meta.accessed().unwrap_or(std::time::SystemTime::UNIX_EPOCH))
        .set_modified(src_meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH));
    let result = std::fs::File::options()
        .read(true)
        .open(dest_disk)
        .and_then(|file| file.set_times(times));
    if let Err(e) = result {
        debug!(path = %dest_disk.display(), error = %e, "could not preserve timestamps");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildOptions, FeatureFlags};
    use crate::image::Platform;
    use crate::paths::BuilderDirs;
    use std::collections::BTreeMap as Map;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        _context: TempDir,
        root: PathBuf,
        context: PathBuf,
        dirs: BuilderDirs,
        opts: BuildOptions,
        flags: FeatureFlags,
        http: reqwest::Client,
        from_dirs: Map<String, PathBuf>,
    }

    impl Fixture {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let context = TempDir::new().unwrap();
            let dirs = BuilderDirs::new(root.path().join("kaniko"));
            Self {
                root: root.path().to_path_buf(),
                context: context.path().to_path_buf(),
                _root: root,
                _context: context,
                dirs,
                opts: BuildOptions::default(),
                flags: FeatureFlags::default(),
                http: reqwest::Client::new(),
                from_dirs: Map::new(),
            }
        }

        fn ctx(&self) -> StepContext<'_> {
            StepContext {
                root: &self.root,
                context_dir: &self.context,
                dirs: &self.dirs,
                opts: &self.opts,
                flags: &self.flags,
                http: &self.http,
                from_dirs: &self.from_dirs,
                secrets: &self.opts.secrets,
            }
        }
    }

    fn run_copy(fixture: &Fixture, spec: &CopySpec) -> Result<Vec<PathBuf>> {
        let config = ImageConfigFile::scratch(&Platform::parse("linux/amd64"));
        let args = BuildArgs::new(&[]);
        let mut used = Map::new();
        tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(execute_copy(spec, 1, &config, &args, &mut used, &fixture.ctx()))
    }

    fn copy_spec(sources: &[&str], dest: &str) -> CopySpec {
        CopySpec {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            dest: dest.to_string(),
            from: None,
            chown: None,
            chmod: None,
            link: false,
        }
    }

    #[test]
    fn test_copy_single_file_to_name() {
        let fixture = Fixture::new();
        std::fs::write(fixture.context.join("hello.txt"), b"hi").unwrap();

        let created = run_copy(&fixture, &copy_spec(&["hello.txt"], "/greeting")).unwrap();
        assert_eq!(created, vec![PathBuf::from("/greeting")]);
        assert_eq!(std::fs::read(fixture.root.join("greeting")).unwrap(), b"hi");
    }

    #[test]
    fn test_copy_preserves_mode_and_sticky_bit() {
        use std::os::unix::fs::PermissionsExt;
        let fixture = Fixture::new();
        let src = fixture.context.join("sticky");
        std::fs::write(&src, b"s").unwrap();
        std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o1777)).unwrap();

        run_copy(&fixture, &copy_spec(&["sticky"], "/sticky")).unwrap();
        let mode = fixture.root.join("sticky").metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o1777);
    }

    #[test]
    fn test_copy_glob_into_dir() {
        let fixture = Fixture::new();
        std::fs::write(fixture.context.join("a.txt"), b"a").unwrap();
        std::fs::write(fixture.context.join("b.txt"), b"b").unwrap();
        std::fs::write(fixture.context.join("c.log"), b"c").unwrap();

        let created = run_copy(&fixture, &copy_spec(&["*.txt"], "/srv/")).unwrap();
        assert_eq!(created.len(), 3); // /srv plus two files
        assert!(fixture.root.join("srv/a.txt").exists());
        assert!(fixture.root.join("srv/b.txt").exists());
        assert!(!fixture.root.join("srv/c.log").exists());
    }

    #[test]
    fn test_copy_directory_copies_contents() {
        let fixture = Fixture::new();
        std::fs::create_dir_all(fixture.context.join("conf/sub")).unwrap();
        std::fs::write(fixture.context.join("conf/app.toml"), b"x").unwrap();
        std::fs::write(fixture.context.join("conf/sub/inner"), b"y").unwrap();

        run_copy(&fixture, &copy_spec(&["conf"], "/etc/app")).unwrap();
        assert!(fixture.root.join("etc/app/app.toml").exists());
        assert!(fixture.root.join("etc/app/sub/inner").exists());
        assert!(!fixture.root.join("etc/app/conf").exists());
    }

    #[test]
    fn test_copy_chmod_applies_literally() {
        use std::os::unix::fs::PermissionsExt;
        let fixture = Fixture::new();
        std::fs::write(fixture.context.join("script.sh"), b"#!/bin/sh").unwrap();

        let spec = CopySpec { chmod: Some("0755".into()), ..copy_spec(&["script.sh"], "/run.sh") };
        run_copy(&fixture, &spec).unwrap();
        let mode = fixture.root.join("run.sh").metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o755);
    }

    #[test]
    fn test_copy_missing_source_errors() {
        let fixture = Fixture::new();
        let err = run_copy(&fixture, &copy_spec(&["nope.txt"], "/x")).unwrap_err();
        assert!(matches!(err, StrataError::Instruction { .. }));
    }

    #[test]
    fn test_copy_symlink_preserved() {
        let fixture = Fixture::new();
        std::fs::write(fixture.context.join("real"), b"r").unwrap();
        std::os::unix::fs::symlink("real", fixture.context.join("link")).unwrap();

        run_copy(&fixture, &copy_spec(&["link"], "/link")).unwrap();
        let target = std::fs::read_link(fixture.root.join("link")).unwrap();
        assert_eq!(target, PathBuf::from("real"));
    }

    #[test]
    fn test_copy_from_stage_dir() {
        let mut fixture = Fixture::new();
        let stage_dir = fixture.root.join("stage0");
        std::fs::create_dir_all(stage_dir.join("app")).unwrap();
        std::fs::write(stage_dir.join("app/binary"), b"elf").unwrap();
        fixture.from_dirs.insert("0".to_string(), stage_dir);

        let spec = CopySpec { from: Some("0".into()), ..copy_spec(&["/app/binary"], "/usr/bin/app") };
        let created = run_copy(&fixture, &spec).unwrap();
        assert_eq!(created, vec![PathBuf::from("/usr/bin/app")]);
        assert_eq!(std::fs::read(fixture.root.join("usr/bin/app")).unwrap(), b"elf");
    }

    #[test]
    fn test_add_extracts_local_tar() {
        let fixture = Fixture::new();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "inside.txt", &b"tar!!"[..]).unwrap();
        let tarball = builder.into_inner().unwrap();
        std::fs::write(fixture.context.join("bundle.tar"), &tarball).unwrap();

        let spec = AddSpec {
            sources: vec!["bundle.tar".into()],
            dest: "/opt/".into(),
            from: None,
            chown: None,
            chmod: None,
            checksum: None,
        };
        let config = ImageConfigFile::scratch(&Platform::parse("linux/amd64"));
        let args = BuildArgs::new(&[]);
        let mut used = Map::new();
        let created = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(execute_add(&spec, 1, &config, &args, &mut used, &fixture.ctx()))
            .unwrap();
        assert!(created.contains(&PathBuf::from("/opt/inside.txt")));
        assert_eq!(std::fs::read(fixture.root.join("opt/inside.txt")).unwrap(), b"tar!!");
    }

    #[test]
    fn test_is_archive_detection() {
        let tmp = TempDir::new().unwrap();
        let plain = tmp.path().join("plain.txt");
        std::fs::write(&plain, b"not an archive").unwrap();
        assert!(!is_archive(&plain));

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(1);
        header.set_cksum();
        builder.append_data(&mut header, "f", &b"x"[..]).unwrap();
        let tar_path = tmp.path().join("a.tar");
        std::fs::write(&tar_path, builder.into_inner().unwrap()).unwrap();
        assert!(is_archive(&tar_path));
    }
}
