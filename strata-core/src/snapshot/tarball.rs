//! Layer tarball writing.
//!
//! Produces OCI-conformant layer tars: entries sorted lexicographically,
//! whiteouts encoded as `.wh.<name>` markers, deletions of whole directory
//! contents as `.wh..wh..opq`. The uncompressed stream is hashed for the
//! `diff_id` while the compressed stream is hashed for the blob digest,
//! in one pass.

use std::io::Write;
use std::path::{Path, PathBuf};

use oci_distribution::manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::Compression;
use crate::error::{Result, StrataError};
use crate::exec::rooted;
use crate::image::remote::{OPAQUE_WHITEOUT, WHITEOUT_PREFIX};
use crate::image::{Layer, OCI_LAYER_ZSTD_MEDIA_TYPE};

/// One entry of a layer under construction, keyed by its tar path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LayerEntry {
    /// Add or modify: content and metadata come from the live filesystem.
    Path(PathBuf),
    /// Delete: a `.wh.<name>` marker.
    Whiteout(PathBuf),
    /// Replace a directory's entire contents: `.wh..wh..opq` inside it.
    Opaque(PathBuf),
}

impl LayerEntry {
    /// The path this entry sorts and serializes under.
    fn tar_path(&self) -> PathBuf {
        match self {
            Self::Path(path) => rel_of(path),
            Self::Whiteout(path) => {
                let rel = rel_of(path);
                let name = rel.file_name().map(|n| n.to_string_lossy().into_owned());
                match (rel.parent(), name) {
                    (Some(parent), Some(name)) => parent.join(format!("{WHITEOUT_PREFIX}{name}")),
                    (_, Some(name)) => PathBuf::from(format!("{WHITEOUT_PREFIX}{name}")),
                    _ => rel,
                }
            }
            Self::Opaque(dir) => rel_of(dir).join(OPAQUE_WHITEOUT),
        }
    }
}

fn rel_of(path: &Path) -> PathBuf {
    path.strip_prefix("/").map(Path::to_path_buf).unwrap_or_else(|_| path.to_path_buf())
}

/// Write a layer for the given entries.
///
/// `root` is the live filesystem the `Path` entries are read from;
/// `output` is where the compressed blob lands. Returns `None` when there
/// are no entries (an empty diff produces no layer).
pub fn write_layer(
    root: &Path,
    mut entries: Vec<LayerEntry>,
    output: &Path,
    compression: Compression,
    compression_level: Option<i32>,
    reproducible: bool,
) -> Result<Option<Layer>> {
    if entries.is_empty() {
        return Ok(None);
    }
    entries.sort_by(|a, b| a.tar_path().cmp(&b.tar_path()));
    entries.dedup();

    let file = std::fs::File::create(output).map_err(|e| StrataError::io(output, e))?;
    let compressed_hash = HashingWriter::new(file);

    // tar -> diff_id hasher -> compressor -> blob hasher -> file
    let (media_type, finished) = match compression {
        Compression::Gzip => {
            let level = compression_level
                .map(|l| flate2::Compression::new(l.clamp(0, 9) as u32))
                .unwrap_or_default();
            let encoder = flate2::write::GzEncoder::new(compressed_hash, level);
            let diff_hash = HashingWriter::new(encoder);
            let diff_hash = append_entries(root, &entries, diff_hash, reproducible, output)?;
            let (encoder, diff_id) = diff_hash.finish();
            let compressed = encoder.finish().map_err(|e| StrataError::io(output, e))?;
            (IMAGE_LAYER_GZIP_MEDIA_TYPE, (diff_id, compressed))
        }
        Compression::Zstd => {
            let level = compression_level.unwrap_or(3);
            let encoder = zstd::stream::write::Encoder::new(compressed_hash, level)
                .map_err(|e| StrataError::io(output, e))?;
            let diff_hash = HashingWriter::new(encoder);
            let diff_hash = append_entries(root, &entries, diff_hash, reproducible, output)?;
            let (encoder, diff_id) = diff_hash.finish();
            let compressed = encoder.finish().map_err(|e| StrataError::io(output, e))?;
            (OCI_LAYER_ZSTD_MEDIA_TYPE, (diff_id, compressed))
        }
    };
    let (diff_id, compressed) = finished;
    let (mut file, digest) = compressed.finish();
    file.flush().map_err(|e| StrataError::io(output, e))?;
    let size = file.metadata().map_err(|e| StrataError::io(output, e))?.len();

    debug!(
        entries = entries.len(),
        size,
        diff_id = %diff_id,
        "wrote layer"
    );

    Ok(Some(Layer {
        diff_id,
        digest,
        media_type: media_type.to_string(),
        size,
        path: output.to_path_buf(),
    }))
}

fn append_entries<W: Write>(
    root: &Path,
    entries: &[LayerEntry],
    writer: HashingWriter<W>,
    reproducible: bool,
    output: &Path,
) -> Result<HashingWriter<W>> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    for entry in entries {
        let tar_path = entry.tar_path();
        // A layer never contains an entry for the root directory itself.
        if tar_path.as_os_str().is_empty() {
            return Err(StrataError::FilesystemInvariant {
                reason: "layer would contain the root directory".to_string(),
            });
        }

        match entry {
            LayerEntry::Whiteout(_) | LayerEntry::Opaque(_) => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(0);
                header.set_mode(0);
                header.set_mtime(0);
                header.set_cksum();
                builder
                    .append_data(&mut header, &tar_path, std::io::empty())
                    .map_err(|e| StrataError::io(output, e))?;
            }
            LayerEntry::Path(abs) => {
                append_path(&mut builder, root, abs, &tar_path, reproducible, output)?;
            }
        }
    }

    builder.finish().map_err(|e| StrataError::io(output, e))?;
    builder.into_inner().map_err(|e| StrataError::io(output, e))
}

fn append_path<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    abs: &Path,
    tar_path: &Path,
    reproducible: bool,
    output: &Path,
) -> Result<()> {
    let disk = rooted(root, abs);
    let meta = match disk.symlink_metadata() {
        Ok(m) => m,
        // Raced deletions between scan and write: the whiteout pass
        // already covers them.
        Err(_) => return Ok(()),
    };

    let mut header = tar::Header::new_gnu();
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        header.set_mode(meta.mode());
        header.set_uid(meta.uid() as u64);
        header.set_gid(meta.gid() as u64);
        header.set_mtime(if reproducible { 0 } else { meta.mtime().max(0) as u64 });
    }

    let file_type = meta.file_type();
    if file_type.is_symlink() {
        let target = std::fs::read_link(&disk).map_err(|e| StrataError::io(&disk, e))?;
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, tar_path, &target)
            .map_err(|e| StrataError::io(output, e))?;
    } else if file_type.is_dir() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_data(&mut header, tar_path, std::io::empty())
            .map_err(|e| StrataError::io(output, e))?;
    } else if file_type.is_file() {
        let file = std::fs::File::open(&disk).map_err(|e| StrataError::io(&disk, e))?;
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(meta.len());
        header.set_cksum();
        builder
            .append_data(&mut header, tar_path, file)
            .map_err(|e| StrataError::io(output, e))?;
    } else {
        // Sockets and device nodes are not captured.
        debug!(path = %disk.display(), "skipping special file");
    }
    Ok(())
}

/// A writer that hashes everything passing through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, hasher: Sha256::new() }
    }

    fn finish(self) -> (W, String) {
        (self.inner, format!("sha256:{:x}", self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::remote::apply_layer_tar;
    use tempfile::TempDir;

    fn layer_paths(layer: &Layer) -> Vec<String> {
        let data = std::fs::read(&layer.path).unwrap();
        let decoder: Box<dyn std::io::Read> = if layer.media_type.ends_with("gzip") {
            Box::new(flate2::read::GzDecoder::new(&data[..]))
        } else {
            Box::new(zstd::stream::read::Decoder::new(&data[..]).unwrap())
        };
        let mut archive = tar::Archive::new(decoder);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn test_empty_diff_produces_no_layer() {
        let tmp = TempDir::new().unwrap();
        let layer = write_layer(
            tmp.path(),
            Vec::new(),
            &tmp.path().join("out"),
            Compression::Gzip,
            None,
            false,
        )
        .unwrap();
        assert!(layer.is_none());
    }

    #[test]
    fn test_entries_sorted_and_no_root_entry() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("b")).unwrap();
        std::fs::write(tmp.path().join("b/file"), b"x").unwrap();
        std::fs::write(tmp.path().join("a"), b"y").unwrap();

        let layer = write_layer(
            tmp.path(),
            vec![
                LayerEntry::Path("/b/file".into()),
                LayerEntry::Path("/a".into()),
                LayerEntry::Path("/b".into()),
            ],
            &tmp.path().join("layer"),
            Compression::Gzip,
            None,
            false,
        )
        .unwrap()
        .unwrap();

        let paths = layer_paths(&layer);
        assert_eq!(paths, vec!["a", "b", "b/file"]);
    }

    #[test]
    fn test_root_entry_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = write_layer(
            tmp.path(),
            vec![LayerEntry::Path("/".into())],
            &tmp.path().join("layer"),
            Compression::Gzip,
            None,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, StrataError::FilesystemInvariant { .. }));
    }

    #[test]
    fn test_whiteout_encoding() {
        let tmp = TempDir::new().unwrap();
        let layer = write_layer(
            tmp.path(),
            vec![
                LayerEntry::Whiteout("/etc/removed.conf".into()),
                LayerEntry::Opaque("/var/lib/replaced".into()),
            ],
            &tmp.path().join("layer"),
            Compression::Gzip,
            None,
            false,
        )
        .unwrap()
        .unwrap();

        let paths = layer_paths(&layer);
        assert!(paths.contains(&"etc/.wh.removed.conf".to_string()));
        assert!(paths.contains(&"var/lib/replaced/.wh..wh..opq".to_string()));
    }

    #[test]
    fn test_layer_roundtrips_through_apply() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("dir")).unwrap();
        std::fs::write(src.join("dir/data"), b"payload").unwrap();

        let layer = write_layer(
            &src,
            vec![LayerEntry::Path("/dir".into()), LayerEntry::Path("/dir/data".into())],
            &tmp.path().join("layer"),
            Compression::Gzip,
            None,
            false,
        )
        .unwrap()
        .unwrap();

        let dest = tmp.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();
        let blob = std::fs::read(&layer.path).unwrap();
        apply_layer_tar(&blob, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("dir/data")).unwrap(), b"payload");
    }

    #[test]
    fn test_reproducible_layers_are_stable() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("f"), b"same").unwrap();

        let entries = vec![LayerEntry::Path("/f".into())];
        let a = write_layer(&src, entries.clone(), &tmp.path().join("a"), Compression::Gzip, None, true)
            .unwrap()
            .unwrap();
        // Touch mtime between the two snapshots.
        std::fs::write(src.join("f"), b"same").unwrap();
        let b = write_layer(&src, entries, &tmp.path().join("b"), Compression::Gzip, None, true)
            .unwrap()
            .unwrap();
        assert_eq!(a.diff_id, b.diff_id);
    }

    #[test]
    fn test_zstd_layer_media_type() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f"), b"z").unwrap();
        let layer = write_layer(
            tmp.path(),
            vec![LayerEntry::Path("/f".into())],
            &tmp.path().join("layer"),
            Compression::Zstd,
            Some(5),
            false,
        )
        .unwrap()
        .unwrap();
        assert_eq!(layer.media_type, OCI_LAYER_ZSTD_MEDIA_TYPE);
        assert_eq!(layer_paths(&layer), vec!["f"]);
    }

    #[test]
    fn test_symlink_entry() {
        let tmp = TempDir::new().unwrap();
        std::os::unix::fs::symlink("/target", tmp.path().join("link")).unwrap();
        let layer = write_layer(
            tmp.path(),
            vec![LayerEntry::Path("/link".into())],
            &tmp.path().join("layer"),
            Compression::Gzip,
            None,
            false,
        )
        .unwrap()
        .unwrap();

        let data = std::fs::read(&layer.path).unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(&data[..]));
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().entry_type(), tar::EntryType::Symlink);
        assert_eq!(
            entry.link_name().unwrap().unwrap(),
            std::path::Path::new("/target")
        );
    }
}
