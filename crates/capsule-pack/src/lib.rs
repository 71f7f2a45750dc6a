//! # capsule-pack
//!
//! Archive codec for capsule containers: a directory tree is packed into a
//! single `tar` stream, then compressed with XZ (default) or gzip. Unpacking
//! auto-detects the compression from the stream's magic bytes, so a capsule
//! file is self-describing regardless of which codec produced it.
//!
//! Entries are written in depth-first lexicographic order with zeroed
//! timestamps, uid/gid, and a fixed mode, so two packs of byte-identical
//! trees produce byte-identical archives.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::instrument;

const XZ_MAGIC: [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0x00];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

#[derive(Error, Debug)]
pub enum PackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("archive entry escapes destination directory: {0}")]
    PathEscape(String),

    #[error("unsupported archive entry type at {0}: symlinks are not packed")]
    UnsupportedEntry(String),

    #[error("could not determine compression codec: unrecognized magic bytes")]
    UnknownCompression,
}

pub type Result<T> = std::result::Result<T, PackError>;

/// Compression codec wrapping the inner tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Xz,
    Gzip,
}

impl Compression {
    fn sniff(header: &[u8]) -> Option<Self> {
        if header.starts_with(&XZ_MAGIC) {
            Some(Compression::Xz)
        } else if header.starts_with(&GZIP_MAGIC) {
            Some(Compression::Gzip)
        } else {
            None
        }
    }
}

/// Build a deterministic tar archive of `src_dir`'s contents, compress it,
/// and write the result to `dest`.
#[instrument(skip(dest), fields(compression = ?compression))]
pub fn write_archive<W: Write>(src_dir: &Path, dest: W, compression: Compression) -> Result<()> {
    match compression {
        Compression::Xz => {
            let mut encoder = xz2::write::XzEncoder::new(dest, 6);
            build_tar(src_dir, &mut encoder)?;
            encoder.finish()?;
        }
        Compression::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(dest, flate2::Compression::default());
            build_tar(src_dir, &mut encoder)?;
            encoder.finish()?;
        }
    }
    Ok(())
}

/// Convenience wrapper: pack `src_dir` into the file at `dest_path`.
pub fn pack_dir(src_dir: &Path, dest_path: &Path, compression: Compression) -> Result<()> {
    let file = File::create(dest_path)?;
    write_archive(src_dir, file, compression)
}

fn build_tar<W: Write>(src_dir: &Path, writer: &mut W) -> Result<()> {
    let mut builder = tar::Builder::new(writer);

    let mut entries: Vec<PathBuf> = walkdir::WalkDir::new(src_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.path().to_path_buf())
        .filter(|p| p != src_dir)
        .collect();
    entries.sort();

    for path in entries {
        let rel = path.strip_prefix(src_dir).expect("walked under src_dir");
        let metadata = fs::symlink_metadata(&path)?;

        if metadata.file_type().is_symlink() {
            return Err(PackError::UnsupportedEntry(rel.display().to_string()));
        }

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        if metadata.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, rel, io::empty())?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(metadata.len());
            header.set_mode(0o644);
            header.set_cksum();
            let file = File::open(&path)?;
            builder.append_data(&mut header, rel, file)?;
        }
    }

    builder.into_inner()?.flush()?;
    Ok(())
}

/// Read a compressed tar stream from `src`, auto-detecting XZ vs. gzip from
/// the stream's magic bytes, and extract it into `dest_dir`. Rejects any
/// entry whose path would escape `dest_dir`.
#[instrument(skip(src))]
pub fn read_archive<R: Read>(mut src: R, dest_dir: &Path) -> Result<()> {
    let mut header = [0u8; 6];
    let n = read_fill(&mut src, &mut header)?;
    let compression = Compression::sniff(&header[..n]).ok_or(PackError::UnknownCompression)?;

    let chained = io::Cursor::new(header[..n].to_vec()).chain(src);
    fs::create_dir_all(dest_dir)?;

    match compression {
        Compression::Xz => extract_tar(xz2::read::XzDecoder::new(chained), dest_dir),
        Compression::Gzip => extract_tar(flate2::read::GzDecoder::new(chained), dest_dir),
    }
}

/// Convenience wrapper: unpack the archive file at `src_path` into `dest_dir`.
pub fn unpack_archive(src_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(src_path)?;
    read_archive(file, dest_dir)
}

fn read_fill<R: Read>(src: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = src.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn extract_tar<R: Read>(inner: R, dest_dir: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(inner);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
            || path.is_absolute()
        {
            return Err(PackError::PathEscape(path.display().to_string()));
        }

        let dest_path = dest_dir.join(&path);
        if !dest_path.starts_with(dest_dir) {
            return Err(PackError::PathEscape(path.display().to_string()));
        }

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&dest_path)?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = dest_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                entry.unpack(&dest_path)?;
            }
            other => {
                return Err(PackError::UnsupportedEntry(format!(
                    "{}: unsupported entry type {other:?}",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(path: &Path, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn roundtrip_xz_preserves_contents() {
        let src = TempDir::new().unwrap();
        write_file(&src.path().join("a.txt"), b"hello");
        write_file(&src.path().join("sub/b.txt"), b"nested");

        let archive_path = src.path().parent().unwrap().join("out.tar.xz");
        pack_dir(src.path(), &archive_path, Compression::Xz).unwrap();

        let dest = TempDir::new().unwrap();
        unpack_archive(&archive_path, dest.path()).unwrap();

        assert_eq!(fs::read(dest.path().join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dest.path().join("sub/b.txt")).unwrap(), b"nested");
        let _ = fs::remove_file(&archive_path);
    }

    #[test]
    fn roundtrip_gzip_preserves_contents() {
        let src = TempDir::new().unwrap();
        write_file(&src.path().join("a.txt"), b"gzip me");

        let mut buf = Vec::new();
        write_archive(src.path(), &mut buf, Compression::Gzip).unwrap();

        let dest = TempDir::new().unwrap();
        read_archive(io::Cursor::new(buf), dest.path()).unwrap();
        assert_eq!(fs::read(dest.path().join("a.txt")).unwrap(), b"gzip me");
    }

    #[test]
    fn compression_is_auto_detected() {
        let src = TempDir::new().unwrap();
        write_file(&src.path().join("x.txt"), b"auto-detect");

        let mut xz_buf = Vec::new();
        write_archive(src.path(), &mut xz_buf, Compression::Xz).unwrap();
        assert_eq!(Compression::sniff(&xz_buf[..6]), Some(Compression::Xz));

        let mut gz_buf = Vec::new();
        write_archive(src.path(), &mut gz_buf, Compression::Gzip).unwrap();
        assert_eq!(Compression::sniff(&gz_buf[..6]), Some(Compression::Gzip));
    }

    #[test]
    fn pack_is_deterministic_across_runs() {
        let src = TempDir::new().unwrap();
        write_file(&src.path().join("z.txt"), b"z");
        write_file(&src.path().join("a.txt"), b"a");

        let mut first = Vec::new();
        write_archive(src.path(), &mut first, Compression::Xz).unwrap();
        let mut second = Vec::new();
        write_archive(src.path(), &mut second, Compression::Xz).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn symlinks_are_rejected() {
        let src = TempDir::new().unwrap();
        write_file(&src.path().join("real.txt"), b"data");
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(
                src.path().join("real.txt"),
                src.path().join("link.txt"),
            )
            .unwrap();
            let mut buf = Vec::new();
            let result = write_archive(src.path(), &mut buf, Compression::Xz);
            assert!(matches!(result, Err(PackError::UnsupportedEntry(_))));
        }
    }

    #[test]
    fn unknown_magic_bytes_are_rejected() {
        let dest = TempDir::new().unwrap();
        let result = read_archive(io::Cursor::new(b"not an archive".to_vec()), dest.path());
        assert!(matches!(result, Err(PackError::UnknownCompression)));
    }
}
