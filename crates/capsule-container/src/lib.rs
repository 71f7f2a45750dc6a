//! # capsule-container
//!
//! The capsule container lifecycle: creating a fresh capsule, ingesting
//! source files and directories into it, packing it to a single archive
//! file, unpacking an archive back into a working tree, and verifying that
//! every blob it claims to hold is actually present and intact.
//!
//! A capsule's on-disk (unpacked) layout is:
//!
//! ```text
//! <root>/
//! ├── manifest.json
//! └── blobs/sha256/<xx>/<hash>   (owned by capsule_cas::CasStore)
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::instrument;

use capsule_cas::{CasError, CasStore};
use capsule_manifest::{Artifact, ArtifactKind, Hashes, Manifest, ManifestError};
use capsule_pack::{Compression, PackError};

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Pack(#[from] PackError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("integrity error: {0}")]
    Integrity(String),
}

pub type Result<T> = std::result::Result<T, ContainerError>;

/// Filesystem capability seam. Production code uses [`StdFilesystem`]; tests
/// can substitute [`FaultingFilesystem`] to exercise partial-write recovery.
pub trait FilesystemOps: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFilesystem;

impl FilesystemOps for StdFilesystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::write(path, data)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}

/// A filesystem wrapper that can be told to fail its next write, for testing
/// recovery from an interrupted manifest write.
#[derive(Debug, Default)]
pub struct FaultingFilesystem {
    inner: StdFilesystem,
    fail_next_write: std::sync::atomic::AtomicBool,
}

impl FaultingFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_write(&self) {
        self.fail_next_write
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl FilesystemOps for FaultingFilesystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.inner.read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if self
            .fail_next_write
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(io::Error::other("injected write fault"));
        }
        self.inner.write(path, data)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.rename(from, to)
    }
}

/// A capsule rooted at a working directory, with its manifest loaded in memory.
pub struct CapsuleContainer {
    root: PathBuf,
    cas: CasStore,
    pub manifest: Manifest,
    fs: Box<dyn FilesystemOps>,
}

impl CapsuleContainer {
    fn manifest_path(root: &Path) -> PathBuf {
        root.join("manifest.json")
    }

    /// Create a brand-new, empty capsule rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, tool_name: &str, tool_version: &str) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let cas = CasStore::new(&root)?;
        let manifest = Manifest::new(tool_name, tool_version);
        Ok(Self {
            root,
            cas,
            manifest,
            fs: Box::new(StdFilesystem),
        })
    }

    /// Swap in a different [`FilesystemOps`] implementation, for fault-injection tests.
    pub fn with_filesystem(mut self, fs: Box<dyn FilesystemOps>) -> Self {
        self.fs = fs;
        self
    }

    /// Open an existing unpacked capsule directory, loading its manifest.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let cas = CasStore::new(&root)?;
        let manifest_path = Self::manifest_path(&root);
        let json = fs::read_to_string(&manifest_path)?;
        let manifest = Manifest::from_json_str(&json)?;
        Ok(Self {
            root,
            cas,
            manifest,
            fs: Box::new(StdFilesystem),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ingest a single file as a `file` artifact, returning its artifact ID.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn ingest(&mut self, path: &Path) -> Result<String> {
        let metadata = fs::symlink_metadata(path)?;
        if metadata.file_type().is_symlink() {
            return Err(ContainerError::Validation(format!(
                "{}: symlinks cannot be ingested",
                path.display()
            )));
        }

        let data = fs::read(path)?;
        let hashes = self.cas.store(&data)?;
        self.manifest.record_blob(hashes, data.len() as u64);

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
        let id = self.manifest.sanitize_artifact_id(&filename);

        let sha_hex = capsule_cas::hash_to_hex(&hashes.sha256);
        let blake3_hex = capsule_cas::hash_to_hex(&hashes.blake3);
        self.manifest.add_artifact(Artifact {
            id: id.clone(),
            kind: ArtifactKind::File,
            original_filename: Some(filename),
            source_path: Some(path.display().to_string()),
            size_bytes: data.len() as u64,
            primary_blob_sha256: sha_hex.clone(),
            hashes: Hashes {
                sha256: sha_hex,
                blake3: blake3_hex,
            },
            detected_format: None,
            components: None,
        })?;

        Ok(id)
    }

    /// Recursively ingest a directory tree, depth-first in lexicographic
    /// order, producing one `dir` artifact per directory whose `components`
    /// list references its immediate children's artifact IDs.
    pub fn ingest_dir(&mut self, dir: &Path) -> Result<String> {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();

        let mut component_ids = Vec::new();
        for entry in entries {
            let metadata = fs::symlink_metadata(&entry)?;
            if metadata.file_type().is_symlink() {
                return Err(ContainerError::Validation(format!(
                    "{}: symlinks cannot be ingested",
                    entry.display()
                )));
            }
            if metadata.is_dir() {
                component_ids.push(self.ingest_dir(&entry)?);
            } else {
                component_ids.push(self.ingest(&entry)?);
            }
        }

        let dirname = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "dir".to_string());
        let id = self.manifest.sanitize_artifact_id(&dirname);

        let empty_hashes = CasStore::compute_hashes(b"");
        self.cas.store(b"")?;
        self.manifest.record_blob(empty_hashes, 0);
        let sha_hex = capsule_cas::hash_to_hex(&empty_hashes.sha256);
        let blake3_hex = capsule_cas::hash_to_hex(&empty_hashes.blake3);

        self.manifest.add_artifact(Artifact {
            id: id.clone(),
            kind: ArtifactKind::Dir,
            original_filename: Some(dirname),
            source_path: Some(dir.display().to_string()),
            size_bytes: 0,
            primary_blob_sha256: sha_hex.clone(),
            hashes: Hashes {
                sha256: sha_hex,
                blake3: blake3_hex,
            },
            detected_format: None,
            components: Some(component_ids),
        })?;

        Ok(id)
    }

    /// Atomically persist the in-memory manifest to `manifest.json` via a
    /// sibling temp file and rename.
    #[instrument(skip(self))]
    pub fn save_manifest(&self) -> Result<()> {
        let json = self.manifest.to_json_pretty()?;
        let dest = Self::manifest_path(&self.root);
        let temp_path = dest.with_extension("json.tmp");
        self.fs.create_dir_all(&self.root)?;
        self.fs.write(&temp_path, json.as_bytes())?;
        self.fs.rename(&temp_path, &dest)?;
        Ok(())
    }

    /// Save the manifest, then archive the whole capsule directory to
    /// `dest_path` using the given compression codec.
    pub fn pack(&self, dest_path: &Path, compression: Compression) -> Result<()> {
        self.save_manifest()?;
        capsule_pack::pack_dir(&self.root, dest_path, compression)?;
        Ok(())
    }

    /// Unpack an archived capsule at `src_path` into `dest_root` and open it.
    pub fn unpack(src_path: &Path, dest_root: &Path) -> Result<Self> {
        capsule_pack::unpack_archive(src_path, dest_root)?;
        Self::open(dest_root)
    }

    /// Verify every blob the manifest claims to hold is present and intact,
    /// that its recorded size and BLAKE3 digest match what's on disk, and
    /// that every artifact's declared size and hash are consistent with the
    /// blob it references.
    #[instrument(skip(self))]
    pub fn verify(&self) -> Result<()> {
        for (sha_hex, record) in &self.manifest.blobs {
            let sha256 = capsule_cas::hex_to_hash(sha_hex).ok_or_else(|| {
                ContainerError::Integrity(format!("malformed sha256 hex in manifest: {sha_hex}"))
            })?;

            let data = self.cas.retrieve(&sha256)?;
            if data.len() as u64 != record.size_bytes {
                return Err(ContainerError::Integrity(format!(
                    "blob {sha_hex} size mismatch: manifest says {}, disk has {}",
                    record.size_bytes,
                    data.len()
                )));
            }

            let actual = CasStore::compute_hashes(&data);
            let actual_blake3_hex = capsule_cas::hash_to_hex(&actual.blake3);
            if actual_blake3_hex != record.blake3_hex {
                return Err(ContainerError::Integrity(format!(
                    "blob {sha_hex} blake3 mismatch: manifest says {}, computed {}",
                    record.blake3_hex, actual_blake3_hex
                )));
            }
        }

        for (artifact_id, artifact) in &self.manifest.artifacts {
            if artifact.hashes.sha256 != artifact.primary_blob_sha256 {
                return Err(ContainerError::Integrity(format!(
                    "artifact {artifact_id} declared hashes.sha256 {} does not match its primary_blob_sha256 {}",
                    artifact.hashes.sha256, artifact.primary_blob_sha256
                )));
            }

            let blob = self.manifest.blobs.get(&artifact.primary_blob_sha256).ok_or_else(|| {
                ContainerError::Integrity(format!(
                    "artifact {artifact_id} references blob {} not recorded in the manifest",
                    artifact.primary_blob_sha256
                ))
            })?;
            if artifact.size_bytes != blob.size_bytes {
                return Err(ContainerError::Integrity(format!(
                    "artifact {artifact_id} declared size_bytes {} does not match referenced blob size {}",
                    artifact.size_bytes, blob.size_bytes
                )));
            }
        }

        Ok(())
    }
}
