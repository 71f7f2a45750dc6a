//! # capsule-cas
//!
//! Content-addressed blob storage for capsule containers.
//!
//! Blobs are indexed by their SHA-256 digest, with a secondary BLAKE3 digest
//! recorded alongside each hash pair for cross-verification. Layout is a
//! two-level fan-out directory so that no single directory accumulates more
//! entries than a filesystem comfortably handles:
//!
//! ```text
//! <root>/
//! └── blobs/
//!     └── sha256/
//!         └── ab/
//!             └── ab12ef...  # full 64-char hex digest
//! ```

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::instrument;

/// SHA-256 digest (32 bytes), hex-encoded for display and on disk.
pub type Sha256Hash = [u8; 32];
/// BLAKE3 digest (32 bytes), recorded as a secondary hash for cross-verification.
pub type Blake3Hash = [u8; 32];

/// Both digests computed for a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashPair {
    pub sha256: Sha256Hash,
    pub blake3: Blake3Hash,
}

#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("blob not found: {hash}")]
    NotFound { hash: String },

    #[error("integrity error: blob {hash} on disk does not match its declared hash")]
    Integrity { hash: String },
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Content-addressed store rooted at a directory.
///
/// All operations are relative to `root`, so a store can be rebound to a
/// fresh directory after a capsule is unpacked.
#[derive(Debug, Clone)]
pub struct CasStore {
    root: PathBuf,
}

/// Hex-encode a digest.
pub fn hash_to_hex(hash: &[u8; 32]) -> String {
    hex::encode(hash)
}

/// Parse a 64-char hex digest.
pub fn hex_to_hash(hex_str: &str) -> Option<[u8; 32]> {
    if hex_str.len() != 64 {
        return None;
    }
    let bytes = hex::decode(hex_str).ok()?;
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Some(hash)
}

impl CasStore {
    /// Open (creating if absent) a CAS store rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("blobs").join("sha256"))?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the SHA-256 and BLAKE3 digests of a byte buffer.
    pub fn compute_hashes(data: &[u8]) -> HashPair {
        let mut sha = Sha256::new();
        sha.update(data);
        let sha256: Sha256Hash = sha.finalize().into();
        let blake3 = *blake3::hash(data).as_bytes();
        HashPair { sha256, blake3 }
    }

    fn blob_path(&self, sha256: &Sha256Hash) -> PathBuf {
        let hex = hash_to_hex(sha256);
        self.root
            .join("blobs")
            .join("sha256")
            .join(&hex[..2])
            .join(hex)
    }

    /// Store bytes, returning both digests. Idempotent: storing the same
    /// bytes twice returns the same hash pair and leaves the existing blob
    /// untouched.
    #[instrument(skip(self, data), level = "debug")]
    pub fn store(&self, data: &[u8]) -> Result<HashPair> {
        let hashes = Self::compute_hashes(data);
        let path = self.blob_path(&hashes.sha256);

        if path.exists() {
            tracing::debug!(hash = %hash_to_hex(&hashes.sha256), "blob already present, skipping write");
            return Ok(hashes);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_name = format!(
            "{}.{}.tmp",
            path.file_name().unwrap().to_string_lossy(),
            std::process::id()
        );
        let temp_path = path.with_file_name(temp_name);
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
        }

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            if path.exists() {
                // Another writer raced us to the same content; dedup succeeded.
                return Ok(hashes);
            }
            return Err(CasError::Io(e));
        }

        tracing::debug!(hash = %hash_to_hex(&hashes.sha256), size = data.len(), "stored blob");
        Ok(hashes)
    }

    /// Store the contents of a file on disk.
    pub fn store_file<P: AsRef<Path>>(&self, path: P) -> Result<HashPair> {
        let data = fs::read(path)?;
        self.store(&data)
    }

    /// Retrieve a blob by its SHA-256 digest, verifying integrity on read.
    #[instrument(skip(self), level = "debug")]
    pub fn retrieve(&self, sha256: &Sha256Hash) -> Result<Vec<u8>> {
        let path = self.blob_path(sha256);
        if !path.exists() {
            return Err(CasError::NotFound {
                hash: hash_to_hex(sha256),
            });
        }

        let mut file = File::open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut sha = Sha256::new();
        sha.update(&data);
        let actual: Sha256Hash = sha.finalize().into();
        if actual != *sha256 {
            tracing::warn!(
                expected = %hash_to_hex(sha256),
                actual = %hash_to_hex(&actual),
                "blob integrity check failed"
            );
            return Err(CasError::Integrity {
                hash: hash_to_hex(sha256),
            });
        }

        Ok(data)
    }

    /// Whether a blob with the given SHA-256 digest exists.
    pub fn exists(&self, sha256: &Sha256Hash) -> bool {
        self.blob_path(sha256).exists()
    }

    /// Size in bytes of the blob at rest, without reading its contents.
    pub fn blob_size(&self, sha256: &Sha256Hash) -> Result<u64> {
        let path = self.blob_path(sha256);
        let meta = fs::metadata(&path).map_err(|_| CasError::NotFound {
            hash: hash_to_hex(sha256),
        })?;
        Ok(meta.len())
    }

    /// Iterate over every stored blob's path, in filesystem order, for
    /// archiving. Temp files left behind by interrupted writes are skipped.
    pub fn iter_blob_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let sha256_dir = self.root.join("blobs").join("sha256");
        if !sha256_dir.exists() {
            return Ok(paths);
        }
        let mut l1_entries: Vec<_> = fs::read_dir(&sha256_dir)?.filter_map(|e| e.ok()).collect();
        l1_entries.sort_by_key(|e| e.file_name());
        for l1 in l1_entries {
            if !l1.file_type()?.is_dir() {
                continue;
            }
            let mut blobs: Vec<_> = fs::read_dir(l1.path())?.filter_map(|e| e.ok()).collect();
            blobs.sort_by_key(|e| e.file_name());
            for blob in blobs {
                let p = blob.path();
                if blob.file_type()?.is_file() && p.extension().is_none_or(|e| e != "tmp") {
                    paths.push(p);
                }
            }
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn store_and_retrieve_roundtrip() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let data = b"hello, capsule";
        let hashes = cas.store(data).unwrap();
        let retrieved = cas.retrieve(&hashes.sha256).unwrap();
        assert_eq!(retrieved, data);
    }

    #[test]
    fn store_is_idempotent_for_equal_bytes() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let data = b"duplicate content";
        let first = cas.store(data).unwrap();
        let second = cas.store(data).unwrap();
        assert_eq!(first.sha256, second.sha256);
        assert_eq!(first.blake3, second.blake3);
        assert_eq!(cas.iter_blob_paths().unwrap().len(), 1);
    }

    #[test]
    fn retrieve_missing_hash_is_not_found() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let fake = [0u8; 32];
        assert!(matches!(cas.retrieve(&fake), Err(CasError::NotFound { .. })));
    }

    #[test]
    fn retrieve_detects_corruption() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let hashes = cas.store(b"original bytes").unwrap();
        let hex = hash_to_hex(&hashes.sha256);
        let path = temp
            .path()
            .join("blobs")
            .join("sha256")
            .join(&hex[..2])
            .join(&hex);
        fs::write(&path, b"corrupted!").unwrap();

        assert!(matches!(
            cas.retrieve(&hashes.sha256),
            Err(CasError::Integrity { .. })
        ));
    }

    #[test]
    fn empty_blob_roundtrips() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let hashes = cas.store(b"").unwrap();
        let retrieved = cas.retrieve(&hashes.sha256).unwrap();
        assert!(retrieved.is_empty());
    }

    #[test]
    fn hash_hex_roundtrip() {
        let hashes = CasStore::compute_hashes(b"test data");
        let hex = hash_to_hex(&hashes.sha256);
        let parsed = hex_to_hash(&hex).unwrap();
        assert_eq!(hashes.sha256, parsed);
    }

    #[test]
    fn two_level_shard_layout() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let hashes = cas.store(b"sharding test").unwrap();
        let hex = hash_to_hex(&hashes.sha256);
        let expected_dir = temp.path().join("blobs").join("sha256").join(&hex[..2]);
        assert!(expected_dir.exists());
        assert!(expected_dir.join(&hex).exists());
    }

    #[test]
    fn iter_blob_paths_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        cas.store(b"blob-a").unwrap();
        cas.store(b"blob-b").unwrap();
        cas.store(b"blob-c").unwrap();

        let first = cas.iter_blob_paths().unwrap();
        let second = cas.iter_blob_paths().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }
}
