//! Artifact generation.
//!
//! An artifact is a file of unpredictable bytes whose download is timed. It is
//! written in fixed-size chunks on the blocking pool and hashed as it is
//! written, so memory use is bounded by the chunk size regardless of the
//! requested size.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{LifecycleError, Result};
use crate::session::SessionId;

/// Bytes per MiB
pub const MIB: u64 = 1024 * 1024;

/// Default generation chunk size (1 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Allowed artifact sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum SizeSelector {
    /// 5 MiB
    Mib5,
    /// 10 MiB
    Mib10,
    /// 20 MiB
    Mib20,
    /// 50 MiB
    Mib50,
    /// 100 MiB
    Mib100,
    /// 200 MiB
    Mib200,
    /// 500 MiB
    Mib500,
    /// 1000 MiB
    Mib1000,
}

impl SizeSelector {
    /// Every allowed selector, smallest first
    pub const ALL: [SizeSelector; 8] = [
        SizeSelector::Mib5,
        SizeSelector::Mib10,
        SizeSelector::Mib20,
        SizeSelector::Mib50,
        SizeSelector::Mib100,
        SizeSelector::Mib200,
        SizeSelector::Mib500,
        SizeSelector::Mib1000,
    ];

    /// Size in MiB
    #[must_use]
    pub const fn mebibytes(self) -> u32 {
        match self {
            SizeSelector::Mib5 => 5,
            SizeSelector::Mib10 => 10,
            SizeSelector::Mib20 => 20,
            SizeSelector::Mib50 => 50,
            SizeSelector::Mib100 => 100,
            SizeSelector::Mib200 => 200,
            SizeSelector::Mib500 => 500,
            SizeSelector::Mib1000 => 1000,
        }
    }

    /// Size in bytes
    #[must_use]
    pub const fn bytes(self) -> u64 {
        self.mebibytes() as u64 * MIB
    }

    /// Map a MiB count to a selector
    ///
    /// # Errors
    ///
    /// Returns `InvalidSize` for any value outside the allowed set.
    pub fn from_mebibytes(mib: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.mebibytes() == mib)
            .ok_or(LifecycleError::InvalidSize(mib))
    }

    /// Comma separated list of allowed MiB values
    #[must_use]
    pub fn allowed_list() -> String {
        Self::ALL
            .iter()
            .map(|s| s.mebibytes().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl TryFrom<u32> for SizeSelector {
    type Error = LifecycleError;

    fn try_from(mib: u32) -> Result<Self> {
        Self::from_mebibytes(mib)
    }
}

impl From<SizeSelector> for u32 {
    fn from(selector: SizeSelector) -> Self {
        selector.mebibytes()
    }
}

impl fmt::Display for SizeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MiB", self.mebibytes())
    }
}

/// A written artifact and its digest
#[derive(Debug, Clone)]
pub struct GeneratedArtifact {
    /// Location of the artifact
    pub path: PathBuf,
    /// Number of bytes written
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the full content
    pub digest: String,
}

/// Writes random artifacts into a directory
#[derive(Debug, Clone)]
pub struct ArtifactGenerator {
    dir: PathBuf,
    chunk_size: usize,
}

impl ArtifactGenerator {
    /// Create a generator writing into `dir` with the given chunk size
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            dir: dir.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Artifact directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path the artifact of `id` is written to
    #[must_use]
    pub fn path_for(&self, id: &SessionId) -> PathBuf {
        self.dir.join(id.artifact_file_name())
    }

    /// Create the artifact directory if missing
    ///
    /// # Errors
    ///
    /// Returns `ArtifactCreation` if the directory cannot be created.
    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(LifecycleError::ArtifactCreation)
    }

    /// Generate the artifact for `id`
    ///
    /// On failure any partially written file is removed before returning.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactCreation` on any I/O failure.
    pub async fn generate(
        &self,
        id: &SessionId,
        selector: SizeSelector,
    ) -> Result<GeneratedArtifact> {
        let path = self.path_for(id);
        let size_bytes = selector.bytes();
        let chunk_size = self.chunk_size;

        let task_path = path.clone();
        let written = tokio::task::spawn_blocking(move || {
            write_random_file(&task_path, size_bytes, chunk_size)
        })
        .await?;

        match written {
            Ok(digest) => {
                tracing::debug!(session = %id, size = size_bytes, "artifact generated");
                Ok(GeneratedArtifact {
                    path,
                    size_bytes,
                    digest,
                })
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(
                            "Failed to remove partial artifact {}: {}",
                            path.display(),
                            cleanup
                        );
                    }
                }
                Err(LifecycleError::ArtifactCreation(e))
            }
        }
    }
}

/// Write `size` random bytes to `path`, returning the hex SHA-256 of the content
pub fn write_random_file(path: &Path, size: u64, chunk_size: usize) -> std::io::Result<String> {
    let chunk_size = chunk_size.max(1);
    let file = File::create(path)?;
    let mut writer = BufWriter::with_capacity(chunk_size, file);
    let mut hasher = Sha256::new();
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; chunk_size];

    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(chunk_size as u64) as usize;
        let chunk = &mut buf[..n];
        rng.fill_bytes(chunk);
        writer.write_all(chunk)?;
        hasher.update(&*chunk);
        remaining -= n as u64;
    }

    writer.flush()?;

    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of a file, read in chunks
pub async fn digest_file(path: &Path) -> std::io::Result<String> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
