//! Blob store adapter
//!
//! Artifacts live in an object store behind the `BlobStore` trait; the
//! production implementation is filesystem-backed under a configured root.
//! Handles are opaque relative paths (`binaries/<user>/<uuid>_<name>`);
//! callers never parse them. The upload digest and a URL hint ride along
//! as side-channel attributes.

use async_trait::async_trait;
use binsight_common::config::BlobConfig;
use binsight_common::{Error, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Result of a successful upload
#[derive(Debug, Clone)]
pub struct StoredBlob {
    /// Opaque handle for later fetch/delete
    pub handle: String,
    /// Human-readable location for diagnostics only
    pub url_hint: String,
    /// SHA-256 hex digest of the content; the ingestion cache key
    pub digest: String,
    pub size: u64,
}

/// Object store seam; injected so tests can substitute a stub
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store an artifact. Repeated puts of identical content yield
    /// distinct handles; dedup happens at ingestion via the digest.
    async fn put(&self, user_id: Uuid, filename: &str, bytes: &[u8]) -> Result<StoredBlob>;

    /// Fetch an artifact, retrying transient failures
    async fn get(&self, handle: &str) -> Result<Vec<u8>>;

    /// Fetch into a local temp file; the caller owns deletion
    async fn get_to_temp_file(&self, handle: &str, name: &str) -> Result<PathBuf>;

    /// Delete an artifact; deleting a missing blob is not an error
    async fn delete(&self, handle: &str) -> Result<()>;

    /// Handles under `prefix` last modified before `now - age`. Returns
    /// handles only; contents are never loaded.
    async fn list_older_than(&self, age: Duration, prefix: &str) -> Result<Vec<String>>;
}

/// Filesystem-backed blob store
pub struct FsBlobStore {
    root: PathBuf,
    max_file_size: u64,
    fetch_timeout: Duration,
    fetch_retries: u32,
}

impl FsBlobStore {
    pub fn new(config: &BlobConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root)?;
        Ok(Self {
            root: config.root.clone(),
            max_file_size: config.max_file_size,
            fetch_timeout: config.fetch_timeout,
            fetch_retries: config.fetch_retries,
        })
    }

    fn resolve(&self, handle: &str) -> Result<PathBuf> {
        // Handles are relative paths we minted ourselves; anything that
        // climbs out of the root is hostile input.
        if handle.split('/').any(|part| part == "..") || Path::new(handle).is_absolute() {
            return Err(Error::BlobNotFound(handle.to_string()));
        }
        Ok(self.root.join(handle))
    }

    async fn read_with_retries(&self, handle: &str) -> Result<Vec<u8>> {
        let path = self.resolve(handle)?;
        let mut backoff = Duration::from_secs(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match tokio::fs::read(&path).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::BlobNotFound(handle.to_string()));
                }
                Err(err) => {
                    if attempt > self.fetch_retries {
                        error!(handle, attempt, "blob fetch exhausted retries: {err}");
                        return Err(Error::Io(err));
                    }
                    warn!(
                        handle,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        "transient blob fetch failure, retrying: {err}"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(8));
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, user_id: Uuid, filename: &str, bytes: &[u8]) -> Result<StoredBlob> {
        let size = bytes.len() as u64;
        if size > self.max_file_size {
            return Err(Error::FileTooLarge {
                size,
                limit: self.max_file_size,
            });
        }

        let digest = hex_digest(bytes);
        let handle = format!(
            "binaries/{}/{}_{}",
            user_id,
            Uuid::new_v4(),
            sanitize_filename(filename)
        );
        let path = self.resolve(&handle)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;

        debug!(handle, size, "stored blob");
        Ok(StoredBlob {
            url_hint: format!("file://{}", path.display()),
            handle,
            digest,
            size,
        })
    }

    async fn get(&self, handle: &str) -> Result<Vec<u8>> {
        let path = self.resolve(handle)?;

        // Fail fast on oversize before reading anything
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if meta.len() > self.max_file_size {
                return Err(Error::FileTooLarge {
                    size: meta.len(),
                    limit: self.max_file_size,
                });
            }
        }

        match tokio::time::timeout(self.fetch_timeout, self.read_with_retries(handle)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("blob fetch timed out after {:?}", self.fetch_timeout),
            ))),
        }
    }

    async fn get_to_temp_file(&self, handle: &str, name: &str) -> Result<PathBuf> {
        let bytes = self.get(handle).await?;
        let path = std::env::temp_dir().join(format!(
            "binsight_{}_{}",
            Uuid::new_v4(),
            sanitize_filename(name)
        ));
        tokio::fs::write(&path, &bytes).await?;
        Ok(path)
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        let path = self.resolve(handle)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Io(err)),
        }
    }

    async fn list_older_than(&self, age: Duration, prefix: &str) -> Result<Vec<String>> {
        let cutoff: DateTime<Utc> = Utc::now() - chrono::Duration::from_std(age).unwrap_or_default();
        let root = self.root.clone();
        let prefix = prefix.to_string();

        // Directory walk is synchronous; keep it off the async workers
        let handles = tokio::task::spawn_blocking(move || walk_older_than(&root, &prefix, cutoff))
            .await
            .map_err(|e| Error::Internal(format!("blob sweep task failed: {e}")))??;

        Ok(handles)
    }
}

/// Walk the tree under `root`, returning handles under `prefix` with an
/// mtime before `cutoff`. Only paths are accumulated, never contents.
fn walk_older_than(root: &Path, prefix: &str, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
    let mut matches = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(Error::Io(err)),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let handle = match path.strip_prefix(root) {
                Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            if !handle.starts_with(prefix) {
                continue;
            }
            let modified: DateTime<Utc> = entry.metadata()?.modified()?.into();
            if modified < cutoff {
                matches.push(handle);
            }
        }
    }

    Ok(matches)
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Keep filenames filesystem-safe without losing readability
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "upload.bin".to_string()
    } else {
        cleaned
    }
}
