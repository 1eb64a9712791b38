//! Directory-backed implementation of [`ObjectStorage`].
//!
//! Each bucket is a sub-directory of the root and each key a file path below
//! it. Writes land in a uniquely named sibling temp file first and are renamed
//! into place, so readers only ever observe a complete previous or complete
//! new body, even with several writers on one root.
//!
//! Version tokens are the hex SHA-256 of the body. Conditional writes are
//! checked under a per-instance mutex only; two instances or processes sharing
//! the same directory still race between the check and the rename.
use crate::{
    ObjectStorage, ObjectSummary, ObjectVersion, StorageError, StorageResult, StoredObject,
    WriteCondition, check_condition,
};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use tokio::sync::Mutex;

const TEMP_SUFFIX: &str = ".satchel-tmp";

#[derive(Debug)]
pub struct LocalDirStorage {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalDirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> StorageResult<PathBuf> {
        let mut components = Path::new(bucket).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(bucket)),
            _ => Err(StorageError::InvalidKey(bucket.to_string())),
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty()
            || key.ends_with(TEMP_SUFFIX)
            || !Path::new(key)
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.bucket_dir(bucket)?.join(key))
    }

    async fn ensure_bucket(&self, bucket: &str) -> StorageResult<PathBuf> {
        let dir = self.bucket_dir(bucket)?;
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(StorageError::BucketNotFound(bucket.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::BucketNotFound(bucket.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn read_current(path: &Path) -> StorageResult<Option<Bytes>> {
        match tokio::fs::read(path).await {
            Ok(body) => Ok(Some(Bytes::from(body))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn version_of(body: &[u8]) -> ObjectVersion {
    ObjectVersion::new(format!("{:x}", Sha256::digest(body)))
}

/// Write `body` to a fresh temp file next to `path`, then rename it over `path`.
fn replace_file(path: &Path, body: &[u8]) -> StorageResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::InvalidKey(path.display().to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".")
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)?;
    temp.write_all(body)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn key_for(bucket_dir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(bucket_dir).ok()?;
    let parts: Option<Vec<&str>> = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    Some(parts?.join("/"))
}

#[async_trait]
impl ObjectStorage for LocalDirStorage {
    async fn head_bucket(&self, bucket: &str) -> StorageResult<()> {
        self.ensure_bucket(bucket).await.map(|_| ())
    }

    async fn create_bucket(&self, bucket: &str) -> StorageResult<()> {
        let dir = self.bucket_dir(bucket)?;
        if tokio::fs::try_exists(&dir).await? {
            return Err(StorageError::BucketExists(bucket.to_string()));
        }
        tokio::fs::create_dir_all(&dir).await?;
        tracing::debug!(bucket, root = %self.root.display(), "created bucket directory");
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> StorageResult<()> {
        let dir = self.ensure_bucket(bucket).await?;
        if !self.list_objects(bucket, "").await?.is_empty() {
            return Err(StorageError::BucketNotEmpty(bucket.to_string()));
        }
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StorageResult<StoredObject> {
        let path = self.object_path(bucket, key)?;
        self.ensure_bucket(bucket).await?;
        let body = Self::read_current(&path)
            .await?
            .ok_or(StorageError::NotFound)?;
        let version = version_of(&body);
        Ok(StoredObject { body, version })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        condition: WriteCondition,
    ) -> StorageResult<ObjectVersion> {
        let path = self.object_path(bucket, key)?;
        self.ensure_bucket(bucket).await?;
        let _guard = self.write_lock.lock().await;

        if condition != WriteCondition::Unconditional {
            let current = Self::read_current(&path).await?;
            let current_version = current.as_deref().map(version_of);
            check_condition(&condition, current_version.as_ref())?;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let version = version_of(&body);
        tokio::task::spawn_blocking(move || replace_file(&path, &body))
            .await
            .map_err(|err| StorageError::Unexpected(anyhow::Error::new(err)))??;
        Ok(version)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let path = self.object_path(bucket, key)?;
        self.ensure_bucket(bucket).await?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<ObjectSummary>> {
        let bucket_dir = self.ensure_bucket(bucket).await?;
        let mut listing = Vec::new();
        let mut pending = vec![bucket_dir.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.to_string_lossy().ends_with(TEMP_SUFFIX) {
                    continue;
                }
                let Some(key) = key_for(&bucket_dir, &path) else {
                    continue;
                };
                if key.starts_with(prefix) {
                    let size = entry.metadata().await?.len();
                    listing.push(ObjectSummary { key, size });
                }
            }
        }
        listing.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listing)
    }

    /// Conditions are honoured against writers sharing this instance. Other
    /// instances or processes on the same root can still slip a write in
    /// between the version check and the rename.
    fn supports_conditional_writes(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "local-dir"
    }
}
