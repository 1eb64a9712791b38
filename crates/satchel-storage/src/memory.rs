//! In-memory implementation of [`ObjectStorage`].
//!
//! # Purpose
//! Emulates an object store entirely in memory using nested `HashMap`s guarded
//! by `tokio::sync::RwLock`. It exists for:
//! - unit and integration tests (deterministic, no external service)
//! - local development where several adapters in one process share a bucket
//!
//! # Durability and consistency
//! - **Not durable**: all state is lost when the value is dropped.
//! - Writes are linearizable within the process: the version check and the
//!   replace happen under one write lock, so conditional writes behave like a
//!   real compare-and-swap.
//!
//! # Fault injection
//! `fail_next_puts` / `fail_next_gets` make the next N calls fail with
//! [`StorageError::Unavailable`] so callers can exercise degraded paths.
use crate::{
    ObjectStorage, ObjectSummary, ObjectVersion, StorageError, StorageResult, StoredObject,
    WriteCondition, check_condition,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Entry {
    body: Bytes,
    version: ObjectVersion,
}

type Bucket = HashMap<String, Entry>;

#[derive(Debug, Default)]
pub struct InMemoryObjectStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
    /// Source of version tokens; shared by every bucket so tokens never repeat.
    next_version: AtomicU64,
    failing_puts: AtomicUsize,
    failing_gets: AtomicUsize,
    puts: AtomicU64,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with the given buckets already created.
    pub fn with_buckets<I, S>(buckets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let map = buckets
            .into_iter()
            .map(|name| (name.into(), Bucket::new()))
            .collect();
        Self {
            buckets: RwLock::new(map),
            ..Self::default()
        }
    }

    pub fn fail_next_puts(&self, count: usize) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_gets(&self, count: usize) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    /// Number of successful `put_object` calls so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn mint_version(&self) -> ObjectVersion {
        let seq = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        ObjectVersion::new(format!("v{seq}"))
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn head_bucket(&self, bucket: &str) -> StorageResult<()> {
        if self.buckets.read().await.contains_key(bucket) {
            Ok(())
        } else {
            Err(StorageError::BucketNotFound(bucket.to_string()))
        }
    }

    async fn create_bucket(&self, bucket: &str) -> StorageResult<()> {
        let mut buckets = self.buckets.write().await;
        if buckets.contains_key(bucket) {
            return Err(StorageError::BucketExists(bucket.to_string()));
        }
        buckets.insert(bucket.to_string(), Bucket::new());
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> StorageResult<()> {
        let mut buckets = self.buckets.write().await;
        match buckets.get(bucket) {
            None => Err(StorageError::BucketNotFound(bucket.to_string())),
            Some(objects) if !objects.is_empty() => {
                Err(StorageError::BucketNotEmpty(bucket.to_string()))
            }
            Some(_) => {
                buckets.remove(bucket);
                Ok(())
            }
        }
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StorageResult<StoredObject> {
        if Self::take_failure(&self.failing_gets) {
            return Err(StorageError::Unavailable("injected get failure".into()));
        }
        let buckets = self.buckets.read().await;
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        let entry = objects.get(key).ok_or(StorageError::NotFound)?;
        Ok(StoredObject {
            body: entry.body.clone(),
            version: entry.version.clone(),
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        condition: WriteCondition,
    ) -> StorageResult<ObjectVersion> {
        if Self::take_failure(&self.failing_puts) {
            return Err(StorageError::Unavailable("injected put failure".into()));
        }
        // Check and replace under one write lock so concurrent writers cannot interleave.
        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        check_condition(&condition, objects.get(key).map(|entry| &entry.version))?;
        let version = self.mint_version();
        objects.insert(
            key.to_string(),
            Entry {
                body,
                version: version.clone(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        objects.remove(key);
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<ObjectSummary>> {
        let buckets = self.buckets.read().await;
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        let mut listing: Vec<ObjectSummary> = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| ObjectSummary {
                key: key.clone(),
                size: entry.body.len() as u64,
            })
            .collect();
        listing.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listing)
    }

    fn supports_conditional_writes(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
