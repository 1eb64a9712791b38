//! Object-storage capability for policy persistence.
//!
//! # Purpose
//! Defines the narrow surface the policy adapter needs from an object store:
//! bucket head-checks, whole-object get/put/delete, and key listing. Backends
//! live in sibling modules and are injected as `Arc<dyn ObjectStorage>`.
//!
//! # Key invariants
//! - Objects are only ever replaced whole; there is no partial update.
//! - Every successful write returns an [`ObjectVersion`]; conditional writes
//!   compare against it.
//! - A missing object is reported as [`StorageError::NotFound`], never as an
//!   empty body.
//!
//! # Backends
//! - [`InMemoryObjectStorage`]: process-local emulator for tests and local dev.
//! - [`LocalDirStorage`]: bucket = directory, key = file under it.
//!
//! # Examples
//! ```
//! use bytes::Bytes;
//! use satchel_storage::{InMemoryObjectStorage, ObjectStorage, WriteCondition};
//!
//! let rt = tokio::runtime::Runtime::new().expect("rt");
//! rt.block_on(async {
//!     let storage = InMemoryObjectStorage::new();
//!     storage.create_bucket("policies").await.expect("bucket");
//!     storage
//!         .put_object("policies", "policies.csv", Bytes::from_static(b"p,a,b,c"), WriteCondition::Unconditional)
//!         .await
//!         .expect("put");
//!     let object = storage.get_object("policies", "policies.csv").await.expect("get");
//!     assert_eq!(object.body, Bytes::from_static(b"p,a,b,c"));
//! });
//! ```
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

mod errors;
pub mod local_dir;
pub mod memory;

pub use errors::{StorageError, StorageResult};
pub use local_dir::LocalDirStorage;
pub use memory::InMemoryObjectStorage;

/// Opaque version token for a stored object (an ETag in S3 terms).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectVersion(String);

impl ObjectVersion {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Precondition attached to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// Overwrite whatever is there.
    Unconditional,
    /// Only write if the current object carries exactly this version.
    IfMatch(ObjectVersion),
    /// Only write if no object exists under the key.
    IfAbsent,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub version: ObjectVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn head_bucket(&self, bucket: &str) -> StorageResult<()>;
    async fn create_bucket(&self, bucket: &str) -> StorageResult<()>;
    /// Fails with [`StorageError::BucketNotEmpty`] while objects remain.
    async fn delete_bucket(&self, bucket: &str) -> StorageResult<()>;

    async fn get_object(&self, bucket: &str, key: &str) -> StorageResult<StoredObject>;
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        condition: WriteCondition,
    ) -> StorageResult<ObjectVersion>;
    /// Deleting a key that does not exist succeeds.
    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()>;
    /// Keys under `prefix`, sorted lexically.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<ObjectSummary>>;

    /// Whether `put_object` honours [`WriteCondition::IfMatch`] and [`WriteCondition::IfAbsent`].
    fn supports_conditional_writes(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}

/// Shared precondition check for backends that can see the current version.
pub(crate) fn check_condition(
    condition: &WriteCondition,
    current: Option<&ObjectVersion>,
) -> StorageResult<()> {
    match (condition, current) {
        (WriteCondition::Unconditional, _) => Ok(()),
        (WriteCondition::IfAbsent, None) => Ok(()),
        (WriteCondition::IfMatch(expected), Some(actual)) if expected == actual => Ok(()),
        _ => Err(StorageError::PreconditionFailed),
    }
}
