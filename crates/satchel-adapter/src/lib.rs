//! casbin policy persistence in a single object-storage object.
//!
//! # Purpose
//! Lets several processes share one casbin policy through an object store
//! instead of a database. The whole policy lives in one text object
//! (`policies.csv` by default), one rule per line.
//!
//! # How it fits
//! - [`codec`] turns rules into lines and back.
//! - [`ObjectPolicyStore`] runs the read-modify-write cycles against an
//!   injected [`satchel_storage::ObjectStorage`] and implements
//!   `casbin::Adapter`, so it plugs straight into `casbin::Enforcer::new`.
//!
//! # Key invariants
//! - Every write replaces the whole object with a freshly encoded blob.
//! - A missing object is an empty policy.
//! - Mutations report persistence failures as `false`; casbin then leaves its
//!   in-memory model unchanged.
//!
//! # Examples
//! ```rust
//! use satchel_adapter::{ObjectPolicyStore, StoreSettings};
//! use satchel_storage::InMemoryObjectStorage;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(InMemoryObjectStorage::with_buckets(["casbin"]));
//! let store = ObjectPolicyStore::init(storage, StoreSettings::new("casbin")).await?;
//! assert!(store.add_policy("p", "p", vec!["alice".into(), "data1".into(), "read".into()]).await);
//! # Ok(())
//! # }
//! ```
//!
//! # Common pitfalls
//! - Two stores writing the same key with [`Consistency::LastWriteWins`] can
//!   lose each other's edits; use [`Consistency::CompareAndSwap`] when the
//!   backend supports conditional writes.
//! - The store does not de-duplicate; adding the same rule twice outside an
//!   enforcer persists two lines.

mod adapter;
pub mod codec;
pub mod config;
mod errors;
pub mod observability;
pub mod store;

pub use codec::PolicyLine;
pub use config::{Consistency, DEFAULT_OBJECT_KEY, StoreSettings};
pub use errors::{CodecError, PolicyStoreError, PolicyStoreResult};
pub use store::{ObjectPolicyStore, PolicyFilter};
