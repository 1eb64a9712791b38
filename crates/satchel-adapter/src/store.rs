//! Object-backed policy store.
//!
//! # Purpose
//! Keeps a casbin policy as one text object (`policies.csv` by default) in an
//! object-storage bucket, so several processes can share a policy without a
//! database.
//!
//! # Read-modify-write
//! Object storage has no partial update, so every mutation runs the same cycle:
//! 1) fetch the object; a missing object is an empty policy
//! 2) decode it into [`PolicyLine`]s
//! 3) apply the edit (append, exact removal, filtered removal)
//! 4) encode and write the whole blob back
//!
//! The blob is always replaced by a freshly encoded, syntactically valid text;
//! it is never patched in place.
//!
//! # Concurrency model
//! - Within one store, every operation holds an async mutex for its whole
//!   cycle, so overlapping calls on the same instance are applied in the
//!   order they acquire the lock instead of interleaving.
//! - Across stores (same or other processes) there is no shared lock. With
//!   [`Consistency::LastWriteWins`] the last full write wins and a concurrent
//!   edit can be lost without notice. [`Consistency::CompareAndSwap`] writes
//!   with a version precondition and re-runs the cycle on conflict.
//!
//! # Failure semantics
//! - `init` fails with [`PolicyStoreError::StoreUnavailable`] when the bucket
//!   cannot be reached; no store is built.
//! - `load_policy` surfaces every fault except a missing object.
//! - `save_policy` and every mutation return `bool`; failures are logged with
//!   `tracing::warn!` and reported as `false`, never raised.
use crate::codec::{self, PolicyLine};
use crate::config::{Consistency, StoreSettings};
use crate::errors::{PolicyStoreError, PolicyStoreResult};
use bytes::Bytes;
use casbin::Model;
use satchel_storage::{ObjectStorage, ObjectVersion, StorageError, WriteCondition};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Positional rule filter for partial loads.
///
/// `p` applies to `p*` ptypes and `g` to `g*` ptypes; entry `i` constrains
/// field `i`, and an empty entry matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyFilter {
    pub p: Vec<String>,
    pub g: Vec<String>,
}

impl PolicyFilter {
    pub fn matches(&self, line: &PolicyLine) -> bool {
        let wanted = match line.section() {
            Some("p") => &self.p,
            Some("g") => &self.g,
            _ => return false,
        };
        fields_match(&line.fields, 0, wanted)
    }
}

impl<'a> From<casbin::Filter<'a>> for PolicyFilter {
    fn from(filter: casbin::Filter<'a>) -> Self {
        Self {
            p: filter.p.into_iter().map(str::to_string).collect(),
            g: filter.g.into_iter().map(str::to_string).collect(),
        }
    }
}

/// `fields[offset + i] == wanted[i]` for every non-empty `wanted[i]`.
fn fields_match(fields: &[String], offset: usize, wanted: &[String]) -> bool {
    wanted.iter().enumerate().all(|(i, value)| {
        value.is_empty() || fields.get(offset + i).is_some_and(|field| field == value)
    })
}

/// Linear backoff, saturating instead of overflowing.
fn retry_delay(backoff: Duration, attempt: u32) -> Duration {
    backoff.checked_mul(attempt).unwrap_or(Duration::MAX)
}

pub struct ObjectPolicyStore {
    storage: Arc<dyn ObjectStorage>,
    bucket: String,
    key: String,
    consistency: Consistency,
    /// Set by a filtered load; a filtered view must never overwrite the full blob.
    filtered: AtomicBool,
    op_lock: Mutex<()>,
}

impl fmt::Debug for ObjectPolicyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPolicyStore")
            .field("backend", &self.storage.backend_name())
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("consistency", &self.consistency)
            .field("filtered", &self.filtered.load(Ordering::SeqCst))
            .finish()
    }
}

impl ObjectPolicyStore {
    /// Verify the bucket is reachable and build a ready store.
    ///
    /// With `force_create_bucket`, a missing bucket is created first; losing a
    /// creation race to another process is not an error.
    pub async fn init(
        storage: Arc<dyn ObjectStorage>,
        settings: StoreSettings,
    ) -> PolicyStoreResult<Self> {
        settings.validate()?;
        if matches!(settings.consistency, Consistency::CompareAndSwap { .. })
            && !storage.supports_conditional_writes()
        {
            return Err(PolicyStoreError::InvalidConfig(format!(
                "backend {} does not support conditional writes",
                storage.backend_name()
            )));
        }

        let bucket = settings.bucket;
        if let Err(err) = storage.head_bucket(&bucket).await {
            if !(settings.force_create_bucket && matches!(err, StorageError::BucketNotFound(_))) {
                return Err(PolicyStoreError::StoreUnavailable { bucket, source: err });
            }
            match storage.create_bucket(&bucket).await {
                Ok(()) => tracing::info!(bucket = %bucket, "created policy bucket"),
                Err(StorageError::BucketExists(_)) => {}
                Err(source) => return Err(PolicyStoreError::StoreUnavailable { bucket, source }),
            }
            if let Err(source) = storage.head_bucket(&bucket).await {
                return Err(PolicyStoreError::StoreUnavailable { bucket, source });
            }
        }

        tracing::info!(
            backend = storage.backend_name(),
            bucket = %bucket,
            key = %settings.key,
            consistency = ?settings.consistency,
            "policy store ready"
        );
        Ok(Self {
            storage,
            bucket,
            key: settings.key,
            consistency: settings.consistency,
            filtered: AtomicBool::new(false),
            op_lock: Mutex::new(()),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    pub fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::SeqCst)
    }

    /// Raw blob and its version; `None` when the object does not exist.
    async fn fetch_blob(&self) -> PolicyStoreResult<Option<(String, ObjectVersion)>> {
        match self.storage.get_object(&self.bucket, &self.key).await {
            Ok(object) => {
                let blob = String::from_utf8(object.body.to_vec())?;
                Ok(Some((blob, object.version)))
            }
            Err(StorageError::NotFound) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Current persisted rules in blob order, without touching any model.
    ///
    /// Duplicate lines are returned as stored.
    pub async fn fetch_lines(&self) -> PolicyStoreResult<Vec<PolicyLine>> {
        let _guard = self.op_lock.lock().await;
        match self.fetch_blob().await? {
            Some((blob, _)) => Ok(codec::try_decode_blob(&blob)?),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the model's rules with the persisted ones. Returns how many
    /// rules the model accepted.
    pub async fn load_policy(&self, model: &mut dyn Model) -> PolicyStoreResult<usize> {
        let _guard = self.op_lock.lock().await;
        model.clear_policy();
        let blob = self.fetch_blob().await?.map(|(blob, _)| blob).unwrap_or_default();
        let loaded = codec::load_blob_into_model(&blob, model);
        self.filtered.store(false, Ordering::SeqCst);
        tracing::debug!(bucket = %self.bucket, key = %self.key, loaded, "loaded policy");
        Ok(loaded)
    }

    /// Like [`load_policy`](Self::load_policy), but only rules passing `filter`
    /// reach the model. The store stays filtered until the next full load.
    pub async fn load_filtered_policy(
        &self,
        model: &mut dyn Model,
        filter: &PolicyFilter,
    ) -> PolicyStoreResult<usize> {
        let _guard = self.op_lock.lock().await;
        model.clear_policy();
        let blob = self.fetch_blob().await?.map(|(blob, _)| blob).unwrap_or_default();
        let lines = codec::decode_blob(&blob)
            .into_iter()
            .filter(|line| filter.matches(line));
        let loaded = codec::load_lines_into_model(lines, model);
        self.filtered.store(true, Ordering::SeqCst);
        tracing::debug!(bucket = %self.bucket, key = %self.key, loaded, "loaded filtered policy");
        Ok(loaded)
    }

    /// Overwrite the object with the model's full rule set.
    pub async fn save_policy(&self, model: &dyn Model) -> bool {
        let _guard = self.op_lock.lock().await;
        if self.is_filtered() {
            tracing::warn!(
                bucket = %self.bucket,
                key = %self.key,
                "refusing to save a filtered policy over the full object"
            );
            return false;
        }
        let blob = codec::encode_model(model);
        match self.write_blob(blob, WriteCondition::Unconditional).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(bucket = %self.bucket, key = %self.key, error = %err, "save_policy failed");
                false
            }
        }
    }

    /// Delete the object. A missing object counts as cleared.
    pub async fn clear_policy(&self) -> bool {
        let _guard = self.op_lock.lock().await;
        match self.storage.delete_object(&self.bucket, &self.key).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(bucket = %self.bucket, key = %self.key, error = %err, "clear_policy failed");
                false
            }
        }
    }

    /// Append one rule. No duplicate check: the engine is expected to reject
    /// rules it already holds before calling this.
    pub async fn add_policy(&self, sec: &str, ptype: &str, rule: Vec<String>) -> bool {
        self.add_policies(sec, ptype, vec![rule]).await
    }

    pub async fn add_policies(&self, sec: &str, ptype: &str, rules: Vec<Vec<String>>) -> bool {
        let additions: Vec<PolicyLine> = rules
            .into_iter()
            .map(|fields| PolicyLine::new(ptype, fields))
            .collect();
        self.mutate(sec, ptype, "add_policy", move |lines| {
            lines.extend(additions.iter().cloned());
        })
        .await
    }

    /// Remove every stored copy of the rule. Absent rules leave the content
    /// unchanged, although the object is still rewritten.
    pub async fn remove_policy(&self, sec: &str, ptype: &str, rule: Vec<String>) -> bool {
        self.remove_policies(sec, ptype, vec![rule]).await
    }

    pub async fn remove_policies(&self, sec: &str, ptype: &str, rules: Vec<Vec<String>>) -> bool {
        let targets: Vec<PolicyLine> = rules
            .into_iter()
            .map(|fields| PolicyLine::new(ptype, fields))
            .collect();
        self.mutate(sec, ptype, "remove_policy", move |lines| {
            lines.retain(|line| !targets.contains(line));
        })
        .await
    }

    /// Remove every `ptype` rule whose fields from `field_index` on match
    /// `field_values` in order. Empty values match anything and fields past
    /// the given values are unconstrained.
    ///
    /// An empty `field_values` selects nothing: the object is left alone and
    /// the call returns `false`, matching the casbin model.
    pub async fn remove_filtered_policy(
        &self,
        sec: &str,
        ptype: &str,
        field_index: usize,
        field_values: Vec<String>,
    ) -> bool {
        if field_values.is_empty() {
            tracing::debug!(sec, ptype, field_index, "filtered removal without field values ignored");
            return false;
        }
        let target = ptype.to_string();
        self.mutate(sec, ptype, "remove_filtered_policy", move |lines| {
            lines.retain(|line| {
                !(line.ptype == target && fields_match(&line.fields, field_index, &field_values))
            });
        })
        .await
    }

    async fn mutate<F>(&self, sec: &str, ptype: &str, op: &'static str, edit: F) -> bool
    where
        F: Fn(&mut Vec<PolicyLine>) + Send + Sync,
    {
        let _guard = self.op_lock.lock().await;
        match self.read_modify_write(&edit).await {
            Ok(count) => {
                tracing::debug!(op, sec, ptype, bucket = %self.bucket, key = %self.key, rules = count, "policy object rewritten");
                true
            }
            Err(err) => {
                tracing::warn!(op, sec, ptype, bucket = %self.bucket, key = %self.key, error = %err, "policy mutation not persisted");
                false
            }
        }
    }

    /// One full cycle per attempt. Returns the number of rules written.
    async fn read_modify_write<F>(&self, edit: &F) -> PolicyStoreResult<usize>
    where
        F: Fn(&mut Vec<PolicyLine>) + Send + Sync,
    {
        let (max_attempts, backoff) = match self.consistency {
            Consistency::LastWriteWins => (1, None),
            Consistency::CompareAndSwap {
                max_attempts,
                backoff,
            } => (max_attempts, Some(backoff)),
        };

        for attempt in 1..=max_attempts {
            let current = self.fetch_blob().await?;
            let (mut lines, condition) = match (current, backoff) {
                (Some((blob, version)), Some(_)) => {
                    (codec::try_decode_blob(&blob)?, WriteCondition::IfMatch(version))
                }
                (Some((blob, _)), None) => {
                    (codec::try_decode_blob(&blob)?, WriteCondition::Unconditional)
                }
                (None, Some(_)) => (Vec::new(), WriteCondition::IfAbsent),
                (None, None) => (Vec::new(), WriteCondition::Unconditional),
            };
            edit(&mut lines);
            let count = lines.len();
            match self.write_blob(codec::encode_blob(&lines), condition).await {
                Ok(_) => return Ok(count),
                Err(PolicyStoreError::TransientStorageFault(StorageError::PreconditionFailed))
                    if attempt < max_attempts =>
                {
                    let delay = retry_delay(backoff.unwrap_or_default(), attempt);
                    tracing::warn!(
                        bucket = %self.bucket,
                        key = %self.key,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "policy object changed underneath, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(PolicyStoreError::TransientStorageFault(StorageError::PreconditionFailed)) => {
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Err(PolicyStoreError::LostUpdateRace {
            attempts: max_attempts,
        })
    }

    async fn write_blob(
        &self,
        blob: String,
        condition: WriteCondition,
    ) -> PolicyStoreResult<ObjectVersion> {
        Ok(self
            .storage
            .put_object(&self.bucket, &self.key, Bytes::from(blob), condition)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use casbin::DefaultModel;
    use satchel_storage::{
        InMemoryObjectStorage, ObjectSummary, StorageResult, StoredObject,
    };
    use std::sync::atomic::AtomicUsize;

    const BUCKET: &str = "casbin.example.net";
    const MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub) && (r.obj == p.obj || p.obj == "*") && (r.act == p.act || p.act == "*")
"#;

    fn strings(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    fn rule(ptype: &str, fields: &[&str]) -> PolicyLine {
        PolicyLine::new(ptype, fields.iter().copied())
    }

    async fn store_on(storage: Arc<InMemoryObjectStorage>) -> ObjectPolicyStore {
        ObjectPolicyStore::init(storage, StoreSettings::new(BUCKET))
            .await
            .expect("init")
    }

    async fn fresh_store() -> (Arc<InMemoryObjectStorage>, ObjectPolicyStore) {
        let storage = Arc::new(InMemoryObjectStorage::with_buckets([BUCKET]));
        let store = store_on(storage.clone()).await;
        (storage, store)
    }

    async fn raw_blob(storage: &InMemoryObjectStorage) -> String {
        let object = storage
            .get_object(BUCKET, "policies.csv")
            .await
            .expect("object");
        String::from_utf8(object.body.to_vec()).expect("utf8")
    }

    #[tokio::test]
    async fn init_fails_on_missing_bucket() {
        let storage = Arc::new(InMemoryObjectStorage::new());
        let err = ObjectPolicyStore::init(storage, StoreSettings::new(BUCKET))
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyStoreError::StoreUnavailable { .. }));
    }

    #[tokio::test]
    async fn init_creates_bucket_when_forced() {
        let storage = Arc::new(InMemoryObjectStorage::new());
        let store = ObjectPolicyStore::init(
            storage.clone(),
            StoreSettings::new(BUCKET).with_force_create_bucket(true),
        )
        .await
        .expect("init");
        assert_eq!(store.bucket(), BUCKET);
        assert_eq!(store.key(), "policies.csv");
        storage.head_bucket(BUCKET).await.expect("bucket exists");
    }

    #[tokio::test]
    async fn init_rejects_invalid_settings() {
        let storage = Arc::new(InMemoryObjectStorage::with_buckets([BUCKET]));
        let err = ObjectPolicyStore::init(storage, StoreSettings::new(""))
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyStoreError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn load_on_missing_object_is_empty() {
        let (_storage, store) = fresh_store().await;
        let mut model = DefaultModel::from_str(MODEL).await.expect("model");
        model.add_policy("p", "p", strings(&["stale", "x", "y"]));
        assert_eq!(store.load_policy(&mut model).await.expect("load"), 0);
        assert!(model.get_policy("p", "p").is_empty());
        assert!(store.fetch_lines().await.expect("lines").is_empty());
    }

    #[tokio::test]
    async fn load_surfaces_other_faults() {
        let (storage, store) = fresh_store().await;
        storage.fail_next_gets(1);
        let mut model = DefaultModel::from_str(MODEL).await.expect("model");
        let err = store.load_policy(&mut model).await.unwrap_err();
        assert!(matches!(
            err,
            PolicyStoreError::TransientStorageFault(StorageError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn add_appends_and_creates_object() {
        let (storage, store) = fresh_store().await;
        assert!(
            store
                .add_policy("p", "p", strings(&["Administrator", "*", "iam:CreateGroup"]))
                .await
        );
        assert!(store.add_policy("g", "g", strings(&["alice", "Administrator"])).await);
        assert_eq!(
            raw_blob(&storage).await,
            "p,Administrator,*,iam:CreateGroup\ng,alice,Administrator"
        );
    }

    #[tokio::test]
    async fn raw_double_add_keeps_both_lines() {
        let (_storage, store) = fresh_store().await;
        let fields = strings(&["Administrator", "*", "iam:CreateGroup"]);
        assert!(store.add_policy("p", "p", fields.clone()).await);
        assert!(store.add_policy("p", "p", fields).await);
        let lines = store.fetch_lines().await.expect("lines");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], lines[1]);
    }

    #[tokio::test]
    async fn remove_drops_every_copy_and_ignores_absent() {
        let (storage, store) = fresh_store().await;
        let target = strings(&["bob", "data2", "write"]);
        assert!(store.add_policy("p", "p", target.clone()).await);
        assert!(store.add_policy("p", "p", strings(&["alice", "data1", "read"])).await);
        assert!(store.add_policy("p", "p", target.clone()).await);

        assert!(store.remove_policy("p", "p", target).await);
        assert_eq!(raw_blob(&storage).await, "p,alice,data1,read");

        let writes = storage.put_count();
        assert!(store.remove_policy("p", "p", strings(&["nobody", "x", "y"])).await);
        assert_eq!(raw_blob(&storage).await, "p,alice,data1,read");
        assert_eq!(storage.put_count(), writes + 1);
    }

    #[tokio::test]
    async fn remove_on_missing_object_writes_empty_blob() {
        let (storage, store) = fresh_store().await;
        assert!(store.remove_policy("p", "p", strings(&["a", "b", "c"])).await);
        assert_eq!(raw_blob(&storage).await, "");
    }

    #[tokio::test]
    async fn filtered_removal_without_values_leaves_object_alone() {
        let (storage, store) = fresh_store().await;
        for fields in [["alice", "data1", "read"], ["bob", "data2", "write"]] {
            assert!(store.add_policy("p", "p", strings(&fields)).await);
        }
        let puts = storage.put_count();

        assert!(!store.remove_filtered_policy("p", "p", 0, Vec::new()).await);
        assert_eq!(storage.put_count(), puts);
        assert_eq!(store.fetch_lines().await.expect("lines").len(), 2);
    }

    #[test]
    fn retry_delay_saturates() {
        assert_eq!(retry_delay(Duration::from_millis(50), 3), Duration::from_millis(150));
        assert_eq!(retry_delay(Duration::MAX, 2), Duration::MAX);
        assert_eq!(retry_delay(Duration::ZERO, u32::MAX), Duration::ZERO);
    }

    #[tokio::test]
    async fn filtered_removal_matches_prefix_at_offset() {
        let (_storage, store) = fresh_store().await;
        for fields in [
            ["Shop", "*", "rfid:AttachRfidTagToSpool"],
            ["Shop", "*", "rfid:DetachRfidTagFromSpool"],
            ["Factory", "*", "rfid:AttachRfidTagToSpool"],
        ] {
            assert!(store.add_policy("p", "p", strings(&fields)).await);
        }
        assert!(store.add_policy("g", "g", strings(&["Shop", "Factory"])).await);

        assert!(store.remove_filtered_policy("p", "p", 0, strings(&["Shop"])).await);
        assert_eq!(
            store.fetch_lines().await.expect("lines"),
            vec![
                rule("p", &["Factory", "*", "rfid:AttachRfidTagToSpool"]),
                rule("g", &["Shop", "Factory"]),
            ]
        );

        assert!(
            store
                .remove_filtered_policy("p", "p", 1, strings(&["", "rfid:AttachRfidTagToSpool"]))
                .await
        );
        assert_eq!(
            store.fetch_lines().await.expect("lines"),
            vec![rule("g", &["Shop", "Factory"])]
        );
    }

    #[tokio::test]
    async fn batch_add_and_remove_use_one_write_each() {
        let (storage, store) = fresh_store().await;
        let rules = vec![strings(&["a", "o1", "read"]), strings(&["b", "o2", "write"])];
        assert!(store.add_policies("p", "p", rules.clone()).await);
        assert_eq!(storage.put_count(), 1);
        assert_eq!(store.fetch_lines().await.expect("lines").len(), 2);
        assert!(store.remove_policies("p", "p", rules).await);
        assert_eq!(storage.put_count(), 2);
        assert!(store.fetch_lines().await.expect("lines").is_empty());
    }

    #[tokio::test]
    async fn save_is_idempotent_and_round_trips() {
        let (storage, store) = fresh_store().await;
        let mut model = DefaultModel::from_str(MODEL).await.expect("model");
        model.add_policy("p", "p", strings(&["alice", "data1", "read"]));
        model.add_policy("p", "p", strings(&["say, \"hi\"", "data2", "write"]));
        model.add_policy("g", "g", strings(&["alice", "admin"]));

        assert!(store.save_policy(&model).await);
        let first = raw_blob(&storage).await;
        assert!(store.save_policy(&model).await);
        assert_eq!(raw_blob(&storage).await, first);

        let mut reloaded = DefaultModel::from_str(MODEL).await.expect("model");
        assert_eq!(store.load_policy(&mut reloaded).await.expect("load"), 3);
        assert_eq!(codec::model_lines(&reloaded), codec::model_lines(&model));
    }

    #[tokio::test]
    async fn degraded_writes_return_false() {
        let (storage, store) = fresh_store().await;
        let model = DefaultModel::from_str(MODEL).await.expect("model");

        storage.fail_next_puts(1);
        assert!(!store.save_policy(&model).await);
        storage.fail_next_puts(1);
        assert!(!store.add_policy("p", "p", strings(&["a", "b", "c"])).await);
        storage.fail_next_gets(1);
        assert!(!store.remove_policy("p", "p", strings(&["a", "b", "c"])).await);
        storage.fail_next_puts(1);
        assert!(!store.remove_filtered_policy("p", "p", 0, strings(&["a"])).await);

        assert!(store.fetch_lines().await.expect("lines").is_empty());
    }

    #[tokio::test]
    async fn malformed_object_blocks_mutation_instead_of_dropping_lines() {
        let (storage, store) = fresh_store().await;
        storage
            .put_object(
                BUCKET,
                "policies.csv",
                Bytes::from_static(b"p,alice,data1,read\np,\"unterminated"),
                WriteCondition::Unconditional,
            )
            .await
            .expect("seed");
        assert!(!store.add_policy("p", "p", strings(&["b", "c", "d"])).await);
        assert_eq!(
            raw_blob(&storage).await,
            "p,alice,data1,read\np,\"unterminated"
        );

        // Loading stays lenient.
        let mut model = DefaultModel::from_str(MODEL).await.expect("model");
        assert_eq!(store.load_policy(&mut model).await.expect("load"), 1);
    }

    #[tokio::test]
    async fn filtered_load_marks_store_and_blocks_save() {
        let (_storage, store) = fresh_store().await;
        assert!(store.add_policy("p", "p", strings(&["alice", "data1", "read"])).await);
        assert!(store.add_policy("p", "p", strings(&["bob", "data2", "write"])).await);
        assert!(store.add_policy("g", "g", strings(&["alice", "admin"])).await);

        let mut model = DefaultModel::from_str(MODEL).await.expect("model");
        let filter = PolicyFilter {
            p: strings(&["", "data2"]),
            g: strings(&["carol"]),
        };
        assert_eq!(store.load_filtered_policy(&mut model, &filter).await.expect("load"), 1);
        assert!(store.is_filtered());
        assert_eq!(model.get_policy("p", "p"), vec![strings(&["bob", "data2", "write"])]);
        assert!(model.get_policy("g", "g").is_empty());
        assert!(!store.save_policy(&model).await);

        store.load_policy(&mut model).await.expect("full load");
        assert!(!store.is_filtered());
        assert!(store.save_policy(&model).await);
    }

    #[tokio::test]
    async fn clear_deletes_object() {
        let (storage, store) = fresh_store().await;
        assert!(store.add_policy("p", "p", strings(&["a", "b", "c"])).await);
        assert!(store.clear_policy().await);
        assert!(storage.get_object(BUCKET, "policies.csv").await.is_err());
        assert!(store.clear_policy().await);
    }

    #[tokio::test]
    async fn custom_key_is_used() {
        let storage = Arc::new(InMemoryObjectStorage::with_buckets([BUCKET]));
        let store = ObjectPolicyStore::init(
            storage.clone(),
            StoreSettings::new(BUCKET).with_key("tenants/acme.csv"),
        )
        .await
        .expect("init");
        assert!(store.add_policy("p", "p", strings(&["a", "b", "c"])).await);
        let listing = storage.list_objects(BUCKET, "").await.expect("list");
        assert_eq!(
            listing,
            vec![ObjectSummary {
                key: "tenants/acme.csv".to_string(),
                size: 7,
            }]
        );
    }

    #[tokio::test]
    async fn concurrent_calls_on_one_store_do_not_lose_updates() {
        let (_storage, store) = fresh_store().await;
        let store = Arc::new(store);
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .add_policy("p", "p", vec![format!("user{i}"), "obj".into(), "read".into()])
                    .await
            }));
        }
        for task in tasks {
            assert!(task.await.expect("join"));
        }
        assert_eq!(store.fetch_lines().await.expect("lines").len(), 16);
    }

    /// Lets another writer slip in between the first read and the write that follows it.
    struct RacingStorage {
        inner: InMemoryObjectStorage,
        intrusions: AtomicUsize,
    }

    impl RacingStorage {
        fn new(intrusions: usize) -> Self {
            Self {
                inner: InMemoryObjectStorage::with_buckets([BUCKET]),
                intrusions: AtomicUsize::new(intrusions),
            }
        }
    }

    #[async_trait]
    impl ObjectStorage for RacingStorage {
        async fn head_bucket(&self, bucket: &str) -> StorageResult<()> {
            self.inner.head_bucket(bucket).await
        }

        async fn create_bucket(&self, bucket: &str) -> StorageResult<()> {
            self.inner.create_bucket(bucket).await
        }

        async fn delete_bucket(&self, bucket: &str) -> StorageResult<()> {
            self.inner.delete_bucket(bucket).await
        }

        async fn get_object(&self, bucket: &str, key: &str) -> StorageResult<StoredObject> {
            let object = self.inner.get_object(bucket, key).await;
            if self
                .intrusions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                let mut body = object
                    .as_ref()
                    .map(|o| o.body.to_vec())
                    .unwrap_or_default();
                if !body.is_empty() {
                    body.push(b'\n');
                }
                body.extend_from_slice(b"p,intruder,data,write");
                self.inner
                    .put_object(bucket, key, Bytes::from(body), WriteCondition::Unconditional)
                    .await?;
            }
            object
        }

        async fn put_object(
            &self,
            bucket: &str,
            key: &str,
            body: Bytes,
            condition: WriteCondition,
        ) -> StorageResult<ObjectVersion> {
            self.inner.put_object(bucket, key, body, condition).await
        }

        async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
            self.inner.delete_object(bucket, key).await
        }

        async fn list_objects(
            &self,
            bucket: &str,
            prefix: &str,
        ) -> StorageResult<Vec<ObjectSummary>> {
            self.inner.list_objects(bucket, prefix).await
        }

        fn supports_conditional_writes(&self) -> bool {
            true
        }

        fn backend_name(&self) -> &'static str {
            "racing"
        }
    }

    #[tokio::test]
    async fn last_write_wins_loses_concurrent_edit() {
        let storage = Arc::new(RacingStorage::new(1));
        let store = ObjectPolicyStore::init(storage.clone(), StoreSettings::new(BUCKET))
            .await
            .expect("init");
        assert!(store.add_policy("p", "p", strings(&["alice", "data1", "read"])).await);
        assert_eq!(
            store.fetch_lines().await.expect("lines"),
            vec![rule("p", &["alice", "data1", "read"])]
        );
    }

    #[tokio::test]
    async fn compare_and_swap_retries_and_keeps_both_edits() {
        let storage = Arc::new(RacingStorage::new(1));
        let store = ObjectPolicyStore::init(
            storage.clone(),
            StoreSettings::new(BUCKET).with_consistency(Consistency::CompareAndSwap {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
            }),
        )
        .await
        .expect("init");
        assert!(store.add_policy("p", "p", strings(&["alice", "data1", "read"])).await);
        assert_eq!(
            store.fetch_lines().await.expect("lines"),
            vec![
                rule("p", &["intruder", "data", "write"]),
                rule("p", &["alice", "data1", "read"]),
            ]
        );
    }

    #[tokio::test]
    async fn compare_and_swap_gives_up_after_max_attempts() {
        let storage = Arc::new(RacingStorage::new(usize::MAX));
        let store = ObjectPolicyStore::init(
            storage.clone(),
            StoreSettings::new(BUCKET).with_consistency(Consistency::CompareAndSwap {
                max_attempts: 2,
                backoff: Duration::ZERO,
            }),
        )
        .await
        .expect("init");
        assert!(!store.add_policy("p", "p", strings(&["alice", "data1", "read"])).await);
    }
}
