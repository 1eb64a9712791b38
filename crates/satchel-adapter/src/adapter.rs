//! casbin [`Adapter`] implementation for [`ObjectPolicyStore`].
//!
//! Mutations map their `bool` straight through: when the store answers
//! `false`, casbin leaves its in-memory model untouched, so memory and the
//! persisted object stay in step. `save_policy` has no boolean channel in
//! casbin, so a failed save is reported as an [`AdapterError`] here.
use crate::errors::PolicyStoreError;
use crate::store::{ObjectPolicyStore, PolicyFilter};
use async_trait::async_trait;
use casbin::error::AdapterError;
use casbin::{Adapter, Filter, Model, Result};

fn adapter_error(err: PolicyStoreError) -> casbin::Error {
    casbin::Error::from(AdapterError(Box::new(err)))
}

#[async_trait]
impl Adapter for ObjectPolicyStore {
    async fn load_policy(&mut self, m: &mut dyn Model) -> Result<()> {
        ObjectPolicyStore::load_policy(self, m)
            .await
            .map(|_| ())
            .map_err(adapter_error)
    }

    async fn load_filtered_policy<'a>(&mut self, m: &mut dyn Model, f: Filter<'a>) -> Result<()> {
        let filter = PolicyFilter::from(f);
        ObjectPolicyStore::load_filtered_policy(self, m, &filter)
            .await
            .map(|_| ())
            .map_err(adapter_error)
    }

    async fn save_policy(&mut self, m: &mut dyn Model) -> Result<()> {
        if ObjectPolicyStore::save_policy(self, m).await {
            Ok(())
        } else {
            Err(adapter_error(PolicyStoreError::NotPersisted { op: "save_policy" }))
        }
    }

    async fn clear_policy(&mut self) -> Result<()> {
        if ObjectPolicyStore::clear_policy(self).await {
            Ok(())
        } else {
            Err(adapter_error(PolicyStoreError::NotPersisted { op: "clear_policy" }))
        }
    }

    fn is_filtered(&self) -> bool {
        ObjectPolicyStore::is_filtered(self)
    }

    async fn add_policy(&mut self, sec: &str, ptype: &str, rule: Vec<String>) -> Result<bool> {
        Ok(ObjectPolicyStore::add_policy(self, sec, ptype, rule).await)
    }

    async fn add_policies(
        &mut self,
        sec: &str,
        ptype: &str,
        rules: Vec<Vec<String>>,
    ) -> Result<bool> {
        Ok(ObjectPolicyStore::add_policies(self, sec, ptype, rules).await)
    }

    async fn remove_policy(&mut self, sec: &str, ptype: &str, rule: Vec<String>) -> Result<bool> {
        Ok(ObjectPolicyStore::remove_policy(self, sec, ptype, rule).await)
    }

    async fn remove_policies(
        &mut self,
        sec: &str,
        ptype: &str,
        rules: Vec<Vec<String>>,
    ) -> Result<bool> {
        Ok(ObjectPolicyStore::remove_policies(self, sec, ptype, rules).await)
    }

    async fn remove_filtered_policy(
        &mut self,
        sec: &str,
        ptype: &str,
        field_index: usize,
        field_values: Vec<String>,
    ) -> Result<bool> {
        Ok(
            ObjectPolicyStore::remove_filtered_policy(self, sec, ptype, field_index, field_values)
                .await,
        )
    }
}
