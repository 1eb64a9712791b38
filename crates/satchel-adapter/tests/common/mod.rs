#![allow(dead_code)]

use casbin::{CoreApi, DefaultModel, Enforcer};
use satchel_adapter::{ObjectPolicyStore, PolicyLine, StoreSettings};
use satchel_storage::ObjectStorage;
use std::sync::Arc;

pub const BUCKET: &str = "casbin.example.net";

pub const MODEL: &str = r#"
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

pub fn strings(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

pub fn rule(ptype: &str, fields: &[&str]) -> PolicyLine {
    PolicyLine::new(ptype, fields.iter().copied())
}

pub async fn open_store(storage: Arc<dyn ObjectStorage>) -> ObjectPolicyStore {
    ObjectPolicyStore::init(storage, StoreSettings::new(BUCKET))
        .await
        .expect("init store")
}

pub async fn enforcer_on(storage: Arc<dyn ObjectStorage>) -> Enforcer {
    let model = DefaultModel::from_str(MODEL).await.expect("model");
    Enforcer::new(model, open_store(storage).await)
        .await
        .expect("enforcer")
}

/// Fresh read of the persisted rules through an independent store.
pub async fn persisted(storage: Arc<dyn ObjectStorage>) -> Vec<PolicyLine> {
    open_store(storage)
        .await
        .fetch_lines()
        .await
        .expect("fetch lines")
}

pub fn allowed(enforcer: &Enforcer, sub: &str, obj: &str, act: &str) -> bool {
    enforcer.enforce((sub, obj, act)).expect("enforce")
}
