//! In-memory cluster used by multi-step tests
//!
//! `FakeCluster` stores objects by identity and records every call so tests
//! can assert on what was written and in which order. Deployments report
//! every desired replica ready unless told otherwise.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::apply::ResourceApplier;
use crate::error::api_error;
use crate::kinds::KindRegistry;
use crate::kube_api::{ClusterApi, ResourceId};
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Cluster operation recorded by the fake
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verb {
    Apply,
    Get,
    List,
    Create,
    Replace,
    Patch,
    ReadDeployment,
}

/// One recorded call
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Call {
    pub verb: Verb,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl Call {
    /// `namespace/name`, or `name` for cluster-scoped objects
    pub fn target(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

type Key = (String, Option<String>, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    calls: Vec<Call>,
    version: u64,
    deployments_never_ready: bool,
    failures: Vec<(Verb, String)>,
}

/// Recording in-memory [`ClusterApi`]
#[derive(Clone, Default)]
pub(crate) struct FakeCluster {
    state: Arc<Mutex<State>>,
}

fn key_of(id: &ResourceId) -> Key {
    (id.kind.clone(), id.namespace.clone(), id.name.clone())
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applier writing into this fake with a fast retry policy
    pub fn applier(&self) -> ResourceApplier {
        self.applier_with(CancellationToken::new())
    }

    pub fn applier_with(&self, cancel: CancellationToken) -> ResourceApplier {
        ResourceApplier::new(
            Arc::new(self.clone()),
            Arc::new(KindRegistry::standard()),
            cancel,
        )
        .with_retry(RetryPolicy::new(2, Duration::from_millis(1)))
    }

    /// Seed an object as if it already existed
    pub fn insert(&self, mut manifest: Value) {
        let id = ResourceId::of(&manifest).unwrap();
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        manifest["metadata"]["resourceVersion"] = json!(state.version.to_string());
        manifest["metadata"]["uid"] = json!(format!("uid-{}", id.name));
        state.objects.insert(key_of(&id), manifest);
    }

    /// Make Deployments report zero ready replicas
    pub fn never_ready(&self) {
        self.state.lock().unwrap().deployments_never_ready = true;
    }

    /// Fail every `verb` call on `kind` with a 500
    pub fn fail(&self, verb: Verb, kind: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((verb, kind.to_string()));
    }

    /// Drop every injected failure
    pub fn heal(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn targets(&self, verb: Verb, kind: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.verb == verb && c.kind == kind)
            .map(|c| c.target())
            .collect()
    }

    pub fn applies_of(&self, kind: &str) -> Vec<String> {
        self.targets(Verb::Apply, kind)
    }

    pub fn creates_of(&self, kind: &str) -> Vec<String> {
        self.targets(Verb::Create, kind)
    }

    pub fn replaces_of(&self, kind: &str) -> Vec<String> {
        self.targets(Verb::Replace, kind)
    }

    pub fn patches_of(&self, kind: &str) -> Vec<String> {
        self.targets(Verb::Patch, kind)
    }

    /// Writes of any kind (apply, create, replace, patch), in call order
    pub fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c.verb,
                    Verb::Apply | Verb::Create | Verb::Replace | Verb::Patch
                )
            })
            .collect()
    }

    /// Index of the first write touching `kind/name`
    pub fn write_index(&self, kind: &str, name: &str) -> Option<usize> {
        self.writes()
            .iter()
            .position(|c| c.kind == kind && c.name == name)
    }

    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Value> {
        let key = (
            kind.to_string(),
            namespace.map(str::to_string),
            name.to_string(),
        );
        self.state.lock().unwrap().objects.get(&key).cloned()
    }

    pub fn objects_of(&self, kind: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|((k, _, _), _)| k == kind)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn record(&self, verb: Verb, id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            verb,
            kind: id.kind.clone(),
            namespace: id.namespace.clone(),
            name: id.name.clone(),
        });
        if state
            .failures
            .iter()
            .any(|(v, k)| *v == verb && *k == id.kind)
        {
            return Err(api_error(500, "InternalError"));
        }
        Ok(())
    }

    fn store(&self, id: &ResourceId, mut manifest: Value) -> Value {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        manifest["metadata"]["resourceVersion"] = json!(state.version.to_string());
        if manifest["metadata"].get("uid").is_none() {
            manifest["metadata"]["uid"] = json!(format!("uid-{}", id.name));
        }
        state.objects.insert(key_of(id), manifest.clone());
        manifest
    }
}

fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = json!({});
            }
            if let Value::Object(map) = target {
                for (k, v) in fields {
                    if v.is_null() {
                        map.remove(k);
                    } else {
                        merge_patch(map.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn labels_match(object: &Value, selector: &str) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|term| {
        let (k, v) = term.split_once('=').unwrap_or((term, ""));
        object["metadata"]["labels"][k].as_str() == Some(v)
    })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn apply(&self, manifest: &Value, _field_manager: &str) -> Result<()> {
        let id = ResourceId::of(manifest)?;
        self.record(Verb::Apply, &id)?;
        let merged = match self.object(&id.kind, id.namespace.as_deref(), &id.name) {
            Some(mut existing) => {
                merge_patch(&mut existing, manifest);
                existing
            }
            None => manifest.clone(),
        };
        self.store(&id, merged);
        Ok(())
    }

    async fn get(&self, id: &ResourceId) -> Result<Value> {
        self.record(Verb::Get, id)?;
        self.object(&id.kind, id.namespace.as_deref(), &id.name)
            .ok_or_else(|| api_error(404, "NotFound"))
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<String>,
        label_selector: Option<String>,
    ) -> Result<Vec<Value>> {
        let id = ResourceId {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.clone(),
            name: String::new(),
        };
        self.record(Verb::List, &id)?;
        Ok(self
            .objects_of(kind)
            .into_iter()
            .filter(|o| {
                namespace.is_none()
                    || o["metadata"]["namespace"].as_str() == namespace.as_deref()
            })
            .filter(|o| {
                label_selector
                    .as_deref()
                    .map_or(true, |selector| labels_match(o, selector))
            })
            .collect())
    }

    async fn create(&self, manifest: &Value) -> Result<Value> {
        let id = ResourceId::of(manifest)?;
        self.record(Verb::Create, &id)?;
        if self
            .object(&id.kind, id.namespace.as_deref(), &id.name)
            .is_some()
        {
            return Err(api_error(409, "AlreadyExists"));
        }
        Ok(self.store(&id, manifest.clone()))
    }

    async fn replace(&self, manifest: &Value) -> Result<Value> {
        let id = ResourceId::of(manifest)?;
        self.record(Verb::Replace, &id)?;
        let existing = self
            .object(&id.kind, id.namespace.as_deref(), &id.name)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        if existing["metadata"]["resourceVersion"] != manifest["metadata"]["resourceVersion"] {
            return Err(api_error(409, "Conflict"));
        }
        Ok(self.store(&id, manifest.clone()))
    }

    async fn patch_merge(&self, id: &ResourceId, patch: &Value) -> Result<()> {
        self.record(Verb::Patch, id)?;
        let mut existing = self
            .object(&id.kind, id.namespace.as_deref(), &id.name)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        merge_patch(&mut existing, patch);
        self.store(id, existing);
        Ok(())
    }

    async fn read_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let id = ResourceId::namespaced("apps/v1", "Deployment", namespace, name);
        self.record(Verb::ReadDeployment, &id)?;
        let mut object = self
            .object("Deployment", Some(namespace), name)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        let ready = if self.state.lock().unwrap().deployments_never_ready {
            0
        } else {
            object["spec"]["replicas"].as_i64().unwrap_or(1)
        };
        object["status"] = json!({"replicas": ready, "readyReplicas": ready});
        serde_json::from_value(object).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_patch_follows_json_merge_semantics() {
        let mut target = json!({"a": {"b": 1, "c": 2}, "d": [1]});
        merge_patch(&mut target, &json!({"a": {"b": 3, "c": null}, "d": [2]}));
        assert_eq!(target, json!({"a": {"b": 3}, "d": [2]}));
    }

    #[tokio::test]
    async fn replace_requires_current_resource_version() {
        let cluster = FakeCluster::new();
        cluster.insert(json!({
            "apiVersion": "v1", "kind": "Secret",
            "metadata": {"name": "s", "namespace": "n"}
        }));
        let stale = json!({
            "apiVersion": "v1", "kind": "Secret",
            "metadata": {"name": "s", "namespace": "n", "resourceVersion": "0"}
        });
        let err = cluster.replace(&stale).await.unwrap_err();
        assert!(err.to_string().contains("Conflict"));
    }
}
