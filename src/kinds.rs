//! Registry of the resource kinds the installer knows how to write
//!
//! Each kind resolves once to its scope, its write strategy and a prepare
//! step that normalises the manifest before it is sent. A manifest whose
//! kind is not registered is rejected before any cluster call is made.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::tree;
use crate::{Error, Result};

/// Whether a kind lives in a namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Cluster-scoped; any `metadata.namespace` is dropped
    Cluster,
    /// Namespaced; `metadata.namespace` is required
    Namespaced,
}

/// How a manifest of a kind is written
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyStrategy {
    /// Server-side apply with the installer's field manager
    Apply,
    /// Read, then create when absent or replace when present
    CreateOrReplace,
}

/// Kind-specific normalisation run before a write
pub type Prepare = fn(&mut Value) -> Result<()>;

/// How one kind is handled
#[derive(Clone, Copy)]
pub struct KindSpec {
    /// Resource scope
    pub scope: Scope,
    /// Write strategy
    pub strategy: ApplyStrategy,
    /// Normalisation step
    pub prepare: Prepare,
}

impl std::fmt::Debug for KindSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindSpec")
            .field("scope", &self.scope)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

/// Kind to handling map, built once per run
#[derive(Debug, Clone)]
pub struct KindRegistry {
    kinds: HashMap<&'static str, KindSpec>,
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl KindRegistry {
    /// Registry with every kind the installer writes
    pub fn standard() -> Self {
        use ApplyStrategy::*;
        use Scope::*;

        let entries: [(&'static str, Scope, ApplyStrategy, Prepare); 12] = [
            ("Namespace", Cluster, Apply, noop),
            ("CustomResourceDefinition", Cluster, Apply, prepare_crd),
            ("ClusterRole", Cluster, Apply, noop),
            ("ClusterRoleBinding", Cluster, Apply, prepare_binding),
            ("ServiceAccount", Namespaced, Apply, noop),
            ("Role", Namespaced, Apply, noop),
            ("RoleBinding", Namespaced, Apply, prepare_binding),
            ("Deployment", Namespaced, Apply, prepare_deployment),
            ("Service", Namespaced, Apply, prepare_service),
            ("Secret", Namespaced, CreateOrReplace, prepare_secret),
            ("PersistentVolumeClaim", Namespaced, CreateOrReplace, prepare_pvc),
            ("Stack", Namespaced, Apply, prepare_stack),
        ];

        let kinds = entries
            .into_iter()
            .map(|(kind, scope, strategy, prepare)| {
                (
                    kind,
                    KindSpec {
                        scope,
                        strategy,
                        prepare,
                    },
                )
            })
            .collect();
        Self { kinds }
    }

    /// Look up a kind, failing for anything unregistered
    pub fn resolve(&self, kind: &str) -> Result<&KindSpec> {
        self.kinds
            .get(kind)
            .ok_or_else(|| Error::unsupported_kind(kind))
    }

    /// Resolve the manifest's kind and run its scope and prepare steps
    pub fn prepare(&self, manifest: &mut Value) -> Result<KindSpec> {
        let kind = tree::get_required_str(manifest, "kind")?.to_string();
        let spec = *self.resolve(&kind)?;
        tree::get_required_str(manifest, "apiVersion")?;
        tree::get_required_str(manifest, "metadata.name")?;

        match spec.scope {
            Scope::Cluster => {
                if let Some(meta) = manifest.get_mut("metadata").and_then(Value::as_object_mut) {
                    meta.remove("namespace");
                }
            }
            Scope::Namespaced => {
                tree::get_required_str(manifest, "metadata.namespace")?;
            }
        }

        (spec.prepare)(manifest)?;
        Ok(spec)
    }
}

fn noop(_: &mut Value) -> Result<()> {
    Ok(())
}

fn prepare_crd(manifest: &mut Value) -> Result<()> {
    tree::get_required_str(manifest, "spec.group")?;
    tree::get_required_str(manifest, "spec.names.plural")?;
    Ok(())
}

fn prepare_binding(manifest: &mut Value) -> Result<()> {
    tree::get_required_str(manifest, "roleRef.name")?;
    tree::get_required_str(manifest, "roleRef.kind")?;
    Ok(())
}

fn prepare_deployment(manifest: &mut Value) -> Result<()> {
    tree::get_required(manifest, "spec.selector")?;
    tree::get_required(manifest, "spec.template.spec.containers[0]")?;
    Ok(())
}

fn prepare_service(manifest: &mut Value) -> Result<()> {
    tree::get_required(manifest, "spec.ports")?;
    Ok(())
}

fn prepare_secret(manifest: &mut Value) -> Result<()> {
    if tree::get(manifest, "type").is_none() {
        tree::set(manifest, "type", json!("Opaque"))?;
    }
    Ok(())
}

fn prepare_pvc(manifest: &mut Value) -> Result<()> {
    tree::get_required_str(manifest, "spec.resources.requests.storage")?;
    if tree::get(manifest, "spec.accessModes").is_none() {
        tree::set(manifest, "spec.accessModes", json!(["ReadWriteOnce"]))?;
    }
    Ok(())
}

fn prepare_stack(manifest: &mut Value) -> Result<()> {
    tree::get_required_str(manifest, "spec.stack")?;
    tree::get_required_str(manifest, "spec.serviceAccountName")?;
    Ok(())
}
