//! Idempotent writes of manifests to the cluster
//!
//! The [`ResourceApplier`] resolves each manifest's kind through the
//! [`KindRegistry`] and writes it with the strategy registered for that
//! kind. Server-side apply covers everything the API lets us own
//! declaratively; Secrets and PersistentVolumeClaims go through an explicit
//! read followed by create or replace.
//!
//! Writes are never retried here. Every write is keyed by resource
//! identity, so re-running the whole installation is the recovery path.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::kinds::{ApplyStrategy, KindRegistry};
use crate::kube_api::{ClusterApi, ResourceId};
use crate::retry::{Fallback, RetryPolicy};
use crate::tree;
use crate::{Error, Result, FIELD_MANAGER};

const STORAGE_PATH: &str = "spec.resources.requests.storage";

/// What a write did to the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Submitted via server-side apply
    Applied,
    /// Object did not exist and was created
    Created,
    /// Object existed and was replaced
    Replaced,
    /// Object existed and a merge patch was sent
    Patched,
    /// Object existed and no write was needed or possible
    Unchanged,
}

/// Writes manifests using the strategy registered for their kind
#[derive(Clone)]
pub struct ResourceApplier {
    api: Arc<dyn ClusterApi>,
    registry: Arc<KindRegistry>,
    field_manager: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl ResourceApplier {
    /// Create an applier using the default field manager and retry policy
    pub fn new(
        api: Arc<dyn ClusterApi>,
        registry: Arc<KindRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            registry,
            field_manager: FIELD_MANAGER.to_string(),
            retry: RetryPolicy::default(),
            cancel,
        }
    }

    /// Use a different field manager for server-side apply
    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    /// Use a different retry policy for the probing reads
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The cluster handle this applier writes through
    pub fn api(&self) -> &Arc<dyn ClusterApi> {
        &self.api
    }

    /// Retry policy used for reads
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// The token cancelling this run
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Write one manifest with its kind's strategy
    pub async fn write(&self, mut manifest: Value) -> Result<Outcome> {
        let spec = self.registry.prepare(&mut manifest)?;
        match spec.strategy {
            ApplyStrategy::Apply => self.apply(&manifest).await,
            ApplyStrategy::CreateOrReplace => self.create_or_replace(manifest).await,
        }
    }

    /// Write manifests one after another, stopping at the first failure
    pub async fn write_all(&self, manifests: Vec<Value>) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            outcomes.push(self.write(manifest).await?);
        }
        Ok(outcomes)
    }

    async fn apply(&self, manifest: &Value) -> Result<Outcome> {
        let id = ResourceId::of(manifest)?;
        self.api.apply(manifest, &self.field_manager).await?;
        debug!(resource = %id, "applied");
        Ok(Outcome::Applied)
    }

    /// Create the object when absent, otherwise replace it in place.
    ///
    /// PersistentVolumeClaims are never replaced: only a storage increase
    /// is patched, and every other difference is logged and left alone.
    pub async fn create_or_replace(&self, mut manifest: Value) -> Result<Outcome> {
        let id = ResourceId::of(&manifest)?;

        let existing = match self.read_existing(&id).await? {
            Some(existing) => existing,
            None => {
                self.api.create(&manifest).await?;
                debug!(resource = %id, "created");
                return Ok(Outcome::Created);
            }
        };

        if id.kind == "PersistentVolumeClaim" {
            return self.reconcile_pvc(&id, &manifest, &existing).await;
        }

        for field in ["resourceVersion", "uid"] {
            if let Some(value) = existing.pointer(&format!("/metadata/{}", field)) {
                tree::set(&mut manifest, &format!("metadata.{}", field), value.clone())?;
            }
        }
        self.api.replace(&manifest).await?;
        debug!(resource = %id, "replaced");
        Ok(Outcome::Replaced)
    }

    /// Read the current object; NotFound yields `None` without a retry
    async fn read_existing(&self, id: &ResourceId) -> Result<Option<Value>> {
        let api = self.api.clone();
        self.retry
            .run(
                &format!("failed to read {}", id),
                &self.cancel,
                Fallback::from_error(|e| if e.is_not_found() { Ok(None) } else { Err(e) }),
                || {
                    let api = api.clone();
                    let id = id.clone();
                    async move { api.get(&id).await.map(|v| Ok::<_, Error>(Some(v))) }
                },
            )
            .await?
    }

    async fn reconcile_pvc(
        &self,
        id: &ResourceId,
        desired: &Value,
        existing: &Value,
    ) -> Result<Outcome> {
        for path in ["spec.accessModes", "spec.storageClassName", "spec.volumeMode"] {
            if let Some(want) = tree::get(desired, path) {
                if let Some(have) = tree::get(existing, path).filter(|have| *have != want) {
                    warn!(
                        resource = %id,
                        field = path,
                        desired = %want,
                        current = %have,
                        "immutable PVC field differs, leaving it unchanged"
                    );
                }
            }
        }

        let want = tree::get_required_str(desired, STORAGE_PATH)?;
        let have = tree::get(existing, STORAGE_PATH).and_then(Value::as_str);

        let (want_bytes, have_bytes) = match (parse_quantity(want), have.and_then(parse_quantity)) {
            (Some(w), Some(h)) => (w, h),
            _ => {
                if have == Some(want) {
                    return Ok(Outcome::Unchanged);
                }
                warn!(
                    resource = %id,
                    desired = want,
                    current = have.unwrap_or("<unset>"),
                    "cannot compare PVC storage sizes, leaving it unchanged"
                );
                return Ok(Outcome::Unchanged);
            }
        };

        if want_bytes == have_bytes {
            debug!(resource = %id, storage = want, "PVC unchanged");
            return Ok(Outcome::Unchanged);
        }

        if want_bytes < have_bytes {
            warn!(
                resource = %id,
                desired = want,
                current = have.unwrap_or_default(),
                "PVC storage cannot shrink, leaving it unchanged"
            );
            return Ok(Outcome::Unchanged);
        }

        let patch = json!({"spec": {"resources": {"requests": {"storage": want}}}});
        self.api.patch_merge(id, &patch).await?;
        debug!(
            resource = %id,
            from = have.unwrap_or_default(),
            to = want,
            "PVC storage expanded"
        );
        Ok(Outcome::Patched)
    }
}

/// Parse a Kubernetes quantity into bytes
///
/// Handles plain numbers, binary suffixes (Ki..Ei), decimal suffixes
/// (k..E) and exponent notation. Returns `None` for anything else.
pub fn parse_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return None;
    }

    const SUFFIXES: [(&str, f64); 13] = [
        ("Ki", 1024.0),
        ("Mi", 1048576.0),
        ("Gi", 1073741824.0),
        ("Ti", 1099511627776.0),
        ("Pi", 1125899906842624.0),
        ("Ei", 1152921504606846976.0),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    for (suffix, factor) in SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    quantity.parse::<f64>().ok()
}
