//! Managed stack provisioning
//!
//! The stack is the Pulumi `Stack` custom resource the operator reconciles,
//! together with what it references: a ServiceAccount with RBAC across the
//! target namespaces, the configuration Secret and, without S3, a
//! PersistentVolumeClaim for local state.
//!
//! RBAC, Secret and PVC are independent of each other. The Stack itself
//! must be written last since it names both the Secret keys and the
//! ServiceAccount.

pub mod manifest;
pub mod rbac;
pub mod secret;

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::apply::ResourceApplier;
use crate::config::Configuration;
use crate::kube_api::ResourceId;
use crate::retry::Fallback;
use crate::tree;
use crate::{Result, STACK_NAME};

pub use manifest::{stack_resource, state_pvc, STACK_API_VERSION};
pub use rbac::rbac_manifests;
pub use secret::{config_entries, config_secret};

/// Reported when the stack's last update state cannot be read
pub const UNKNOWN_STATE: &str = "unknown";

/// Applies the stack and everything it references
#[derive(Clone)]
pub struct StackProvisioner {
    applier: ResourceApplier,
    config: Arc<Configuration>,
}

impl StackProvisioner {
    /// Create a provisioner
    pub fn new(applier: ResourceApplier, config: Arc<Configuration>) -> Self {
        Self { applier, config }
    }

    /// Namespaces the stack workspace administers
    pub fn target_namespaces(&self) -> Vec<String> {
        self.config.kubernetes.distinct_namespaces()
    }

    /// Every manifest this provisioner writes, in write order
    pub fn manifests(&self) -> Result<Vec<Value>> {
        let mut out = rbac_manifests(&self.config, &self.target_namespaces())?;
        out.push(config_secret(&self.config)?);
        out.extend(state_pvc(&self.config)?);
        out.push(stack_resource(&self.config)?);
        Ok(out)
    }

    /// Apply the ServiceAccount, bindings and per-namespace roles
    pub async fn apply_rbac(&self) -> Result<()> {
        let targets = self.target_namespaces();
        let manifests = rbac_manifests(&self.config, &targets)?;
        self.applier.write_all(manifests).await?;
        info!(namespaces = ?targets, "stack RBAC applied");
        Ok(())
    }

    /// Write the configuration Secret
    pub async fn apply_secret(&self) -> Result<()> {
        let outcome = self.applier.write(config_secret(&self.config)?).await?;
        info!(outcome = ?outcome, "stack configuration secret written");
        Ok(())
    }

    /// Write the state PVC; returns false when S3 holds state
    pub async fn apply_state_pvc(&self) -> Result<bool> {
        let Some(pvc) = state_pvc(&self.config)? else {
            debug!("S3 backend configured, no state volume");
            return Ok(false);
        };
        let outcome = self.applier.write(pvc).await?;
        info!(outcome = ?outcome, "stack state volume written");
        Ok(true)
    }

    /// Apply the Stack custom resource
    pub async fn apply_stack(&self) -> Result<()> {
        self.applier.write(stack_resource(&self.config)?).await?;
        info!(
            namespace = %self.config.kubernetes.system_namespace(),
            stack = %self.config.environment,
            "stack applied"
        );
        Ok(())
    }

    /// `status.lastUpdate.state` of the Stack, or [`UNKNOWN_STATE`]
    pub async fn last_update_state(&self) -> Result<String> {
        let id = ResourceId::namespaced(
            STACK_API_VERSION,
            "Stack",
            self.config.kubernetes.system_namespace(),
            STACK_NAME,
        );
        let api = self.applier.api().clone();
        self.applier
            .retry()
            .run(
                "read stack status",
                self.applier.cancel_token(),
                Fallback::value(UNKNOWN_STATE.to_string()),
                || {
                    let api = api.clone();
                    let id = id.clone();
                    async move {
                        let stack = api.get(&id).await?;
                        Ok(tree::get(&stack, "status.lastUpdate.state")
                            .and_then(Value::as_str)
                            .unwrap_or(UNKNOWN_STATE)
                            .to_string())
                    }
                },
            )
            .await
    }
}
