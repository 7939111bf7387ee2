//! Namespace provisioning
//!
//! The system namespace always exists. The CNI and CI-pipelines namespaces
//! are only provisioned when they are dedicated, i.e. named differently from
//! the system namespace; otherwise they share it and nothing is written.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::apply::ResourceApplier;
use crate::config::{Configuration, NodeLabel};
use crate::manifest::placement::place_namespace;
use crate::manifest::secrets::pull_secret;
use crate::manifest::StandardLabels;
use crate::{Result, PULL_SECRET_NAME};

/// The three configured namespaces
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NamespaceRole {
    /// Operator and stack namespace
    System,
    /// CNI namespace
    Cni,
    /// CI pipelines namespace
    CiPipelines,
}

impl NamespaceRole {
    /// Namespace name for this role
    pub fn name(self, config: &Configuration) -> &str {
        match self {
            NamespaceRole::System => config.kubernetes.system_namespace(),
            NamespaceRole::Cni => config.kubernetes.cni_namespace(),
            NamespaceRole::CiPipelines => config.kubernetes.ci_pipelines_namespace(),
        }
    }

    /// Node label the namespace's pods are placed on
    pub fn node_label(self, config: &Configuration) -> &NodeLabel {
        match self {
            NamespaceRole::System | NamespaceRole::Cni => &config.kubernetes.system_node_label,
            NamespaceRole::CiPipelines => &config.kubernetes.application_node_label,
        }
    }

    fn component(self) -> &'static str {
        match self {
            NamespaceRole::System => "system",
            NamespaceRole::Cni => "cni",
            NamespaceRole::CiPipelines => "ci-pipelines",
        }
    }
}

impl std::fmt::Display for NamespaceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.component())
    }
}

/// Provisions namespaces and their image pull secrets
#[derive(Clone)]
pub struct NamespaceProvisioner {
    applier: ResourceApplier,
    config: Arc<Configuration>,
}

impl NamespaceProvisioner {
    /// Create a provisioner
    pub fn new(applier: ResourceApplier, config: Arc<Configuration>) -> Self {
        Self { applier, config }
    }

    /// Whether `role` needs its own namespace
    pub fn is_provisioned(&self, role: NamespaceRole) -> bool {
        role == NamespaceRole::System
            || self
                .config
                .kubernetes
                .is_dedicated(role.name(&self.config))
    }

    /// Namespace and pull secret manifests for `role`; empty when shared
    pub fn manifests(&self, role: NamespaceRole) -> Result<Vec<Value>> {
        if !self.is_provisioned(role) {
            return Ok(Vec::new());
        }
        let name = role.name(&self.config);

        let mut namespace = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": name}
        });
        StandardLabels::new(role.component())
            .with_instance(&self.config.environment)
            .apply(&mut namespace)?;
        place_namespace(
            &mut namespace,
            self.config.kubernetes.pod_placement_mode,
            role.node_label(&self.config),
        )?;

        let secret = pull_secret(name, PULL_SECRET_NAME, &self.config.container_registry);
        Ok(vec![namespace, secret])
    }

    /// Provision the namespace for `role`.
    ///
    /// Returns false when the namespace is shared with the system namespace
    /// and nothing was written.
    pub async fn provision(&self, role: NamespaceRole) -> Result<bool> {
        let name = role.name(&self.config);
        if !self.is_provisioned(role) {
            debug!(role = %role, namespace = %name, "shares the system namespace, skipping");
            return Ok(false);
        }

        self.applier.write_all(self.manifests(role)?).await?;
        info!(role = %role, namespace = %name, "namespace provisioned");
        Ok(true)
    }
}
