//! Pulumi Kubernetes Operator installation
//!
//! Installs the operator from the packaged templates: CRDs (cluster-scoped,
//! optional), RBAC and the controller Deployment/Service in the system
//! namespace. Template-local names are prefixed so several installations
//! of the upstream operator can coexist in one cluster.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use crate::apply::ResourceApplier;
use crate::config::Configuration;
use crate::manifest::image::{resolve_image, with_tag};
use crate::manifest::naming::prefixed;
use crate::manifest::placement::place_pod;
use crate::manifest::pod::{
    container_mut, ensure_env, ensure_pull_secret, inject_custom_ca, inject_proxy,
    inject_service_account_token, set_run_as,
};
use crate::manifest::templates::{
    OPERATOR_CRDS, OPERATOR_DEPLOYMENT, OPERATOR_RBAC, OPERATOR_SERVICE,
};
use crate::manifest::{StandardLabels, TemplateSet};
use crate::readiness::ReadinessWaiter;
use crate::tree;
use crate::{Error, Result, CA_SECRET_KEY, CA_SECRET_NAME, PULL_SECRET_NAME};

/// Component label of operator resources
const COMPONENT: &str = "pulumi-kubernetes-operator";

/// Container running the controller
const MANAGER_CONTAINER: &str = "manager";

const POD_SPEC: &str = "spec.template.spec";

/// Installs and checks the operator
#[derive(Clone)]
pub struct OperatorProvisioner {
    applier: ResourceApplier,
    config: Arc<Configuration>,
    templates: TemplateSet,
    waiter: ReadinessWaiter,
}

impl OperatorProvisioner {
    /// Create a provisioner
    pub fn new(
        applier: ResourceApplier,
        config: Arc<Configuration>,
        templates: TemplateSet,
        waiter: ReadinessWaiter,
    ) -> Self {
        Self {
            applier,
            config,
            templates,
            waiter,
        }
    }

    fn namespace(&self) -> &str {
        self.config.kubernetes.system_namespace()
    }

    fn labels(&self) -> StandardLabels {
        StandardLabels::new(COMPONENT)
            .with_version(&self.config.pulumi.operator_version)
            .with_instance(&self.config.environment)
    }

    /// CRD manifests; empty when CRD installation is disabled
    pub fn crd_manifests(&self) -> Result<Vec<Value>> {
        if !self.config.pulumi.install_crds {
            return Ok(Vec::new());
        }
        let labels = self.labels();
        let mut crds = self.templates.load(OPERATOR_CRDS)?;
        for crd in &mut crds {
            labels.apply(crd)?;
        }
        Ok(crds)
    }

    /// Apply the operator CRDs
    pub async fn apply_crds(&self) -> Result<()> {
        let crds = self.crd_manifests()?;
        if crds.is_empty() {
            info!("CRD installation disabled, skipping");
            return Ok(());
        }
        let count = crds.len();
        self.applier.write_all(crds).await?;
        info!(count, "operator CRDs applied");
        Ok(())
    }

    /// RBAC manifests with prefixed names, subjects and role references
    pub fn rbac_manifests(&self) -> Result<Vec<Value>> {
        let namespace = self.namespace();
        let labels = self.labels();
        let mut docs = self.templates.load(OPERATOR_RBAC)?;

        for doc in &mut docs {
            let kind = tree::get_required_str(doc, "kind")?.to_string();
            let name = prefixed(tree::get_required_str(doc, "metadata.name")?);
            tree::set(doc, "metadata.name", json!(name))?;
            labels.apply(doc)?;

            if matches!(kind.as_str(), "ServiceAccount" | "Role" | "RoleBinding") {
                tree::set(doc, "metadata.namespace", json!(namespace))?;
            }

            if matches!(kind.as_str(), "RoleBinding" | "ClusterRoleBinding") {
                let role = prefixed(tree::get_required_str(doc, "roleRef.name")?);
                tree::set(doc, "roleRef.name", json!(role))?;

                if let Some(subjects) = doc.get_mut("subjects").and_then(Value::as_array_mut) {
                    for subject in subjects {
                        if subject["kind"] != "ServiceAccount" {
                            continue;
                        }
                        let sa = prefixed(tree::get_required_str(subject, "name")?);
                        tree::set(subject, "name", json!(sa))?;
                        tree::set(subject, "namespace", json!(namespace))?;
                    }
                }
            }
        }
        Ok(docs)
    }

    /// Apply the operator RBAC
    pub async fn apply_rbac(&self) -> Result<()> {
        let docs = self.rbac_manifests()?;
        let count = docs.len();
        self.applier.write_all(docs).await?;
        info!(namespace = %self.namespace(), count, "operator RBAC applied");
        Ok(())
    }

    /// Operator image: the template image re-tagged to the configured
    /// version and resolved against the private registry
    pub fn operator_image(&self) -> Result<String> {
        let deployment = self.templates.load_one(OPERATOR_DEPLOYMENT)?;
        let image = tree::get_required_str(&deployment, "spec.template.spec.containers[0].image")?;
        Ok(self.resolve_operator_image(image))
    }

    fn resolve_operator_image(&self, template_image: &str) -> String {
        let tagged = with_tag(template_image, &self.config.pulumi.operator_version);
        resolve_image(&tagged, self.config.container_registry.image_prefix())
    }

    /// Name of the operator Deployment after prefixing
    pub fn deployment_name(&self) -> Result<String> {
        let deployment = self.templates.load_one(OPERATOR_DEPLOYMENT)?;
        Ok(prefixed(tree::get_required_str(&deployment, "metadata.name")?))
    }

    /// Secret carrying the custom CA, when one is configured
    pub fn ca_secret_manifest(&self) -> Result<Option<Value>> {
        let Some(ca) = self.config.custom_ca() else {
            return Ok(None);
        };
        let mut secret = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": CA_SECRET_NAME, "namespace": self.namespace()},
            "type": "Opaque",
            "data": {CA_SECRET_KEY: ca}
        });
        self.labels().apply(&mut secret)?;
        Ok(Some(secret))
    }

    /// Deployment, Service and (optionally) CA Secret manifests, in write order
    pub fn deployment_manifests(&self) -> Result<Vec<Value>> {
        let namespace = self.namespace().to_string();
        let labels = self.labels();
        let config = &self.config;

        let mut service = self.templates.load_one(OPERATOR_SERVICE)?;
        let service_name = prefixed(tree::get_required_str(&service, "metadata.name")?);
        tree::set(&mut service, "metadata.name", json!(service_name))?;
        tree::set(&mut service, "metadata.namespace", json!(namespace))?;
        labels.apply(&mut service)?;

        let mut deployment = self.templates.load_one(OPERATOR_DEPLOYMENT)?;
        let name = prefixed(tree::get_required_str(&deployment, "metadata.name")?);
        tree::set(&mut deployment, "metadata.name", json!(name))?;
        tree::set(&mut deployment, "metadata.namespace", json!(namespace))?;
        labels.apply(&mut deployment)?;

        let pod_template = tree::object_node(&mut deployment, "spec.template")?;
        labels.apply(pod_template)?;

        let pod = tree::object_node(&mut deployment, POD_SPEC)?;
        let service_account = prefixed(tree::get_required_str(pod, "serviceAccountName")?);
        tree::set(pod, "serviceAccountName", json!(service_account))?;

        let manager = container_mut(pod, MANAGER_CONTAINER)
            .ok_or_else(|| {
                Error::missing_path(
                    format!("{}.containers[name={}]", POD_SPEC, MANAGER_CONTAINER),
                    format!("Deployment/{}/{}", namespace, name),
                )
            })?;
        let image = tree::get_required_str(manager, "image")?.to_string();
        tree::set(manager, "image", json!(self.resolve_operator_image(&image)))?;
        ensure_env(manager, "POD_SERVICE_NAME", service_name.as_str())?;

        set_run_as(pod, config.kubernetes.run_as_id)?;
        place_pod(
            pod,
            config.kubernetes.pod_placement_mode,
            &config.kubernetes.system_node_label,
        )?;
        ensure_pull_secret(pod, PULL_SECRET_NAME)?;
        inject_service_account_token(pod)?;
        if config.custom_ca().is_some() {
            inject_custom_ca(pod, CA_SECRET_NAME, CA_SECRET_KEY)?;
        }
        if let Some(proxy) = config.proxy() {
            inject_proxy(pod, proxy)?;
        }

        let mut out = Vec::with_capacity(3);
        out.extend(self.ca_secret_manifest()?);
        out.push(deployment);
        out.push(service);
        Ok(out)
    }

    /// Apply the operator Deployment and Service
    pub async fn apply_deployment(&self) -> Result<()> {
        let manifests = self.deployment_manifests()?;
        self.applier.write_all(manifests).await?;
        info!(
            namespace = %self.namespace(),
            image = %self.operator_image()?,
            "operator deployment applied"
        );
        Ok(())
    }

    /// Single readiness check of the operator Deployment
    pub async fn is_ready(&self) -> Result<bool> {
        let name = self.deployment_name()?;
        Ok(self.waiter.is_ready(self.namespace(), &name).await)
    }

    /// Wait for the operator Deployment to become ready
    pub async fn wait_ready(&self) -> Result<()> {
        let name = self.deployment_name()?;
        self.waiter.wait_for_deployment(self.namespace(), &name).await?;
        info!(namespace = %self.namespace(), deployment = %name, "operator ready");
        Ok(())
    }
}
