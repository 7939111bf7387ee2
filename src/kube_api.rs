//! Cluster API surface consumed by the installer
//!
//! Every provisioner talks to the cluster through [`ClusterApi`], an
//! object-safe trait over untyped manifests. Production runs use
//! [`KubeClusterApi`], built once per run from a `kube::Client`; tests use
//! the mockall-generated `MockClusterApi` or the in-memory fake.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde_json::Value;
use tracing::trace;

#[cfg(test)]
use mockall::automock;

use crate::tree;
use crate::{Error, Result};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity of a cluster resource.
///
/// `(kind, namespace, name)` is the idempotency key; `api_version` is
/// carried along so the adapter can address the right endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    /// Full API version (e.g. "apps/v1", "v1")
    pub api_version: String,
    /// Resource kind
    pub kind: String,
    /// Namespace, `None` for cluster-scoped resources
    pub namespace: Option<String>,
    /// Resource name
    pub name: String,
}

impl ResourceId {
    /// Identity of a namespaced resource
    pub fn namespaced(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Identity of a cluster-scoped resource
    pub fn cluster(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: None,
            name: name.into(),
        }
    }

    /// Read the identity out of a manifest.
    ///
    /// Fails naming the missing path when `apiVersion`, `kind` or
    /// `metadata.name` is absent.
    pub fn of(manifest: &Value) -> Result<Self> {
        Ok(Self {
            api_version: tree::get_required_str(manifest, "apiVersion")?.to_string(),
            kind: tree::get_required_str(manifest, "kind")?.to_string(),
            namespace: tree::get(manifest, "metadata.namespace")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            name: tree::get_required_str(manifest, "metadata.name")?.to_string(),
        })
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Cluster operations the installer depends on.
///
/// Reads return `Error::Kube` with status 404 for absent objects so callers
/// can tell NotFound apart from transient failures.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Server-side apply of a whole manifest, owned by `field_manager`
    async fn apply(&self, manifest: &Value, field_manager: &str) -> Result<()>;

    /// Read one object
    async fn get(&self, id: &ResourceId) -> Result<Value>;

    /// List objects of a kind, optionally filtered by namespace and labels
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<String>,
        label_selector: Option<String>,
    ) -> Result<Vec<Value>>;

    /// Create an object that must not exist yet
    async fn create(&self, manifest: &Value) -> Result<Value>;

    /// Replace an existing object; the manifest carries its resourceVersion
    async fn replace(&self, manifest: &Value) -> Result<Value>;

    /// JSON merge patch of an existing object
    async fn patch_merge(&self, id: &ResourceId, patch: &Value) -> Result<()>;

    /// Read a Deployment with typed status
    async fn read_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;
}

/// [`ClusterApi`] backed by a kube-rs client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using an optional kubeconfig path, inferring config otherwise
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let client = create_client(kubeconfig).await?;
        Ok(Self::new(client))
    }

    fn dynamic_api(&self, id: &ResourceId) -> Api<DynamicObject> {
        let ar = build_api_resource(&id.api_version, &id.kind);
        match &id.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn apply(&self, manifest: &Value, field_manager: &str) -> Result<()> {
        let id = ResourceId::of(manifest)?;
        let params = PatchParams::apply(field_manager).force();
        self.dynamic_api(&id)
            .patch(&id.name, &params, &Patch::Apply(manifest))
            .await?;
        trace!(resource = %id, "applied");
        Ok(())
    }

    async fn get(&self, id: &ResourceId) -> Result<Value> {
        let obj = self.dynamic_api(id).get(&id.name).await?;
        Ok(serde_json::to_value(obj)?)
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<String>,
        label_selector: Option<String>,
    ) -> Result<Vec<Value>> {
        let ar = build_api_resource(api_version, kind);
        let api: Api<DynamicObject> = match namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        let mut params = ListParams::default();
        if let Some(selector) = label_selector.as_deref() {
            params = params.labels(selector);
        }
        let list = api.list(&params).await?;
        list.items
            .into_iter()
            .map(|obj| serde_json::to_value(obj).map_err(Error::from))
            .collect()
    }

    async fn create(&self, manifest: &Value) -> Result<Value> {
        let id = ResourceId::of(manifest)?;
        let obj: DynamicObject = serde_json::from_value(manifest.clone())
            .map_err(|e| Error::serialization_for_kind(&id.kind, e.to_string()))?;
        let created = self
            .dynamic_api(&id)
            .create(&PostParams::default(), &obj)
            .await?;
        Ok(serde_json::to_value(created)?)
    }

    async fn replace(&self, manifest: &Value) -> Result<Value> {
        let id = ResourceId::of(manifest)?;
        let obj: DynamicObject = serde_json::from_value(manifest.clone())
            .map_err(|e| Error::serialization_for_kind(&id.kind, e.to_string()))?;
        let replaced = self
            .dynamic_api(&id)
            .replace(&id.name, &PostParams::default(), &obj)
            .await?;
        Ok(serde_json::to_value(replaced)?)
    }

    async fn patch_merge(&self, id: &ResourceId, patch: &Value) -> Result<()> {
        self.dynamic_api(id)
            .patch(&id.name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn read_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }
}

/// [`ClusterApi`] for rendering without a cluster; every call fails
#[derive(Clone, Copy, Debug, Default)]
pub struct DisconnectedClusterApi;

impl DisconnectedClusterApi {
    fn refuse<T>(operation: &str) -> Result<T> {
        Err(Error::internal_with_context(
            operation,
            "no cluster connection in render mode",
        ))
    }
}

#[async_trait]
impl ClusterApi for DisconnectedClusterApi {
    async fn apply(&self, _manifest: &Value, _field_manager: &str) -> Result<()> {
        Self::refuse("apply")
    }

    async fn get(&self, _id: &ResourceId) -> Result<Value> {
        Self::refuse("get")
    }

    async fn list(
        &self,
        _api_version: &str,
        _kind: &str,
        _namespace: Option<String>,
        _label_selector: Option<String>,
    ) -> Result<Vec<Value>> {
        Self::refuse("list")
    }

    async fn create(&self, _manifest: &Value) -> Result<Value> {
        Self::refuse("create")
    }

    async fn replace(&self, _manifest: &Value) -> Result<Value> {
        Self::refuse("replace")
    }

    async fn patch_merge(&self, _id: &ResourceId, _patch: &Value) -> Result<()> {
        Self::refuse("patch")
    }

    async fn read_deployment(&self, _namespace: &str, _name: &str) -> Result<Deployment> {
        Self::refuse("read_deployment")
    }
}

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Build an ApiResource from a known apiVersion and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use dataplane_installer::kube_api::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with("ss") || lower.ends_with("sh") || lower.ends_with("ch") {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        if stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            format!("{}s", lower)
        } else {
            format!("{}ies", stem)
        }
    } else if lower.ends_with('s') {
        lower
    } else {
        format!("{}s", lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("Deployment", "deployments")]
    #[case("Namespace", "namespaces")]
    #[case("ClusterRoleBinding", "clusterrolebindings")]
    #[case("CustomResourceDefinition", "customresourcedefinitions")]
    #[case("PersistentVolumeClaim", "persistentvolumeclaims")]
    #[case("Stack", "stacks")]
    #[case("GitRepository", "gitrepositories")]
    #[case("Ingress", "ingresses")]
    #[case("Gateway", "gateways")]
    fn pluralizes_kinds(#[case] kind: &str, #[case] plural: &str) {
        assert_eq!(pluralize_kind(kind), plural);
    }

    #[test]
    fn resource_id_from_manifest() {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "creds", "namespace": "sys"}
        });
        let id = ResourceId::of(&manifest).unwrap();
        assert_eq!(id, ResourceId::namespaced("v1", "Secret", "sys", "creds"));
        assert_eq!(id.to_string(), "Secret/sys/creds");
    }

    #[test]
    fn resource_id_requires_name() {
        let manifest = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {}});
        let err = ResourceId::of(&manifest).unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }

    #[test]
    fn cluster_scoped_identity_has_no_namespace() {
        let manifest = json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {"name": "admin", "namespace": ""}
        });
        let id = ResourceId::of(&manifest).unwrap();
        assert_eq!(id.namespace, None);
        assert_eq!(id.to_string(), "ClusterRole/admin");
    }

    #[test]
    fn api_resource_from_version() {
        let ar = build_api_resource("pulumi.com/v1", "Stack");
        assert_eq!(ar.group, "pulumi.com");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "stacks");
    }

    #[tokio::test]
    async fn disconnected_api_refuses_every_call() {
        let api = DisconnectedClusterApi;
        let id = ResourceId::cluster("v1", "Namespace", "sys");
        assert!(api.get(&id).await.is_err());
        let err = api.read_deployment("sys", "op").await.unwrap_err();
        assert!(err.to_string().contains("render mode"));
    }
}
