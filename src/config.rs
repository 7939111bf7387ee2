//! Installer configuration
//!
//! A single typed record drives an entire provisioning run. It is loaded
//! from YAML (or JSON, which is valid YAML) with camelCase keys:
//!
//! ```yaml
//! environment: production
//! containerRegistry:
//!   hostname: registry.example.com
//!   username: robot
//!   password: secret
//! scm:
//!   url: https://git.example.com/platform/stack.git
//!   accessToken: glpat-xxxx
//! kubernetes:
//!   namespaces:
//!     system: dataplane-system
//!     cni: cilium
//!     ciPipelines: ci
//! pulumi:
//!   passphrase: hunter2
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Namespace used when none is configured
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "dataplane-system";

/// Default node label key for placement
pub const DEFAULT_NODE_LABEL_KEY: &str = "node-role.dataplane.io/pool";

/// Root configuration record
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Environment name; also the Pulumi stack name
    pub environment: String,
    /// Private container registry credentials
    pub container_registry: ContainerRegistry,
    /// npm registry used by the Pulumi program
    #[serde(default)]
    pub npm_registry: NpmRegistry,
    /// Source repository of the Pulumi program
    pub scm: ScmSettings,
    /// Cluster placement settings
    #[serde(default)]
    pub kubernetes: KubernetesSettings,
    /// Outbound HTTP proxy
    #[serde(default)]
    pub http_proxy: Option<HttpProxy>,
    /// S3 state backend; local PVC state when absent
    #[serde(default)]
    pub s3: Option<S3Settings>,
    /// Pulumi runtime settings
    #[serde(default)]
    pub pulumi: PulumiSettings,
    /// FluxCD source; direct Git fetch when absent
    #[serde(default)]
    pub flux: Option<FluxSettings>,
    /// Base64-encoded PEM bundle trusted in addition to system roots
    #[serde(default)]
    pub custom_ca: Option<String>,
}

/// Container registry credentials
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRegistry {
    /// Registry hostname (e.g. registry.example.com)
    pub hostname: String,
    /// Registry username
    pub username: String,
    /// Registry password
    pub password: String,
}

impl ContainerRegistry {
    /// Registry prefix for image references, `None` when no hostname is set
    pub fn image_prefix(&self) -> Option<&str> {
        let hostname = self.hostname.trim().trim_end_matches('/');
        if !hostname.is_empty() {
            Some(hostname)
        } else {
            None
        }
    }
}

/// npm registry settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NpmRegistry {
    /// Registry URL
    pub url: String,
    /// Auth token, if the registry is private
    #[serde(default)]
    pub access_token: Option<String>,
}

impl Default for NpmRegistry {
    fn default() -> Self {
        Self {
            url: "https://registry.npmjs.org/".to_string(),
            access_token: None,
        }
    }
}

impl NpmRegistry {
    /// Render an `.npmrc` for this registry
    pub fn npmrc(&self) -> String {
        let url = if self.url.ends_with('/') {
            self.url.clone()
        } else {
            format!("{}/", self.url)
        };
        let mut npmrc = format!("registry={}\n", url);
        if let Some(token) = self.access_token.as_deref().filter(|t| !t.is_empty()) {
            let scoped = url
                .trim_start_matches("https:")
                .trim_start_matches("http:");
            npmrc.push_str(&format!("{}:_authToken={}\n", scoped, token));
            npmrc.push_str("always-auth=true\n");
        }
        npmrc
    }
}

/// Source repository settings
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScmSettings {
    /// Clone URL
    pub url: String,
    /// Branch to track
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Sub-directory holding the Pulumi project
    #[serde(default)]
    pub directory: Option<String>,
    /// Basic-auth username
    #[serde(default)]
    pub username: Option<String>,
    /// Basic-auth password
    #[serde(default)]
    pub password: Option<String>,
    /// Token auth, used instead of username/password
    #[serde(default)]
    pub access_token: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Resolved SCM authentication
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScmAuth<'a> {
    /// Username and password
    Basic {
        /// Username
        username: &'a str,
        /// Password
        password: &'a str,
    },
    /// Access token
    Token(&'a str),
}

impl ScmSettings {
    /// The configured auth method; token wins when both are present
    pub fn auth(&self) -> Option<ScmAuth<'_>> {
        if let Some(token) = non_empty(&self.access_token) {
            return Some(ScmAuth::Token(token));
        }
        match (non_empty(&self.username), non_empty(&self.password)) {
            (Some(username), Some(password)) => Some(ScmAuth::Basic { username, password }),
            _ => None,
        }
    }
}

/// Node label pair
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeLabel {
    /// Label key
    pub key: String,
    /// Label value
    pub value: String,
}

impl NodeLabel {
    fn pool(value: &str) -> Self {
        Self {
            key: DEFAULT_NODE_LABEL_KEY.to_string(),
            value: value.to_string(),
        }
    }

    /// `key=value` form used by node-selector annotations
    pub fn selector(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}

/// How workloads are pinned to nodes
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PodPlacementMode {
    /// Namespace-level node-selector annotation only
    #[default]
    NodeSelector,
    /// Toleration plus required node affinity on every pod
    NodeSelectorAndTaint,
}

impl PodPlacementMode {
    /// Stable string form stored in the configuration Secret
    pub fn as_str(&self) -> &'static str {
        match self {
            PodPlacementMode::NodeSelector => "nodeSelector",
            PodPlacementMode::NodeSelectorAndTaint => "nodeSelectorAndTaint",
        }
    }
}

/// Configured namespaces
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Namespaces {
    /// Namespace for the operator and the stack
    #[serde(default)]
    pub system: Option<String>,
    /// Namespace for the CNI
    #[serde(default)]
    pub cni: Option<String>,
    /// Namespace for CI pipelines
    #[serde(default)]
    pub ci_pipelines: Option<String>,
}

/// Kubernetes placement settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesSettings {
    /// Namespace names
    #[serde(default)]
    pub namespaces: Namespaces,
    /// Label of nodes running system workloads
    #[serde(default = "default_system_label")]
    pub system_node_label: NodeLabel,
    /// Label of nodes running application workloads
    #[serde(default = "default_application_label")]
    pub application_node_label: NodeLabel,
    /// Placement policy
    #[serde(default)]
    pub pod_placement_mode: PodPlacementMode,
    /// Storage class for the state volume
    #[serde(default)]
    pub storage_class: Option<String>,
    /// UID (and GID) pods run as
    #[serde(default = "default_run_as_id")]
    pub run_as_id: i64,
}

fn default_system_label() -> NodeLabel {
    NodeLabel::pool("system")
}

fn default_application_label() -> NodeLabel {
    NodeLabel::pool("application")
}

fn default_run_as_id() -> i64 {
    1000
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            namespaces: Namespaces::default(),
            system_node_label: default_system_label(),
            application_node_label: default_application_label(),
            pod_placement_mode: PodPlacementMode::default(),
            storage_class: None,
            run_as_id: default_run_as_id(),
        }
    }
}

impl KubernetesSettings {
    /// System namespace, defaulted when absent
    pub fn system_namespace(&self) -> &str {
        non_empty(&self.namespaces.system).unwrap_or(DEFAULT_SYSTEM_NAMESPACE)
    }

    /// CNI namespace; shares the system namespace when absent
    pub fn cni_namespace(&self) -> &str {
        non_empty(&self.namespaces.cni).unwrap_or_else(|| self.system_namespace())
    }

    /// CI pipelines namespace; shares the system namespace when absent
    pub fn ci_pipelines_namespace(&self) -> &str {
        non_empty(&self.namespaces.ci_pipelines).unwrap_or_else(|| self.system_namespace())
    }

    /// A namespace is dedicated iff its name differs from the system namespace
    pub fn is_dedicated(&self, namespace: &str) -> bool {
        namespace != self.system_namespace()
    }

    /// All distinct namespaces in configuration order, system first
    pub fn distinct_namespaces(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for ns in [
            self.system_namespace(),
            self.cni_namespace(),
            self.ci_pipelines_namespace(),
        ] {
            if !out.iter().any(|n| n == ns) {
                out.push(ns.to_string());
            }
        }
        out
    }
}

/// Outbound HTTP proxy
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpProxy {
    /// Proxy hostname
    #[serde(default)]
    pub hostname: Option<String>,
    /// Proxy port
    #[serde(default)]
    pub port: Option<u16>,
    /// Comma-separated hosts that bypass the proxy
    #[serde(default)]
    pub no_proxy: Option<String>,
}

impl HttpProxy {
    /// `host:port` when both parts are configured
    pub fn endpoint(&self) -> Option<String> {
        match (non_empty(&self.hostname), self.port) {
            (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
            _ => None,
        }
    }

    /// The no-proxy list, if set
    pub fn no_proxy(&self) -> Option<&str> {
        non_empty(&self.no_proxy)
    }
}

/// S3 state backend
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Settings {
    /// Static access key id
    #[serde(default)]
    pub access_key: Option<String>,
    /// Static secret key
    #[serde(default)]
    pub secret_key: Option<String>,
    /// IAM role assumed through the service account
    #[serde(default)]
    pub iam_role: Option<String>,
    /// Bucket name
    pub bucket: String,
    /// Bucket region
    pub region: String,
}

/// Resolved S3 authentication
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum S3Auth<'a> {
    /// Static keys, passed as environment variables
    AccessKey {
        /// Access key id
        access_key: &'a str,
        /// Secret key
        secret_key: &'a str,
    },
    /// IAM role, bound through a service account annotation
    IamRole(&'a str),
}

impl S3Settings {
    /// The configured auth method; static keys win when both are present
    pub fn auth(&self) -> Option<S3Auth<'_>> {
        match (non_empty(&self.access_key), non_empty(&self.secret_key)) {
            (Some(access_key), Some(secret_key)) => Some(S3Auth::AccessKey {
                access_key,
                secret_key,
            }),
            _ => non_empty(&self.iam_role).map(S3Auth::IamRole),
        }
    }

    /// Pulumi backend URL
    pub fn backend_url(&self) -> String {
        format!("s3://{}?region={}", self.bucket, self.region)
    }
}

/// Pulumi runtime settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PulumiSettings {
    /// Operator image tag
    #[serde(default = "default_operator_version")]
    pub operator_version: String,
    /// Workspace runtime image
    #[serde(default = "default_runtime_image")]
    pub runtime_image: String,
    /// Whether to install the operator CRDs
    #[serde(default = "default_true")]
    pub install_crds: bool,
    /// Secrets provider passphrase
    #[serde(default)]
    pub passphrase: String,
    /// State volume size when S3 is disabled
    #[serde(default = "default_state_size")]
    pub state_storage_size: String,
}

fn default_operator_version() -> String {
    "v2.0.0".to_string()
}

fn default_runtime_image() -> String {
    "pulumi/pulumi:3.147.0-nonroot".to_string()
}

fn default_state_size() -> String {
    "1Gi".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for PulumiSettings {
    fn default() -> Self {
        Self {
            operator_version: default_operator_version(),
            runtime_image: default_runtime_image(),
            install_crds: true,
            passphrase: String::new(),
            state_storage_size: default_state_size(),
        }
    }
}

/// FluxCD source settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FluxSettings {
    /// Name of the externally managed source resource
    pub source_name: String,
    /// Source resource kind
    #[serde(default = "default_flux_kind")]
    pub source_kind: String,
    /// Source resource API version
    #[serde(default = "default_flux_api_version")]
    pub source_api_version: String,
    /// Sub-directory of the artifact holding the project
    #[serde(default = "default_flux_dir")]
    pub directory: String,
}

fn default_flux_kind() -> String {
    "GitRepository".to_string()
}

fn default_flux_api_version() -> String {
    "source.toolkit.fluxcd.io/v1".to_string()
}

fn default_flux_dir() -> String {
    ".".to_string()
}

impl Configuration {
    /// Parse configuration from a YAML or JSON string
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        serde_yaml::from_str(input)
            .map_err(|e| Error::configuration("<root>", format!("failed to parse: {}", e)))
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration("<root>", format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Whether the S3 backend is enabled
    pub fn s3_enabled(&self) -> bool {
        self.s3.is_some()
    }

    /// The configured proxy, if it has both host and port
    pub fn proxy(&self) -> Option<&HttpProxy> {
        self.http_proxy.as_ref().filter(|p| p.endpoint().is_some())
    }

    /// Custom CA, if set and non-blank
    pub fn custom_ca(&self) -> Option<&str> {
        non_empty(&self.custom_ca)
    }

    /// Check required fields and mutually dependent settings
    pub fn validate(&self) -> Result<()> {
        if self.environment.trim().is_empty() {
            return Err(Error::configuration("environment", "must be set"));
        }
        for (field, value) in [
            ("containerRegistry.hostname", &self.container_registry.hostname),
            ("containerRegistry.username", &self.container_registry.username),
            ("containerRegistry.password", &self.container_registry.password),
            ("pulumi.passphrase", &self.pulumi.passphrase),
        ] {
            if value.trim().is_empty() {
                return Err(Error::configuration(field, "must be set"));
            }
        }

        match &self.flux {
            Some(flux) if flux.source_name.trim().is_empty() => {
                return Err(Error::configuration("flux.sourceName", "must be set"));
            }
            Some(_) => {}
            None => {
                if self.scm.url.trim().is_empty() {
                    return Err(Error::configuration("scm.url", "must be set"));
                }
                if self.scm.auth().is_none() {
                    return Err(Error::configuration(
                        "scm",
                        "either accessToken or username/password must be set",
                    ));
                }
            }
        }

        if let Some(s3) = &self.s3 {
            if s3.bucket.trim().is_empty() {
                return Err(Error::configuration("s3.bucket", "must be set"));
            }
            if s3.region.trim().is_empty() {
                return Err(Error::configuration("s3.region", "must be set"));
            }
            if s3.auth().is_none() {
                return Err(Error::configuration(
                    "s3",
                    "either accessKey/secretKey or iamRole must be set",
                ));
            }
        }

        if let Some(proxy) = &self.http_proxy {
            if non_empty(&proxy.hostname).is_some() != proxy.port.is_some() {
                return Err(Error::configuration(
                    "httpProxy",
                    "hostname and port must be set together",
                ));
            }
        }

        Ok(())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
