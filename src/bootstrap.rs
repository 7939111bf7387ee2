//! Provisioning orchestrator
//!
//! A run is a fixed graph of tasks:
//!
//! ```text
//! system ns ──┬─> operator rbac ───────┐
//!             └─> operator deployment ─┤
//! cni ns ──────────────────────────────┤
//! ci-pipelines ns ─────────────────────┼─> operator ready ─┬─> stack rbac ─┐
//! crds ────────────────────────────────┘                   ├─> secret ─────┼─> stack
//!                                                          └─> state pvc ──┘
//! ```
//!
//! Everything without an edge between it may run concurrently. The first
//! failing task aborts the run. Every write is idempotent by resource
//! identity, so recovery is running the installer again from the top.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::apply::ResourceApplier;
use crate::config::Configuration;
use crate::graph::TaskGraph;
use crate::kinds::KindRegistry;
use crate::kube_api::ClusterApi;
use crate::manifest::labels::managed_selector;
use crate::manifest::TemplateSet;
use crate::namespace::{NamespaceProvisioner, NamespaceRole};
use crate::operator::OperatorProvisioner;
use crate::readiness::{ReadinessWaiter, DEFAULT_POLL_INTERVAL, DEFAULT_READINESS_TIMEOUT};
use crate::retry::{Fallback, RetryPolicy};
use crate::stack::StackProvisioner;
use crate::tree;
use crate::{Result, FIELD_MANAGER};

/// One node of the provisioning graph
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskId {
    /// System namespace and pull secret
    SystemNamespace,
    /// CNI namespace and pull secret, when dedicated
    CniNamespace,
    /// CI pipelines namespace and pull secret, when dedicated
    CiPipelinesNamespace,
    /// Operator CRDs
    Crds,
    /// Operator ServiceAccount, roles and bindings
    OperatorRbac,
    /// Operator Deployment, Service and CA secret
    OperatorDeployment,
    /// Wait for the operator Deployment
    OperatorReady,
    /// Stack ServiceAccount, roles and bindings
    StackRbac,
    /// Stack configuration Secret
    StackSecret,
    /// Local state volume
    StatePvc,
    /// The Stack custom resource
    StackResource,
}

impl TaskId {
    /// Every task, in a valid execution order
    pub const ALL: [TaskId; 11] = [
        TaskId::SystemNamespace,
        TaskId::CniNamespace,
        TaskId::CiPipelinesNamespace,
        TaskId::Crds,
        TaskId::OperatorRbac,
        TaskId::OperatorDeployment,
        TaskId::OperatorReady,
        TaskId::StackRbac,
        TaskId::StackSecret,
        TaskId::StatePvc,
        TaskId::StackResource,
    ];

    /// Tasks that must complete before this one starts
    pub fn dependencies(self) -> &'static [TaskId] {
        use TaskId::*;
        match self {
            SystemNamespace | CniNamespace | CiPipelinesNamespace | Crds => &[],
            OperatorRbac | OperatorDeployment => &[SystemNamespace],
            OperatorReady => &[
                CniNamespace,
                CiPipelinesNamespace,
                OperatorRbac,
                OperatorDeployment,
                Crds,
            ],
            StackRbac | StackSecret | StatePvc => &[OperatorReady],
            StackResource => &[StackRbac, StackSecret, StatePvc],
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            TaskId::SystemNamespace => "system-namespace",
            TaskId::CniNamespace => "cni-namespace",
            TaskId::CiPipelinesNamespace => "ci-pipelines-namespace",
            TaskId::Crds => "crds",
            TaskId::OperatorRbac => "operator-rbac",
            TaskId::OperatorDeployment => "operator-deployment",
            TaskId::OperatorReady => "operator-ready",
            TaskId::StackRbac => "stack-rbac",
            TaskId::StackSecret => "stack-secret",
            TaskId::StatePvc => "state-pvc",
            TaskId::StackResource => "stack",
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime knobs for a [`Bootstrapper`]
#[derive(Clone)]
pub struct BootstrapOptions {
    /// Where operator templates come from
    pub templates: TemplateSet,
    /// Field manager for server-side apply
    pub field_manager: String,
    /// How long to wait for the operator to become ready
    pub readiness_timeout: Duration,
    /// Delay between readiness polls
    pub poll_interval: Duration,
    /// Retry budget for reads
    pub retry: RetryPolicy,
    /// Cancels every run and read made through the bootstrapper. A failed
    /// run cancels only its own child token.
    pub cancel: CancellationToken,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            templates: TemplateSet::packaged(),
            field_manager: FIELD_MANAGER.to_string(),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Observed state of one managed Deployment
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
    /// Ready replicas
    pub ready: i64,
    /// Desired replicas
    pub desired: i64,
}

/// Best-effort snapshot of an installation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Whether the operator Deployment is ready
    pub operator_ready: bool,
    /// Managed Deployments in the system namespace
    pub deployments: Vec<DeploymentStatus>,
    /// `status.lastUpdate.state` of the Stack
    pub stack_state: String,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "operator: {}",
            if self.operator_ready { "ready" } else { "not ready" }
        )?;
        writeln!(f, "stack:    {}", self.stack_state)?;
        for d in &self.deployments {
            writeln!(f, "  {}/{} {}/{}", d.namespace, d.name, d.ready, d.desired)?;
        }
        Ok(())
    }
}

impl DeploymentStatus {
    fn of(deployment: &Value) -> Option<Self> {
        Some(Self {
            namespace: tree::get(deployment, "metadata.namespace")?.as_str()?.to_string(),
            name: tree::get(deployment, "metadata.name")?.as_str()?.to_string(),
            ready: tree::get(deployment, "status.readyReplicas")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            desired: tree::get(deployment, "spec.replicas")
                .and_then(Value::as_i64)
                .unwrap_or(1),
        })
    }
}

/// Runs, renders and inspects an installation
pub struct Bootstrapper {
    config: Arc<Configuration>,
    registry: Arc<KindRegistry>,
    applier: ResourceApplier,
    namespaces: NamespaceProvisioner,
    operator: OperatorProvisioner,
    stack: StackProvisioner,
    cancel: CancellationToken,
}

impl Bootstrapper {
    /// Build every provisioner around one shared cluster handle.
    ///
    /// Fails when the configuration does not validate.
    pub fn new(
        api: Arc<dyn ClusterApi>,
        config: Configuration,
        options: BootstrapOptions,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let registry = Arc::new(KindRegistry::standard());

        let applier = ResourceApplier::new(api.clone(), registry.clone(), options.cancel.clone())
            .with_field_manager(options.field_manager)
            .with_retry(options.retry);
        let waiter = ReadinessWaiter::new(api, options.cancel.clone())
            .with_timeout(options.readiness_timeout)
            .with_interval(options.poll_interval);

        Ok(Self {
            namespaces: NamespaceProvisioner::new(applier.clone(), config.clone()),
            operator: OperatorProvisioner::new(
                applier.clone(),
                config.clone(),
                options.templates,
                waiter,
            ),
            stack: StackProvisioner::new(applier.clone(), config.clone()),
            applier,
            registry,
            config,
            cancel: options.cancel,
        })
    }

    /// The configuration this run was built from
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// The provisioning graph for one run
    pub fn graph(&self) -> TaskGraph<TaskId> {
        let mut graph = TaskGraph::new();
        for id in TaskId::ALL {
            let namespaces = self.namespaces.clone();
            let operator = self.operator.clone();
            let stack = self.stack.clone();
            let task = async move {
                match id {
                    TaskId::SystemNamespace => {
                        namespaces.provision(NamespaceRole::System).await.map(drop)
                    }
                    TaskId::CniNamespace => {
                        namespaces.provision(NamespaceRole::Cni).await.map(drop)
                    }
                    TaskId::CiPipelinesNamespace => {
                        namespaces.provision(NamespaceRole::CiPipelines).await.map(drop)
                    }
                    TaskId::Crds => operator.apply_crds().await,
                    TaskId::OperatorRbac => operator.apply_rbac().await,
                    TaskId::OperatorDeployment => operator.apply_deployment().await,
                    TaskId::OperatorReady => operator.wait_ready().await,
                    TaskId::StackRbac => stack.apply_rbac().await,
                    TaskId::StackSecret => stack.apply_secret().await,
                    TaskId::StatePvc => stack.apply_state_pvc().await.map(drop),
                    TaskId::StackResource => stack.apply_stack().await,
                }
            };
            graph.add(id, id.dependencies(), task);
        }
        graph
    }

    /// Provision everything, stopping at the first failure
    pub async fn run(&self) -> Result<()> {
        let started = Instant::now();
        info!(
            environment = %self.config.environment,
            namespaces = ?self.config.kubernetes.distinct_namespaces(),
            s3 = self.config.s3_enabled(),
            "starting provisioning run"
        );
        let completed = self.graph().run(&self.cancel.child_token()).await?;
        info!(
            tasks = completed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "provisioning complete"
        );
        Ok(())
    }

    /// Every manifest a run would write, in task order, without touching
    /// the cluster
    pub fn plan(&self) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        for role in [
            NamespaceRole::System,
            NamespaceRole::Cni,
            NamespaceRole::CiPipelines,
        ] {
            out.extend(self.namespaces.manifests(role)?);
        }
        out.extend(self.operator.crd_manifests()?);
        out.extend(self.operator.rbac_manifests()?);
        out.extend(self.operator.deployment_manifests()?);
        out.extend(self.stack.manifests()?);

        for manifest in &mut out {
            self.registry.prepare(manifest)?;
        }
        Ok(out)
    }

    /// Snapshot of operator readiness, managed Deployments and stack state.
    ///
    /// Read failures are absorbed into fallbacks; only cancellation fails.
    pub async fn status(&self) -> Result<StatusReport> {
        let operator_ready = self.operator.is_ready().await?;

        let api = self.applier.api().clone();
        let namespace = self.config.kubernetes.system_namespace().to_string();
        let deployments = self
            .applier
            .retry()
            .run(
                "list managed deployments",
                &self.cancel,
                Fallback::from_error(|e| {
                    warn!(error = %e, "could not list managed deployments");
                    Vec::new()
                }),
                || {
                    let api = api.clone();
                    let namespace = namespace.clone();
                    async move {
                        api.list("apps/v1", "Deployment", Some(namespace), Some(managed_selector()))
                            .await
                    }
                },
            )
            .await?;

        Ok(StatusReport {
            operator_ready,
            deployments: deployments.iter().filter_map(DeploymentStatus::of).collect(),
            stack_state: self.stack.last_update_state().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::config::S3Settings;
    use crate::manifest::secrets::decode_data;
    use crate::stack::secret::{KEY_S3_ACCESS_KEY, KEY_S3_ENABLED, KEY_S3_SECRET_KEY};
    use crate::testing::{FakeCluster, Verb};
    use crate::{CONFIG_SECRET_NAME, PULL_SECRET_NAME, STACK_NAME, STATE_PVC_NAME};
    use serde_json::json;

    fn options() -> BootstrapOptions {
        BootstrapOptions {
            templates: TemplateSet::packaged().with_fallback_dirs(Vec::new()),
            readiness_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
            retry: RetryPolicy::new(2, Duration::from_millis(1)),
            ..Default::default()
        }
    }

    fn bootstrapper(cluster: &FakeCluster, config: Configuration) -> Bootstrapper {
        Bootstrapper::new(Arc::new(cluster.clone()), config, options()).unwrap()
    }

    fn distinct_namespaces_with_s3() -> Configuration {
        let mut config = sample();
        config.kubernetes.namespaces.system = Some("dp-system".into());
        config.kubernetes.namespaces.cni = Some("dp-cni".into());
        config.kubernetes.namespaces.ci_pipelines = Some("dp-ci".into());
        config.s3 = Some(S3Settings {
            access_key: Some("AKIA".into()),
            secret_key: Some("shh".into()),
            iam_role: None,
            bucket: "state".into(),
            region: "eu-west-1".into(),
        });
        config
    }

    #[test]
    fn dependency_table_forms_a_valid_graph() {
        let cluster = FakeCluster::new();
        let graph = bootstrapper(&cluster, sample()).graph();
        assert_eq!(graph.order().unwrap(), TaskId::ALL.to_vec());
        assert_eq!(
            graph.predecessors(TaskId::StackResource).unwrap(),
            &[TaskId::StackRbac, TaskId::StackSecret, TaskId::StatePvc]
        );
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let mut config = sample();
        config.pulumi.passphrase.clear();
        let result = Bootstrapper::new(Arc::new(FakeCluster::new()), config, options());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn three_namespaces_with_access_key_s3() {
        let cluster = FakeCluster::new();
        bootstrapper(&cluster, distinct_namespaces_with_s3())
            .run()
            .await
            .unwrap();

        let mut namespaces = cluster.applies_of("Namespace");
        namespaces.sort();
        assert_eq!(namespaces, vec!["dp-ci", "dp-cni", "dp-system"]);

        for ns in ["dp-cni", "dp-ci"] {
            assert!(cluster
                .object("Secret", Some(ns), PULL_SECRET_NAME)
                .is_some());
        }

        let secret = cluster
            .object("Secret", Some("dp-system"), CONFIG_SECRET_NAME)
            .unwrap();
        assert_eq!(decode_data(&secret, KEY_S3_ENABLED).as_deref(), Some("true"));
        assert_eq!(decode_data(&secret, KEY_S3_ACCESS_KEY).as_deref(), Some("AKIA"));
        assert_eq!(decode_data(&secret, KEY_S3_SECRET_KEY).as_deref(), Some("shh"));

        assert!(cluster.objects_of("PersistentVolumeClaim").is_empty());

        let stack = cluster.object("Stack", Some("dp-system"), STACK_NAME).unwrap();
        assert_eq!(stack["spec"]["backend"], "s3://state?region=eu-west-1");
        assert!(stack["spec"]["envRefs"].get("AWS_ACCESS_KEY_ID").is_some());
        assert!(stack["spec"]["envRefs"].get("AWS_SECRET_ACCESS_KEY").is_some());
    }

    #[tokio::test]
    async fn shared_namespaces_are_provisioned_once() {
        let cluster = FakeCluster::new();
        bootstrapper(&cluster, sample()).run().await.unwrap();

        assert_eq!(cluster.applies_of("Namespace"), vec!["dataplane-system"]);
        let pull_secret_writes = cluster
            .writes()
            .into_iter()
            .filter(|c| c.kind == "Secret" && c.name == PULL_SECRET_NAME)
            .count();
        assert_eq!(pull_secret_writes, 1);
    }

    #[tokio::test]
    async fn unchanged_state_pvc_is_not_patched() {
        let cluster = FakeCluster::new();
        bootstrapper(&cluster, sample()).run().await.unwrap();
        bootstrapper(&cluster, sample()).run().await.unwrap();

        assert_eq!(cluster.creates_of("PersistentVolumeClaim").len(), 1);
        assert!(cluster.patches_of("PersistentVolumeClaim").is_empty());
    }

    #[tokio::test]
    async fn larger_state_pvc_is_patched_once() {
        let cluster = FakeCluster::new();
        bootstrapper(&cluster, sample()).run().await.unwrap();

        let mut grown = sample();
        grown.pulumi.state_storage_size = "50Gi".into();
        bootstrapper(&cluster, grown).run().await.unwrap();

        assert_eq!(
            cluster.patches_of("PersistentVolumeClaim"),
            vec![format!("dataplane-system/{}", STATE_PVC_NAME)]
        );
        let pvc = cluster
            .object("PersistentVolumeClaim", Some("dataplane-system"), STATE_PVC_NAME)
            .unwrap();
        assert_eq!(pvc["spec"]["resources"]["requests"]["storage"], "50Gi");
    }

    #[tokio::test]
    async fn writes_follow_the_dependency_order() {
        let cluster = FakeCluster::new();
        bootstrapper(&cluster, distinct_namespaces_with_s3())
            .run()
            .await
            .unwrap();

        let operator = "dataplane-pulumi-controller-manager";
        let namespace = cluster.write_index("Namespace", "dp-system").unwrap();
        let deployment = cluster.write_index("Deployment", operator).unwrap();
        let ready_check = cluster
            .calls()
            .iter()
            .position(|c| c.verb == Verb::ReadDeployment)
            .unwrap();
        let first_stack_write = cluster.write_index("ServiceAccount", "dataplane-stack").unwrap();
        let stack = cluster.write_index("Stack", STACK_NAME).unwrap();

        assert!(namespace < deployment);
        assert!(stack > first_stack_write);
        assert_eq!(stack, cluster.writes().len() - 1);

        let calls = cluster.calls();
        let stack_call = calls
            .iter()
            .position(|c| c.kind == "Stack" && c.verb == Verb::Apply)
            .unwrap();
        assert!(ready_check < stack_call);
    }

    #[tokio::test]
    async fn operator_timeout_aborts_before_stack() {
        let cluster = FakeCluster::new();
        cluster.never_ready();
        let b = bootstrapper(&cluster, sample());

        let err = b.run().await.unwrap_err();
        assert!(matches!(err, crate::Error::Timeout { .. }));
        assert!(cluster.applies_of("Stack").is_empty());
        assert!(cluster.creates_of("Secret").iter().all(|s| !s.ends_with(CONFIG_SECRET_NAME)));
    }

    #[tokio::test]
    async fn failed_write_aborts_the_run() {
        let cluster = FakeCluster::new();
        cluster.fail(Verb::Apply, "CustomResourceDefinition");
        let err = bootstrapper(&cluster, sample()).run().await.unwrap_err();
        assert!(err.to_string().contains("kubernetes error"));
        assert!(cluster.applies_of("Stack").is_empty());
    }

    #[tokio::test]
    async fn failed_run_leaves_bootstrapper_usable() {
        let cluster = FakeCluster::new();
        cluster.fail(Verb::Apply, "CustomResourceDefinition");
        let b = bootstrapper(&cluster, sample());
        assert!(b.run().await.is_err());

        let report = b.status().await.unwrap();
        assert!(!report.operator_ready);

        cluster.heal();
        b.run().await.unwrap();
        assert_eq!(cluster.applies_of("Stack").len(), 1);
    }

    #[tokio::test]
    async fn external_cancel_stops_the_run() {
        let cluster = FakeCluster::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let b = Bootstrapper::new(
            Arc::new(cluster.clone()),
            sample(),
            BootstrapOptions {
                cancel,
                ..options()
            },
        )
        .unwrap();

        let err = b.run().await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(cluster.applies_of("Stack").is_empty());
    }

    #[test]
    fn plan_renders_without_cluster_calls() {
        let cluster = FakeCluster::new();
        let plan = bootstrapper(&cluster, sample()).plan().unwrap();

        assert!(cluster.calls().is_empty());
        let kinds: Vec<&str> = plan.iter().map(|m| m["kind"].as_str().unwrap()).collect();
        assert_eq!(kinds.first(), Some(&"Namespace"));
        assert_eq!(kinds.last(), Some(&"Stack"));
        assert!(kinds.contains(&"CustomResourceDefinition"));
        assert!(kinds.contains(&"PersistentVolumeClaim"));
        let pvc = plan
            .iter()
            .find(|m| m["kind"] == "PersistentVolumeClaim")
            .unwrap();
        assert_eq!(pvc["spec"]["accessModes"], json!(["ReadWriteOnce"]));
    }

    #[tokio::test]
    async fn status_after_install() {
        let cluster = FakeCluster::new();
        let b = bootstrapper(&cluster, sample());
        b.run().await.unwrap();

        let report = b.status().await.unwrap();
        assert!(report.operator_ready);
        assert_eq!(report.stack_state, "unknown");
        assert_eq!(
            report.deployments,
            vec![DeploymentStatus {
                namespace: "dataplane-system".into(),
                name: "dataplane-pulumi-controller-manager".into(),
                ready: 0,
                desired: 1,
            }]
        );
    }

    #[tokio::test]
    async fn status_absorbs_read_failures() {
        let cluster = FakeCluster::new();
        cluster.fail(Verb::List, "Deployment");
        cluster.fail(Verb::Get, "Stack");
        let report = bootstrapper(&cluster, sample()).status().await.unwrap();

        assert!(!report.operator_ready);
        assert!(report.deployments.is_empty());
        assert_eq!(report.stack_state, "unknown");
        assert!(report.to_string().contains("not ready"));
    }
}
