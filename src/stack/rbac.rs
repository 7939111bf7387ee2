//! RBAC for the stack workspace
//!
//! The workspace deploys the data plane, so it gets cluster-wide admin for
//! cluster-scoped objects plus an admin Role in every target namespace.

use serde_json::{json, Value};

use crate::config::{Configuration, S3Auth};
use crate::manifest::StandardLabels;
use crate::{Result, STACK_SERVICE_ACCOUNT};

/// Annotation binding a service account to an AWS IAM role
pub const IAM_ROLE_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

/// Namespace holding the control-plane leader-election roles
pub const KUBE_SYSTEM: &str = "kube-system";

/// Roles and bindings in kube-system the workspace may read
pub const LEADER_LOCKING_OBJECTS: [&str; 2] = [
    "system::leader-locking-kube-controller-manager",
    "system::leader-locking-kube-scheduler",
];

const RBAC_API: &str = "rbac.authorization.k8s.io/v1";
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

const AUTH_DELEGATOR_BINDING: &str = "dataplane-stack-auth-delegator";
const ADMIN: &str = "dataplane-stack-admin";
const LEADER_LOCKING_READER: &str = "dataplane-stack-leader-locking-reader";

fn subject(namespace: &str) -> Value {
    json!([{"kind": "ServiceAccount", "name": STACK_SERVICE_ACCOUNT, "namespace": namespace}])
}

fn binding(
    kind: &str,
    name: &str,
    namespace: Option<&str>,
    role_kind: &str,
    role: &str,
    sa_namespace: &str,
) -> Value {
    let mut metadata = json!({"name": name});
    if let Some(ns) = namespace {
        metadata["namespace"] = json!(ns);
    }
    json!({
        "apiVersion": RBAC_API,
        "kind": kind,
        "metadata": metadata,
        "roleRef": {"apiGroup": RBAC_GROUP, "kind": role_kind, "name": role},
        "subjects": subject(sa_namespace)
    })
}

fn admin_rules() -> Value {
    json!([{"apiGroups": ["*"], "resources": ["*"], "verbs": ["*"]}])
}

/// Stack RBAC manifests, granting admin in each of `target_namespaces`
pub fn rbac_manifests(config: &Configuration, target_namespaces: &[String]) -> Result<Vec<Value>> {
    let namespace = config.kubernetes.system_namespace();

    let mut service_account = json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": {"name": STACK_SERVICE_ACCOUNT, "namespace": namespace}
    });
    if let Some(S3Auth::IamRole(role)) = config.s3.as_ref().and_then(|s3| s3.auth()) {
        service_account["metadata"]["annotations"] = json!({IAM_ROLE_ANNOTATION: role});
    }

    let mut manifests = vec![
        service_account,
        binding(
            "ClusterRoleBinding",
            AUTH_DELEGATOR_BINDING,
            None,
            "ClusterRole",
            "system:auth-delegator",
            namespace,
        ),
        json!({
            "apiVersion": RBAC_API,
            "kind": "ClusterRole",
            "metadata": {"name": ADMIN},
            "rules": admin_rules()
        }),
        binding("ClusterRoleBinding", ADMIN, None, "ClusterRole", ADMIN, namespace),
        json!({
            "apiVersion": RBAC_API,
            "kind": "Role",
            "metadata": {"name": LEADER_LOCKING_READER, "namespace": KUBE_SYSTEM},
            "rules": [{
                "apiGroups": [RBAC_GROUP],
                "resources": ["roles", "rolebindings"],
                "resourceNames": LEADER_LOCKING_OBJECTS,
                "verbs": ["get", "list", "watch"]
            }]
        }),
        binding(
            "RoleBinding",
            LEADER_LOCKING_READER,
            Some(KUBE_SYSTEM),
            "Role",
            LEADER_LOCKING_READER,
            namespace,
        ),
    ];

    for target in target_namespaces {
        manifests.push(json!({
            "apiVersion": RBAC_API,
            "kind": "Role",
            "metadata": {"name": ADMIN, "namespace": target},
            "rules": admin_rules()
        }));
        manifests.push(binding("RoleBinding", ADMIN, Some(target), "Role", ADMIN, namespace));
    }

    let labels = StandardLabels::new("stack-rbac").with_instance(&config.environment);
    for manifest in &mut manifests {
        labels.apply(manifest)?;
    }
    Ok(manifests)
}
