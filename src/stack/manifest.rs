//! Stack custom resource and state volume manifests

use serde_json::{json, Value};

use crate::config::{Configuration, S3Auth, ScmAuth};
use crate::manifest::image::resolve_image;
use crate::manifest::placement::place_pod;
use crate::manifest::pod::{
    container_mut, ensure_env, ensure_env_from_secret, ensure_mount, ensure_pull_secret,
    ensure_volume, inject_custom_ca, inject_proxy,
};
use crate::manifest::StandardLabels;
use crate::stack::secret::{
    KEY_NPMRC, KEY_PASSPHRASE, KEY_S3_ACCESS_KEY, KEY_S3_SECRET_KEY, KEY_SCM_ACCESS_TOKEN,
    KEY_SCM_PASSWORD, KEY_SCM_USERNAME,
};
use crate::tree;
use crate::{
    Result, CA_SECRET_KEY, CA_SECRET_NAME, CONFIG_SECRET_NAME, PULL_SECRET_NAME, STACK_NAME,
    STACK_SERVICE_ACCOUNT, STATE_PVC_NAME,
};

/// Stack API version
pub const STACK_API_VERSION: &str = "pulumi.com/v1";

/// Backend used when state lives on the local volume
pub const LOCAL_BACKEND: &str = "file:///state";

const HOME_DIR: &str = "/home/pulumi";
const STATE_DIR: &str = "/state";
const POD_SPEC: &str = "spec.workspaceTemplate.spec.podTemplate.spec";

/// Which shared volumes a workspace container mounts
struct ContainerRole {
    name: &'static str,
    home: bool,
    npmrc: bool,
    state: bool,
    registry_auth: bool,
}

/// Workspace containers in execution order; the first three are init steps
const CONTAINER_ROLES: [ContainerRole; 4] = [
    ContainerRole {
        name: "bootstrap",
        home: false,
        npmrc: false,
        state: false,
        registry_auth: false,
    },
    ContainerRole {
        name: "fetch",
        home: true,
        npmrc: false,
        state: false,
        registry_auth: false,
    },
    ContainerRole {
        name: "install-plugins",
        home: true,
        npmrc: true,
        state: true,
        registry_auth: true,
    },
    ContainerRole {
        name: "pulumi",
        home: true,
        npmrc: true,
        state: true,
        registry_auth: true,
    },
];

fn secret_ref(key: &str) -> Value {
    json!({"type": "Secret", "secret": {"name": CONFIG_SECRET_NAME, "key": key}})
}

/// Persistent volume claim for local state; `None` when S3 holds state
pub fn state_pvc(config: &Configuration) -> Result<Option<Value>> {
    if config.s3_enabled() {
        return Ok(None);
    }
    let mut pvc = json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": STATE_PVC_NAME,
            "namespace": config.kubernetes.system_namespace()
        },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": {"requests": {"storage": config.pulumi.state_storage_size}}
        }
    });
    if let Some(class) = config
        .kubernetes
        .storage_class
        .as_deref()
        .filter(|c| !c.trim().is_empty())
    {
        tree::set(&mut pvc, "spec.storageClassName", json!(class))?;
    }
    StandardLabels::new("stack-state")
        .with_instance(&config.environment)
        .apply(&mut pvc)?;
    Ok(Some(pvc))
}

/// The Stack custom resource
pub fn stack_resource(config: &Configuration) -> Result<Value> {
    let namespace = config.kubernetes.system_namespace();
    let image = resolve_image(
        &config.pulumi.runtime_image,
        config.container_registry.image_prefix(),
    );

    let mut stack = json!({
        "apiVersion": STACK_API_VERSION,
        "kind": "Stack",
        "metadata": {"name": STACK_NAME, "namespace": namespace},
        "spec": {
            "serviceAccountName": STACK_SERVICE_ACCOUNT,
            "stack": config.environment,
            "refresh": true,
            "resyncFrequencySeconds": 300,
            "destroyOnFinalize": false,
            "workspaceTemplate": {
                "spec": {
                    "image": image,
                    "serviceAccountName": STACK_SERVICE_ACCOUNT,
                    "resources": {
                        "requests": {"cpu": "500m", "memory": "1Gi"},
                        "limits": {"memory": "2Gi"}
                    },
                    "podTemplate": {
                        "spec": {
                            "initContainers": [
                                {"name": "bootstrap"},
                                {"name": "fetch"},
                                {
                                    "name": "install-plugins",
                                    "image": image,
                                    "command": ["pulumi", "install"],
                                    "workingDir": format!("{}/src", HOME_DIR)
                                }
                            ],
                            "containers": [{"name": "pulumi"}]
                        }
                    }
                }
            }
        }
    });
    StandardLabels::new("stack")
        .with_instance(&config.environment)
        .apply(&mut stack)?;

    set_source(&mut stack, config)?;
    set_backend(&mut stack, config)?;
    configure_pod(&mut stack, config)?;
    Ok(stack)
}

fn set_source(stack: &mut Value, config: &Configuration) -> Result<()> {
    let spec = tree::ensure_object(stack, "spec")?;

    if let Some(flux) = &config.flux {
        for field in ["projectRepo", "branch", "repoDir", "gitAuth"] {
            spec.remove(field);
        }
        spec.insert(
            "fluxSource".to_string(),
            json!({
                "sourceRef": {
                    "apiVersion": flux.source_api_version,
                    "kind": flux.source_kind,
                    "name": flux.source_name
                },
                "dir": flux.directory
            }),
        );
        return Ok(());
    }

    spec.remove("fluxSource");
    spec.insert("projectRepo".to_string(), json!(config.scm.url));
    spec.insert("branch".to_string(), json!(config.scm.branch));
    if let Some(dir) = config.scm.directory.as_deref().filter(|d| !d.is_empty()) {
        spec.insert("repoDir".to_string(), json!(dir));
    }

    let auth = match config.scm.auth() {
        Some(ScmAuth::Token(_)) => json!({"accessToken": secret_ref(KEY_SCM_ACCESS_TOKEN)}),
        Some(ScmAuth::Basic { .. }) => json!({
            "basicAuth": {
                "userName": secret_ref(KEY_SCM_USERNAME),
                "password": secret_ref(KEY_SCM_PASSWORD)
            }
        }),
        None => return Ok(()),
    };
    spec.insert("gitAuth".to_string(), auth);
    Ok(())
}

fn set_backend(stack: &mut Value, config: &Configuration) -> Result<()> {
    let backend = config
        .s3
        .as_ref()
        .map(|s3| s3.backend_url())
        .unwrap_or_else(|| LOCAL_BACKEND.to_string());
    tree::set(stack, "spec.backend", json!(backend))?;

    tree::set(
        stack,
        "spec.envRefs.PULUMI_CONFIG_PASSPHRASE",
        secret_ref(KEY_PASSPHRASE),
    )?;
    if let Some(S3Auth::AccessKey { .. }) = config.s3.as_ref().and_then(|s3| s3.auth()) {
        tree::set(stack, "spec.envRefs.AWS_ACCESS_KEY_ID", secret_ref(KEY_S3_ACCESS_KEY))?;
        tree::set(
            stack,
            "spec.envRefs.AWS_SECRET_ACCESS_KEY",
            secret_ref(KEY_S3_SECRET_KEY),
        )?;
    }
    if let Some(s3) = &config.s3 {
        tree::set(
            stack,
            "spec.envRefs.AWS_REGION",
            json!({"type": "Literal", "literal": s3.region}),
        )?;
    }
    Ok(())
}

fn configure_pod(stack: &mut Value, config: &Configuration) -> Result<()> {
    let use_state_volume = !config.s3_enabled();
    let pod = tree::object_node(stack, POD_SPEC)?;

    ensure_pull_secret(pod, PULL_SECRET_NAME)?;
    place_pod(
        pod,
        config.kubernetes.pod_placement_mode,
        &config.kubernetes.system_node_label,
    )?;

    ensure_volume(pod, json!({"name": "tmp", "emptyDir": {}}))?;
    ensure_volume(pod, json!({"name": "home", "emptyDir": {}}))?;
    ensure_volume(
        pod,
        json!({
            "name": "npmrc",
            "secret": {
                "secretName": CONFIG_SECRET_NAME,
                "items": [{"key": KEY_NPMRC, "path": ".npmrc"}]
            }
        }),
    )?;
    ensure_volume(
        pod,
        json!({
            "name": "registry-auth",
            "secret": {
                "secretName": PULL_SECRET_NAME,
                "items": [{"key": ".dockerconfigjson", "path": "config.json"}]
            }
        }),
    )?;
    if use_state_volume {
        ensure_volume(
            pod,
            json!({"name": "state", "persistentVolumeClaim": {"claimName": STATE_PVC_NAME}}),
        )?;
    }

    for role in &CONTAINER_ROLES {
        let Some(container) = container_mut(pod, role.name) else {
            continue;
        };
        ensure_mount(container, json!({"name": "tmp", "mountPath": "/tmp"}))?;
        if role.home {
            ensure_mount(container, json!({"name": "home", "mountPath": HOME_DIR}))?;
            ensure_env(container, "HOME", HOME_DIR)?;
        }
        if role.npmrc {
            ensure_mount(
                container,
                json!({
                    "name": "npmrc",
                    "mountPath": format!("{}/.npmrc", HOME_DIR),
                    "subPath": ".npmrc",
                    "readOnly": true
                }),
            )?;
            ensure_env(container, "NPM_CONFIG_USERCONFIG", format!("{}/.npmrc", HOME_DIR))?;
        }
        if role.state && use_state_volume {
            ensure_mount(container, json!({"name": "state", "mountPath": STATE_DIR}))?;
        }
        if role.registry_auth {
            ensure_mount(
                container,
                json!({"name": "registry-auth", "mountPath": "/etc/docker-auth", "readOnly": true}),
            )?;
            ensure_env(container, "DOCKER_CONFIG", "/etc/docker-auth")?;
        }
        if role.name == "pulumi" {
            ensure_env_from_secret(
                container,
                "PULUMI_CONFIG_PASSPHRASE",
                CONFIG_SECRET_NAME,
                KEY_PASSPHRASE,
            )?;
        }
    }

    if config.custom_ca().is_some() {
        inject_custom_ca(pod, CA_SECRET_NAME, CA_SECRET_KEY)?;
    }
    if let Some(proxy) = config.proxy() {
        inject_proxy(pod, proxy)?;
    }
    Ok(())
}
