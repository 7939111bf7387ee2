//! Idempotent edits of pod specs
//!
//! Every helper here has "ensure" semantics keyed by name: running it
//! twice leaves exactly one entry, holding the most recent value.

use serde_json::{json, Value};

use crate::config::HttpProxy;
use crate::tree;
use crate::Result;

/// Insert `entry` into the array at `path`, replacing any entry with the
/// same `name`.
pub fn ensure_named(node: &mut Value, path: &str, entry: Value) -> Result<()> {
    let name = entry.get("name").cloned();
    let items = tree::ensure_array(node, path)?;
    match items
        .iter_mut()
        .find(|item| name.is_some() && item.get("name") == name.as_ref())
    {
        Some(existing) => *existing = entry,
        None => items.push(entry),
    }
    Ok(())
}

/// Ensure a literal environment variable on a container
pub fn ensure_env(container: &mut Value, name: &str, value: impl Into<String>) -> Result<()> {
    ensure_named(container, "env", json!({"name": name, "value": value.into()}))
}

/// Ensure an environment variable sourced from a Secret key
pub fn ensure_env_from_secret(
    container: &mut Value,
    name: &str,
    secret: &str,
    key: &str,
) -> Result<()> {
    ensure_named(
        container,
        "env",
        json!({
            "name": name,
            "valueFrom": {"secretKeyRef": {"name": secret, "key": key}}
        }),
    )
}

/// Ensure a volume on a pod spec
pub fn ensure_volume(pod_spec: &mut Value, volume: Value) -> Result<()> {
    ensure_named(pod_spec, "volumes", volume)
}

/// Ensure a volume mount on a container
pub fn ensure_mount(container: &mut Value, mount: Value) -> Result<()> {
    ensure_named(container, "volumeMounts", mount)
}

/// Ensure an image pull secret reference on a pod spec
pub fn ensure_pull_secret(pod_spec: &mut Value, secret: &str) -> Result<()> {
    ensure_named(pod_spec, "imagePullSecrets", json!({"name": secret}))
}

/// Every container and init container of a pod spec
pub fn containers_mut(pod_spec: &mut Value) -> impl Iterator<Item = &mut Value> {
    let mut out: Vec<&mut Value> = Vec::new();
    if let Some(spec) = pod_spec.as_object_mut() {
        for (key, list) in spec.iter_mut() {
            if key == "containers" || key == "initContainers" {
                if let Some(items) = list.as_array_mut() {
                    out.extend(items.iter_mut());
                }
            }
        }
    }
    out.into_iter()
}

/// Find a container (or init container) by name
pub fn container_mut<'a>(pod_spec: &'a mut Value, name: &str) -> Option<&'a mut Value> {
    containers_mut(pod_spec).find(|c| c.get("name").and_then(Value::as_str) == Some(name))
}

/// Ensure proxy environment on every container of a pod spec.
///
/// No-op unless the proxy has both host and port.
pub fn inject_proxy(pod_spec: &mut Value, proxy: &HttpProxy) -> Result<()> {
    let Some(endpoint) = proxy.endpoint() else {
        return Ok(());
    };
    for container in containers_mut(pod_spec) {
        ensure_env(container, "HTTP_PROXY", endpoint.as_str())?;
        ensure_env(container, "HTTPS_PROXY", endpoint.as_str())?;
        if let Some(no_proxy) = proxy.no_proxy() {
            ensure_env(container, "NO_PROXY", no_proxy)?;
        }
    }
    Ok(())
}

/// Volume carrying the projected service account token
pub const SA_TOKEN_VOLUME: &str = "service-account-token";
/// Where the service account token is mounted
pub const SA_TOKEN_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
/// Volume carrying the custom CA bundle
pub const CA_VOLUME: &str = "custom-ca";
/// Where the custom CA bundle is mounted
pub const CA_MOUNT_PATH: &str = "/etc/ssl/custom";

/// Mount a projected service account token into every container.
///
/// Used with `automountServiceAccountToken: false` so the token, CA and
/// namespace files appear at the usual path.
pub fn inject_service_account_token(pod_spec: &mut Value) -> Result<()> {
    ensure_volume(
        pod_spec,
        json!({
            "name": SA_TOKEN_VOLUME,
            "projected": {
                "defaultMode": 0o444,
                "sources": [
                    {"serviceAccountToken": {"path": "token", "expirationSeconds": 3607}},
                    {"configMap": {
                        "name": "kube-root-ca.crt",
                        "items": [{"key": "ca.crt", "path": "ca.crt"}]
                    }},
                    {"downwardAPI": {"items": [{
                        "path": "namespace",
                        "fieldRef": {"apiVersion": "v1", "fieldPath": "metadata.namespace"}
                    }]}}
                ]
            }
        }),
    )?;
    for container in containers_mut(pod_spec) {
        ensure_mount(
            container,
            json!({"name": SA_TOKEN_VOLUME, "mountPath": SA_TOKEN_MOUNT_PATH, "readOnly": true}),
        )?;
    }
    Ok(())
}

/// Mount the custom CA Secret into every container and point TLS clients
/// at it.
pub fn inject_custom_ca(pod_spec: &mut Value, secret: &str, key: &str) -> Result<()> {
    ensure_volume(
        pod_spec,
        json!({"name": CA_VOLUME, "secret": {"secretName": secret}}),
    )?;
    let bundle = format!("{}/{}", CA_MOUNT_PATH, key);
    for container in containers_mut(pod_spec) {
        ensure_mount(
            container,
            json!({"name": CA_VOLUME, "mountPath": CA_MOUNT_PATH, "readOnly": true}),
        )?;
        ensure_env(container, "SSL_CERT_FILE", bundle.as_str())?;
        ensure_env(container, "NODE_EXTRA_CA_CERTS", bundle.as_str())?;
        ensure_env(container, "GIT_SSL_CAINFO", bundle.as_str())?;
    }
    Ok(())
}

/// Run-as security context for a pod
pub fn set_run_as(pod_spec: &mut Value, id: i64) -> Result<()> {
    let ctx = tree::ensure_object(pod_spec, "securityContext")?;
    ctx.insert("runAsUser".to_string(), json!(id));
    ctx.insert("runAsGroup".to_string(), json!(id));
    ctx.insert("fsGroup".to_string(), json!(id));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod() -> Value {
        json!({
            "initContainers": [{"name": "fetch"}],
            "containers": [{"name": "main", "env": [{"name": "KEEP", "value": "1"}]}]
        })
    }

    fn names(list: &Value) -> Vec<&str> {
        list.as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect()
    }

    #[test]
    fn proxy_injection_twice_yields_one_entry_per_name() {
        let proxy = HttpProxy {
            hostname: Some("proxy.local".into()),
            port: Some(3128),
            no_proxy: Some("10.0.0.0/8,.svc".into()),
        };
        let mut spec = pod();
        inject_proxy(&mut spec, &proxy).unwrap();
        inject_proxy(&mut spec, &proxy).unwrap();

        let env = &spec["containers"][0]["env"];
        assert_eq!(names(env), vec!["KEEP", "HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"]);
        assert_eq!(env[1]["value"], "proxy.local:3128");
        assert_eq!(names(&spec["initContainers"][0]["env"]).len(), 3);
    }

    #[test]
    fn proxy_without_port_is_ignored() {
        let proxy = HttpProxy {
            hostname: Some("proxy.local".into()),
            ..Default::default()
        };
        let mut spec = pod();
        inject_proxy(&mut spec, &proxy).unwrap();
        assert_eq!(spec, pod());
    }

    #[test]
    fn proxy_without_no_proxy_skips_that_entry() {
        let proxy = HttpProxy {
            hostname: Some("proxy.local".into()),
            port: Some(8080),
            no_proxy: None,
        };
        let mut spec = pod();
        inject_proxy(&mut spec, &proxy).unwrap();
        assert_eq!(
            names(&spec["containers"][0]["env"]),
            vec!["KEEP", "HTTP_PROXY", "HTTPS_PROXY"]
        );
    }

    #[test]
    fn volume_and_mount_ensured_once() {
        let mut spec = pod();
        for _ in 0..2 {
            ensure_volume(
                &mut spec,
                json!({"name": "ca", "secret": {"secretName": "ca"}}),
            )
            .unwrap();
            let c = container_mut(&mut spec, "main").unwrap();
            ensure_mount(c, json!({"name": "ca", "mountPath": "/etc/ca"})).unwrap();
        }
        assert_eq!(spec["volumes"].as_array().unwrap().len(), 1);
        assert_eq!(spec["containers"][0]["volumeMounts"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn ensure_replaces_same_name_with_new_value() {
        let mut container = json!({"name": "c"});
        ensure_env(&mut container, "A", "1").unwrap();
        ensure_env(&mut container, "A", "2").unwrap();
        assert_eq!(container["env"], json!([{"name": "A", "value": "2"}]));
    }

    #[test]
    fn finds_init_containers_by_name() {
        let mut spec = pod();
        assert!(container_mut(&mut spec, "fetch").is_some());
        assert!(container_mut(&mut spec, "missing").is_none());
    }

    #[test]
    fn token_and_ca_mounts_reach_every_container() {
        let mut spec = pod();
        inject_service_account_token(&mut spec).unwrap();
        inject_custom_ca(&mut spec, "ca", "ca.crt").unwrap();
        inject_custom_ca(&mut spec, "ca", "ca.crt").unwrap();

        assert_eq!(names(&spec["volumes"]), vec![SA_TOKEN_VOLUME, CA_VOLUME]);
        for container in containers_mut(&mut spec) {
            assert_eq!(names(&container["volumeMounts"]), vec![SA_TOKEN_VOLUME, CA_VOLUME]);
            let env = &container["env"];
            let ssl = env
                .as_array()
                .unwrap()
                .iter()
                .find(|e| e["name"] == "SSL_CERT_FILE")
                .unwrap();
            assert_eq!(ssl["value"], "/etc/ssl/custom/ca.crt");
        }
    }

    #[test]
    fn run_as_sets_user_group_and_fs_group() {
        let mut spec = json!({"securityContext": {"runAsNonRoot": true}});
        set_run_as(&mut spec, 1001).unwrap();
        assert_eq!(
            spec["securityContext"],
            json!({"runAsNonRoot": true, "runAsUser": 1001, "runAsGroup": 1001, "fsGroup": 1001})
        );
    }
}
