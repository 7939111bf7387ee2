//! Secret manifests shared by several provisioners

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};

use crate::config::ContainerRegistry;

/// `.dockerconfigjson` payload for a registry
pub fn docker_config_json(registry: &ContainerRegistry) -> String {
    let auth = STANDARD.encode(format!("{}:{}", registry.username, registry.password));
    let mut auths = serde_json::Map::new();
    auths.insert(
        registry.hostname.clone(),
        json!({
            "username": registry.username,
            "password": registry.password,
            "auth": auth
        }),
    );
    json!({ "auths": auths }).to_string()
}

/// Image pull secret for a namespace
pub fn pull_secret(namespace: &str, name: &str, registry: &ContainerRegistry) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": name, "namespace": namespace},
        "type": "kubernetes.io/dockerconfigjson",
        "data": {".dockerconfigjson": STANDARD.encode(docker_config_json(registry))}
    })
}

/// Opaque secret from string entries; values are base64-encoded into `data`
pub fn opaque_secret(namespace: &str, name: &str, entries: &BTreeMap<String, String>) -> Value {
    let data: serde_json::Map<String, Value> = entries
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(STANDARD.encode(v))))
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": name, "namespace": namespace},
        "type": "Opaque",
        "data": data
    })
}

/// Decode one key of a Secret's `data`, for inspection and tests
pub fn decode_data(secret: &Value, key: &str) -> Option<String> {
    let encoded = secret.get("data")?.get(key)?.as_str()?;
    let bytes = STANDARD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}
