//! Stack configuration Secret
//!
//! Every non-empty setting is stored under a `cn_` key. The Pulumi program
//! reads the keys back as configuration; the Stack resource references a
//! few of them directly as environment.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::{Configuration, S3Auth, ScmAuth};
use crate::manifest::secrets::opaque_secret;
use crate::manifest::StandardLabels;
use crate::{Result, CONFIG_SECRET_NAME};

/// Pulumi secrets passphrase
pub const KEY_PASSPHRASE: &str = "cn_pulumi_passphrase";
/// Generated `.npmrc`
pub const KEY_NPMRC: &str = "cn_npmrc";
/// Whether the S3 backend is used
pub const KEY_S3_ENABLED: &str = "cn_s3_enabled";
/// S3 access key id
pub const KEY_S3_ACCESS_KEY: &str = "cn_s3_access_key";
/// S3 secret key
pub const KEY_S3_SECRET_KEY: &str = "cn_s3_secret_key";
/// SCM username
pub const KEY_SCM_USERNAME: &str = "cn_scm_username";
/// SCM password
pub const KEY_SCM_PASSWORD: &str = "cn_scm_password";
/// SCM access token
pub const KEY_SCM_ACCESS_TOKEN: &str = "cn_scm_access_token";

/// Flatten the configuration into Secret entries, dropping empty values
pub fn config_entries(config: &Configuration) -> BTreeMap<String, String> {
    let k8s = &config.kubernetes;
    let registry = &config.container_registry;
    let mut entries: Vec<(&str, String)> = vec![
        ("cn_environment", config.environment.clone()),
        (KEY_PASSPHRASE, config.pulumi.passphrase.clone()),
        (KEY_NPMRC, config.npm_registry.npmrc()),
        ("cn_system_namespace", k8s.system_namespace().to_string()),
        ("cn_cni_namespace", k8s.cni_namespace().to_string()),
        (
            "cn_ci_pipelines_namespace",
            k8s.ci_pipelines_namespace().to_string(),
        ),
        (
            "cn_cni_namespace_dedicated",
            k8s.is_dedicated(k8s.cni_namespace()).to_string(),
        ),
        (
            "cn_ci_pipelines_namespace_dedicated",
            k8s.is_dedicated(k8s.ci_pipelines_namespace()).to_string(),
        ),
        ("cn_system_node_label_key", k8s.system_node_label.key.clone()),
        ("cn_system_node_label_value", k8s.system_node_label.value.clone()),
        (
            "cn_application_node_label_key",
            k8s.application_node_label.key.clone(),
        ),
        (
            "cn_application_node_label_value",
            k8s.application_node_label.value.clone(),
        ),
        ("cn_pod_placement_mode", k8s.pod_placement_mode.as_str().to_string()),
        ("cn_run_as_id", k8s.run_as_id.to_string()),
        (
            "cn_storage_class",
            k8s.storage_class.clone().unwrap_or_default(),
        ),
        ("cn_container_registry_hostname", registry.hostname.clone()),
        ("cn_container_registry_username", registry.username.clone()),
        ("cn_container_registry_password", registry.password.clone()),
        ("cn_scm_url", config.scm.url.clone()),
        ("cn_scm_branch", config.scm.branch.clone()),
        (
            "cn_scm_directory",
            config.scm.directory.clone().unwrap_or_default(),
        ),
        (KEY_S3_ENABLED, config.s3_enabled().to_string()),
        ("cn_custom_ca", config.custom_ca().unwrap_or_default().to_string()),
    ];

    match config.scm.auth() {
        Some(ScmAuth::Token(token)) => entries.push((KEY_SCM_ACCESS_TOKEN, token.to_string())),
        Some(ScmAuth::Basic { username, password }) => {
            entries.push((KEY_SCM_USERNAME, username.to_string()));
            entries.push((KEY_SCM_PASSWORD, password.to_string()));
        }
        None => {}
    }

    if let Some(proxy) = config.proxy() {
        entries.push((
            "cn_http_proxy_hostname",
            proxy.hostname.clone().unwrap_or_default(),
        ));
        entries.push((
            "cn_http_proxy_port",
            proxy.port.map(|p| p.to_string()).unwrap_or_default(),
        ));
        entries.push((
            "cn_http_proxy_no_proxy",
            proxy.no_proxy().unwrap_or_default().to_string(),
        ));
    }

    if let Some(s3) = &config.s3 {
        entries.push(("cn_s3_bucket", s3.bucket.clone()));
        entries.push(("cn_s3_region", s3.region.clone()));
        entries.push(("cn_s3_backend_url", s3.backend_url()));
        match s3.auth() {
            Some(S3Auth::AccessKey {
                access_key,
                secret_key,
            }) => {
                entries.push((KEY_S3_ACCESS_KEY, access_key.to_string()));
                entries.push((KEY_S3_SECRET_KEY, secret_key.to_string()));
            }
            Some(S3Auth::IamRole(role)) => entries.push(("cn_s3_iam_role", role.to_string())),
            None => {}
        }
    }

    if let Some(flux) = &config.flux {
        entries.push(("cn_flux_source_name", flux.source_name.clone()));
        entries.push(("cn_flux_source_kind", flux.source_kind.clone()));
        entries.push(("cn_flux_directory", flux.directory.clone()));
    }

    entries
        .into_iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// The configuration Secret in the system namespace
pub fn config_secret(config: &Configuration) -> Result<Value> {
    let mut secret = opaque_secret(
        config.kubernetes.system_namespace(),
        CONFIG_SECRET_NAME,
        &config_entries(config),
    );
    StandardLabels::new("stack-config")
        .with_instance(&config.environment)
        .apply(&mut secret)?;
    Ok(secret)
}
