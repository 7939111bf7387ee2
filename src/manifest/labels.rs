//! Standard labels and annotations

use serde_json::Value;

use crate::tree;
use crate::{Result, MANAGED_BY, PART_OF};

/// `app.kubernetes.io/name`
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
/// `app.kubernetes.io/managed-by`
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// `app.kubernetes.io/part-of`
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";
/// `app.kubernetes.io/version`
pub const LABEL_VERSION: &str = "app.kubernetes.io/version";
/// `app.kubernetes.io/instance`
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

/// Selector matching everything this installer manages
pub fn managed_selector() -> String {
    format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY)
}

/// Label set stamped onto every managed resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StandardLabels {
    /// Component name
    pub name: String,
    /// Component version
    pub version: Option<String>,
    /// Installation instance (the environment)
    pub instance: Option<String>,
}

impl StandardLabels {
    /// Labels for a component
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            instance: None,
        }
    }

    /// Set the version label
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set the instance label
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Key/value pairs in a stable order
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (LABEL_NAME, self.name.clone()),
            (LABEL_MANAGED_BY, MANAGED_BY.to_string()),
            (LABEL_PART_OF, PART_OF.to_string()),
        ];
        if let Some(version) = &self.version {
            pairs.push((LABEL_VERSION, version.clone()));
        }
        if let Some(instance) = &self.instance {
            pairs.push((LABEL_INSTANCE, instance.clone()));
        }
        pairs
    }

    /// Merge into `metadata.labels`, keeping unrelated keys
    pub fn apply(&self, manifest: &mut Value) -> Result<()> {
        merge_map(manifest, "metadata.labels", self.pairs())
    }
}

/// Merge annotations into `metadata.annotations`, keeping unrelated keys
pub fn annotate<K, V>(
    manifest: &mut Value,
    annotations: impl IntoIterator<Item = (K, V)>,
) -> Result<()>
where
    K: Into<String>,
    V: Into<String>,
{
    merge_map(manifest, "metadata.annotations", annotations)
}

fn merge_map<K, V>(
    manifest: &mut Value,
    path: &str,
    entries: impl IntoIterator<Item = (K, V)>,
) -> Result<()>
where
    K: Into<String>,
    V: Into<String>,
{
    let map = tree::ensure_object(manifest, path)?;
    for (k, v) in entries {
        map.insert(k.into(), Value::String(v.into()));
    }
    Ok(())
}
