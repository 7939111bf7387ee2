//! Packaged manifest templates
//!
//! Templates are compiled into the binary and addressed by logical path.
//! An explicit override directory wins over the packaged copy; directories
//! on disk are consulted last, for logical paths that are not packaged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde_json::Value;
use tracing::debug;

use crate::yaml::parse_documents;
use crate::{Error, Result};

/// Operator CRDs
pub const OPERATOR_CRDS: &str = "operator/crds.yaml";
/// Operator ServiceAccount and RBAC
pub const OPERATOR_RBAC: &str = "operator/rbac.yaml";
/// Operator Deployment
pub const OPERATOR_DEPLOYMENT: &str = "operator/deployment.yaml";
/// Operator Service
pub const OPERATOR_SERVICE: &str = "operator/service.yaml";

/// Directory searched on disk when no explicit fallback is configured
pub const DEFAULT_TEMPLATE_DIR: &str = "templates";

static PACKAGED: LazyLock<BTreeMap<&'static str, &'static str>> = LazyLock::new(|| {
    BTreeMap::from([
        (
            OPERATOR_CRDS,
            include_str!("../../templates/operator/crds.yaml"),
        ),
        (
            OPERATOR_RBAC,
            include_str!("../../templates/operator/rbac.yaml"),
        ),
        (
            OPERATOR_DEPLOYMENT,
            include_str!("../../templates/operator/deployment.yaml"),
        ),
        (
            OPERATOR_SERVICE,
            include_str!("../../templates/operator/service.yaml"),
        ),
    ])
});

/// Where template documents are looked up
#[derive(Clone, Debug)]
pub struct TemplateSet {
    override_dir: Option<PathBuf>,
    fallback_dirs: Vec<PathBuf>,
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self {
            override_dir: None,
            fallback_dirs: vec![PathBuf::from(DEFAULT_TEMPLATE_DIR)],
        }
    }
}

impl TemplateSet {
    /// Packaged templates with the default on-disk fallback
    pub fn packaged() -> Self {
        Self::default()
    }

    /// Prefer files in `dir` over the packaged copies
    pub fn with_override_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.override_dir = Some(dir.into());
        self
    }

    /// Replace the on-disk fallback directories
    pub fn with_fallback_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.fallback_dirs = dirs;
        self
    }

    /// Logical paths of every packaged template
    pub fn packaged_names() -> impl Iterator<Item = &'static str> {
        PACKAGED.keys().copied()
    }

    /// Raw template text for a logical path
    pub fn source(&self, logical: &str) -> Result<String> {
        let mut tried = Vec::new();

        if let Some(dir) = &self.override_dir {
            if let Some(text) = read_from(dir, logical, &mut tried)? {
                return Ok(text);
            }
        }

        tried.push(format!("packaged:{}", logical));
        if let Some(text) = PACKAGED.get(logical) {
            return Ok((*text).to_string());
        }

        for dir in &self.fallback_dirs {
            if let Some(text) = read_from(dir, logical, &mut tried)? {
                return Ok(text);
            }
        }

        Err(Error::template(
            logical,
            format!("not found; tried {}", tried.join(", ")),
        ))
    }

    /// Parse every document of a template into a manifest tree
    pub fn load(&self, logical: &str) -> Result<Vec<Value>> {
        let text = self.source(logical)?;
        let docs =
            parse_documents(&text).map_err(|e| Error::template(logical, e.to_string()))?;
        for (index, doc) in docs.iter().enumerate() {
            if !doc.is_object() {
                return Err(Error::template(
                    logical,
                    format!("document {} is not a mapping", index),
                ));
            }
        }
        Ok(docs)
    }

    /// Load a template expected to hold exactly one document
    pub fn load_one(&self, logical: &str) -> Result<Value> {
        let mut docs = self.load(logical)?;
        if docs.len() != 1 {
            return Err(Error::template(
                logical,
                format!("expected one document, found {}", docs.len()),
            ));
        }
        Ok(docs.remove(0))
    }
}

fn read_from(dir: &Path, logical: &str, tried: &mut Vec<String>) -> Result<Option<String>> {
    let path = dir.join(logical);
    tried.push(path.display().to_string());
    if !path.is_file() {
        return Ok(None);
    }
    debug!(path = %path.display(), "loading template from disk");
    std::fs::read_to_string(&path)
        .map(Some)
        .map_err(|e| Error::template(logical, format!("failed to read {}: {}", path.display(), e)))
}
