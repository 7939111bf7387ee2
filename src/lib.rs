//! Data-plane installer - provisions the Pulumi Kubernetes Operator and the
//! workload stack it manages
//!
//! One typed [`config::Configuration`] drives a provisioning run that
//! creates namespaces, installs the operator from packaged templates, waits
//! for it to become ready and then hands it the stack custom resource.
//! Every write is idempotent by resource identity, so a failed run is
//! recovered by running it again.
//!
//! # Modules
//!
//! - [`bootstrap`] - Orchestrator sequencing the provisioning tasks
//! - [`graph`] - Dependency-ordered task executor
//! - [`namespace`] - Namespaces and their image pull secrets
//! - [`operator`] - Operator CRDs, RBAC, Deployment and Service
//! - [`stack`] - Stack RBAC, configuration Secret, state PVC and custom resource
//! - [`manifest`] - Template loading and manifest mutations
//! - [`tree`] - Path-addressable editing of manifest trees
//! - [`yaml`] - Multi-document YAML parsing
//! - [`apply`] - Idempotent resource writes
//! - [`kinds`] - Per-kind scope and write strategy
//! - [`retry`] - Bounded retry for reads
//! - [`readiness`] - Deployment readiness polling
//! - [`kube_api`] - Cluster API trait and kube-rs adapter
//! - [`config`] - Installer configuration
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types

#![warn(missing_docs)]

pub mod apply;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod graph;
pub mod kinds;
pub mod kube_api;
pub mod manifest;
pub mod namespace;
pub mod operator;
pub mod readiness;
pub mod retry;
pub mod stack;
pub mod telemetry;
pub mod tree;
pub mod yaml;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Resource naming constants
// =============================================================================
// Names are fixed so that every run against the same configuration addresses
// the same objects.

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "dataplane-installer";

/// Value of the `app.kubernetes.io/managed-by` label
pub const MANAGED_BY: &str = "dataplane-installer";

/// Value of the `app.kubernetes.io/part-of` label
pub const PART_OF: &str = "dataplane";

/// Image pull secret created in every provisioned namespace
pub const PULL_SECRET_NAME: &str = "registry-credentials";

/// Secret holding the stack configuration
pub const CONFIG_SECRET_NAME: &str = "dataplane-config";

/// Secret holding the custom CA bundle
pub const CA_SECRET_NAME: &str = "dataplane-custom-ca";

/// Key of the CA bundle inside [`CA_SECRET_NAME`]
pub const CA_SECRET_KEY: &str = "ca.crt";

/// PersistentVolumeClaim holding local Pulumi state
pub const STATE_PVC_NAME: &str = "dataplane-state";

/// Name of the Stack custom resource
pub const STACK_NAME: &str = "dataplane";

/// ServiceAccount the stack workspace runs as
pub const STACK_SERVICE_ACCOUNT: &str = "dataplane-stack";
