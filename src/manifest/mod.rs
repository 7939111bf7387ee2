//! Manifest mutation toolkit
//!
//! Templates are loaded as untyped trees and shaped by small, composable
//! mutations. Each mutation is a function of the manifest and the
//! configuration only, and is safe to run more than once.

pub mod image;
pub mod labels;
pub mod naming;
pub mod placement;
pub mod pod;
pub mod secrets;
pub mod templates;

pub use labels::StandardLabels;
pub use templates::TemplateSet;
