//! Node placement policy
//!
//! In node-selector mode placement is expressed once, as an annotation on
//! the namespace. In taint mode every pod carries a toleration and a
//! required node-affinity term for the same label.

use serde_json::{json, Value};

use crate::config::{NodeLabel, PodPlacementMode};
use crate::manifest::labels::annotate;
use crate::tree;
use crate::Result;

/// Namespace annotation read by the PodNodeSelector admission plugin
pub const NODE_SELECTOR_ANNOTATION: &str = "scheduler.alpha.kubernetes.io/node-selector";

/// Apply placement to a Namespace manifest
pub fn place_namespace(
    namespace: &mut Value,
    mode: PodPlacementMode,
    label: &NodeLabel,
) -> Result<()> {
    if mode == PodPlacementMode::NodeSelector {
        annotate(namespace, [(NODE_SELECTOR_ANNOTATION, label.selector())])?;
    }
    Ok(())
}

/// Apply placement to a pod spec
pub fn place_pod(pod_spec: &mut Value, mode: PodPlacementMode, label: &NodeLabel) -> Result<()> {
    if mode != PodPlacementMode::NodeSelectorAndTaint {
        return Ok(());
    }

    let toleration = json!({
        "key": label.key,
        "operator": "Equal",
        "value": label.value,
        "effect": "NoSchedule"
    });
    let tolerations = tree::ensure_array(pod_spec, "tolerations")?;
    if !tolerations.contains(&toleration) {
        tolerations.push(toleration);
    }

    let term = json!({
        "matchExpressions": [{
            "key": label.key,
            "operator": "In",
            "values": [label.value]
        }]
    });
    let terms = tree::ensure_array(
        pod_spec,
        "affinity.nodeAffinity.requiredDuringSchedulingIgnoredDuringExecution.nodeSelectorTerms",
    )?;
    if !terms.contains(&term) {
        terms.push(term);
    }
    Ok(())
}
