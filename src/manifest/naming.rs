//! Deterministic names for imported template resources

/// Prefix of every operator resource created from templates
pub const OPERATOR_PREFIX: &str = "dataplane-pulumi-";

/// Prefix used by the upstream operator distribution
const UPSTREAM_PREFIX: &str = "pulumi-kubernetes-operator-";

/// Canonical name for a template-local resource name.
///
/// Any known prefix is stripped before ours is added, so repeated calls
/// converge on the same name.
///
/// # Examples
/// ```
/// use dataplane_installer::manifest::naming::prefixed;
///
/// assert_eq!(prefixed("controller-manager"), "dataplane-pulumi-controller-manager");
/// assert_eq!(prefixed(&prefixed("controller-manager")), prefixed("controller-manager"));
/// ```
pub fn prefixed(name: &str) -> String {
    let mut base = name;
    loop {
        let stripped = base
            .strip_prefix(OPERATOR_PREFIX)
            .or_else(|| base.strip_prefix(UPSTREAM_PREFIX));
        match stripped {
            Some(rest) if !rest.is_empty() => base = rest,
            _ => break,
        }
    }
    format!("{}{}", OPERATOR_PREFIX, base)
}
