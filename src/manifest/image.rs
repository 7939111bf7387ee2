//! Image reference helpers

/// Prefix `image` with the private registry host.
///
/// References already pointing at the registry are returned unchanged, so
/// resolving twice is the same as resolving once.
///
/// # Examples
/// ```
/// use dataplane_installer::manifest::image::resolve_image;
///
/// assert_eq!(
///     resolve_image("pulumi/pulumi:3.147.0", Some("registry.example.com")),
///     "registry.example.com/pulumi/pulumi:3.147.0"
/// );
/// assert_eq!(resolve_image("pulumi/pulumi:3.147.0", None), "pulumi/pulumi:3.147.0");
/// ```
pub fn resolve_image(image: &str, registry: Option<&str>) -> String {
    match registry.map(|r| r.trim_end_matches('/')).filter(|r| !r.is_empty()) {
        Some(registry) if !image.starts_with(&format!("{}/", registry)) => {
            format!("{}/{}", registry, image)
        }
        _ => image.to_string(),
    }
}

/// Strip any tag and digest from an image reference.
///
/// A colon before the last `/` belongs to a registry port and is kept.
pub fn strip_tag(image: &str) -> &str {
    let without_digest = image.split_once('@').map_or(image, |(name, _)| name);
    let name_start = without_digest.rfind('/').map_or(0, |i| i + 1);
    match without_digest[name_start..].rfind(':') {
        Some(i) => &without_digest[..name_start + i],
        None => without_digest,
    }
}

/// Replace the tag (and drop any digest) of an image reference
pub fn with_tag(image: &str, tag: &str) -> String {
    format!("{}:{}", strip_tag(image), tag)
}
