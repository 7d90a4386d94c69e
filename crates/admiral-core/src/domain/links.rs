//! Document link helpers.
//!
//! A link is an absolute path such as `/resources/pools/hosts-aws-us-east-1a`.
//! The first segments name the factory, the last segment is the document id.

/// Join path parts into a single absolute link, collapsing duplicate slashes.
pub fn build_uri_path(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        for segment in part.split('/').filter(|s| !s.is_empty()) {
            out.push('/');
            out.push_str(segment);
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Last path segment of a link (the document id).
pub fn get_id(link: &str) -> &str {
    link.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(link)
}

/// Resolve the self link of a document created under `factory_link`.
///
/// - empty request: `factory_link/<generated id>`
/// - absolute request (`/...`): used as is
/// - relative request: appended to the factory link
pub fn normalize_self_link<F>(factory_link: &str, requested: &str, generate_id: F) -> String
where
    F: FnOnce() -> String,
{
    let requested = requested.trim();
    if requested.is_empty() {
        build_uri_path(&[factory_link, &generate_id()])
    } else if requested.starts_with('/') {
        build_uri_path(&[requested])
    } else {
        build_uri_path(&[factory_link, requested])
    }
}
