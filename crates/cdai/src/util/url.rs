/// Directory portion of a manifest URL, used to synthesize a Period-level
/// BaseURL for ad manifests that omit one.
pub(crate) fn directory_path(url: &str) -> String {
    match url.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/"),
        None => url.to_string(),
    }
}
