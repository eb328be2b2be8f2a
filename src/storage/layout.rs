//! Mapping between logical paths and object keys.
//!
//! A logical path `P` is stored as the content object `data/P` with sidecars
//! under `meta/P/`. Both namespaces live below the configured bucket prefix.
//! The raw object key never leaks out of the storage layer.

pub const DATA_NAMESPACE: &str = "data";
pub const META_NAMESPACE: &str = "meta";

/// Collapses repeated slashes and trims leading/trailing ones, so `a//b` and
/// `/a/b/` both name the logical path `a/b`.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn join_segments(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|segment| normalize_path(segment))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone)]
pub struct KeyLayout {
    root: String,
}

impl KeyLayout {
    pub fn new(root_prefix: &str) -> Self {
        Self {
            root: normalize_path(root_prefix),
        }
    }

    /// Content object key for logical path `path`.
    pub fn data_key(&self, path: &str) -> String {
        join_segments(&[&self.root, DATA_NAMESPACE, path])
    }

    /// Listing prefix covering everything under logical path `path`. An empty
    /// path means the whole data namespace.
    pub fn data_prefix(&self, path: &str) -> String {
        let joined = join_segments(&[&self.root, DATA_NAMESPACE, path]);
        format!("{joined}/")
    }

    /// Sidecar object key for `path` and sidecar name `name`.
    pub fn meta_key(&self, path: &str, name: &str) -> String {
        join_segments(&[&self.root, META_NAMESPACE, path, name])
    }

    /// Listing prefix covering every sidecar of `path`.
    pub fn meta_prefix(&self, path: &str) -> String {
        let joined = join_segments(&[&self.root, META_NAMESPACE, path]);
        format!("{joined}/")
    }

    /// Recovers the logical path from a content object key. Returns `None`
    /// for keys outside the data namespace.
    pub fn logical_path_from_data_key(&self, key: &str) -> Option<String> {
        let normalized = normalize_path(key);
        let namespace_prefix = if self.root.is_empty() {
            format!("{DATA_NAMESPACE}/")
        } else {
            format!("{}/{DATA_NAMESPACE}/", self.root)
        };

        normalized
            .strip_prefix(&namespace_prefix)
            .map(|path| path.to_string())
    }
}
