//! Path utility functions
//!
//! Common path manipulation helpers used across the application.

use std::path::{Path, PathBuf};

/// Last path segment of a URL, without query string or fragment
pub fn file_name_from_url(url: &str) -> Option<&str> {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    without_query
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && !name.contains(':'))
}

/// Path of the in-progress file for `path` (`<name>.part`)
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(crate::config::download::PART_SUFFIX);
    PathBuf::from(name)
}

/// Whether `path` lies inside `dir`. Both are compared lexically after
/// canonicalizing whatever exists.
pub fn is_within(dir: &Path, path: &Path) -> bool {
    let dir = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let path = match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .unwrap_or_else(|_| parent.to_path_buf())
            .join(name),
        _ => path.to_path_buf(),
    };
    path != dir && path.starts_with(&dir)
}
