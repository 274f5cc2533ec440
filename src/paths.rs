//! Remote path handling. All remote paths are POSIX; `/` is the only
//! separator regardless of the local platform.

/// Collapse duplicate slashes and trailing slashes. `"/"` stays `"/"`,
/// a relative input stays relative.
pub fn normalize_remote_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
    if parts.is_empty() {
        return if absolute { "/".to_string() } else { String::new() };
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Join a child name onto a remote directory path.
pub fn join_remote_path(base: &str, name: &str) -> String {
    let base = normalize_remote_path(base);
    let name = name.trim_start_matches('/');
    if base == "/" || base.is_empty() {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Final component of a remote path; empty for the root.
pub fn remote_basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// Parent directory of a remote path; the root is its own parent.
pub fn remote_parent(path: &str) -> String {
    let normalized = normalize_remote_path(path);
    match normalized.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }
}

/// Translate a remote path into an object-store key: no leading slash,
/// duplicate slashes collapsed.
pub fn remote_path_to_key(path: &str) -> String {
    normalize_remote_path(path)
        .trim_start_matches('/')
        .to_string()
}

/// Object-store prefix for listing under a "directory": empty for the
/// root, otherwise the key with exactly one trailing slash.
pub fn key_prefix(path: &str) -> String {
    let key = remote_path_to_key(path);
    if key.is_empty() {
        key
    } else {
        format!("{key}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_double_slashes() {
        assert_eq!(normalize_remote_path("/a//b/"), "/a/b");
        assert_eq!(normalize_remote_path("//"), "/");
        assert_eq!(normalize_remote_path("/"), "/");
        assert_eq!(normalize_remote_path("a//b"), "a/b");
    }

    #[test]
    fn join_after_normalize_round_trips() {
        assert_eq!(join_remote_path("a//b/", "c"), "a/b/c");
        assert_eq!(join_remote_path("/a//b/", "c"), "/a/b/c");
        assert_eq!(join_remote_path("/", "c"), "/c");
        assert_eq!(join_remote_path("", "c"), "/c");
    }

    #[test]
    fn basename_and_parent() {
        assert_eq!(remote_basename("/a/b/c"), "c");
        assert_eq!(remote_basename("/a/b/"), "b");
        assert_eq!(remote_basename("/"), "");
        assert_eq!(remote_parent("/a/b/c"), "/a/b");
        assert_eq!(remote_parent("/a"), "/");
        assert_eq!(remote_parent("/"), "/");
    }

    #[test]
    fn keys_strip_the_leading_slash() {
        assert_eq!(remote_path_to_key("/bucket-dir//file.txt"), "bucket-dir/file.txt");
        assert_eq!(remote_path_to_key("/"), "");
        assert_eq!(key_prefix("/photos"), "photos/");
        assert_eq!(key_prefix("/"), "");
    }
}
