//! Utility functions for metacoord

use chrono::Utc;

/// Get current Unix timestamp (nanoseconds)
pub fn timestamp_now_nanos() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000))
}

/// Normalize a relative path to forward-slash form.
///
/// Both `/` and `\` separate segments; empty and `.` segments are dropped and
/// `..` pops the previous segment without ever climbing above the start.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.join("/")
}

/// Join a relative path onto a root, forward-slash form.
///
/// An empty relative path resolves to the root itself.
pub fn join_root(root: &str, path: &str) -> String {
    let root = root.trim_end_matches('/');
    let rel = normalize_path(path);
    if rel.is_empty() {
        if root.is_empty() {
            "/".to_string()
        } else {
            root.to_string()
        }
    } else {
        format!("{}/{}", root, rel)
    }
}

/// Strip `prefix` (and the separator after it) from `key`.
pub fn strip_prefix_path<'a>(key: &'a str, prefix: &str) -> &'a str {
    let rest = key.strip_prefix(prefix).unwrap_or(key);
    rest.trim_start_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a/b/c"), "a/b/c");
        assert_eq!(normalize_path("/a//b/"), "a/b");
        assert_eq!(normalize_path("a\\b\\c.json"), "a/b/c.json");
        assert_eq!(normalize_path("./a/./b"), "a/b");
        assert_eq!(normalize_path("a/../b"), "b");
        assert_eq!(normalize_path("../../a"), "a");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn test_join_root() {
        assert_eq!(join_root("/cluster/meta", "idx/shard0.json"), "/cluster/meta/idx/shard0.json");
        assert_eq!(join_root("/cluster/meta/", "/idx"), "/cluster/meta/idx");
        assert_eq!(join_root("/cluster/meta", ""), "/cluster/meta");
        assert_eq!(join_root("", ""), "/");
    }

    #[test]
    fn test_strip_prefix_path() {
        assert_eq!(strip_prefix_path("/root/a/x", "/root/a"), "x");
        assert_eq!(strip_prefix_path("/root/a/b/y", "/root/a/"), "b/y");
    }

    #[test]
    fn test_timestamp_increases() {
        let t1 = timestamp_now_nanos();
        let t2 = timestamp_now_nanos();
        assert!(t1 > 0);
        assert!(t2 >= t1);
    }
}
