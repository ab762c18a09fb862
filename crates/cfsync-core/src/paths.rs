//! Relative-path mapping between the local sync root and the remote tree.
//!
//! Relative paths are always `/`-separated, never start or end with `/`, and
//! the root itself is the empty string. Both the placeholder layer and the
//! remote capabilities key everything by this form.

use std::path::{Component, Path, PathBuf};

/// File names the host shell drops into any directory. They are never
/// projected from the remote nor uploaded to it.
const HOST_RESERVED: &[&str] = &["desktop.ini", "thumbs.db", "ehthumbs.db", ".ds_store"];

/// Normalize a relative path: `\` becomes `/`, empty and `.` segments vanish.
pub fn normalize_relative(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Map an absolute local path to its relative form under `root`.
///
/// Returns `None` when `path` lies outside the root or climbs out of it.
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let rest = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rest.components() {
        match component {
            Component::Normal(seg) => parts.push(seg.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Map a relative path back to an absolute local path under `root`.
pub fn to_local(root: &Path, relative: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for seg in normalize_relative(relative).split('/').filter(|s| !s.is_empty()) {
        out.push(seg);
    }
    out
}

/// Parent of a relative path (`""` for top-level entries and the root).
pub fn parent_of(relative: &str) -> &str {
    match relative.rfind('/') {
        Some(idx) => &relative[..idx],
        None => "",
    }
}

/// Final segment of a relative path.
pub fn file_name(relative: &str) -> &str {
    match relative.rfind('/') {
        Some(idx) => &relative[idx + 1..],
        None => relative,
    }
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// True if `relative` equals `ancestor` or lives beneath it.
pub fn is_within(ancestor: &str, relative: &str) -> bool {
    ancestor.is_empty()
        || relative == ancestor
        || (relative.starts_with(ancestor) && relative.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// Host-reserved system file (case-insensitive) or an office lock file.
pub fn is_host_reserved(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOST_RESERVED.contains(&lower.as_str()) || name.starts_with("~$")
}

/// Decides which entries never take part in sync: host-reserved names plus
/// configured glob patterns (matched against the name and the relative path).
#[derive(Debug, Clone, Default)]
pub struct ExcludeFilter {
    patterns: Vec<glob::Pattern>,
}

impl ExcludeFilter {
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!(pattern = %p, "ignoring invalid exclude pattern: {e}");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn is_excluded(&self, relative: &str) -> bool {
        let name = file_name(relative);
        if name.is_empty() {
            return false;
        }
        if relative.split('/').any(is_host_reserved) {
            return true;
        }
        self.patterns
            .iter()
            .any(|p| p.matches(name) || p.matches(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_separators() {
        assert_eq!(normalize_relative("/a//b/./c/"), "a/b/c");
        assert_eq!(normalize_relative("a\\b\\c"), "a/b/c");
        assert_eq!(normalize_relative(""), "");
        assert_eq!(normalize_relative("/"), "");
    }

    #[test]
    fn relative_mapping() {
        let root = Path::new("/home/u/Phone");
        assert_eq!(
            relative_to(root, Path::new("/home/u/Phone/dir/b.txt")).as_deref(),
            Some("dir/b.txt")
        );
        assert_eq!(relative_to(root, root).as_deref(), Some(""));
        assert_eq!(relative_to(root, Path::new("/home/u/Other/x")), None);
        assert_eq!(relative_to(root, Path::new("/home/u/Phone/../x")), None);
        assert_eq!(to_local(root, "dir/b.txt"), PathBuf::from("/home/u/Phone/dir/b.txt"));
        assert_eq!(to_local(root, ""), root.to_path_buf());
    }

    #[test]
    fn parent_and_name() {
        assert_eq!(parent_of("a/b/c.txt"), "a/b");
        assert_eq!(parent_of("c.txt"), "");
        assert_eq!(file_name("a/b/c.txt"), "c.txt");
        assert_eq!(file_name("c.txt"), "c.txt");
        assert_eq!(join("", "x"), "x");
        assert_eq!(join("a", "x"), "a/x");
    }

    #[test]
    fn within() {
        assert!(is_within("", "a/b"));
        assert!(is_within("a", "a"));
        assert!(is_within("a", "a/b"));
        assert!(!is_within("a", "ab/c"));
        assert!(!is_within("a/b", "a"));
    }

    #[test]
    fn reserved_names_are_excluded() {
        let filter = ExcludeFilter::default();
        assert!(filter.is_excluded("desktop.ini"));
        assert!(filter.is_excluded("dir/Thumbs.db"));
        assert!(filter.is_excluded("docs/~$report.docx"));
        assert!(!filter.is_excluded("docs/report.docx"));
        assert!(!filter.is_excluded(""));
    }

    #[test]
    fn glob_patterns_are_excluded() {
        let filter = ExcludeFilter::new(&["*.part".to_string(), "cache/*".to_string()]);
        assert!(filter.is_excluded("video.mp4.part"));
        assert!(filter.is_excluded("cache/x.bin"));
        assert!(!filter.is_excluded("video.mp4"));
    }
}

#[cfg(test)]
mod proptest_suite {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn local_relative_roundtrip(segs in prop::collection::vec("[a-zA-Z0-9_.-]{1,12}", 0..6)) {
            prop_assume!(segs.iter().all(|s| s != "." && s != ".."));
            let rel = segs.join("/");
            let root = Path::new("/sync/root");
            let local = to_local(root, &rel);
            prop_assert_eq!(relative_to(root, &local), Some(rel.clone()));
            prop_assert_eq!(normalize_relative(&rel), rel);
        }
    }
}
