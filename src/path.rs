//! Path normalization and containment tests.
//!
//! Every location the scanner talks about is a `/`-separated string. Plain
//! files are keyed by their normalized absolute path; entries inside archives
//! append `!/` per archive level, e.g. `/libs/app.war!/WEB-INF/lib/core.jar!/org/a/A.java`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{Result, ScanError};

/// Separator between an archive key and the entry inside it.
pub const ARCHIVE_SEPARATOR: &str = "!/";

/// Lexically normalizes a path: unified separators, `.`/`..` resolved,
/// repeated and trailing separators removed. Idempotent.
pub fn clean(path: &str) -> String {
    let uniform = path.replace('\\', "/");
    let absolute = uniform.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in uniform.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            p => parts.push(p),
        }
    }

    let joined = parts.join("/");
    let cleaned = if absolute { format!("/{joined}") } else { joined };
    if cfg!(windows) {
        cleaned.to_lowercase()
    } else {
        cleaned
    }
}

/// True when `candidate` is `root` itself or lies below it, either as a
/// filesystem descendant or as an entry of the archive `root`.
pub fn is_within(candidate: &str, root: &str) -> bool {
    if candidate == root {
        return true;
    }
    if root == "/" {
        return candidate.starts_with('/');
    }
    match candidate.strip_prefix(root) {
        Some(rest) => rest.starts_with('/') || rest.starts_with(ARCHIVE_SEPARATOR),
        None => false,
    }
}

/// A normalized absolute path given to a query; the unit of cache granularity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanRoot(String);

impl ScanRoot {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let absolute = std::path::absolute(path)
            .map_err(|e| ScanError::io(path.to_string_lossy(), e))?;
        Ok(Self(clean(&absolute.to_string_lossy())))
    }

    pub(crate) fn from_normalized(path: &str) -> Self {
        Self(clean(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    pub fn contains(&self, location: &str) -> bool {
        is_within(location, &self.0)
    }
}

impl fmt::Display for ScanRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ScanRoot {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifying key of a discovered file or archive entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryKey(String);

impl EntryKey {
    pub fn file(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn entry(container: &str, entry_name: &str) -> Self {
        let name = entry_name.trim_start_matches('/');
        Self(format!("{container}{ARCHIVE_SEPARATOR}{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the innermost archive holding this entry, if any.
    pub fn container(&self) -> Option<&str> {
        self.0
            .rfind(ARCHIVE_SEPARATOR)
            .map(|idx| &self.0[..idx])
    }

    /// Path of this entry inside its innermost archive, or the file path.
    pub fn entry_name(&self) -> &str {
        match self.0.rfind(ARCHIVE_SEPARATOR) {
            Some(idx) => &self.0[idx + ARCHIVE_SEPARATOR.len()..],
            None => &self.0,
        }
    }

    /// File name of the last path element.
    pub fn file_name(&self) -> &str {
        let name = self.entry_name();
        name.rsplit('/').next().unwrap_or(name)
    }

    pub fn is_within(&self, root: &str) -> bool {
        is_within(&self.0, root)
    }

    /// Location the unit is loaded from: the key stripped of the unit's own
    /// relative path (`org/a/A.java`). For a unit stored at the top of an
    /// archive this is the archive itself; otherwise it is the directory or
    /// archive prefix acting as the class path root.
    pub fn class_path(&self, unit_path: &str) -> String {
        let key = self.0.as_str();
        if let Some(prefix) = key.strip_suffix(unit_path) {
            if let Some(archive) = prefix.strip_suffix(ARCHIVE_SEPARATOR) {
                return archive.to_string();
            }
            if let Some(dir) = prefix.strip_suffix('/') {
                return if dir.is_empty() { "/".to_string() } else { dir.to_string() };
            }
        }
        match key.rfind('/') {
            Some(0) => "/".to_string(),
            Some(idx) => key[..idx].trim_end_matches('!').to_string(),
            None => key.to_string(),
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Drops every path that lies within another path of the set. The result is
/// sorted, so the reduction does not depend on input order.
pub fn outermost<'a, I>(paths: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut sorted: Vec<&str> = paths.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut kept: Vec<String> = Vec::new();
    for path in sorted {
        if !kept.iter().any(|k| is_within(path, k)) {
            kept.push(path.to_string());
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_is_idempotent() {
        let samples = [
            "/a/b/../c/./d/",
            "//a//b",
            "a\\b\\c",
            "/",
            "/a/b/..",
            "../x/y",
        ];
        for s in samples {
            let once = clean(s);
            assert_eq!(clean(&once), once, "sample {s}");
        }
        if !cfg!(windows) {
            assert_eq!(clean("/a/b/../c/./d/"), "/a/c/d");
            assert_eq!(clean("//a//b"), "/a/b");
            assert_eq!(clean("/"), "/");
            assert_eq!(clean("a\\b\\c"), "a/b/c");
        }
    }

    #[test]
    fn is_within_respects_separators() {
        assert!(is_within("/a/foo", "/a/foo"));
        assert!(is_within("/a/foo/x", "/a/foo"));
        assert!(is_within("/a/foo.zip!/x/A.java", "/a/foo.zip"));
        assert!(!is_within("/a/foobar", "/a/foo"));
        assert!(!is_within("/a/foo.zip", "/a/foo"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn entry_key_chain() {
        let outer = EntryKey::entry("/libs/app.war", "WEB-INF/lib/core.jar");
        let inner = EntryKey::entry(outer.as_str(), "/org/a/A.java");
        assert_eq!(
            inner.as_str(),
            "/libs/app.war!/WEB-INF/lib/core.jar!/org/a/A.java"
        );
        assert_eq!(inner.container(), Some("/libs/app.war!/WEB-INF/lib/core.jar"));
        assert_eq!(inner.entry_name(), "org/a/A.java");
        assert_eq!(inner.file_name(), "A.java");
        assert!(inner.is_within("/libs/app.war"));
        assert!(inner.is_within("/libs"));
    }

    #[test]
    fn class_path_strips_unit_path() {
        let in_dir = EntryKey::file("/proj/src/org/a/A.java");
        assert_eq!(in_dir.class_path("org/a/A.java"), "/proj/src");

        let in_jar = EntryKey::entry("/m2/lib.jar", "org/a/A.java");
        assert_eq!(in_jar.class_path("org/a/A.java"), "/m2/lib.jar");

        let misplaced = EntryKey::file("/proj/other/A.java");
        assert_eq!(misplaced.class_path("org/a/A.java"), "/proj/other");
    }

    #[test]
    fn outermost_is_order_independent() {
        let a = outermost(["/r/a/b", "/r/a", "/r/c", "/r/a/b/c"]);
        let b = outermost(["/r/c", "/r/a/b/c", "/r/a", "/r/a/b"]);
        assert_eq!(a, vec!["/r/a".to_string(), "/r/c".to_string()]);
        assert_eq!(a, b);
    }

    #[test]
    fn scan_root_is_absolute_and_stable() {
        let root = ScanRoot::new("some/relative/../dir").unwrap();
        assert!(root.as_path().is_absolute());
        assert!(root.as_str().ends_with("some/dir"));
        assert_eq!(ScanRoot::new(root.as_str()).unwrap(), root);
    }
}
