//! Path-safe resolution under the storage root.
//!
//! All persisted file locations are storage-root-relative POSIX paths. This
//! module is the single place where relative paths are normalized and turned
//! into absolute filesystem paths, so no caller can escape the root.

use std::path::{Component, Path, PathBuf};

use kvitto_core::{Error, Result};

/// A normalized storage-root-relative path.
///
/// Always uses `/` separators, never starts with a separator, and contains
/// no `.` or `..` segments. Construct via [`RelPath::normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelPath(String);

impl RelPath {
    /// Normalize an untrusted relative path.
    ///
    /// Leading separators are stripped; absolute paths (including Windows
    /// drive prefixes), empty input, and any `..` segment are rejected with
    /// `Error::PathEscape`. `.` segments are dropped.
    pub fn normalize(raw: &str) -> Result<Self> {
        let cleaned = raw.replace('\\', "/");
        let trimmed = cleaned.trim_start_matches('/');

        if trimmed.is_empty() {
            return Err(Error::PathEscape(raw.to_string()));
        }
        // Windows drive prefix ("C:/...") survives trim_start_matches.
        if trimmed.len() >= 2 && trimmed.as_bytes()[1] == b':' {
            return Err(Error::PathEscape(raw.to_string()));
        }

        let mut segments = Vec::new();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(seg) => {
                    let seg = seg
                        .to_str()
                        .ok_or_else(|| Error::PathEscape(raw.to_string()))?;
                    segments.push(seg);
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(Error::PathEscape(raw.to_string()));
                }
            }
        }

        if segments.is_empty() {
            return Err(Error::PathEscape(raw.to_string()));
        }

        Ok(Self(segments.join("/")))
    }

    /// Build from already-trusted segments (internal layout paths).
    pub(crate) fn from_segments(segments: &[&str]) -> Self {
        Self(segments.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parent directory as a relative POSIX string, empty for top-level.
    pub fn parent(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }

    /// Final path segment.
    pub fn file_name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// True when this path is inside `dir` (a relative POSIX directory).
    pub fn starts_with_dir(&self, dir: &str) -> bool {
        let dir = dir.trim_end_matches('/');
        self.0 == dir || self.0.starts_with(&format!("{}/", dir))
    }

    pub fn join(&self, segment: &str) -> Self {
        Self(format!("{}/{}", self.0, segment))
    }
}

impl std::fmt::Display for RelPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve a normalized relative path under `root`, re-checking the prefix.
pub fn resolve_under(root: &Path, rel: &RelPath) -> Result<PathBuf> {
    let joined = root.join(rel.as_str());
    // normalize() already forbids traversal; the prefix check guards against
    // future construction paths.
    if !joined.starts_with(root) {
        return Err(Error::PathEscape(rel.as_str().to_string()));
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_plain() {
        let rel = RelPath::normalize("incoming/2024/receipt.pdf").unwrap();
        assert_eq!(rel.as_str(), "incoming/2024/receipt.pdf");
        assert_eq!(rel.parent(), "incoming/2024");
        assert_eq!(rel.file_name(), "receipt.pdf");
    }

    #[test]
    fn test_normalize_strips_leading_separators() {
        let rel = RelPath::normalize("/incoming/a.pdf").unwrap();
        assert_eq!(rel.as_str(), "incoming/a.pdf");
    }

    #[test]
    fn test_normalize_converts_backslashes() {
        let rel = RelPath::normalize("incoming\\sub\\a.pdf").unwrap();
        assert_eq!(rel.as_str(), "incoming/sub/a.pdf");
    }

    #[test]
    fn test_normalize_drops_curdir() {
        let rel = RelPath::normalize("./incoming/./a.pdf").unwrap();
        assert_eq!(rel.as_str(), "incoming/a.pdf");
    }

    #[test]
    fn test_rejects_parent_segments() {
        assert!(matches!(
            RelPath::normalize("incoming/../../etc/passwd"),
            Err(Error::PathEscape(_))
        ));
        assert!(matches!(
            RelPath::normalize(".."),
            Err(Error::PathEscape(_))
        ));
    }

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(RelPath::normalize(""), Err(Error::PathEscape(_))));
        assert!(matches!(RelPath::normalize("/"), Err(Error::PathEscape(_))));
    }

    #[test]
    fn test_rejects_drive_prefix() {
        assert!(matches!(
            RelPath::normalize("C:/Windows/system32"),
            Err(Error::PathEscape(_))
        ));
    }

    #[test]
    fn test_starts_with_dir() {
        let rel = RelPath::normalize("receipts_raw/2024-05-01/a.pdf").unwrap();
        assert!(rel.starts_with_dir("receipts_raw"));
        assert!(rel.starts_with_dir("receipts_raw/2024-05-01"));
        assert!(!rel.starts_with_dir("receipts"));
        assert!(!rel.starts_with_dir("incoming"));
    }

    #[test]
    fn test_resolve_under_root() {
        let root = Path::new("/var/kvitto");
        let rel = RelPath::normalize("incoming/a.pdf").unwrap();
        let abs = resolve_under(root, &rel).unwrap();
        assert_eq!(abs, PathBuf::from("/var/kvitto/incoming/a.pdf"));
    }

    #[test]
    fn test_top_level_parent_is_empty() {
        let rel = RelPath::normalize("a.pdf").unwrap();
        assert_eq!(rel.parent(), "");
        assert_eq!(rel.file_name(), "a.pdf");
    }
}
