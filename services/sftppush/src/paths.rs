//! Path resolution for filesystem events.
//!
//! Turns the raw path carried by a notification into an absolute path, and
//! derives the object-store key that mirrors the file's position below the
//! configured destination root.

use glob::{MatchOptions, Pattern};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Suffixes removed from a key, since the stored object is the decoded content.
const COMPRESSED_SUFFIXES: [&str; 2] = [".gzip", ".gz"];

/// `*` must not cross a path separator, the same way shell globs behave.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Errors that can occur while resolving event paths.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("Failed to determine working directory for {path}: {source}")]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid destination root pattern {pattern:?}: {message}")]
    InvalidRootPattern { pattern: String, message: String },

    #[error("Path {path} does not lie below destination root {pattern:?}")]
    OutsideRoot { path: PathBuf, pattern: String },

    #[error("Path {0} is not valid UTF-8")]
    NonUtf8(PathBuf),
}

/// Returns `raw` unchanged when absolute, otherwise joined onto the process
/// working directory.
pub fn resolve_absolute(raw: impl AsRef<Path>) -> Result<PathBuf, PathError> {
    let raw = raw.as_ref();
    if raw.is_absolute() {
        return Ok(raw.to_path_buf());
    }

    let cwd = std::env::current_dir().map_err(|source| PathError::WorkingDirectory {
        path: raw.to_path_buf(),
        source,
    })?;

    Ok(cwd.join(raw))
}

/// Compiled destination root glob, e.g. `/home/` or `/srv/sftp/*/`.
#[derive(Debug, Clone)]
pub struct DestinationRoot {
    raw: String,
    pattern: Pattern,
}

impl DestinationRoot {
    /// Compile a root pattern. Malformed globs are rejected here so that a bad
    /// configuration fails at start-up instead of on every event.
    pub fn parse(pattern: &str) -> Result<Self, PathError> {
        let compiled = Pattern::new(pattern).map_err(|e| PathError::InvalidRootPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            raw: pattern.to_string(),
            pattern: compiled,
        })
    }

    /// The pattern as configured.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Derive the object key for `path`.
    ///
    /// Walks from the leaf upward, testing each ancestor (with a trailing
    /// separator) against the root pattern. The first ancestor that matches
    /// splits the path; everything below it, joined by `/`, is the key. A
    /// trailing `.gz`/`.gzip` is dropped.
    pub fn destination_key(&self, path: &Path) -> Result<String, PathError> {
        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => {
                    let part = part
                        .to_str()
                        .ok_or_else(|| PathError::NonUtf8(path.to_path_buf()))?;
                    parts.push(part);
                }
                Component::ParentDir => {
                    parts.pop();
                }
                Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            }
        }

        for split in (0..parts.len()).rev() {
            let prefix = if split == 0 {
                "/".to_string()
            } else {
                format!("/{}/", parts[..split].join("/"))
            };

            if self.pattern.matches_with(&prefix, MATCH_OPTIONS) {
                return Ok(strip_compressed_suffix(parts[split..].join("/")));
            }
        }

        Err(PathError::OutsideRoot {
            path: path.to_path_buf(),
            pattern: self.raw.clone(),
        })
    }

    /// Whether files placed directly in `dir` can be keyed below this root.
    pub fn covers_directory(&self, dir: &Path) -> bool {
        self.destination_key(&dir.join("probe")).is_ok()
    }
}

/// Convenience wrapper that compiles `root` and derives the key for `path`.
pub fn compute_destination_key(path: &Path, root: &str) -> Result<String, PathError> {
    DestinationRoot::parse(root)?.destination_key(path)
}

fn strip_compressed_suffix(key: String) -> String {
    for suffix in COMPRESSED_SUFFIXES {
        if let Some(stripped) = key.strip_suffix(suffix) {
            if !stripped.is_empty() && !stripped.ends_with('/') {
                return stripped.to_string();
            }
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_absolute_keeps_absolute_paths() {
        let path = resolve_absolute("/tmp/c.txt").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/c.txt"));
    }

    #[test]
    fn test_resolve_absolute_joins_working_directory() {
        let cwd = std::env::current_dir().unwrap();
        let path = resolve_absolute("c.txt").unwrap();
        assert!(path.is_absolute());
        assert_eq!(path, cwd.join("c.txt"));
    }

    #[test]
    fn test_key_is_relative_to_root_without_gz_suffix() {
        let key =
            compute_destination_key(Path::new("/watch/a/b/file.txt.gz"), "/watch/").unwrap();
        assert_eq!(key, "a/b/file.txt");
    }

    #[test]
    fn test_key_strips_gzip_suffix() {
        let key =
            compute_destination_key(Path::new("/watch/user1/data.csv.gzip"), "/watch/").unwrap();
        assert_eq!(key, "user1/data.csv");
    }

    #[test]
    fn test_key_keeps_other_extensions() {
        let key = compute_destination_key(Path::new("/home/user1/report.tar"), "/home/").unwrap();
        assert_eq!(key, "user1/report.tar");
    }

    #[test]
    fn test_key_with_wildcard_root_stops_at_deepest_match() {
        let root = DestinationRoot::parse("/srv/sftp/*/").unwrap();
        let key = root
            .destination_key(Path::new("/srv/sftp/user1/in/data.csv.gz"))
            .unwrap();
        assert_eq!(key, "in/data.csv");
    }

    #[test]
    fn test_wildcard_does_not_cross_separators() {
        let root = DestinationRoot::parse("/srv/*/").unwrap();
        let key = root
            .destination_key(Path::new("/srv/a/b/c.gz"))
            .unwrap();
        assert_eq!(key, "b/c");
    }

    #[test]
    fn test_key_never_starts_with_separator_or_contains_root() {
        let key = compute_destination_key(Path::new("/watch/user1/x.gz"), "/watch/").unwrap();
        assert!(!key.starts_with('/'));
        assert!(!key.contains("watch"));
    }

    #[test]
    fn test_path_outside_root_is_rejected() {
        let err = compute_destination_key(Path::new("/var/log/syslog.gz"), "/home/").unwrap_err();
        assert!(matches!(err, PathError::OutsideRoot { .. }));
    }

    #[test]
    fn test_malformed_pattern_is_rejected() {
        let err = DestinationRoot::parse("/home/[abc/").unwrap_err();
        assert!(matches!(err, PathError::InvalidRootPattern { .. }));
    }

    #[test]
    fn test_suffix_only_name_is_kept() {
        let key = compute_destination_key(Path::new("/watch/user1/.gz"), "/watch/").unwrap();
        assert_eq!(key, "user1/.gz");
    }

    #[test]
    fn test_covers_directory() {
        let root = DestinationRoot::parse("/watch/").unwrap();
        assert!(root.covers_directory(Path::new("/watch/user1")));
        assert!(!root.covers_directory(Path::new("/elsewhere/user1")));
    }
}
