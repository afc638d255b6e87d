//! Discovery of git repositories under the roots directory.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("cannot read repositories directory {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ScanError>;

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepoKind {
    WorkingTree,
    Bare,
}

/// A repository discovered under the roots directory. Rediscovered on every
/// poll cycle, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub path: PathBuf,
    pub kind: RepoKind,
}

impl Repository {
    /// The directory name, used as the per-repository prefix on file paths.
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
    }
}

/// True when `pattern` matches the whole of `text`, not just a prefix.
pub(crate) fn full_match(pattern: &Regex, text: &str) -> bool {
    pattern
        .find(text)
        .is_some_and(|m| m.start() == 0 && m.end() == text.len())
}

/// Enumerate direct children of `roots` that look like git repositories,
/// skipping names that fully match `ignore`.
///
/// A bare repository carries `config` and `refs/` at its top level, a
/// working tree carries them under `.git/`. The result is sorted by path;
/// callers rely on that for deterministic poll ordering.
pub fn scan_repositories(roots: &Path, ignore: Option<&Regex>) -> Result<Vec<Repository>> {
    let entries = std::fs::read_dir(roots).map_err(|source| ScanError::Unreadable {
        path: roots.to_path_buf(),
        source,
    })?;

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(pattern) = ignore {
            if full_match(pattern, name) {
                continue;
            }
        }
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let path = std::path::absolute(&path).unwrap_or(path);
        if path.join("config").is_file() && path.join("refs").is_dir() {
            found.push(Repository {
                path,
                kind: RepoKind::Bare,
            });
        } else if path.join(".git/config").is_file() && path.join(".git/refs").is_dir() {
            found.push(Repository {
                path,
                kind: RepoKind::WorkingTree,
            });
        }
    }

    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}
