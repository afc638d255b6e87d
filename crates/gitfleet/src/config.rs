//! Source configuration: loaded from TOML or built in code, then validated
//! eagerly into a set of compiled filters before the first poll.

use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scan::full_match;
use crate::sequencer::DEFAULT_WIDTH;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),

    #[error("parse: {0}")]
    Parse(String),

    #[error("repositories directory {path:?} is not readable: {source}")]
    RepositoriesDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tag format {format:?} has no INDEX placeholder")]
    TemplateMissingIndex { format: String },

    #[error("invalid {field} pattern: {source}")]
    Pattern {
        field: &'static str,
        #[source]
        source: regex::Error,
    },
}

// ---------------------------------------------------------------------------
// SourceConfig
// ---------------------------------------------------------------------------

/// How a revision reachable from several branches is attributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BranchAttribution {
    /// Attribute each revision to the branch whose rev-list found it.
    #[default]
    RevListBranch,
    /// Emit one record per branch containing the revision
    /// (`git branch --contains`), ignore filter applied.
    AllContaining,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory whose direct children are the repositories to watch.
    pub repositories_directory: PathBuf,

    /// Tag name template; `BRANCH` and `INDEX` are substituted.
    #[serde(default = "default_tag_format")]
    pub tag_format: String,

    /// Seconds a revision must exist before it can trigger tagging.
    #[serde(default)]
    pub age_requirement: u64,

    /// First index tried when allocating a tag.
    #[serde(default = "default_tag_starting_index")]
    pub tag_starting_index: u64,

    /// Driver-facing hint, seconds between polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Run `git fetch` in every repository at the start of a cycle.
    #[serde(default)]
    pub auto_fetch: bool,

    /// Full-match pattern against repository directory names to skip.
    #[serde(default)]
    pub ignore_repositories_regexp: Option<String>,

    /// Full-match pattern against branch names to skip entirely.
    #[serde(default)]
    pub ignore_branches_regexp: Option<String>,

    /// Branches matching this are never scanned for new revisions, but stay
    /// visible to attribution and tagging.
    #[serde(default)]
    pub non_scan_branches_regexp: Option<String>,

    #[serde(default)]
    pub branch_attribution: BranchAttribution,

    /// Free-form label copied into every emitted change.
    #[serde(default)]
    pub project: String,

    /// Bound on concurrently running subprocesses.
    #[serde(default = "default_subprocess_width")]
    pub subprocess_width: usize,
}

fn default_tag_format() -> String {
    "BRANCH-INDEX".to_string()
}

fn default_tag_starting_index() -> u64 {
    1
}

fn default_poll_interval() -> u64 {
    600
}

fn default_subprocess_width() -> usize {
    DEFAULT_WIDTH
}

impl SourceConfig {
    /// Config with defaults for everything but the roots directory.
    pub fn new(repositories_directory: impl Into<PathBuf>) -> Self {
        Self {
            repositories_directory: repositories_directory.into(),
            tag_format: default_tag_format(),
            age_requirement: 0,
            tag_starting_index: default_tag_starting_index(),
            poll_interval: default_poll_interval(),
            auto_fetch: false,
            ignore_repositories_regexp: None,
            ignore_branches_regexp: None,
            non_scan_branches_regexp: None,
            branch_attribution: BranchAttribution::default(),
            project: String::new(),
            subprocess_width: default_subprocess_width(),
        }
    }

    /// Load from a TOML file.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check everything that can fail before the first poll: the roots
    /// directory must be readable, the template must be able to encode an
    /// index, and the three patterns must compile. Returns the compiled
    /// filter set.
    pub fn validate(&self) -> Result<Filters, ConfigError> {
        std::fs::read_dir(&self.repositories_directory).map_err(|source| {
            ConfigError::RepositoriesDirectory {
                path: self.repositories_directory.clone(),
                source,
            }
        })?;

        if !self.tag_format.contains("INDEX") {
            return Err(ConfigError::TemplateMissingIndex {
                format: self.tag_format.clone(),
            });
        }

        Ok(Filters {
            ignore_repositories: compile(
                "ignore_repositories_regexp",
                self.ignore_repositories_regexp.as_deref(),
            )?,
            ignore_branches: compile(
                "ignore_branches_regexp",
                self.ignore_branches_regexp.as_deref(),
            )?,
            non_scan_branches: compile(
                "non_scan_branches_regexp",
                self.non_scan_branches_regexp.as_deref(),
            )?,
        })
    }
}

fn compile(field: &'static str, pattern: Option<&str>) -> Result<Option<Regex>, ConfigError> {
    pattern
        .map(|p| Regex::new(p).map_err(|source| ConfigError::Pattern { field, source }))
        .transpose()
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// The three name filters, compiled. All matching is anchored full-match.
#[derive(Debug, Default)]
pub struct Filters {
    pub ignore_repositories: Option<Regex>,
    pub ignore_branches: Option<Regex>,
    pub non_scan_branches: Option<Regex>,
}

impl Filters {
    /// Branch is neither ignored nor excluded from scanning.
    pub fn scannable_branch(&self, name: &str) -> bool {
        self.visible_branch(name) && !matches(&self.non_scan_branches, name)
    }

    /// Branch is not ignored (non-scan branches are still visible).
    pub fn visible_branch(&self, name: &str) -> bool {
        !matches(&self.ignore_branches, name)
    }

    /// Branch is visible but excluded from scanning: it contributes no
    /// revisions of its own, yet still gets tagged when it shares
    /// qualifying history.
    pub fn non_scan_branch(&self, name: &str) -> bool {
        self.visible_branch(name) && matches(&self.non_scan_branches, name)
    }
}

fn matches(pattern: &Option<Regex>, name: &str) -> bool {
    pattern.as_ref().is_some_and(|p| full_match(p, name))
}
