//! The poll orchestrator: one cycle walks the fleet, gates branches on
//! quiescence, and drives allocate -> apply -> describe -> emit for each
//! qualifying branch.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{BranchAttribution, ConfigError, Filters, SourceConfig};
use crate::git::{GitClient, GitError};
use crate::revision::{self, Revision};
use crate::scan::{scan_repositories, Repository, ScanError};
use crate::sequencer::run_chunked;
use crate::sink::{ChangeRecord, ChangeSink};
use crate::tag::{apply_tag, describe_tag, find_fresh_tag, TagError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error("change sink failed: {0}")]
    Sink(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PollError>;

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Optional synchronous observation callbacks.
#[derive(Default)]
pub struct PollerHooks {
    /// Invoked once per untagged revision discovered in a cycle.
    pub new_revision: Option<Box<dyn Fn(&Revision) + Send + Sync>>,
    /// Invoked with `(tag, branch)` after a tag is applied.
    pub new_tag: Option<Box<dyn Fn(&str, &str) + Send + Sync>>,
    /// Invoked with every status transition message.
    pub status: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl PollerHooks {
    pub fn on_new_revision(mut self, f: impl Fn(&Revision) + Send + Sync + 'static) -> Self {
        self.new_revision = Some(Box::new(f));
        self
    }

    pub fn on_new_tag(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.new_tag = Some(Box::new(f));
        self
    }

    pub fn on_status(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.status = Some(Box::new(f));
        self
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What one completed cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollReport {
    pub repositories: usize,
    pub new_revisions: usize,
    pub tags_created: usize,
}

/// Result of a `poll()` call. Overlapping ticks are skipped, not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Skipped,
    Completed(PollReport),
}

// ---------------------------------------------------------------------------
// FleetSource
// ---------------------------------------------------------------------------

/// Everything a cycle may mutate, guarded by the single re-entry lock.
struct CycleState {
    /// Lowest tag index worth probing; advances only on failed attempts.
    tag_starting_index: u64,
    /// Latest tag applied per branch, for this source's lifetime.
    tags: HashMap<String, String>,
    /// Most recent repository scan, kept for `notify` and the summary.
    repositories: Vec<Repository>,
}

/// A change source over a fleet of git repositories.
///
/// The driver calls [`poll`](Self::poll) on a fixed interval; each cycle
/// rescans the roots directory, finds untagged revisions old enough to have
/// quiesced, allocates a fresh tag name absent from every repository,
/// applies it to each repository carrying the branch, and reports the tag
/// upstream through the [`ChangeSink`].
pub struct FleetSource {
    config: SourceConfig,
    filters: Filters,
    client: GitClient,
    sink: Arc<dyn ChangeSink>,
    hooks: PollerHooks,
    state: Mutex<CycleState>,
    last_status: StdMutex<String>,
    last_finish: StdMutex<Option<i64>>,
}

impl FleetSource {
    /// Build a source that shells out to the real git binary. Validates the
    /// configuration eagerly.
    pub fn new(config: SourceConfig, sink: Arc<dyn ChangeSink>) -> std::result::Result<Self, ConfigError> {
        Self::with_client(config, sink, GitClient::system())
    }

    /// Build a source over a custom git client (scripted in tests).
    pub fn with_client(
        config: SourceConfig,
        sink: Arc<dyn ChangeSink>,
        client: GitClient,
    ) -> std::result::Result<Self, ConfigError> {
        let filters = config.validate()?;
        let state = CycleState {
            tag_starting_index: config.tag_starting_index,
            tags: HashMap::new(),
            repositories: Vec::new(),
        };
        Ok(Self {
            config,
            filters,
            client,
            sink,
            hooks: PollerHooks::default(),
            state: Mutex::new(state),
            last_status: StdMutex::new("idle".to_string()),
            last_finish: StdMutex::new(None),
        })
    }

    pub fn hooks(mut self, hooks: PollerHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Driver-facing hint for how often to call [`poll`](Self::poll).
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval)
    }

    pub fn last_status(&self) -> String {
        self.last_status.lock().expect("status lock poisoned").clone()
    }

    /// Wall-clock seconds-since-epoch when the last cycle ended.
    pub fn last_finish(&self) -> Option<i64> {
        *self.last_finish.lock().expect("finish lock poisoned")
    }

    fn set_status(&self, message: String) {
        debug!(status = %message, "poll status");
        if let Some(hook) = &self.hooks.status {
            hook(&message);
        }
        *self.last_status.lock().expect("status lock poisoned") = message;
    }

    /// Run one poll cycle. Returns [`PollOutcome::Skipped`] without doing
    /// anything when a previous cycle is still in flight; this is the only
    /// lock in the system.
    pub async fn poll(&self) -> Result<PollOutcome> {
        let Ok(mut state) = self.state.try_lock() else {
            debug!("previous poll cycle still running, skipping tick");
            return Ok(PollOutcome::Skipped);
        };

        let started = Instant::now();
        let now = Utc::now().timestamp();
        self.set_status("start polling".to_string());

        let outcome = self.run_cycle(&mut state, now).await;
        *self.last_finish.lock().expect("finish lock poisoned") = Some(Utc::now().timestamp());

        match outcome {
            Ok(report) => {
                self.set_status(format!(
                    "finished in {:.3}s",
                    started.elapsed().as_secs_f64()
                ));
                Ok(PollOutcome::Completed(report))
            }
            Err(err) => {
                error!(error = %err, "poll cycle aborted");
                self.set_status(format!(
                    "failed after {:.3}s: {err}",
                    started.elapsed().as_secs_f64()
                ));
                Err(err)
            }
        }
    }

    async fn run_cycle(&self, state: &mut CycleState, now: i64) -> Result<PollReport> {
        let width = self.config.subprocess_width;

        // Rescan the fleet from disk.
        let repos = scan_repositories(
            &self.config.repositories_directory,
            self.filters.ignore_repositories.as_ref(),
        )?;
        state.repositories = repos.clone();

        // Optionally bring every repository up to date first. A fetch
        // failure aborts the cycle; the next tick retries naturally.
        if self.config.auto_fetch {
            self.set_status("fetching".to_string());
            run_chunked(repos.clone(), width, |repo| async move {
                self.client.fetch(&repo.path).await
            })
            .await?;
        }

        // Untagged revisions across the fleet, described and attributed
        // to branches.
        self.set_status(format!("examining {} repositories", repos.len()));
        let per_repo = run_chunked(repos.clone(), width, |repo| async move {
            revision::untagged_for_repository(
                &self.client,
                &repo,
                &self.filters,
                self.config.branch_attribution,
                width,
            )
            .await
        })
        .await?;
        let revisions: Vec<Revision> = per_repo.into_iter().flatten().collect();

        // Age gate: a branch qualifies when any of its untagged
        // revisions predates the quiescence window.
        self.set_status(format!(
            "checking {} revisions for being at least {}s old",
            revisions.len(),
            self.config.age_requirement
        ));
        let cutoff = now - self.config.age_requirement as i64;
        let mut qualifying: BTreeSet<String> = BTreeSet::new();
        for rev in &revisions {
            if let Some(hook) = &self.hooks.new_revision {
                hook(rev);
            }
            if rev.commit_time <= cutoff && qualifying.insert(rev.branch.clone()) {
                info!(
                    branch = %rev.branch,
                    revision = %rev.hash,
                    "branch has quiescent untagged revisions"
                );
            }
        }

        // Non-scan branches contribute no revisions of their own, but they
        // still get tagged when they share qualifying history. Under
        // all-containing attribution that surfaced above; under rev-list
        // attribution the containment has to be probed here.
        if self.config.branch_attribution == BranchAttribution::RevListBranch
            && self.filters.non_scan_branches.is_some()
        {
            let mut seen = HashSet::new();
            let mut old_revisions = Vec::new();
            for rev in &revisions {
                if rev.commit_time <= cutoff
                    && seen.insert((rev.repo.clone(), rev.hash.clone()))
                {
                    old_revisions.push((rev.repo.clone(), rev.hash.clone()));
                }
            }
            let containing = run_chunked(old_revisions, width, |(repo, hash)| async move {
                self.client.branches_containing(&repo, &hash).await
            })
            .await?;
            for branches in containing {
                for branch in branches {
                    if self.filters.non_scan_branch(&branch)
                        && qualifying.insert(branch.clone())
                    {
                        info!(branch = %branch, "non-scan branch shares qualifying history");
                    }
                }
            }
        }

        // One tag per qualifying branch, sequentially in branch order.
        let mut tags_created = 0;
        for branch in &qualifying {
            self.tag_branch(state, &repos, branch, now).await?;
            tags_created += 1;
        }

        Ok(PollReport {
            repositories: repos.len(),
            new_revisions: revisions.len(),
            tags_created,
        })
    }

    /// Allocate a fresh tag for `branch`, apply it fleet-wide, describe the
    /// revision range it covers, and emit the change. An application
    /// failure (someone else took the name first) bumps the index and
    /// starts over.
    async fn tag_branch(
        &self,
        state: &mut CycleState,
        repos: &[Repository],
        branch: &str,
        now: i64,
    ) -> Result<()> {
        let width = self.config.subprocess_width;
        let template = &self.config.tag_format;
        self.set_status(format!("creating tag for {branch}"));

        let (tag, index) = loop {
            let (tag, index) = find_fresh_tag(
                &self.client,
                repos,
                template,
                branch,
                state.tag_starting_index,
                width,
            )
            .await?;
            // Probes below `index` all collided; record that progress.
            state.tag_starting_index = index;

            self.set_status(format!("creating tag {tag}"));
            match apply_tag(&self.client, repos, &tag, index, branch, width).await {
                Ok(applied) => {
                    info!(
                        tag = %tag,
                        branch = %branch,
                        repositories = applied.len(),
                        "tag applied"
                    );
                    break (tag, index);
                }
                Err(TagError::Collision { tag, source }) => {
                    warn!(
                        tag = %tag,
                        error = %source,
                        "failed to apply tag, retrying with a higher index"
                    );
                    state.tag_starting_index = index + 1;
                }
                Err(other) => return Err(other.into()),
            }
        };

        let summary = describe_tag(&self.client, repos, template, branch, index, width).await?;
        let record = match summary {
            Some(s) => ChangeRecord {
                revision: s.revision,
                author: s.author,
                when: s.when,
                files: s.files,
                comments: s.comments,
                project: self.config.project.clone(),
                branch: branch.to_string(),
            },
            // The first tag on a branch covers no earlier range; the
            // record still names it so the sink hears about every tag.
            None => ChangeRecord {
                revision: tag.clone(),
                author: String::new(),
                when: now,
                files: Vec::new(),
                comments: String::new(),
                project: self.config.project.clone(),
                branch: branch.to_string(),
            },
        };

        state.tags.insert(branch.to_string(), tag.clone());
        if let Some(hook) = &self.hooks.new_tag {
            hook(&tag, branch);
        }
        self.sink
            .record_change(record)
            .await
            .map_err(PollError::Sink)?;
        Ok(())
    }

    /// Fast path for an externally observed commit: inspect just the named
    /// repository and branch instead of rescanning the whole fleet, then
    /// run the same gate and tagging flow. Serialises behind the same lock
    /// as [`poll`](Self::poll), waiting rather than skipping.
    pub async fn notify(&self, repo_path: &Path, branch: &str) -> Result<PollReport> {
        let mut state = self.state.lock().await;
        let now = Utc::now().timestamp();
        let width = self.config.subprocess_width;

        if state.repositories.is_empty() {
            state.repositories = scan_repositories(
                &self.config.repositories_directory,
                self.filters.ignore_repositories.as_ref(),
            )?;
        }
        let repos = state.repositories.clone();
        let repo = repos
            .iter()
            .find(|r| r.path == repo_path)
            .cloned()
            .unwrap_or_else(|| Repository {
                path: repo_path.to_path_buf(),
                kind: crate::scan::RepoKind::WorkingTree,
            });

        let hashes = self.client.rev_list_untagged(&repo.path, branch).await?;
        let repo_ref = &repo;
        let mut revisions = run_chunked(hashes, width, |hash| async move {
            revision::describe_revision(&self.client, repo_ref, &hash).await
        })
        .await?;
        for rev in &mut revisions {
            rev.branch = branch.to_string();
        }

        let cutoff = now - self.config.age_requirement as i64;
        let mut tags_created = 0;
        let mut qualifies = false;
        for rev in &revisions {
            if let Some(hook) = &self.hooks.new_revision {
                hook(rev);
            }
            if rev.commit_time <= cutoff {
                qualifies = true;
            }
        }
        if qualifies {
            self.tag_branch(&mut state, &repos, branch, now).await?;
            tags_created = 1;
        }

        Ok(PollReport {
            repositories: repos.len(),
            new_revisions: revisions.len(),
            tags_created,
        })
    }

    /// One-line human-readable account of the source, for status pages.
    pub fn status_summary(&self) -> String {
        let project = if self.config.project.is_empty() {
            "(unnamed project)".to_string()
        } else {
            self.config.project.clone()
        };
        let finish = match self.last_finish() {
            None => "not yet finished".to_string(),
            Some(t) => format!(
                "last finished {}s ago",
                (Utc::now().timestamp() - t).max(0)
            ),
        };
        let mut out = format!(
            "{project} watching {}: {}, {finish}",
            self.config.repositories_directory.display(),
            self.last_status(),
        );
        if let Some(p) = &self.config.ignore_repositories_regexp {
            out.push_str(&format!(", ignoring repositories {p}"));
        }
        if let Some(p) = &self.config.ignore_branches_regexp {
            out.push_str(&format!(", ignoring branches {p}"));
        }
        match self.state.try_lock() {
            Ok(state) => {
                let mut tags: Vec<String> = state
                    .tags
                    .iter()
                    .map(|(branch, tag)| format!("{branch}={tag}"))
                    .collect();
                tags.sort();
                let repos: Vec<&str> = state.repositories.iter().map(|r| r.name()).collect();
                out.push_str(&format!(
                    "; tags [{}]; repositories [{}]",
                    tags.join(", "),
                    repos.join(", ")
                ));
            }
            Err(_) => out.push_str("; cycle in progress"),
        }
        out
    }
}
