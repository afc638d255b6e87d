//! Cross-repository tag allocation, application and description.

use thiserror::Error;
use tracing::debug;

use crate::git::{GitClient, GitError, RefLookup};
use crate::process::ProcessError;
use crate::revision::{describe_revision, Revision};
use crate::scan::Repository;
use crate::sequencer::run_chunked;

/// Bound on downward steps when hunting for an earlier tag, so a
/// pathological index can not trigger unbounded probing.
pub const MAX_TAG_WALK: u64 = 10_000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TagError {
    /// Creating the tag failed in some repository, typically because an
    /// external tagger raced us between allocation and application. The
    /// caller retries allocation with a higher index.
    #[error("could not apply tag {tag}: {source}")]
    Collision {
        tag: String,
        #[source]
        source: ProcessError,
    },

    #[error(transparent)]
    Git(#[from] GitError),
}

pub type Result<T> = std::result::Result<T, TagError>;

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Branch name as embedded in tag names: spaces and dots become underscores.
pub fn safe_branch(name: &str) -> String {
    name.replace([' ', '.'], "_")
}

/// Render the tag template, substituting `BRANCH` and `INDEX`.
pub fn render_tag(template: &str, branch: &str, index: u64) -> String {
    template
        .replace("BRANCH", &safe_branch(branch))
        .replace("INDEX", &index.to_string())
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Find the lowest index at or above `start_index` whose rendered tag is
/// absent from every repository. Returns the tag name and the index it was
/// allocated at; every index below the returned one was probed and found
/// taken somewhere.
pub async fn find_fresh_tag(
    client: &GitClient,
    repos: &[Repository],
    template: &str,
    branch: &str,
    start_index: u64,
    width: usize,
) -> Result<(String, u64)> {
    let mut index = start_index;
    loop {
        let tag = render_tag(template, branch, index);
        let reference = format!("refs/tags/{tag}");
        let lookups = run_chunked(repos.to_vec(), width, |repo| {
            let reference = reference.clone();
            async move {
                client
                    .show_ref(&repo.path, &reference)
                    .await
                    .map_err(TagError::Git)
            }
        })
        .await?;

        if lookups.iter().all(|l| *l == RefLookup::Absent) {
            return Ok((tag, index));
        }
        debug!(tag = %tag, "tag already exists, probing next index");
        index += 1;
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Apply `tag` to the tip of `branch` in every repository that carries the
/// branch; repositories without it are skipped silently. Returns the
/// repositories actually tagged. Any failing tag operation surfaces as
/// [`TagError::Collision`].
pub async fn apply_tag(
    client: &GitClient,
    repos: &[Repository],
    tag: &str,
    index: u64,
    branch: &str,
    width: usize,
) -> Result<Vec<Repository>> {
    assert!(
        tag.contains(&index.to_string()),
        "rendered tag {tag} does not encode index {index}"
    );

    let applied = run_chunked(repos.to_vec(), width, |repo| {
        let tag = tag.to_string();
        let branch = branch.to_string();
        async move {
            let branches = client.branches(&repo.path).await.map_err(TagError::Git)?;
            if !branches.iter().any(|b| *b == branch) {
                return Ok(None);
            }
            match client.create_tag(&repo.path, &tag, &branch).await {
                Ok(()) => Ok(Some(repo)),
                Err(GitError::Process(source)) => Err(TagError::Collision { tag, source }),
                Err(other) => Err(TagError::Git(other)),
            }
        }
    })
    .await?;

    Ok(applied.into_iter().flatten().collect())
}

// ---------------------------------------------------------------------------
// Description
// ---------------------------------------------------------------------------

/// Aggregated description of everything a new tag covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSummary {
    /// The new tag name.
    pub revision: String,
    /// Latest commit time in the range, seconds since epoch.
    pub when: i64,
    /// Comma-joined sorted unique author names.
    pub author: String,
    /// Sorted unique changed paths across all repositories.
    pub files: Vec<String>,
    /// Per-revision blocks in commit-time order.
    pub comments: String,
}

/// Walk downward from `from` looking for an index whose rendered tag exists
/// in at least one repository. Probes at most [`MAX_TAG_WALK`] indices.
pub async fn find_most_recent_tag(
    client: &GitClient,
    repos: &[Repository],
    template: &str,
    branch: &str,
    from: u64,
    width: usize,
) -> Result<Option<(String, u64)>> {
    let mut index = from;
    for _ in 0..MAX_TAG_WALK {
        let tag = render_tag(template, branch, index);
        let reference = format!("refs/tags/{tag}");
        let lookups = run_chunked(repos.to_vec(), width, |repo| {
            let reference = reference.clone();
            async move {
                client
                    .show_ref(&repo.path, &reference)
                    .await
                    .map_err(TagError::Git)
            }
        })
        .await?;

        if lookups.iter().any(RefLookup::is_found) {
            return Ok(Some((tag, index)));
        }
        if index == 0 {
            return Ok(None);
        }
        index -= 1;
    }
    Ok(None)
}

/// Summarise the revisions a freshly applied tag covers: everything between
/// the most recent earlier tag on the same branch and the new tag, across
/// all repositories.
///
/// A repository where the range does not resolve (the tag or its
/// predecessor never existed there) contributes nothing. When the whole
/// range turns out empty the walk backs off one more index; when it bottoms
/// out without finding any covered revision there is nothing to describe
/// and `None` is returned.
pub async fn describe_tag(
    client: &GitClient,
    repos: &[Repository],
    template: &str,
    branch: &str,
    index: u64,
    width: usize,
) -> Result<Option<TagSummary>> {
    if index == 0 {
        return Ok(None);
    }
    let tag = render_tag(template, branch, index);
    let mut next_below = index - 1;

    for _ in 0..MAX_TAG_WALK {
        let Some((prev_tag, prev_index)) =
            find_most_recent_tag(client, repos, template, branch, next_below, width).await?
        else {
            return Ok(None);
        };

        let revisions = revisions_between(client, repos, &tag, &prev_tag, width).await?;
        if revisions.is_empty() {
            debug!(tag = %tag, prev = %prev_tag, "no revisions in range, walking further back");
            if prev_index == 0 {
                return Ok(None);
            }
            next_below = prev_index - 1;
            continue;
        }
        return Ok(Some(summarise(tag, revisions)));
    }
    Ok(None)
}

async fn revisions_between(
    client: &GitClient,
    repos: &[Repository],
    tag: &str,
    prev: &str,
    width: usize,
) -> Result<Vec<Revision>> {
    let per_repo = run_chunked(repos.to_vec(), width, |repo| {
        let tag = tag.to_string();
        let prev = prev.to_string();
        async move {
            match client.rev_list_range(&repo.path, &tag, &prev).await {
                Ok(hashes) => Ok((repo, hashes)),
                Err(GitError::Process(ProcessError::UnexpectedExit {
                    exit_code: Some(128),
                    ref stderr,
                    ..
                })) if stderr.contains("unknown revision") => Ok((repo, Vec::new())),
                Err(other) => Err(TagError::Git(other)),
            }
        }
    })
    .await?;

    let mut revisions = Vec::new();
    for (repo, hashes) in per_repo {
        let described = run_chunked(hashes, width, |hash| {
            let repo = repo.clone();
            async move { describe_revision(client, &repo, &hash).await }
        })
        .await
        .map_err(TagError::Git)?;
        revisions.extend(described);
    }
    Ok(revisions)
}

fn summarise(tag: String, mut revisions: Vec<Revision>) -> TagSummary {
    revisions.sort_by_key(|r| r.commit_time);

    let when = revisions.last().map(|r| r.commit_time).unwrap_or_default();

    let mut authors: Vec<&str> = revisions.iter().map(|r| r.author.as_str()).collect();
    authors.sort_unstable();
    authors.dedup();
    let author = authors.join(", ");

    let mut files: Vec<String> = revisions.iter().flat_map(|r| r.files.clone()).collect();
    files.sort_unstable();
    files.dedup();

    let comments = revisions
        .iter()
        .map(|r| {
            let short = r.hash.get(..8).unwrap_or(r.hash.as_str());
            format!(
                "{short} {} on {} at {}:\n{}",
                r.author,
                r.repo.display(),
                r.date,
                r.message
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    TagSummary {
        revision: tag,
        when,
        author,
        files,
        comments,
    }
}
