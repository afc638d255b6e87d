//! Untagged-revision detection and enrichment.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{BranchAttribution, Filters};
use crate::git::{GitClient, GitError, Result};
use crate::scan::Repository;
use crate::sequencer::run_chunked;

/// A fully described commit, attributed to one branch. Owned by the poll
/// cycle that found it and dropped once summarised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub hash: String,
    pub repo: PathBuf,
    pub author: String,
    pub email: String,
    pub date: String,
    /// Seconds since epoch, offset-corrected; drives the age gate.
    pub commit_time: i64,
    pub message: String,
    /// Changed paths, prefixed with the repository name.
    pub files: Vec<String>,
    /// The branch this record is attributed to.
    pub branch: String,
}

/// Describe one revision: `show --summary` metadata plus the changed paths,
/// each prefixed with the repository directory name. Branch attribution is
/// left empty for the caller to fill in.
pub async fn describe_revision(
    client: &GitClient,
    repo: &Repository,
    hash: &str,
) -> Result<Revision> {
    let details = client.show_summary(&repo.path, hash).await?;
    let paths = client.changed_paths(&repo.path, hash).await?;
    let files = paths
        .into_iter()
        .map(|p| format!("{}/{}", repo.name(), p))
        .collect();
    Ok(Revision {
        hash: details.hash,
        repo: repo.path.clone(),
        author: details.author,
        email: details.email,
        date: details.date,
        commit_time: details.commit_time,
        message: details.message,
        files,
        branch: String::new(),
    })
}

/// All untagged revisions in one repository, described and attributed.
///
/// Branches that are ignored or marked non-scan contribute no revisions.
/// Under [`BranchAttribution::RevListBranch`] each revision is attributed to
/// the branch whose rev-list produced it (so a commit shared by two
/// scannable branches appears once per branch). Under
/// [`BranchAttribution::AllContaining`] each distinct revision is attributed
/// once per containing branch, with only the ignore filter applied.
pub async fn untagged_for_repository(
    client: &GitClient,
    repo: &Repository,
    filters: &Filters,
    attribution: BranchAttribution,
    width: usize,
) -> Result<Vec<Revision>> {
    let branches = client.branches(&repo.path).await?;
    let scannable: Vec<String> = branches
        .into_iter()
        .filter(|b| filters.scannable_branch(b))
        .collect();

    let mut out = Vec::new();
    match attribution {
        BranchAttribution::RevListBranch => {
            for branch in &scannable {
                let hashes = client.rev_list_untagged(&repo.path, branch).await?;
                let mut revisions = run_chunked(hashes, width, |hash| async move {
                    describe_revision(client, repo, &hash).await
                })
                .await?;
                for revision in &mut revisions {
                    revision.branch.clone_from(branch);
                }
                out.append(&mut revisions);
            }
        }
        BranchAttribution::AllContaining => {
            let mut seen = HashSet::new();
            let mut distinct = Vec::new();
            for branch in &scannable {
                for hash in client.rev_list_untagged(&repo.path, branch).await? {
                    if seen.insert(hash.clone()) {
                        distinct.push(hash);
                    }
                }
            }
            let described = run_chunked(distinct, width, |hash| async move {
                describe_revision(client, repo, &hash).await
            })
            .await?;
            let contained = run_chunked(described, width, |revision| async move {
                let containing = client
                    .branches_containing(&repo.path, &revision.hash)
                    .await?;
                Ok::<_, GitError>((revision, containing))
            })
            .await?;
            for (revision, containing) in contained {
                for branch in containing {
                    if !filters.visible_branch(&branch) {
                        continue;
                    }
                    let mut attributed = revision.clone();
                    attributed.branch = branch;
                    out.push(attributed);
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::ScriptedRunner;
    use crate::scan::RepoKind;
    use std::path::Path;
    use std::sync::Arc;

    fn repo() -> Repository {
        Repository {
            path: PathBuf::from("/srv/widgets"),
            kind: RepoKind::WorkingTree,
        }
    }

    fn summary_for(hash: &str, subject: &str) -> String {
        format!(
            "commit {hash}\nAuthor: A U Thor <author@example.com>\n\
             Date:   Thu Apr 7 15:13:13 2005 -0700\n\n    {subject}\n"
        )
    }

    fn scripted_client(script: impl Fn(&Path, &[&str]) -> (i32, String, String) + Send + Sync + 'static) -> GitClient {
        GitClient::new(Arc::new(ScriptedRunner(script)))
    }

    #[tokio::test]
    async fn files_are_prefixed_with_repo_name() {
        let client = scripted_client(|_, argv| match argv[1] {
            "show" => (0, summary_for("abc", "tweak"), String::new()),
            "diff" => (0, ":100644 100644 a b M\tsrc/lib.c\n".to_string(), String::new()),
            other => panic!("unexpected git {other}"),
        });
        let revision = describe_revision(&client, &repo(), "abc").await.unwrap();
        assert_eq!(revision.files, vec!["widgets/src/lib.c"]);
        assert_eq!(revision.author, "A U Thor");
        assert!(revision.branch.is_empty());
    }

    #[tokio::test]
    async fn rev_list_attribution_tags_each_branch_separately() {
        // Both branches report the same untagged commit.
        let client = scripted_client(|_, argv| match argv[1] {
            "branch" => (0, "* master\n  topic\n".to_string(), String::new()),
            "rev-list" => (0, "abc\n".to_string(), String::new()),
            "show" => (0, summary_for("abc", "shared"), String::new()),
            "diff" => (0, String::new(), String::new()),
            other => panic!("unexpected git {other}"),
        });
        let filters = Filters::default();
        let revisions = untagged_for_repository(
            &client,
            &repo(),
            &filters,
            BranchAttribution::RevListBranch,
            2,
        )
        .await
        .unwrap();
        let branches: Vec<&str> = revisions.iter().map(|r| r.branch.as_str()).collect();
        assert_eq!(branches, vec!["master", "topic"]);
    }

    #[tokio::test]
    async fn all_containing_attribution_deduplicates_then_fans_out() {
        let client = scripted_client(|_, argv| match (argv[1], argv.get(2).copied()) {
            ("branch", Some("--contains")) => {
                (0, "  master\n  topic\n  wip-x\n".to_string(), String::new())
            }
            ("branch", _) => (0, "* master\n  topic\n".to_string(), String::new()),
            ("rev-list", _) => (0, "abc\n".to_string(), String::new()),
            ("show", _) => (0, summary_for("abc", "shared"), String::new()),
            ("diff", _) => (0, String::new(), String::new()),
            (other, _) => panic!("unexpected git {other}"),
        });
        let filters = Filters {
            ignore_branches: Some(regex::Regex::new("wip-.*").unwrap()),
            ..Filters::default()
        };
        let revisions = untagged_for_repository(
            &client,
            &repo(),
            &filters,
            BranchAttribution::AllContaining,
            2,
        )
        .await
        .unwrap();
        // One distinct commit, attributed to each visible containing branch.
        let branches: Vec<&str> = revisions.iter().map(|r| r.branch.as_str()).collect();
        assert_eq!(branches, vec!["master", "topic"]);
    }

    #[tokio::test]
    async fn non_scan_branches_contribute_nothing() {
        let client = scripted_client(|_, argv| match argv[1] {
            "branch" => (0, "* master\n  release-1\n".to_string(), String::new()),
            "rev-list" => {
                // Only master may be scanned.
                assert_eq!(argv[2], "master");
                (0, String::new(), String::new())
            }
            other => panic!("unexpected git {other}"),
        });
        let filters = Filters {
            non_scan_branches: Some(regex::Regex::new("release-.*").unwrap()),
            ..Filters::default()
        };
        let revisions = untagged_for_repository(
            &client,
            &repo(),
            &filters,
            BranchAttribution::RevListBranch,
            2,
        )
        .await
        .unwrap();
        assert!(revisions.is_empty());
    }
}
