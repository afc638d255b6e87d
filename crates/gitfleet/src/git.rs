//! Typed facade over the fixed git command vocabulary.
//!
//! Every operation shells out through a [`CommandRunner`] and parses git's
//! textual output into structured records. The parsers are free functions so
//! they can be unit-tested against literal command output.

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::process::{CommandRunner, ProcessError, SystemRunner};

/// Longest commit message carried on a revision; anything longer is cut and
/// suffixed with `...`.
pub const MAX_MESSAGE_LEN: usize = 4000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("unparseable `{command}` output: {detail}")]
    Parse {
        command: &'static str,
        detail: String,
    },
}

pub type Result<T> = std::result::Result<T, GitError>;

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// Result of a ref lookup. A missing ref is data, not an error: git reports
/// it as exit 1 with empty stdout and the facade folds that shape here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefLookup {
    Found(String),
    Absent,
}

impl RefLookup {
    pub fn is_found(&self) -> bool {
        matches!(self, RefLookup::Found(_))
    }
}

/// Parsed `git show --summary` header for one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitDetails {
    pub hash: String,
    pub author: String,
    pub email: String,
    /// The `Date:` line as git printed it, whitespace-normalized.
    pub date: String,
    /// Seconds since epoch with the `±HHMM` zone sign inverted while
    /// converting, matching what the age gate compares against.
    pub commit_time: i64,
    pub message: String,
}

// ---------------------------------------------------------------------------
// GitClient
// ---------------------------------------------------------------------------

/// Facade over the git binary, generic in how subprocesses actually run.
#[derive(Clone)]
pub struct GitClient {
    runner: Arc<dyn CommandRunner>,
}

impl GitClient {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Client backed by real subprocesses.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemRunner))
    }

    async fn git(&self, repo: &Path, args: &[&str]) -> Result<String> {
        tracing::trace!(repo = %repo.display(), ?args, "git");
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push("git");
        argv.extend_from_slice(args);
        let out = self.runner.run(repo, &argv).await?;
        Ok(out.stdout)
    }

    pub async fn init(&self, repo: &Path) -> Result<()> {
        self.git(repo, &["init"]).await?;
        Ok(())
    }

    pub async fn fetch(&self, repo: &Path) -> Result<()> {
        self.git(repo, &["fetch"]).await?;
        Ok(())
    }

    /// Local branch names, one per line of `git branch` (the last
    /// whitespace-delimited token, which skips the `*` current marker).
    pub async fn branches(&self, repo: &Path) -> Result<Vec<String>> {
        let out = self.git(repo, &["branch"]).await?;
        Ok(parse_branch_lines(&out))
    }

    /// Branches from which `rev` is reachable.
    pub async fn branches_containing(&self, repo: &Path, rev: &str) -> Result<Vec<String>> {
        let out = self.git(repo, &["branch", "--contains", rev]).await?;
        Ok(parse_branch_lines(&out))
    }

    /// Look up a fully-qualified ref, distinguishing absent from failed.
    pub async fn show_ref(&self, repo: &Path, reference: &str) -> Result<RefLookup> {
        match self.git(repo, &["show-ref", reference]).await {
            Ok(out) => {
                let sha = out
                    .split_whitespace()
                    .next()
                    .ok_or_else(|| GitError::Parse {
                        command: "show-ref",
                        detail: format!("no hash in output for {reference}"),
                    })?;
                Ok(RefLookup::Found(sha.to_string()))
            }
            Err(GitError::Process(ProcessError::UnexpectedExit {
                exit_code: Some(1),
                ref stdout,
                ..
            })) if stdout.is_empty() => Ok(RefLookup::Absent),
            Err(e) => Err(e),
        }
    }

    /// Revisions reachable from `branch` but from no tag, newest first.
    pub async fn rev_list_untagged(&self, repo: &Path, branch: &str) -> Result<Vec<String>> {
        let out = self.git(repo, &["rev-list", branch, "--not", "--tags"]).await?;
        Ok(nonempty_lines(&out))
    }

    /// Revisions reachable from `new` but not from `old`, newest first.
    pub async fn rev_list_range(&self, repo: &Path, new: &str, old: &str) -> Result<Vec<String>> {
        let out = self.git(repo, &["rev-list", new, "--not", old]).await?;
        Ok(nonempty_lines(&out))
    }

    /// Free-form `git log old..new` text.
    pub async fn log_range(&self, repo: &Path, old: &str, new: &str) -> Result<String> {
        let range = format!("{old}..{new}");
        self.git(repo, &["log", &range]).await
    }

    /// Author, date and message for one revision.
    pub async fn show_summary(&self, repo: &Path, rev: &str) -> Result<CommitDetails> {
        let out = self.git(repo, &["show", "--summary", rev]).await?;
        parse_show_summary(rev, &out)
    }

    /// Paths changed by `rev` relative to its first parent. A root commit
    /// has no parent; git rejects `rev^1` with exit 128 and the facade
    /// reports that as an empty change list.
    pub async fn changed_paths(&self, repo: &Path, rev: &str) -> Result<Vec<String>> {
        let range = format!("{rev}^1..{rev}");
        match self.git(repo, &["diff", "--raw", &range]).await {
            Ok(out) => Ok(parse_raw_diff(&out)),
            Err(GitError::Process(ProcessError::UnexpectedExit {
                exit_code: Some(128),
                ref stderr,
                ..
            })) if stderr.contains("unknown revision") => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Create an annotated tag on the tip of `branch`.
    pub async fn create_tag(&self, repo: &Path, tag: &str, branch: &str) -> Result<()> {
        self.git(repo, &["tag", "-m", tag, tag, branch]).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

fn nonempty_lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_branch_lines(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| line.split_whitespace().last())
        .map(str::to_string)
        .collect()
}

/// One path per `git diff --raw` line: five metadata fields, then the path
/// (joined back together if it contained spaces).
fn parse_raw_diff(out: &str) -> Vec<String> {
    out.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() > 5 {
                Some(fields[5..].join(" "))
            } else {
                None
            }
        })
        .collect()
}

/// Parse a whitespace-normalized `Date:` value such as
/// `Thu Apr 7 15:13:13 2005 -0700` into offset-corrected epoch seconds.
///
/// The trailing five characters are the `±HHMM` zone; the sign is inverted
/// when applying it, matching the convention the rest of the pipeline
/// expects for age comparison.
pub(crate) fn parse_commit_time(date: &str) -> Result<i64> {
    let bad = |detail: String| GitError::Parse {
        command: "show --summary",
        detail,
    };

    if date.len() < 6 {
        return Err(bad(format!("date too short: {date:?}")));
    }
    let (stamp, zone) = date.split_at(date.len() - 6);
    let zone = zone.trim_start();
    if zone.len() != 5 {
        return Err(bad(format!("malformed zone in {date:?}")));
    }
    let sign = &zone[..1];
    let hours: i64 = zone[1..3]
        .parse()
        .map_err(|_| bad(format!("malformed zone hours in {date:?}")))?;
    let minutes: i64 = zone[3..5]
        .parse()
        .map_err(|_| bad(format!("malformed zone minutes in {date:?}")))?;
    let magnitude = 3600 * hours + 60 * minutes;
    let offset = if sign == "+" { -magnitude } else { magnitude };

    let naive = NaiveDateTime::parse_from_str(stamp.trim_end(), "%a %b %d %H:%M:%S %Y")
        .map_err(|e| bad(format!("cannot parse {stamp:?}: {e}")))?;
    Ok(naive.and_utc().timestamp() + offset)
}

/// Decode `git show --summary` output: the `Author:` line splits into a name
/// and a final email token, the `Date:` line becomes epoch seconds, and the
/// message is the first paragraph after the header, de-indented and capped
/// at [`MAX_MESSAGE_LEN`].
pub(crate) fn parse_show_summary(rev: &str, out: &str) -> Result<CommitDetails> {
    let lines: Vec<&str> = out.split('\n').collect();

    let mut author = String::new();
    let mut email = String::new();
    if let Some(line) = lines.iter().find(|l| l.starts_with("Author:")) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() >= 2 {
            author = tokens[1..tokens.len() - 1].join(" ");
            email = tokens[tokens.len() - 1].to_string();
        }
    }

    let date_line = lines
        .iter()
        .find(|l| l.starts_with("Date:"))
        .ok_or_else(|| GitError::Parse {
            command: "show --summary",
            detail: format!("no Date line for {rev}"),
        })?;
    let date = date_line
        .split_whitespace()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let commit_time = parse_commit_time(&date)?;

    // The message is the paragraph between the first blank line after the
    // header and the next blank line.
    let mut i = 0;
    while i < lines.len() && !lines[i].is_empty() {
        i += 1;
    }
    i += 1;
    let mut j = i;
    while j < lines.len() && !lines[j].is_empty() {
        j += 1;
    }
    let message = lines
        .get(i..j)
        .unwrap_or(&[])
        .iter()
        .map(|l| l.trim_start_matches([' ', '\t']))
        .collect::<Vec<_>>()
        .join("\n");
    let message = truncate_message(message);

    Ok(CommitDetails {
        hash: rev.to_string(),
        author,
        email,
        date,
        commit_time,
        message,
    })
}

fn truncate_message(message: String) -> String {
    if message.len() <= MAX_MESSAGE_LEN {
        return message;
    }
    let mut cut = MAX_MESSAGE_LEN;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &message[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::ScriptedRunner;

    const SUMMARY: &str = "\
commit 3dc0e360550e1e8a5a4f132b0b092dd3c6b0c1f5
Author: A U Thor <author@example.com>
Date:   Thu Apr 7 15:13:13 2005 -0700

    add a frobnicator to the widget
    so widgets can frob

 create mode 100644 widget.c
";

    #[test]
    fn summary_author_and_email_split() {
        let details = parse_show_summary("3dc0e360", SUMMARY).unwrap();
        assert_eq!(details.author, "A U Thor");
        assert_eq!(details.email, "<author@example.com>");
    }

    #[test]
    fn summary_message_is_first_paragraph_deindented() {
        let details = parse_show_summary("3dc0e360", SUMMARY).unwrap();
        assert_eq!(
            details.message,
            "add a frobnicator to the widget\nso widgets can frob"
        );
    }

    #[test]
    fn summary_date_applies_inverted_offset() {
        let details = parse_show_summary("3dc0e360", SUMMARY).unwrap();
        assert_eq!(details.date, "Thu Apr 7 15:13:13 2005 -0700");
        // naive 2005-04-07 15:13:13 as UTC is 1112886793; "-0700" adds 7h.
        assert_eq!(details.commit_time, 1_112_886_793 + 7 * 3600);
    }

    #[test]
    fn positive_zone_subtracts() {
        let t = parse_commit_time("Thu Apr 7 15:13:13 2005 +0130").unwrap();
        assert_eq!(t, 1_112_886_793 - 3600 - 1800);
    }

    #[test]
    fn oversized_message_is_capped() {
        let body: String = "x".repeat(MAX_MESSAGE_LEN + 100);
        let out = format!("commit abc\nDate: Thu Apr 7 15:13:13 2005 -0700\n\n    {body}\n");
        let details = parse_show_summary("abc", &out).unwrap();
        assert_eq!(details.message.len(), MAX_MESSAGE_LEN + 3);
        assert!(details.message.ends_with("..."));
    }

    #[test]
    fn raw_diff_yields_paths() {
        let out = "\
:100644 100644 bcd1234 0123456 M\tsome/file.c
:000000 100644 0000000 1234567 A\tnew file name
";
        assert_eq!(parse_raw_diff(out), vec!["some/file.c", "new file name"]);
    }

    #[test]
    fn branch_lines_take_last_token() {
        let out = "  master\n* work in progress\n  release-1\n";
        assert_eq!(parse_branch_lines(out), vec!["master", "progress", "release-1"]);
    }

    #[tokio::test]
    async fn show_ref_folds_missing_into_absent() {
        let runner = ScriptedRunner(|_: &Path, argv: &[&str]| {
            assert_eq!(argv[1], "show-ref");
            (1, String::new(), String::new())
        });
        let client = GitClient::new(Arc::new(runner));
        let lookup = client
            .show_ref(Path::new("/repo"), "refs/tags/absent-1")
            .await
            .unwrap();
        assert_eq!(lookup, RefLookup::Absent);
    }

    #[tokio::test]
    async fn show_ref_found_returns_hash() {
        let runner = ScriptedRunner(|_: &Path, _: &[&str]| {
            (
                0,
                "49ecba1 refs/tags/master-1\n".to_string(),
                String::new(),
            )
        });
        let client = GitClient::new(Arc::new(runner));
        let lookup = client
            .show_ref(Path::new("/repo"), "refs/tags/master-1")
            .await
            .unwrap();
        assert_eq!(lookup, RefLookup::Found("49ecba1".to_string()));
    }

    #[tokio::test]
    async fn show_ref_other_failures_propagate() {
        let runner = ScriptedRunner(|_: &Path, _: &[&str]| {
            (128, String::new(), "fatal: not a git repository\n".to_string())
        });
        let client = GitClient::new(Arc::new(runner));
        let err = client
            .show_ref(Path::new("/repo"), "refs/tags/master-1")
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::Process(_)));
    }

    #[tokio::test]
    async fn root_commit_diff_is_empty_not_fatal() {
        let runner = ScriptedRunner(|_: &Path, argv: &[&str]| {
            assert_eq!(argv[1], "diff");
            (
                128,
                String::new(),
                "fatal: ambiguous argument 'abc^1..abc': unknown revision or path\n".to_string(),
            )
        });
        let client = GitClient::new(Arc::new(runner));
        let paths = client.changed_paths(Path::new("/repo"), "abc").await.unwrap();
        assert!(paths.is_empty());
    }
}
