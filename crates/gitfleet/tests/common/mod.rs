//! Fixture for driving real git repositories under a temporary roots
//! directory.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// A temporary roots directory plus helpers for populating repositories in
/// it. All git invocations are isolated from the host user's configuration.
pub struct Fleet {
    home: TempDir,
    roots: PathBuf,
}

impl Fleet {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let home = TempDir::new().expect("create tempdir");
        let roots = home.path().join("repos");
        std::fs::create_dir(&roots).expect("create roots dir");
        Self { home, roots }
    }

    pub fn roots(&self) -> &Path {
        &self.roots
    }

    /// Run git in `repo`, panicking on failure, returning stdout.
    pub fn git(&self, repo: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo)
            .env("HOME", self.home.path())
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {:?} in {:?} failed: {}",
            args,
            repo,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    /// Create a working-tree repository with a `master` branch and an
    /// in-repo committer identity, so the source's own tag operations work
    /// whatever the ambient environment.
    pub fn add_repo(&self, name: &str) -> PathBuf {
        let repo = self.roots.join(name);
        std::fs::create_dir(&repo).expect("create repo dir");
        self.git(&repo, &["init", "-q"]);
        self.git(&repo, &["symbolic-ref", "HEAD", "refs/heads/master"]);
        self.git(&repo, &["config", "user.name", "Test Author"]);
        self.git(&repo, &["config", "user.email", "test@example.com"]);
        repo
    }

    /// Write `file` and commit it with `message`.
    pub fn commit(&self, repo: &Path, file: &str, message: &str) {
        std::fs::write(repo.join(file), message).expect("write file");
        self.git(repo, &["add", "-A"]);
        self.git(repo, &["commit", "-q", "-m", message]);
    }

    pub fn tags(&self, repo: &Path) -> Vec<String> {
        self.git(repo, &["tag", "-l"])
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn has_tag(&self, repo: &Path, tag: &str) -> bool {
        self.tags(repo).iter().any(|t| t == tag)
    }
}

/// One repository with a single commit already covered by `master-1` — the
/// quiet baseline the scenarios build on.
pub fn seeded_fleet() -> (Fleet, PathBuf) {
    let fleet = Fleet::new();
    let repo = fleet.add_repo("widgets");
    fleet.commit(&repo, "foo", "foo");
    fleet.git(&repo, &["tag", "-m", "master-1", "master-1", "master"]);
    (fleet, repo)
}
