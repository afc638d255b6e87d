//! Child process execution.
//!
//! Everything the crate asks of the outside world goes through a
//! [`CommandRunner`], so tests can swap in scripted responses without
//! touching a real `git` binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {argv:?} in {cwd:?}: {source}")]
    Spawn {
        argv: Vec<String>,
        cwd: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The child ran but did not exit with the expected code. Carries both
    /// output streams and the full invocation so callers can branch on the
    /// failure shape.
    #[error("{argv:?} in {cwd:?} exited with {exit_code:?}, expected {expected}: {stderr}")]
    UnexpectedExit {
        argv: Vec<String>,
        cwd: PathBuf,
        stdout: String,
        stderr: String,
        /// `None` when the child was killed by a signal.
        exit_code: Option<i32>,
        expected: i32,
    },
}

pub type Result<T> = std::result::Result<T, ProcessError>;

// ---------------------------------------------------------------------------
// CommandRunner trait
// ---------------------------------------------------------------------------

/// Captured output of a completed child process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Abstraction over subprocess execution so it can be mocked in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` in `cwd` and fail unless the exit code equals `expected`.
    async fn run_expecting(
        &self,
        cwd: &Path,
        argv: &[&str],
        expected: i32,
    ) -> Result<ProcessOutput>;

    /// Run `argv` in `cwd`, expecting a clean exit.
    async fn run(&self, cwd: &Path, argv: &[&str]) -> Result<ProcessOutput> {
        self.run_expecting(cwd, argv, 0).await
    }
}

// ---------------------------------------------------------------------------
// SystemRunner
// ---------------------------------------------------------------------------

/// Real runner that spawns child processes on the host.
///
/// Children are spawned with a null stdin and are killed if the owning
/// future is dropped, so a cancelled poll cycle does not leak processes.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run_expecting(
        &self,
        cwd: &Path,
        argv: &[&str],
        expected: i32,
    ) -> Result<ProcessOutput> {
        let owned = || argv.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        let (program, args) = match argv.split_first() {
            Some(split) => split,
            None => {
                return Err(ProcessError::Spawn {
                    argv: Vec::new(),
                    cwd: cwd.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
                })
            }
        };

        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProcessError::Spawn {
                argv: owned(),
                cwd: cwd.to_path_buf(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code();

        if exit_code != Some(expected) {
            return Err(ProcessError::UnexpectedExit {
                argv: owned(),
                cwd: cwd.to_path_buf(),
                stdout,
                stderr,
                exit_code,
                expected,
            });
        }

        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code: expected,
        })
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = SystemRunner
            .run(Path::new("."), &["sh", "-c", "echo hello"])
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn unexpected_exit_carries_everything() {
        let err = SystemRunner
            .run(Path::new("."), &["sh", "-c", "echo out; echo err >&2; exit 3"])
            .await
            .unwrap_err();
        match err {
            ProcessError::UnexpectedExit {
                argv,
                stdout,
                stderr,
                exit_code,
                expected,
                ..
            } => {
                assert_eq!(argv[0], "sh");
                assert_eq!(stdout, "out\n");
                assert_eq!(stderr, "err\n");
                assert_eq!(exit_code, Some(3));
                assert_eq!(expected, 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_can_be_expected() {
        let out = SystemRunner
            .run_expecting(Path::new("."), &["sh", "-c", "exit 3"], 3)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = SystemRunner
            .run(Path::new("."), &["gitfleet-no-such-binary"])
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
