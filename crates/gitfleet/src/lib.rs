//! Change source that watches a directory of git repositories and emits one
//! logical change per branch by tagging synchronized points-in-time across
//! the whole fleet.
//!
//! Rather than reporting a build per commit per repository, each poll cycle:
//! - rescans the roots directory for repositories
//! - finds revisions reachable from branches but from no tag
//! - waits out a quiescence window before acting on a branch
//! - allocates a tag name absent from every repository and applies it to
//!   each repository carrying the branch, retrying on collision
//! - summarises the revision range back to the previous tag into a single
//!   change record handed to the [`sink::ChangeSink`]
//!
//! The driver owns the schedule; overlapping `poll` calls are skipped.

pub mod config;
pub mod git;
pub mod poller;
pub mod process;
pub mod revision;
pub mod scan;
pub mod sequencer;
pub mod sink;
pub mod tag;

pub use config::{BranchAttribution, ConfigError, SourceConfig};
pub use poller::{FleetSource, PollError, PollOutcome, PollReport, PollerHooks};
pub use sink::{ChangeRecord, ChangeSink, MemorySink};
