//! Git driver: a thin, timeout-bounded, structured-output wrapper over
//! the git executable.
//!
//! Uses the git CLI directly (rather than libgit2) for mutable operations
//! to ensure compatibility with worktrees, hooks, and other git features.

mod driver;
mod ops;

pub use driver::{GitDriver, GitError, GitOutput};
pub use ops::{BranchInfo, RebaseOutcome, WorktreeEntry};
