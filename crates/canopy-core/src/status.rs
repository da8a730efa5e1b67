use crate::ChangeSet;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatusError {
    /// The worktree path is gone or no longer a repository. Recoverable:
    /// callers keep the resource and retry on their normal cadence.
    #[error("path inaccessible: {0}")]
    PathInaccessible(String),
    /// Another process holds the version-control lock.
    #[error("repository lock held: {0}")]
    LockContention(String),
    #[error("{0} not found on PATH")]
    ToolMissing(String),
    #[error("status command failed: {0}")]
    Command(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StatusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StatusError::LockContention(_))
    }
}

/// Source of a worktree's change set and commit metadata.
#[async_trait]
pub trait StatusProvider: Send + Sync {
    /// Returns the current change set. `force` bypasses any provider-side
    /// cache for this path only.
    async fn fetch_changes(&self, root: &Path, force: bool) -> Result<ChangeSet, StatusError>;

    /// Subject line of the most recent commit, `None` when there is none.
    async fn last_commit_message(&self, root: &Path) -> Result<Option<String>, StatusError>;

    /// Unified diff of one file against the last commit.
    async fn file_diff(&self, root: &Path, file: &str) -> Result<String, StatusError>;
}
