//! `git` and `gh` command-line backed collaborators for the canopy engine.

pub mod gh;
pub mod status;
pub mod worktrees;

pub use gh::GhPeerQuery;
pub use status::GitStatusProvider;
pub use worktrees::list_worktrees;

use canopy_core::StatusError;
use std::io;
use std::path::Path;
use tokio::process::Command;

/// Runs `git <args>` inside `cwd` and returns stdout. Failures are mapped onto
/// the status taxonomy so callers can tell a vanished worktree from a held
/// index lock.
pub(crate) async fn run_git(cwd: &Path, args: &[&str]) -> Result<String, StatusError> {
    match tokio::fs::metadata(cwd).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(StatusError::PathInaccessible(format!(
                "{} is not a directory",
                cwd.display()
            )))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(StatusError::PathInaccessible(cwd.display().to_string()))
        }
        Err(err) => return Err(StatusError::Io(err)),
    }

    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_OPTIONAL_LOCKS", "0")
        .kill_on_drop(true)
        .output()
        .await;
    let output = match output {
        Ok(value) => value,
        Err(err) => {
            if err.kind() == io::ErrorKind::NotFound {
                return Err(StatusError::ToolMissing("git".to_string()));
            }
            return Err(StatusError::Io(err));
        }
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(classify_git_failure(&stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub(crate) fn classify_git_failure(stderr: &str) -> StatusError {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("index.lock") || lowered.contains(".lock': file exists") {
        return StatusError::LockContention(stderr.to_string());
    }
    if lowered.contains("not a git repository") || lowered.contains("cannot change to") {
        return StatusError::PathInaccessible(stderr.to_string());
    }
    StatusError::Command(stderr.to_string())
}
