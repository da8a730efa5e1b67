use crate::run_git;
use canopy_core::{normalize_path, Resource, StatusError};
use std::path::Path;

/// Lists the worktrees attached to `repo` via `git worktree list --porcelain`.
/// Bare entries are skipped. The entry containing `repo` is flagged current.
pub async fn list_worktrees(repo: &Path) -> Result<Vec<Resource>, StatusError> {
    let output = run_git(repo, &["worktree", "list", "--porcelain"]).await?;
    let current = match tokio::fs::canonicalize(repo).await {
        Ok(path) => path,
        Err(_) => repo.to_path_buf(),
    };
    Ok(parse_worktree_list(&output, &current))
}

struct Entry {
    path: String,
    branch: Option<String>,
    bare: bool,
}

pub(crate) fn parse_worktree_list(output: &str, current: &Path) -> Vec<Resource> {
    let mut entries: Vec<Entry> = Vec::new();
    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.push(Entry {
                path: path.trim().to_string(),
                branch: None,
                bare: false,
            });
            continue;
        }
        let Some(entry) = entries.last_mut() else {
            continue;
        };
        if let Some(reference) = line.strip_prefix("branch ") {
            let reference = reference.trim();
            let branch = reference.strip_prefix("refs/heads/").unwrap_or(reference);
            entry.branch = Some(branch.to_string());
        } else if line.trim() == "bare" {
            entry.bare = true;
        }
    }

    let current = normalize_path(current);
    let mut resources: Vec<Resource> = entries
        .into_iter()
        .filter(|entry| !entry.bare)
        .map(|entry| Resource::new(&entry.path, entry.branch))
        .collect();

    let current_index = resources
        .iter()
        .enumerate()
        .filter(|(_, resource)| current.starts_with(resource.path()))
        .max_by_key(|(_, resource)| resource.path().as_os_str().len())
        .map(|(index, _)| index);
    if let Some(index) = current_index {
        resources[index].is_current = true;
    }
    resources
}
