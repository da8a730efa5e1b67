use crate::run_git;
use async_trait::async_trait;
use canopy_core::{ChangeSet, FileChange, FileStatus, StatusError, StatusProvider};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(1);

struct CachedChanges {
    fetched_at: Instant,
    changes: ChangeSet,
}

/// Status provider backed by `git status` and `git diff --numstat`.
///
/// Results are cached per worktree for a short TTL so that several readers
/// polling the same path in quick succession share one set of subprocesses.
/// A forced fetch only evicts the entry for its own path.
pub struct GitStatusProvider {
    ttl: Duration,
    cache: Mutex<HashMap<PathBuf, CachedChanges>>,
}

impl GitStatusProvider {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn invalidate(&self, root: &Path) {
        self.lock_cache().remove(root);
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<PathBuf, CachedChanges>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached(&self, root: &Path) -> Option<ChangeSet> {
        let cache = self.lock_cache();
        let entry = cache.get(root)?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(entry.changes.clone())
        } else {
            None
        }
    }

    fn store(&self, root: &Path, changes: &ChangeSet) {
        self.lock_cache().insert(
            root.to_path_buf(),
            CachedChanges {
                fetched_at: Instant::now(),
                changes: changes.clone(),
            },
        );
    }
}

impl Default for GitStatusProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusProvider for GitStatusProvider {
    async fn fetch_changes(&self, root: &Path, force: bool) -> Result<ChangeSet, StatusError> {
        if force {
            self.invalidate(root);
        } else if let Some(changes) = self.cached(root) {
            debug!(event = "status_cache_hit", root = %root.display());
            return Ok(changes);
        }

        let changes = collect_changes(root).await?;
        self.store(root, &changes);
        Ok(changes)
    }

    async fn last_commit_message(&self, root: &Path) -> Result<Option<String>, StatusError> {
        match run_git(root, &["log", "-1", "--format=%s"]).await {
            Ok(output) => {
                let subject = output.trim();
                if subject.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(subject.to_string()))
                }
            }
            Err(StatusError::Command(stderr)) if is_unborn_head(&stderr) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn file_diff(&self, root: &Path, file: &str) -> Result<String, StatusError> {
        match run_git(root, &["diff", "HEAD", "--unified=0", "--", file]).await {
            Ok(diff) => Ok(diff),
            Err(StatusError::Command(stderr)) if is_unborn_head(&stderr) => {
                run_git(root, &["diff", "--cached", "--unified=0", "--", file]).await
            }
            Err(err) => Err(err),
        }
    }
}

fn is_unborn_head(stderr: &str) -> bool {
    stderr.contains("does not have any commits")
        || stderr.contains("bad default revision")
        || stderr.contains("unknown revision")
        || stderr.contains("ambiguous argument 'HEAD'")
}

async fn collect_changes(root: &Path) -> Result<ChangeSet, StatusError> {
    let status_raw = run_git(root, &["status", "--porcelain=v1", "-u"]).await?;
    let entries = parse_status_entries(&status_raw);
    if entries.is_empty() {
        return Ok(ChangeSet::empty(root));
    }

    let staged_raw = run_git(root, &["diff", "--numstat", "--cached"]).await?;
    let staged = parse_numstat(&staged_raw);
    let unstaged_raw = run_git(root, &["diff", "--numstat"]).await?;
    let unstaged = parse_numstat(&unstaged_raw);

    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        let stats = if entry.status == FileStatus::Untracked {
            None
        } else {
            merge_stats(staged.get(&entry.path), unstaged.get(&entry.path))
        };
        let mtime = if entry.status == FileStatus::Deleted {
            None
        } else {
            file_mtime(&root.join(&entry.path)).await
        };
        files.push(FileChange {
            path: entry.path,
            status: entry.status,
            insertions: stats.map(|(ins, _)| ins),
            deletions: stats.map(|(_, del)| del),
            mtime,
        });
    }
    Ok(ChangeSet::new(root, files))
}

/// `None` inside the map marks a binary file (`-\t-` in numstat output).
type NumstatMap = HashMap<String, Option<(u32, u32)>>;

fn merge_stats(
    staged: Option<&Option<(u32, u32)>>,
    unstaged: Option<&Option<(u32, u32)>>,
) -> Option<(u32, u32)> {
    match (staged, unstaged) {
        (None, None) => Some((0, 0)),
        (Some(None), _) | (_, Some(None)) => None,
        (Some(Some(a)), None) | (None, Some(Some(a))) => Some(*a),
        (Some(Some(a)), Some(Some(b))) => Some((a.0 + b.0, a.1 + b.1)),
    }
}

async fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let meta = tokio::fs::symlink_metadata(path).await.ok()?;
    meta.modified().ok().map(DateTime::<Utc>::from)
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct StatusEntry {
    pub path: String,
    pub status: FileStatus,
}

pub(crate) fn parse_status_entries(output: &str) -> Vec<StatusEntry> {
    output.lines().filter_map(parse_status_line).collect()
}

pub(crate) fn parse_status_line(line: &str) -> Option<StatusEntry> {
    if line.len() < 4 {
        return None;
    }
    if let Some(path) = line.strip_prefix("?? ") {
        return Some(StatusEntry {
            path: unquote(path.trim()),
            status: FileStatus::Untracked,
        });
    }
    if let Some(path) = line.strip_prefix("!! ") {
        return Some(StatusEntry {
            path: unquote(path.trim()),
            status: FileStatus::Ignored,
        });
    }
    let mut chars = line.chars();
    let x = chars.next()?;
    let y = chars.next()?;
    let mut path = line.get(3..)?.trim().to_string();
    if let Some((_, new_path)) = path.split_once(" -> ") {
        path = new_path.trim().to_string();
    }
    let status = if matches!(x, 'A' | 'C') || matches!(y, 'A' | 'C') {
        FileStatus::Added
    } else if x == 'D' || y == 'D' {
        FileStatus::Deleted
    } else if x == 'R' || y == 'R' {
        FileStatus::Renamed
    } else {
        FileStatus::Modified
    };
    Some(StatusEntry {
        path: unquote(&path),
        status,
    })
}

pub(crate) fn parse_numstat(output: &str) -> NumstatMap {
    let mut map = HashMap::new();
    for line in output.lines() {
        let mut parts = line.splitn(3, '\t');
        let additions = parts.next().unwrap_or("");
        let deletions = parts.next().unwrap_or("");
        let path = parts.next().unwrap_or("");
        if path.is_empty() {
            continue;
        }
        let stats = match (additions.parse::<u32>(), deletions.parse::<u32>()) {
            (Ok(add), Ok(del)) => Some((add, del)),
            _ => None,
        };
        map.insert(numstat_target_path(path), stats);
    }
    map
}

/// Resolves numstat rename notation (`old => new`, `dir/{a => b}/file`) to the
/// destination path porcelain reports.
fn numstat_target_path(raw: &str) -> String {
    let raw = unquote(raw);
    if let (Some(open), Some(close)) = (raw.find('{'), raw.find('}')) {
        if open < close {
            let inner = &raw[open + 1..close];
            if let Some((_, new)) = inner.split_once(" => ") {
                let joined = format!("{}{}{}", &raw[..open], new, &raw[close + 1..]);
                return joined.replace("//", "/");
            }
        }
    }
    match raw.split_once(" => ") {
        Some((_, new)) => new.to_string(),
        None => raw,
    }
}

fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}
