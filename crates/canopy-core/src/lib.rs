pub mod events;
pub mod fingerprint;
pub mod identity;
pub mod remote;
pub mod status;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub use events::{EngineEvent, EventBus, Notification, Severity};
pub use fingerprint::{fingerprint, Fingerprint};
pub use identity::{secondary_id_from_branch, IdentityKey};
pub use remote::{PeerCandidate, PeerMatch, RemoteError, RemoteQuery};
pub use status::{StatusError, StatusProvider};

/// Stable identity of a monitored worktree: its normalized absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self(normalize_path(path.as_ref()).to_string_lossy().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lexically normalizes a path: drops `.` segments, resolves `..` against
/// preceding segments and strips trailing separators. Does not touch the
/// filesystem, so it works for worktrees that have already disappeared.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    /// `None` means detached HEAD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub is_current: bool,
}

impl Resource {
    pub fn new(path: impl AsRef<Path>, branch: Option<String>) -> Self {
        let id = ResourceId::from_path(path);
        let name = id
            .as_path()
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| id.to_string());
        Self {
            id,
            name,
            branch,
            is_current: false,
        }
    }

    pub fn path(&self) -> &Path {
        self.id.as_path()
    }

    pub fn is_detached(&self) -> bool {
        self.branch.is_none()
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::for_branch(self.branch.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Modified,
    Added,
    Deleted,
    Renamed,
    Untracked,
    Ignored,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Modified => "modified",
            FileStatus::Added => "added",
            FileStatus::Deleted => "deleted",
            FileStatus::Renamed => "renamed",
            FileStatus::Untracked => "untracked",
            FileStatus::Ignored => "ignored",
        }
    }

    /// Single-letter code used in compact listings.
    pub fn code(self) -> char {
        match self {
            FileStatus::Modified => 'M',
            FileStatus::Added => 'A',
            FileStatus::Deleted => 'D',
            FileStatus::Renamed => 'R',
            FileStatus::Untracked => '?',
            FileStatus::Ignored => '!',
        }
    }

    pub fn is_new_file(self) -> bool {
        matches!(self, FileStatus::Added | FileStatus::Untracked)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub status: FileStatus,
    /// `None` when the provider has no line stats (untracked or binary).
    pub insertions: Option<u32>,
    pub deletions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTime<Utc>>,
}

impl FileChange {
    pub fn new(path: impl Into<String>, status: FileStatus) -> Self {
        Self {
            path: path.into(),
            status,
            insertions: None,
            deletions: None,
            mtime: None,
        }
    }

    pub fn with_stats(mut self, insertions: u32, deletions: u32) -> Self {
        self.insertions = Some(insertions);
        self.deletions = Some(deletions);
        self
    }

    pub fn with_mtime(mut self, mtime: DateTime<Utc>) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn line_delta(&self) -> u64 {
        u64::from(self.insertions.unwrap_or(0)) + u64::from(self.deletions.unwrap_or(0))
    }
}

/// A worktree's file-level differences at one instant. Built once per poll
/// via [`ChangeSet::new`], which also computes the aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub root: PathBuf,
    pub files: Vec<FileChange>,
    pub changed_files: usize,
    pub insertions: u64,
    pub deletions: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_mtime: Option<DateTime<Utc>>,
}

impl ChangeSet {
    pub fn new(root: impl Into<PathBuf>, files: Vec<FileChange>) -> Self {
        let insertions = files
            .iter()
            .map(|file| u64::from(file.insertions.unwrap_or(0)))
            .sum();
        let deletions = files
            .iter()
            .map(|file| u64::from(file.deletions.unwrap_or(0)))
            .sum();
        let latest_mtime = files.iter().filter_map(|file| file.mtime).max();
        Self {
            root: root.into(),
            changed_files: files.len(),
            files,
            insertions,
            deletions,
            latest_mtime,
        }
    }

    pub fn empty(root: impl Into<PathBuf>) -> Self {
        Self::new(root, Vec::new())
    }

    pub fn is_clean(&self) -> bool {
        self.changed_files == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Disabled,
    Loading,
    Active,
    Error,
}

impl EnrichmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrichmentStatus::Disabled => "disabled",
            EnrichmentStatus::Loading => "loading",
            EnrichmentStatus::Active => "active",
            EnrichmentStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    #[default]
    Clean,
    Working,
    Heavy,
    Stale,
}

/// Snapshot of everything the engine knows about one worktree. Published by
/// value; consumers never observe later mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub resource: Resource,
    pub changes: Option<Arc<ChangeSet>>,
    pub summary: Option<String>,
    pub summary_loading: bool,
    pub enrichment: EnrichmentStatus,
    pub mood: Mood,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl ResourceState {
    pub fn initial(resource: Resource, enrichment_enabled: bool) -> Self {
        Self {
            resource,
            changes: None,
            summary: None,
            summary_loading: false,
            enrichment: if enrichment_enabled {
                EnrichmentStatus::Active
            } else {
                EnrichmentStatus::Disabled
            },
            mood: Mood::Clean,
            last_activity: None,
            note: None,
            degraded: None,
        }
    }

    pub fn changed_files(&self) -> usize {
        self.changes.as_ref().map_or(0, |changes| changes.changed_files)
    }

    pub fn is_clean(&self) -> bool {
        self.changes.as_ref().map_or(true, |changes| changes.is_clean())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Open,
    Merged,
    Closed,
}

impl PeerState {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" => Some(PeerState::Open),
            "merged" => Some(PeerState::Merged),
            "closed" => Some(PeerState::Closed),
            _ => None,
        }
    }
}

/// A detected association between a worktree and a remote request record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLink {
    pub resource_id: ResourceId,
    pub peer_id: String,
    pub url: String,
    pub state: PeerState,
    pub for_identity_key: IdentityKey,
}
