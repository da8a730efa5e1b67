use crate::{PeerState, ResourceId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCandidate {
    pub resource_id: ResourceId,
    pub secondary_id: String,
    pub branch: String,
}

impl PeerCandidate {
    pub fn worktree(&self) -> PathBuf {
        self.resource_id.as_path().to_path_buf()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMatch {
    pub peer_id: String,
    pub url: String,
    pub state: PeerState,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{0} not found on PATH")]
    ToolMissing(String),
    #[error("remote query timed out after {0}s")]
    Timeout(u64),
    #[error("remote query failed: {0}")]
    Command(String),
    #[error("remote response unreadable: {0}")]
    Parse(String),
}

/// Batched remote lookup. One call covers every candidate; candidates with no
/// match map to `None`.
#[async_trait]
pub trait RemoteQuery: Send + Sync {
    async fn batch_check(
        &self,
        candidates: &[PeerCandidate],
    ) -> Result<HashMap<ResourceId, Option<PeerMatch>>, RemoteError>;
}
