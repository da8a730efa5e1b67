use async_trait::async_trait;
use canopy_core::{PeerCandidate, PeerMatch, PeerState, RemoteError, RemoteQuery, ResourceId};
use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const PR_LIST_LIMIT: &str = "200";

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    number: u64,
    url: String,
    state: String,
    #[serde(rename = "headRefName")]
    head_ref_name: String,
}

/// Peer lookup through the GitHub CLI: one `gh pr list` per batch, matched
/// locally against every candidate's branch.
pub struct GhPeerQuery {
    program: String,
    timeout: Duration,
}

impl GhPeerQuery {
    pub fn new() -> Self {
        Self {
            program: "gh".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for GhPeerQuery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteQuery for GhPeerQuery {
    async fn batch_check(
        &self,
        candidates: &[PeerCandidate],
    ) -> Result<HashMap<ResourceId, Option<PeerMatch>>, RemoteError> {
        let Some(first) = candidates.first() else {
            return Ok(HashMap::new());
        };

        let mut command = Command::new(&self.program);
        command
            .args([
                "pr",
                "list",
                "--state",
                "all",
                "--limit",
                PR_LIST_LIMIT,
                "--json",
                "number,url,state,headRefName",
            ])
            .current_dir(first.worktree())
            .kill_on_drop(true);
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => {
                return Err(RemoteError::ToolMissing(self.program.clone()))
            }
            Ok(Err(err)) => return Err(RemoteError::Command(err.to_string())),
            Err(_) => return Err(RemoteError::Timeout(self.timeout.as_secs())),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(RemoteError::Command(stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let pulls = parse_pull_requests(stdout.trim())?;
        debug!(
            event = "gh_pr_list",
            candidates = candidates.len(),
            pulls = pulls.len()
        );
        Ok(match_candidates(candidates, &pulls))
    }
}

fn parse_pull_requests(raw: &str) -> Result<Vec<GhPullRequest>, RemoteError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).map_err(|err| RemoteError::Parse(err.to_string()))
}

/// Several PRs can share a head branch over time; an open one wins, otherwise
/// the most recent by number.
fn match_candidates(
    candidates: &[PeerCandidate],
    pulls: &[GhPullRequest],
) -> HashMap<ResourceId, Option<PeerMatch>> {
    let mut results = HashMap::with_capacity(candidates.len());
    for candidate in candidates {
        let best = pulls
            .iter()
            .filter(|pull| pull.head_ref_name == candidate.branch)
            .filter_map(|pull| PeerState::parse(&pull.state).map(|state| (pull, state)))
            .max_by_key(|(pull, state)| (*state == PeerState::Open, pull.number))
            .map(|(pull, state)| PeerMatch {
                peer_id: pull.number.to_string(),
                url: pull.url.clone(),
                state,
            });
        results.insert(candidate.resource_id.clone(), best);
    }
    results
}
