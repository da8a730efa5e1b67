#![allow(dead_code)]

use async_trait::async_trait;
use canopy_core::{
    normalize_path, ChangeSet, EngineEvent, FileChange, FileStatus, PeerCandidate, PeerMatch,
    PeerState, RemoteError, RemoteQuery, ResourceId, StatusError, StatusProvider,
};
use canopy_enrich::{CompletionError, CompletionRequest, CompletionService};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub fn dirty(root: &Path, files: &[(&str, u32, u32)]) -> ChangeSet {
    ChangeSet::new(
        root,
        files
            .iter()
            .map(|(path, ins, del)| {
                FileChange::new(*path, FileStatus::Modified).with_stats(*ins, *del)
            })
            .collect(),
    )
}

pub fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn updates(events: &[EngineEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, EngineEvent::ResourceUpdate(_)))
        .count()
}

#[derive(Clone)]
enum Scripted {
    Changes(Vec<FileChange>),
    Fail(fn(String) -> StatusError, String),
}

/// Status provider driven by the test. Counts calls and the highest number
/// of overlapping `fetch_changes` calls.
pub struct ScriptedStatus {
    delay: Duration,
    scripts: Mutex<HashMap<PathBuf, Scripted>>,
    messages: Mutex<HashMap<PathBuf, String>>,
    calls: Mutex<HashMap<PathBuf, usize>>,
    forced: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedStatus {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            scripts: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            forced: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn set_changes(&self, changes: &ChangeSet) {
        self.scripts.lock().expect("scripts").insert(
            normalize_path(&changes.root),
            Scripted::Changes(changes.files.clone()),
        );
    }

    pub fn set_clean(&self, root: impl AsRef<Path>) {
        self.set_changes(&ChangeSet::empty(root.as_ref()));
    }

    pub fn set_error(&self, root: impl AsRef<Path>, make: fn(String) -> StatusError, reason: &str) {
        self.scripts.lock().expect("scripts").insert(
            normalize_path(root.as_ref()),
            Scripted::Fail(make, reason.to_string()),
        );
    }

    pub fn set_message(&self, root: impl AsRef<Path>, message: &str) {
        self.messages
            .lock()
            .expect("messages")
            .insert(normalize_path(root.as_ref()), message.to_string());
    }

    pub fn calls(&self, root: impl AsRef<Path>) -> usize {
        self.calls
            .lock()
            .expect("calls")
            .get(&normalize_path(root.as_ref()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().expect("calls").values().sum()
    }

    pub fn forced_calls(&self) -> usize {
        self.forced.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusProvider for ScriptedStatus {
    async fn fetch_changes(&self, root: &Path, force: bool) -> Result<ChangeSet, StatusError> {
        let key = normalize_path(root);
        *self.calls.lock().expect("calls").entry(key.clone()).or_insert(0) += 1;
        if force {
            self.forced.fetch_add(1, Ordering::SeqCst);
        }
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let script = self.scripts.lock().expect("scripts").get(&key).cloned();
        match script {
            Some(Scripted::Changes(files)) => Ok(ChangeSet::new(root, files)),
            Some(Scripted::Fail(make, reason)) => Err(make(reason)),
            None => Ok(ChangeSet::empty(root)),
        }
    }

    async fn last_commit_message(&self, root: &Path) -> Result<Option<String>, StatusError> {
        Ok(self
            .messages
            .lock()
            .expect("messages")
            .get(&normalize_path(root))
            .cloned())
    }

    async fn file_diff(&self, _root: &Path, file: &str) -> Result<String, StatusError> {
        Ok(format!(
            "--- a/{file}\n+++ b/{file}\n@@ -1,1 +1,1 @@ fn retry()\n-    old\n+    new\n"
        ))
    }
}

/// Completion service replying from a script, then with a fixed default.
pub struct ScriptedCompletion {
    delay: Duration,
    fallback: Result<String, CompletionError>,
    replies: Mutex<VecDeque<Result<String, CompletionError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn replying(description: &str) -> Arc<Self> {
        Self::build(
            Duration::ZERO,
            Ok(format!(r#"{{"description": "{description}"}}"#)),
        )
    }

    pub fn slow(delay: Duration, description: &str) -> Arc<Self> {
        Self::build(delay, Ok(format!(r#"{{"description": "{description}"}}"#)))
    }

    pub fn failing(reason: &str) -> Arc<Self> {
        Self::build(Duration::ZERO, Err(CompletionError::Failed(reason.to_string())))
    }

    fn build(delay: Duration, fallback: Result<String, CompletionError>) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fallback,
            replies: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn push_reply(&self, reply: Result<String, CompletionError>) {
        self.replies.lock().expect("replies").push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().expect("prompts").len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts").clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        self.prompts
            .lock()
            .expect("prompts")
            .push(request.prompt.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.replies.lock().expect("replies").pop_front();
        match scripted {
            Some(reply) => reply,
            None => match &self.fallback {
                Ok(text) => Ok(text.clone()),
                Err(CompletionError::Failed(reason)) => Err(CompletionError::Failed(reason.clone())),
                Err(_) => Err(CompletionError::Empty),
            },
        }
    }
}

/// Remote query that records every batch. Matches candidates whose
/// secondary id is listed in `open`, or fails every call.
pub struct ScriptedRemote {
    delay: Duration,
    fail: bool,
    open: Mutex<HashMap<String, String>>,
    batches: Mutex<Vec<(Instant, Vec<PeerCandidate>)>>,
}

impl ScriptedRemote {
    pub fn matching(ids: &[&str]) -> Arc<Self> {
        Self::build(Duration::ZERO, false, ids)
    }

    pub fn slow_matching(delay: Duration, ids: &[&str]) -> Arc<Self> {
        Self::build(delay, false, ids)
    }

    pub fn failing() -> Arc<Self> {
        Self::build(Duration::ZERO, true, &[])
    }

    fn build(delay: Duration, fail: bool, ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail,
            open: Mutex::new(
                ids.iter()
                    .map(|id| (id.to_string(), format!("https://example.test/pull/{id}")))
                    .collect(),
            ),
            batches: Mutex::new(Vec::new()),
        })
    }

    pub fn batches(&self) -> Vec<(Instant, Vec<PeerCandidate>)> {
        self.batches.lock().expect("batches").clone()
    }
}

#[async_trait]
impl RemoteQuery for ScriptedRemote {
    async fn batch_check(
        &self,
        candidates: &[PeerCandidate],
    ) -> Result<HashMap<ResourceId, Option<PeerMatch>>, RemoteError> {
        self.batches
            .lock()
            .expect("batches")
            .push((Instant::now(), candidates.to_vec()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(RemoteError::Command("HTTP 502".to_string()));
        }
        let open = self.open.lock().expect("open").clone();
        Ok(candidates
            .iter()
            .map(|candidate| {
                let found = open.get(&candidate.secondary_id).map(|url| PeerMatch {
                    peer_id: candidate.secondary_id.clone(),
                    url: url.clone(),
                    state: PeerState::Open,
                });
                (candidate.resource_id.clone(), found)
            })
            .collect())
    }
}
