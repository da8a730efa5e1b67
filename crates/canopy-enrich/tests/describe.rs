use async_trait::async_trait;
use canopy_core::{ChangeSet, FileChange, FileStatus, StatusError, StatusProvider};
use canopy_enrich::{
    CompletionError, CompletionRequest, CompletionService, EnrichConfig, EnrichError, Enricher,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ScriptedCompletion {
    replies: Mutex<VecDeque<Result<String, CompletionError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    fn new(replies: Vec<Result<String, CompletionError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<String> {
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
        self.replies
            .lock()
            .expect("replies")
            .pop_front()
            .unwrap_or(Err(CompletionError::Empty))
    }
}

struct DiffOnlyStatus;

#[async_trait]
impl StatusProvider for DiffOnlyStatus {
    async fn fetch_changes(&self, root: &Path, _force: bool) -> Result<ChangeSet, StatusError> {
        Ok(ChangeSet::empty(root))
    }

    async fn last_commit_message(&self, _root: &Path) -> Result<Option<String>, StatusError> {
        Ok(None)
    }

    async fn file_diff(&self, _root: &Path, file: &str) -> Result<String, StatusError> {
        Ok(format!(
            "--- a/{file}\n+++ b/{file}\n@@ -1,1 +1,1 @@ fn backoff()\n-    100\n+    250\n"
        ))
    }
}

fn dirty_changes(root: &Path) -> ChangeSet {
    ChangeSet::new(
        root,
        vec![
            FileChange::new("src/retry.rs", FileStatus::Modified)
                .with_stats(1, 1)
                .with_mtime(chrono::Utc::now()),
            FileChange::new("src/policy.rs", FileStatus::Untracked).with_mtime(chrono::Utc::now()),
            FileChange::new("Cargo.lock", FileStatus::Modified).with_stats(20, 20),
        ],
    )
}

#[tokio::test]
async fn prompt_carries_diff_and_new_file_skeleton() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("src")).expect("mkdir");
    std::fs::write(
        dir.path().join("src/policy.rs"),
        "pub struct RetryPolicy {\n    attempts: u32,\n}\n\npub fn default_policy() -> RetryPolicy {\n    RetryPolicy { attempts: 3 }\n}\n",
    )
    .expect("write");

    let completion = ScriptedCompletion::new(vec![Ok(
        r#"{"description": "🔧 adjusting retry logic"}"#.to_string(),
    )]);
    let enricher = Enricher::new(completion.clone(), EnrichConfig::default());
    let description = enricher
        .describe(&dirty_changes(dir.path()), &DiffOnlyStatus)
        .await
        .expect("description");
    assert_eq!(description, "🔧 adjusting retry logic");

    let prompts = completion.prompts();
    assert_eq!(prompts.len(), 1);
    let prompt = &prompts[0];
    assert!(prompt.contains("### M src/retry.rs (+1 -1)"));
    assert!(prompt.contains("+    250"));
    assert!(!prompt.contains("+++ b/src/retry.rs"));
    assert!(prompt.contains("pub struct RetryPolicy"));
    assert!(!prompt.contains("attempts: 3"));
    assert!(!prompt.contains("Cargo.lock"));
}

#[tokio::test(start_paused = true)]
async fn retries_transport_and_parse_failures() {
    let completion = ScriptedCompletion::new(vec![
        Err(CompletionError::Timeout(Duration::from_secs(20))),
        Ok("I think it is about retries".to_string()),
        Ok(r#"{"description": "🔁 tune backoff"}"#.to_string()),
    ]);
    let enricher = Enricher::new(completion.clone(), EnrichConfig::default());
    let started = tokio::time::Instant::now();
    let description = enricher
        .describe(&dirty_changes(Path::new("/nonexistent")), &DiffOnlyStatus)
        .await
        .expect("third attempt succeeds");
    assert_eq!(description, "🔁 tune backoff");
    assert_eq!(completion.prompts().len(), 3);
    assert!(started.elapsed() >= Duration::from_millis(750 + 1_500));
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_retry_budget() {
    let completion = ScriptedCompletion::new(vec![
        Err(CompletionError::Failed("rate limited".to_string())),
        Err(CompletionError::Failed("rate limited".to_string())),
        Err(CompletionError::Failed("still rate limited".to_string())),
        Ok(r#"{"description": "never reached"}"#.to_string()),
    ]);
    let enricher = Enricher::new(completion.clone(), EnrichConfig::default());
    let err = enricher
        .describe(&dirty_changes(Path::new("/nonexistent")), &DiffOnlyStatus)
        .await
        .expect_err("exhausted");
    match err {
        EnrichError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(last.contains("still rate limited"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(completion.prompts().len(), 3);
}

#[tokio::test]
async fn clean_change_set_is_rejected_without_a_call() {
    let completion = ScriptedCompletion::new(Vec::new());
    let enricher = Enricher::new(completion.clone(), EnrichConfig::default());
    let err = enricher
        .describe(&ChangeSet::empty("/repo"), &DiffOnlyStatus)
        .await
        .expect_err("clean");
    assert!(matches!(err, EnrichError::NoChanges));
    assert!(completion.prompts().is_empty());
}
