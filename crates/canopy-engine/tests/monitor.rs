mod common;

use canopy_core::{EngineEvent, EnrichmentStatus, EventBus, Resource, Severity, StatusError};
use canopy_engine::{HeuristicMood, MonitorConfig, MonitorDeps, PollOutcome, ResourceMonitor};
use canopy_enrich::{EnrichConfig, Enricher};
use common::{dirty, drain, updates, ScriptedCompletion, ScriptedStatus};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const ROOT: &str = "/work/app";

fn monitor_with(
    root: &Path,
    status: &Arc<ScriptedStatus>,
    completion: Option<&Arc<ScriptedCompletion>>,
    bus: &EventBus,
    config: MonitorConfig,
) -> ResourceMonitor {
    let enricher = completion.map(|service| Enricher::new(service.clone(), EnrichConfig::default()));
    ResourceMonitor::new(
        Resource::new(root, Some("main".to_string())),
        MonitorDeps {
            status: status.clone(),
            enricher,
            mood: Arc::new(HeuristicMood::default()),
            bus: bus.clone(),
            observer: None,
        },
        config,
    )
}

fn monitor(
    status: &Arc<ScriptedStatus>,
    completion: Option<&Arc<ScriptedCompletion>>,
    bus: &EventBus,
) -> ResourceMonitor {
    monitor_with(Path::new(ROOT), status, completion, bus, MonitorConfig::default())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn unchanged_poll_emits_nothing() {
    let bus = EventBus::new(64);
    let status = ScriptedStatus::new();
    status.set_changes(&dirty(Path::new(ROOT), &[("src/lib.rs", 2, 1)]));
    let monitor = monitor(&status, None, &bus);
    let mut rx = bus.subscribe();

    assert_eq!(monitor.poll(false).await, PollOutcome::Updated);
    assert_eq!(updates(&drain(&mut rx)), 1);

    assert_eq!(monitor.poll(false).await, PollOutcome::Unchanged);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(status.total_calls(), 2);

    assert_eq!(monitor.poll(true).await, PollOutcome::Updated);
    assert_eq!(updates(&drain(&mut rx)), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_polls_share_one_status_call() {
    let bus = EventBus::new(64);
    let status = ScriptedStatus::with_delay(Duration::from_millis(100));
    status.set_changes(&dirty(Path::new(ROOT), &[("src/lib.rs", 1, 0)]));
    let monitor = monitor(&status, None, &bus);

    let (first, second) = tokio::join!(monitor.poll(false), monitor.poll(false));
    let mut outcomes = vec![first, second];
    outcomes.sort_by_key(|outcome| matches!(outcome, PollOutcome::Skipped));
    assert_eq!(outcomes, vec![PollOutcome::Updated, PollOutcome::Skipped]);
    assert_eq!(status.total_calls(), 1);
    assert_eq!(status.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn clean_transition_commits_count_and_summary_together() {
    let bus = EventBus::new(64);
    let status = ScriptedStatus::new();
    status.set_message(ROOT, "fix bug");
    status.set_changes(&dirty(Path::new(ROOT), &[("src/lib.rs", 1, 0)]));
    let monitor = monitor(&status, None, &bus);
    monitor.start().await;
    assert_eq!(monitor.snapshot().changed_files(), 1);

    let mut rx = bus.subscribe();
    status.set_clean(ROOT);
    assert_eq!(monitor.poll(false).await, PollOutcome::Updated);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        EngineEvent::ResourceUpdate(state) => {
            assert_eq!(state.changed_files(), 0);
            assert_eq!(state.summary.as_deref(), Some("✅ fix bug"));
            assert!(!state.summary_loading);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn dirty_burst_coalesces_into_one_deferred_enrichment() {
    let bus = EventBus::new(256);
    let status = ScriptedStatus::new();
    let completion = ScriptedCompletion::replying("🔧 tuning step handling");
    status.set_changes(&dirty(Path::new(ROOT), &[("src/step_0.rs", 1, 0)]));
    let monitor = monitor(&status, Some(&completion), &bus);

    monitor.start().await;
    settle().await;
    assert_eq!(completion.calls(), 1);

    for step in 1..=5 {
        let file = format!("src/step_{step}.rs");
        status.set_changes(&dirty(Path::new(ROOT), &[(file.as_str(), 1, 0)]));
        assert_eq!(monitor.poll(false).await, PollOutcome::Updated);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(completion.calls(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(completion.calls(), 2);
    let prompts = completion.prompts();
    let last = prompts.last().expect("deferred prompt");
    assert!(last.contains("src/step_5.rs"));
    assert!(!last.contains("src/step_4.rs"));
    assert_eq!(
        monitor.snapshot().summary.as_deref(),
        Some("🔧 tuning step handling")
    );
}

#[tokio::test(start_paused = true)]
async fn clean_dirty_enriched_clean_round_trip() {
    let bus = EventBus::new(256);
    let status = ScriptedStatus::new();
    let completion = ScriptedCompletion::slow(Duration::from_secs(3), "🔧 adjusting retry logic");
    status.set_message(ROOT, "fix bug");
    status.set_clean(ROOT);
    let monitor = monitor(&status, Some(&completion), &bus);

    monitor.start().await;
    assert_eq!(monitor.snapshot().summary.as_deref(), Some("✅ fix bug"));
    assert_eq!(completion.calls(), 0);

    status.set_changes(&dirty(Path::new(ROOT), &[("src/retry.rs", 3, 1)]));
    assert_eq!(monitor.poll(false).await, PollOutcome::Updated);
    let state = monitor.snapshot();
    assert_eq!(state.summary.as_deref(), Some("fix bug"));
    assert!(state.summary_loading);
    assert_eq!(state.enrichment, EnrichmentStatus::Loading);

    tokio::time::sleep(Duration::from_secs(4)).await;
    let state = monitor.snapshot();
    assert_eq!(state.summary.as_deref(), Some("🔧 adjusting retry logic"));
    assert!(!state.summary_loading);
    assert_eq!(state.enrichment, EnrichmentStatus::Active);

    status.set_changes(&dirty(
        Path::new(ROOT),
        &[("src/retry.rs", 3, 1), ("src/policy.rs", 2, 0)],
    ));
    assert_eq!(monitor.poll(false).await, PollOutcome::Updated);

    status.set_clean(ROOT);
    assert_eq!(monitor.poll(false).await, PollOutcome::Updated);
    let state = monitor.snapshot();
    assert_eq!(state.summary.as_deref(), Some("✅ fix bug"));
    assert_eq!(state.changed_files(), 0);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(completion.calls(), 1);
    assert_eq!(monitor.snapshot().summary.as_deref(), Some("✅ fix bug"));
}

#[tokio::test(start_paused = true)]
async fn revert_discards_in_flight_enrichment() {
    let bus = EventBus::new(64);
    let status = ScriptedStatus::new();
    let completion = ScriptedCompletion::slow(Duration::from_secs(3), "🧪 late answer");
    status.set_message(ROOT, "fix bug");
    status.set_changes(&dirty(Path::new(ROOT), &[("src/lib.rs", 1, 0)]));
    let monitor = monitor(&status, Some(&completion), &bus);

    monitor.start().await;
    assert!(monitor.snapshot().summary_loading);

    status.set_clean(ROOT);
    monitor.poll(false).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let state = monitor.snapshot();
    assert_eq!(completion.calls(), 1);
    assert_eq!(state.summary.as_deref(), Some("✅ fix bug"));
    assert!(!state.summary_loading);
    assert_eq!(state.enrichment, EnrichmentStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn failed_enrichment_keeps_summary_and_notifies_once() {
    let bus = EventBus::new(64);
    let status = ScriptedStatus::new();
    let completion = ScriptedCompletion::failing("rate limited");
    status.set_message(ROOT, "fix bug");
    status.set_changes(&dirty(Path::new(ROOT), &[("src/lib.rs", 1, 0)]));
    let monitor = monitor(&status, Some(&completion), &bus);
    let mut rx = bus.subscribe();

    monitor.start().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(completion.calls(), 3);
    let state = monitor.snapshot();
    assert_eq!(state.enrichment, EnrichmentStatus::Error);
    assert_eq!(state.summary.as_deref(), Some("fix bug"));
    assert!(!state.summary_loading);

    let notices: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::Notify(notice) => Some(notice),
            _ => None,
        })
        .collect();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].severity, Severity::Warning);
    assert!(notices[0].message.contains("app"));
}

#[tokio::test(start_paused = true)]
async fn forced_refresh_bypasses_enrichment_dedup() {
    let bus = EventBus::new(64);
    let status = ScriptedStatus::new();
    let completion = ScriptedCompletion::replying("🔧 first pass");
    status.set_changes(&dirty(Path::new(ROOT), &[("src/lib.rs", 1, 0)]));
    let monitor = monitor(&status, Some(&completion), &bus);

    monitor.start().await;
    settle().await;
    assert_eq!(completion.calls(), 1);

    assert_eq!(monitor.poll(false).await, PollOutcome::Unchanged);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(completion.calls(), 1);

    monitor.refresh(true).await;
    settle().await;
    assert_eq!(completion.calls(), 2);
    assert_eq!(status.forced_calls(), 1);
}

async fn enriched_then_cleaned(
    status: &Arc<ScriptedStatus>,
    completion: &Arc<ScriptedCompletion>,
    bus: &EventBus,
) -> ResourceMonitor {
    status.set_message(ROOT, "fix bug");
    status.set_changes(&dirty(Path::new(ROOT), &[("src/lib.rs", 1, 0)]));
    let monitor = monitor(status, Some(completion), bus);
    monitor.start().await;
    settle().await;
    assert_eq!(completion.calls(), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    status.set_clean(ROOT);
    assert_eq!(monitor.poll(false).await, PollOutcome::Updated);
    monitor
}

#[tokio::test(start_paused = true)]
async fn enrichment_within_min_interval_waits_for_the_remainder() {
    let bus = EventBus::new(256);
    let status = ScriptedStatus::new();
    let completion = ScriptedCompletion::replying("🔧 reworking parser");
    let monitor = enriched_then_cleaned(&status, &completion, &bus).await;

    status.set_changes(&dirty(Path::new(ROOT), &[("src/parser.rs", 4, 2)]));
    assert_eq!(monitor.poll(false).await, PollOutcome::Updated);
    settle().await;
    assert_eq!(completion.calls(), 1);
    assert!(!monitor.snapshot().summary_loading);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(completion.calls(), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(completion.calls(), 2);
    let prompts = completion.prompts();
    assert!(prompts[1].contains("src/parser.rs"));
    assert_eq!(monitor.snapshot().summary.as_deref(), Some("🔧 reworking parser"));
}

#[tokio::test(start_paused = true)]
async fn forced_refresh_is_not_throttled() {
    let bus = EventBus::new(256);
    let status = ScriptedStatus::new();
    let completion = ScriptedCompletion::replying("🔧 reworking parser");
    let monitor = enriched_then_cleaned(&status, &completion, &bus).await;

    status.set_changes(&dirty(Path::new(ROOT), &[("src/parser.rs", 4, 2)]));
    assert_eq!(monitor.poll(false).await, PollOutcome::Updated);
    settle().await;
    assert_eq!(completion.calls(), 1);

    monitor.refresh(true).await;
    settle().await;
    assert_eq!(completion.calls(), 2);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(completion.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn inaccessible_path_degrades_without_stopping() {
    let bus = EventBus::new(64);
    let status = ScriptedStatus::new();
    status.set_error(ROOT, StatusError::PathInaccessible, "no such directory");
    let monitor = monitor(&status, None, &bus);
    let mut rx = bus.subscribe();

    assert!(matches!(monitor.start().await, PollOutcome::Degraded(_)));
    let degraded = monitor.snapshot().degraded.expect("degraded");
    assert!(degraded.contains("no such directory"));
    assert_eq!(updates(&drain(&mut rx)), 1);

    assert!(matches!(monitor.poll(false).await, PollOutcome::Degraded(_)));
    assert!(drain(&mut rx).is_empty());
    assert!(!monitor.is_stopped());

    status.set_changes(&dirty(Path::new(ROOT), &[("src/lib.rs", 1, 0)]));
    assert_eq!(monitor.poll(false).await, PollOutcome::Updated);
    assert!(monitor.snapshot().degraded.is_none());
}

#[tokio::test(start_paused = true)]
async fn lock_contention_is_silent() {
    let bus = EventBus::new(64);
    let status = ScriptedStatus::new();
    status.set_changes(&dirty(Path::new(ROOT), &[("src/lib.rs", 1, 0)]));
    let monitor = monitor(&status, None, &bus);
    monitor.start().await;
    let before = monitor.snapshot();

    let mut rx = bus.subscribe();
    status.set_error(ROOT, StatusError::LockContention, "index.lock exists");
    assert_eq!(monitor.poll(true).await, PollOutcome::Contended);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(monitor.snapshot(), before);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_deferred_enrichment() {
    let bus = EventBus::new(64);
    let status = ScriptedStatus::new();
    let completion = ScriptedCompletion::replying("🔧 work");
    status.set_changes(&dirty(Path::new(ROOT), &[("src/a.rs", 1, 0)]));
    let monitor = monitor(&status, Some(&completion), &bus);
    monitor.start().await;
    settle().await;

    status.set_changes(&dirty(Path::new(ROOT), &[("src/a.rs", 1, 0), ("src/b.rs", 1, 0)]));
    monitor.poll(false).await;
    monitor.stop();
    monitor.stop();

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(completion.calls(), 1);
    assert_eq!(monitor.poll(true).await, PollOutcome::Skipped);
}

#[tokio::test(start_paused = true)]
async fn metadata_change_emits_one_update() {
    let bus = EventBus::new(64);
    let status = ScriptedStatus::new();
    let monitor = monitor(&status, None, &bus);
    monitor.start().await;
    let mut rx = bus.subscribe();

    assert!(!monitor.update_metadata(Resource::new(ROOT, Some("main".to_string()))));
    assert!(monitor.update_metadata(Resource::new(ROOT, Some("fix/42-crash".to_string()))));
    assert!(!monitor.update_metadata(Resource::new("/work/other", None)));

    let events = drain(&mut rx);
    assert_eq!(updates(&events), 1);
    assert_eq!(
        monitor.snapshot().resource.branch.as_deref(),
        Some("fix/42-crash")
    );
}

#[tokio::test]
async fn sidecar_note_exposes_last_line_truncated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bus = EventBus::new(64);
    let status = ScriptedStatus::new();
    let config = MonitorConfig {
        note_file: Some("NOTES.txt".into()),
        note_max_chars: 20,
        ..MonitorConfig::default()
    };
    let monitor = monitor_with(dir.path(), &status, None, &bus, config);

    monitor.start().await;
    assert!(monitor.snapshot().note.is_none());

    std::fs::write(dir.path().join("NOTES.txt"), "first\nrunning migrations\n  \n").expect("write");
    monitor.poll(true).await;
    assert_eq!(monitor.snapshot().note.as_deref(), Some("running migrations"));

    std::fs::write(
        dir.path().join("NOTES.txt"),
        "rebuilding the search index for every tenant\n",
    )
    .expect("write");
    monitor.poll(true).await;
    assert_eq!(
        monitor.snapshot().note.as_deref(),
        Some("rebuilding the se...")
    );

    std::fs::write(dir.path().join("NOTES.txt"), "   \n").expect("write");
    monitor.poll(true).await;
    assert!(monitor.snapshot().note.is_none());
}
