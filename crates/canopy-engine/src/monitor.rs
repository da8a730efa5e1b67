use crate::config::MonitorConfig;
use crate::mood::MoodScorer;
use canopy_core::{
    fingerprint, EngineEvent, EnrichmentStatus, EventBus, Fingerprint, Resource,
    ResourceId, ResourceState, Severity, StatusError, StatusProvider,
};
use canopy_enrich::{EnrichError, Enricher};
use chrono::Utc;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CLEAN_MARKER: &str = "✅";
const NOTE_TAIL_BYTES: u64 = 4 * 1024;

/// Receives resource updates and removals synchronously, before they reach
/// the bus, so it never misses one to a lagging subscriber.
pub trait ResourceObserver: Send + Sync {
    fn observe(&self, event: &EngineEvent);
}

/// Collaborators shared by every monitor an engine creates.
#[derive(Clone)]
pub struct MonitorDeps {
    pub status: Arc<dyn StatusProvider>,
    pub enricher: Option<Enricher>,
    pub mood: Arc<dyn MoodScorer>,
    pub bus: EventBus,
    pub observer: Option<Arc<dyn ResourceObserver>>,
}

impl MonitorDeps {
    /// Hands the event to the observer, then emits it on the bus.
    pub fn publish(&self, event: EngineEvent) {
        if let Some(observer) = &self.observer {
            observer.observe(&event);
        }
        self.bus.emit(event);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another poll was running, or the monitor is stopped.
    Skipped,
    /// Same fingerprint as the last commit; nothing emitted.
    Unchanged,
    Updated,
    /// The version-control lock was held; retried on the next cycle.
    Contended,
    Degraded(String),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EnrichTrigger {
    Deferred,
    Immediate,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Clean,
    FirstDirty,
    StillDirty,
}

#[derive(Default)]
struct EnrichmentGuard {
    timer: Option<(u64, JoinHandle<()>)>,
    timer_seq: u64,
    /// Fingerprint of the last change set that was successfully described.
    last_enriched: Option<Fingerprint>,
    in_flight: bool,
    rerun: Option<EnrichTrigger>,
    last_started: Option<Instant>,
    /// Bumped on every cancellation; in-flight results from an older
    /// generation are discarded.
    generation: u64,
}

impl EnrichmentGuard {
    fn timer_pending(&self) -> bool {
        self.timer
            .as_ref()
            .map_or(false, |(_, handle)| !handle.is_finished())
    }

    fn abort_timer(&mut self) {
        if let Some((_, handle)) = self.timer.take() {
            handle.abort();
        }
    }

    fn cancel(&mut self) {
        self.abort_timer();
        self.last_enriched = None;
        self.rerun = None;
        self.generation += 1;
    }
}

struct MonitorState {
    snapshot: ResourceState,
    last_fingerprint: Option<Fingerprint>,
    guard: EnrichmentGuard,
}

struct MonitorInner {
    id: ResourceId,
    deps: MonitorDeps,
    config: MonitorConfig,
    polling: AtomicBool,
    stopped: AtomicBool,
    state: Mutex<MonitorState>,
}

/// Per-worktree state machine: polls, deduplicates by fingerprint, commits
/// one snapshot per cycle and drives enrichment.
#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
}

struct PollGuard<'a>(&'a AtomicBool);

impl<'a> PollGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ResourceMonitor {
    pub fn new(resource: Resource, deps: MonitorDeps, config: MonitorConfig) -> Self {
        let enrichment_enabled = deps.enricher.is_some();
        let id = resource.id.clone();
        Self {
            inner: Arc::new(MonitorInner {
                id,
                deps,
                config,
                polling: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                state: Mutex::new(MonitorState {
                    snapshot: ResourceState::initial(resource, enrichment_enabled),
                    last_fingerprint: None,
                    guard: EnrichmentGuard::default(),
                }),
            }),
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.inner.id
    }

    pub fn snapshot(&self) -> ResourceState {
        self.inner.lock_state().snapshot.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Initial poll. Never fails: a failed first poll leaves the monitor
    /// running in a degraded state.
    pub async fn start(&self) -> PollOutcome {
        let outcome = self.poll(false).await;
        if let PollOutcome::Failed(reason) = &outcome {
            self.inner.mark_degraded(format!("initial poll failed: {reason}"));
        }
        info!(event = "monitor_started", resource = %self.inner.id, outcome = ?outcome);
        outcome
    }

    pub async fn poll(&self, force: bool) -> PollOutcome {
        self.inner.poll(force).await
    }

    /// Forced poll, optionally followed by a forced enrichment that bypasses
    /// dedup, debounce and throttling (but not the single-flight guard).
    pub async fn refresh(&self, force_enrich: bool) -> PollOutcome {
        let outcome = self.inner.poll(true).await;
        if force_enrich {
            self.inner.request_enrichment(EnrichTrigger::Forced);
        }
        outcome
    }

    /// Applies an externally observed name/branch/current change. Emits one
    /// update when something actually changed.
    pub fn update_metadata(&self, resource: Resource) -> bool {
        if resource.id != self.inner.id {
            return false;
        }
        let mut state = self.inner.lock_state();
        let current = &state.snapshot.resource;
        if current.name == resource.name
            && current.branch == resource.branch
            && current.is_current == resource.is_current
        {
            return false;
        }
        debug!(
            event = "monitor_metadata_updated",
            resource = %self.inner.id,
            branch = ?resource.branch
        );
        state.snapshot.resource = resource;
        self.inner.deps.publish(EngineEvent::ResourceUpdate(state.snapshot.clone()));
        true
    }

    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.inner.lock_state();
        state.guard.cancel();
        info!(event = "monitor_stopped", resource = %self.inner.id);
    }
}

impl MonitorInner {
    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    async fn poll(self: &Arc<Self>, force: bool) -> PollOutcome {
        if self.is_stopped() {
            return PollOutcome::Skipped;
        }
        let Some(_guard) = PollGuard::acquire(&self.polling) else {
            debug!(event = "poll_skipped_reentrant", resource = %self.id);
            return PollOutcome::Skipped;
        };

        let root = self.id.as_path().to_path_buf();
        let changes = match self.deps.status.fetch_changes(&root, force).await {
            Ok(changes) => Arc::new(changes),
            Err(StatusError::LockContention(reason)) => {
                debug!(event = "poll_lock_contention", resource = %self.id, reason = %reason);
                return PollOutcome::Contended;
            }
            Err(StatusError::PathInaccessible(reason)) => {
                warn!(event = "poll_path_inaccessible", resource = %self.id, reason = %reason);
                self.mark_degraded(format!("path inaccessible: {reason}"));
                return PollOutcome::Degraded(reason);
            }
            Err(err) => {
                warn!(event = "poll_failed", resource = %self.id, error = %err);
                return PollOutcome::Failed(err.to_string());
            }
        };

        let fingerprint = fingerprint(&changes);
        let was_dirty = {
            let state = self.lock_state();
            if !force
                && state.last_fingerprint.as_ref() == Some(&fingerprint)
                && state.snapshot.degraded.is_none()
            {
                debug!(event = "poll_unchanged", resource = %self.id);
                return PollOutcome::Unchanged;
            }
            state
                .snapshot
                .changes
                .as_ref()
                .map_or(false, |previous| !previous.is_clean())
        };

        let transition = if changes.is_clean() {
            Transition::Clean
        } else if was_dirty {
            Transition::StillDirty
        } else {
            Transition::FirstDirty
        };
        let commit_message = match transition {
            Transition::Clean | Transition::FirstDirty => self.commit_message(&root).await,
            Transition::StillDirty => None,
        };
        let note = self.read_note(&root).await;
        if self.is_stopped() {
            return PollOutcome::Skipped;
        }

        let enrichment_enabled = self.deps.enricher.is_some();
        let mut enrich_now = false;
        let mut arm_deferred = false;
        {
            let mut state = self.lock_state();
            let now = Utc::now();
            let mut next = state.snapshot.clone();
            next.mood = self.deps.mood.score(&next.resource, &changes, now);
            next.changes = Some(changes.clone());
            next.last_activity = Some(now);
            next.note = note;
            next.degraded = None;

            match transition {
                Transition::Clean => {
                    next.summary = Some(clean_summary(commit_message.as_deref()));
                    next.summary_loading = false;
                    if next.enrichment == EnrichmentStatus::Loading {
                        next.enrichment = EnrichmentStatus::Active;
                    }
                    state.guard.cancel();
                }
                Transition::FirstDirty => {
                    next.summary = Some(
                        commit_message.unwrap_or_else(|| "Uncommitted changes".to_string()),
                    );
                    enrich_now = enrichment_enabled;
                }
                Transition::StillDirty => {
                    arm_deferred = enrichment_enabled
                        && state.guard.last_enriched.as_ref() != Some(&fingerprint);
                }
            }

            state.snapshot = next;
            state.last_fingerprint = Some(fingerprint);
            self.deps.publish(EngineEvent::ResourceUpdate(state.snapshot.clone()));
        }
        debug!(
            event = "poll_committed",
            resource = %self.id,
            transition = ?transition,
            files = changes.changed_files
        );

        if enrich_now {
            self.request_enrichment(EnrichTrigger::Immediate);
        } else if arm_deferred {
            self.arm_deferred(self.config.enrich_debounce);
        }
        PollOutcome::Updated
    }

    fn mark_degraded(&self, reason: String) {
        let mut state = self.lock_state();
        if state.snapshot.degraded.as_deref() == Some(reason.as_str()) {
            return;
        }
        state.snapshot.degraded = Some(reason);
        self.deps.publish(EngineEvent::ResourceUpdate(state.snapshot.clone()));
    }

    async fn commit_message(&self, root: &Path) -> Option<String> {
        match self.deps.status.last_commit_message(root).await {
            Ok(message) => message,
            Err(err) => {
                debug!(event = "commit_message_unavailable", resource = %self.id, error = %err);
                None
            }
        }
    }

    async fn read_note(&self, root: &Path) -> Option<String> {
        let relative = self.config.note_file.as_ref()?;
        let tail = read_tail(&root.join(relative), NOTE_TAIL_BYTES).await?;
        let line = tail.lines().map(str::trim).filter(|line| !line.is_empty()).last()?;
        Some(truncate_chars(line, self.config.note_max_chars))
    }

    fn request_enrichment(self: &Arc<Self>, trigger: EnrichTrigger) {
        let Some(enricher) = self.deps.enricher.clone() else {
            return;
        };
        if self.is_stopped() {
            return;
        }
        let mut state = self.lock_state();
        let Some(changes) = state.snapshot.changes.clone() else {
            return;
        };
        if changes.is_clean() {
            return;
        }
        let fingerprint = fingerprint(&changes);

        if state.guard.in_flight {
            state.guard.rerun = Some(state.guard.rerun.map_or(trigger, |prev| prev.max(trigger)));
            debug!(event = "enrich_rerun_queued", resource = %self.id, trigger = ?trigger);
            return;
        }
        if trigger != EnrichTrigger::Forced {
            if state.guard.last_enriched.as_ref() == Some(&fingerprint) {
                debug!(event = "enrich_deduplicated", resource = %self.id);
                return;
            }
            if let Some(started) = state.guard.last_started {
                let elapsed = started.elapsed();
                if elapsed < self.config.enrich_min_interval {
                    drop(state);
                    debug!(event = "enrich_throttled", resource = %self.id);
                    self.arm_deferred(self.config.enrich_min_interval - elapsed);
                    return;
                }
            }
        } else {
            state.guard.abort_timer();
        }

        state.guard.in_flight = true;
        state.guard.last_started = Some(Instant::now());
        let generation = state.guard.generation;
        state.snapshot.summary_loading = true;
        state.snapshot.enrichment = EnrichmentStatus::Loading;
        self.deps.publish(EngineEvent::ResourceUpdate(state.snapshot.clone()));
        drop(state);

        debug!(event = "enrich_started", resource = %self.id, trigger = ?trigger);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = enricher
                .describe(&changes, inner.deps.status.as_ref())
                .await;
            inner.finish_enrichment(generation, fingerprint, result);
        });
    }

    fn finish_enrichment(
        self: &Arc<Self>,
        generation: u64,
        fingerprint: Fingerprint,
        result: Result<String, EnrichError>,
    ) {
        let rerun = {
            let mut state = self.lock_state();
            state.guard.in_flight = false;
            let rerun = state.guard.rerun.take();
            if generation != state.guard.generation || self.is_stopped() {
                debug!(event = "enrich_discarded", resource = %self.id);
            } else {
                state.snapshot.summary_loading = false;
                match result {
                    Ok(description) => {
                        state.snapshot.summary = Some(description);
                        state.snapshot.enrichment = EnrichmentStatus::Active;
                        state.guard.last_enriched = Some(fingerprint);
                    }
                    Err(EnrichError::NoChanges) => {
                        state.snapshot.enrichment = EnrichmentStatus::Active;
                    }
                    Err(err) => {
                        warn!(event = "enrich_failed", resource = %self.id, error = %err);
                        state.snapshot.enrichment = EnrichmentStatus::Error;
                        self.deps.bus.notify(
                            Severity::Warning,
                            format!(
                                "Could not describe changes in {}: {err}",
                                state.snapshot.resource.name
                            ),
                        );
                    }
                }
                self.deps.publish(EngineEvent::ResourceUpdate(state.snapshot.clone()));
            }
            rerun
        };
        if let Some(trigger) = rerun {
            self.request_enrichment(trigger);
        }
    }

    /// Arms the deferred enrichment timer unless one is already pending.
    /// A pending timer is never pushed back.
    fn arm_deferred(self: &Arc<Self>, delay: Duration) {
        if self.is_stopped() {
            return;
        }
        let mut state = self.lock_state();
        if state.guard.timer_pending() {
            return;
        }
        state.guard.timer_seq += 1;
        let seq = state.guard.timer_seq;
        let weak: Weak<MonitorInner> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut state = inner.lock_state();
                if matches!(state.guard.timer, Some((current, _)) if current == seq) {
                    state.guard.timer = None;
                }
            }
            inner.request_enrichment(EnrichTrigger::Deferred);
        });
        state.guard.timer = Some((seq, handle));
        debug!(event = "enrich_deferred", resource = %self.id, delay_ms = delay.as_millis() as u64);
    }
}

fn clean_summary(message: Option<&str>) -> String {
    match message {
        Some(message) if !message.trim().is_empty() => format!("{CLEAN_MARKER} {}", message.trim()),
        _ => format!("{CLEAN_MARKER} clean"),
    }
}

async fn read_tail(path: &Path, max_bytes: u64) -> Option<String> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let len = file.metadata().await.ok()?.len();
    if len > max_bytes {
        file.seek(SeekFrom::Start(len - max_bytes)).await.ok()?;
    }
    let mut buffer = Vec::with_capacity(len.min(max_bytes) as usize);
    file.read_to_end(&mut buffer).await.ok()?;
    Some(String::from_utf8_lossy(&buffer).to_string())
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out = text
        .chars()
        .take(limit.saturating_sub(3))
        .collect::<String>();
    out.push_str("...");
    out
}
