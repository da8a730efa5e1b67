use crate::config::PeerConfig;
use crate::monitor::ResourceObserver;
use canopy_core::{
    EngineEvent, EventBus, IdentityKey, PeerCandidate, PeerLink, RemoteQuery, ResourceId,
    Severity,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct PeerBook {
    /// Latest identity seen for every live resource.
    identities: HashMap<ResourceId, IdentityKey>,
    resolved: HashMap<ResourceId, PeerLink>,
    consecutive_errors: u32,
    disabled: bool,
    paused: bool,
    debounce_at: Option<Instant>,
    next_check: Option<Instant>,
}

impl PeerBook {
    fn candidates(&self) -> Vec<(PeerCandidate, IdentityKey)> {
        let mut candidates: Vec<(PeerCandidate, IdentityKey)> = self
            .identities
            .iter()
            .filter(|(id, _)| !self.resolved.contains_key(*id))
            .filter_map(|(id, key)| {
                let candidate = PeerCandidate {
                    resource_id: id.clone(),
                    secondary_id: key.secondary_id.clone()?,
                    branch: key.branch.clone()?,
                };
                Some((candidate, key.clone()))
            })
            .collect();
        candidates.sort_by(|a, b| a.0.resource_id.cmp(&b.0.resource_id));
        candidates
    }

    fn has_candidates(&self) -> bool {
        self.identities
            .iter()
            .any(|(id, key)| key.is_candidate() && !self.resolved.contains_key(id))
    }
}

struct PeerInner {
    query: Arc<dyn RemoteQuery>,
    bus: EventBus,
    config: PeerConfig,
    book: Mutex<PeerBook>,
    wake: Notify,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Links worktrees to remote pull requests by the issue number in their
/// branch name. Fed by resource updates, either handed over directly by the
/// monitors or read from the event bus; never polls the status provider.
#[derive(Clone)]
pub struct PeerDetector {
    inner: Arc<PeerInner>,
}

impl PeerDetector {
    pub fn new(query: Arc<dyn RemoteQuery>, bus: EventBus, config: PeerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(PeerInner {
                query,
                bus,
                config,
                book: Mutex::new(PeerBook::default()),
                wake: Notify::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Subscribes to the bus and spawns the check loop. Must run before the
    /// first resource is synced so no update is missed.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) || self.is_stopped() {
            return;
        }
        let events = self.inner.bus.subscribe();
        Arc::clone(&self.inner).spawn_loop(Some(events), self.inner.shutdown.subscribe());
        info!(event = "peer_detector_started", intake = "bus");
    }

    /// Spawns only the check loop. Events must be delivered through
    /// [`ResourceObserver`] by whoever publishes them.
    pub fn start_attached(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) || self.is_stopped() {
            return;
        }
        Arc::clone(&self.inner).spawn_loop(None, self.inner.shutdown.subscribe());
        info!(event = "peer_detector_started", intake = "direct");
    }

    /// Applies one bus event. Identity changes clear the affected link before
    /// this returns.
    pub fn handle_event(&self, event: &EngineEvent) {
        self.inner.handle_event(event);
    }

    /// Re-enables a disabled detector, resets the error count and checks
    /// right away.
    pub fn refresh(&self) {
        if self.is_stopped() {
            return;
        }
        {
            let mut book = self.inner.lock_book();
            if book.disabled {
                info!(event = "peer_detector_reenabled");
            }
            book.disabled = false;
            book.consecutive_errors = 0;
            book.debounce_at = Some(Instant::now());
        }
        self.inner.wake.notify_one();
    }

    /// Delay until the next scheduled check given the current error streak,
    /// or `None` while disabled.
    pub fn next_delay(&self) -> Option<Duration> {
        let book = self.inner.lock_book();
        if book.disabled {
            return None;
        }
        Some(self.inner.delay_for(book.consecutive_errors))
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.lock_book().disabled
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.inner.lock_book().consecutive_errors
    }

    pub fn link(&self, resource_id: &ResourceId) -> Option<PeerLink> {
        self.inner.lock_book().resolved.get(resource_id).cloned()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        info!(event = "peer_detector_stopped");
    }
}

impl ResourceObserver for PeerDetector {
    fn observe(&self, event: &EngineEvent) {
        if !self.is_stopped() {
            self.inner.handle_event(event);
        }
    }
}

impl PeerInner {
    fn lock_book(&self) -> MutexGuard<'_, PeerBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delay_for(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return self.config.interval;
        }
        let last = self.config.backoff.len().saturating_sub(1);
        let index = (consecutive_errors as usize - 1).min(last);
        self.config
            .backoff
            .get(index)
            .copied()
            .unwrap_or(self.config.interval)
    }

    fn handle_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::ResourceUpdate(state) => {
                let id = &state.resource.id;
                let key = state.resource.identity_key();
                let mut book = self.lock_book();
                let previous = book.identities.insert(id.clone(), key.clone());
                if previous.as_ref() == Some(&key) {
                    return;
                }
                if let Some(link) = book.resolved.remove(id) {
                    info!(
                        event = "peer_link_invalidated",
                        resource = %id,
                        previous = %link.for_identity_key,
                        current = %key
                    );
                    self.bus.emit(EngineEvent::PeerCleared {
                        resource_id: id.clone(),
                    });
                }
                if key.is_candidate() && !book.disabled {
                    // A failing remote keeps its backoff schedule.
                    if book.debounce_at.is_none() && book.consecutive_errors == 0 {
                        book.debounce_at = Some(Instant::now() + self.config.debounce);
                    }
                    debug!(event = "peer_candidate_registered", resource = %id, identity = %key);
                    drop(book);
                    self.wake.notify_one();
                }
            }
            EngineEvent::ResourceRemoved { resource_id } => {
                let mut book = self.lock_book();
                book.identities.remove(resource_id);
                book.resolved.remove(resource_id);
            }
            _ => {}
        }
    }

    /// Called when bus events were skipped. Any identity change or removal
    /// may be among them, so every link is dropped and every identity
    /// forgotten until the next update re-registers it.
    fn forget_all(&self) {
        let mut book = self.lock_book();
        let cleared: Vec<ResourceId> = book.resolved.drain().map(|(id, _)| id).collect();
        book.identities.clear();
        book.debounce_at = None;
        for resource_id in cleared {
            self.bus.emit(EngineEvent::PeerCleared { resource_id });
        }
    }

    /// Next instant a check should run, or `None` while disabled or idle.
    fn next_deadline(&self) -> Option<Instant> {
        let mut book = self.lock_book();
        if book.disabled {
            return None;
        }
        let idle = !book.has_candidates();
        if idle != book.paused {
            book.paused = idle;
            if idle {
                info!(event = "peer_detector_paused");
            } else {
                info!(event = "peer_detector_resumed");
            }
        }
        if idle {
            book.debounce_at = None;
            return None;
        }
        match (book.debounce_at, book.next_check) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => {
                let at = Instant::now() + self.config.debounce;
                book.debounce_at = Some(at);
                Some(at)
            }
        }
    }

    async fn check_now(&self) {
        let batch = {
            let mut book = self.lock_book();
            book.debounce_at = None;
            book.next_check = None;
            if book.disabled {
                return;
            }
            book.candidates()
        };
        if batch.is_empty() {
            return;
        }

        let candidates: Vec<PeerCandidate> =
            batch.iter().map(|(candidate, _)| candidate.clone()).collect();
        debug!(event = "peer_check_started", candidates = candidates.len());
        let result = self.query.batch_check(&candidates).await;

        let mut book = self.lock_book();
        match result {
            Ok(mut matches) => {
                book.consecutive_errors = 0;
                for (candidate, used_key) in batch {
                    let Some(Some(found)) = matches.remove(&candidate.resource_id) else {
                        continue;
                    };
                    if book.identities.get(&candidate.resource_id) != Some(&used_key) {
                        debug!(event = "peer_match_stale", resource = %candidate.resource_id);
                        continue;
                    }
                    let link = PeerLink {
                        resource_id: candidate.resource_id.clone(),
                        peer_id: found.peer_id,
                        url: found.url,
                        state: found.state,
                        for_identity_key: used_key,
                    };
                    info!(
                        event = "peer_detected",
                        resource = %link.resource_id,
                        peer = %link.peer_id
                    );
                    book.resolved.insert(candidate.resource_id, link.clone());
                    self.bus.emit(EngineEvent::PeerDetected(link));
                }
                book.next_check = Some(Instant::now() + self.config.interval);
            }
            Err(err) => {
                book.consecutive_errors = book.consecutive_errors.saturating_add(1);
                let errors = book.consecutive_errors;
                if errors >= self.config.max_consecutive_errors {
                    book.disabled = true;
                    warn!(event = "peer_detector_disabled", errors, error = %err);
                    self.bus.notify(
                        Severity::Warning,
                        format!(
                            "Pull request lookup disabled after {errors} consecutive failures: {err}"
                        ),
                    );
                } else {
                    let delay = self.delay_for(errors);
                    warn!(
                        event = "peer_check_failed",
                        errors,
                        retry_ms = delay.as_millis() as u64,
                        error = %err
                    );
                    book.next_check = Some(Instant::now() + delay);
                }
            }
        }
    }

    /// Event intake runs apart from the check loop so invalidations are
    /// never held up behind an in-flight remote query.
    fn spawn_loop(
        self: Arc<Self>,
        events: Option<broadcast::Receiver<EngineEvent>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Some(events) = events {
            Arc::clone(&self).spawn_intake(events, shutdown.clone());
        }

        tokio::spawn(async move {
            loop {
                let deadline = self.next_deadline();
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        self.check_now().await;
                    }
                }
            }
            debug!(event = "peer_detector_exit");
        });
    }

    fn spawn_intake(
        self: Arc<Self>,
        mut events: broadcast::Receiver<EngineEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    received = events.recv() => match received {
                        Ok(event) => self.handle_event(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(event = "peer_events_lagged", skipped);
                            self.forget_all();
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}
