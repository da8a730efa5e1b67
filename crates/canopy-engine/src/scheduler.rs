use crate::config::{MonitorConfig, SchedulerConfig};
use crate::monitor::{MonitorDeps, PollOutcome, ResourceMonitor};
use crate::queue::{PollFlags, PollJob, PollPriority, PollQueue};
use canopy_core::{EngineEvent, Resource, ResourceId, ResourceState};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct SyncRequest {
    resources: Vec<Resource>,
    active: Option<ResourceId>,
}

struct MonitorEntry {
    monitor: ResourceMonitor,
    priority: PollPriority,
    last_polled: Instant,
}

struct SchedulerInner {
    deps: MonitorDeps,
    monitor_config: MonitorConfig,
    config: SchedulerConfig,
    entries: Mutex<HashMap<ResourceId, MonitorEntry>>,
    queue: Mutex<PollQueue>,
    wake: Notify,
    /// Held for every status fetch the scheduler drives, including the
    /// initial poll of a newly added monitor.
    poll_gate: tokio::sync::Mutex<()>,
    pending_sync: Mutex<Option<SyncRequest>>,
    sync_running: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Owns the live monitors and drives every recurring poll through one
/// serial queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler {
    pub fn new(deps: MonitorDeps, monitor_config: MonitorConfig, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                deps,
                monitor_config,
                config,
                entries: Mutex::new(HashMap::new()),
                queue: Mutex::new(PollQueue::new()),
                wake: Notify::new(),
                poll_gate: tokio::sync::Mutex::new(()),
                pending_sync: Mutex::new(None),
                sync_running: AtomicBool::new(false),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Spawns the tick and worker loops. Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) || self.is_stopped() {
            return;
        }
        Arc::clone(&self.inner).spawn_ticker(self.inner.shutdown.subscribe());
        Arc::clone(&self.inner).spawn_worker(self.inner.shutdown.subscribe());
        info!(
            event = "scheduler_started",
            tick_ms = self.inner.config.tick_interval.as_millis() as u64
        );
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Reconciles the monitored set with `resources`. A call made while
    /// another sync is running replaces any queued request and returns; the
    /// running call applies it before finishing.
    pub async fn sync(&self, resources: Vec<Resource>, active: Option<ResourceId>) {
        if self.is_stopped() {
            return;
        }
        *lock(&self.inner.pending_sync) = Some(SyncRequest { resources, active });
        loop {
            if self.inner.sync_running.swap(true, Ordering::AcqRel) {
                debug!(event = "sync_queued");
                return;
            }
            loop {
                let next = lock(&self.inner.pending_sync).take();
                let Some(request) = next else {
                    break;
                };
                self.inner.apply_sync(request).await;
            }
            self.inner.sync_running.store(false, Ordering::Release);
            // A request parked between the last take and the store above
            // would otherwise wait for the next sync call.
            if lock(&self.inner.pending_sync).is_none() {
                return;
            }
        }
    }

    /// Queues a manual, forced poll for the resource. Returns `false` when the
    /// resource is not monitored.
    pub fn refresh(&self, resource_id: &ResourceId, force_enrich: bool) -> bool {
        if self.is_stopped() || !lock(&self.inner.entries).contains_key(resource_id) {
            return false;
        }
        lock(&self.inner.queue).enqueue(
            resource_id.clone(),
            PollPriority::Manual,
            Instant::now(),
            PollFlags {
                force_refresh: true,
                force_enrich,
            },
        );
        self.inner.wake.notify_one();
        true
    }

    /// Stops and forgets one resource. Removing an unknown resource is a
    /// no-op.
    pub fn remove(&self, resource_id: &ResourceId) -> bool {
        self.inner.remove(resource_id)
    }

    pub fn snapshot(&self, resource_id: &ResourceId) -> Option<ResourceState> {
        lock(&self.inner.entries)
            .get(resource_id)
            .map(|entry| entry.monitor.snapshot())
    }

    pub fn snapshots(&self) -> Vec<ResourceState> {
        let mut states: Vec<ResourceState> = lock(&self.inner.entries)
            .values()
            .map(|entry| entry.monitor.snapshot())
            .collect();
        states.sort_by(|a, b| a.resource.id.cmp(&b.resource.id));
        states
    }

    pub fn resource_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = lock(&self.inner.entries).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stops every monitor and both loops. In-flight status calls finish on
    /// their own.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        let drained: Vec<MonitorEntry> = lock(&self.inner.entries)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &drained {
            entry.monitor.stop();
        }
        *lock(&self.inner.queue) = PollQueue::new();
        info!(event = "scheduler_stopped", monitors = drained.len());
    }
}

impl SchedulerInner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    async fn apply_sync(&self, request: SyncRequest) {
        let desired: HashSet<ResourceId> = request
            .resources
            .iter()
            .map(|resource| resource.id.clone())
            .collect();

        let stale: Vec<ResourceId> = lock(&self.entries)
            .keys()
            .filter(|id| !desired.contains(*id))
            .cloned()
            .collect();
        for id in &stale {
            self.remove(id);
        }

        for resource in request.resources {
            if self.is_stopped() {
                return;
            }
            let priority = if request.active.as_ref() == Some(&resource.id) {
                PollPriority::Active
            } else {
                PollPriority::Background
            };

            let existing = {
                let mut entries = lock(&self.entries);
                entries.get_mut(&resource.id).map(|entry| {
                    entry.priority = priority;
                    entry.monitor.clone()
                })
            };
            if let Some(monitor) = existing {
                monitor.update_metadata(resource);
                continue;
            }

            let id = resource.id.clone();
            let monitor =
                ResourceMonitor::new(resource, self.deps.clone(), self.monitor_config.clone());
            let outcome = {
                let _gate = self.poll_gate.lock().await;
                monitor.start().await
            };
            if self.is_stopped() {
                monitor.stop();
                return;
            }
            lock(&self.entries).insert(
                id.clone(),
                MonitorEntry {
                    monitor,
                    priority,
                    last_polled: Instant::now(),
                },
            );
            info!(event = "monitor_added", resource = %id, priority = ?priority, outcome = ?outcome);
        }
    }

    fn remove(&self, resource_id: &ResourceId) -> bool {
        let Some(entry) = lock(&self.entries).remove(resource_id) else {
            return false;
        };
        lock(&self.queue).remove(resource_id);
        entry.monitor.stop();
        self.deps.publish(EngineEvent::ResourceRemoved {
            resource_id: resource_id.clone(),
        });
        info!(event = "monitor_removed", resource = %resource_id);
        true
    }

    /// Enqueues a background or active poll for every monitor whose interval
    /// has elapsed.
    fn enqueue_due(&self, now: Instant) -> usize {
        let due: Vec<(ResourceId, PollPriority)> = lock(&self.entries)
            .iter()
            .filter(|(_, entry)| {
                let interval = match entry.priority {
                    PollPriority::Background => self.config.background_interval,
                    PollPriority::Active | PollPriority::Manual => self.config.active_interval,
                };
                now.saturating_duration_since(entry.last_polled) >= interval
            })
            .map(|(id, entry)| (id.clone(), entry.priority))
            .collect();

        let mut queue = lock(&self.queue);
        let mut added = 0;
        for (id, priority) in due {
            if queue.is_tracked(&id) {
                continue;
            }
            if queue.enqueue(id, priority, now, PollFlags::default()) {
                added += 1;
            }
        }
        added
    }

    fn spawn_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if self.enqueue_due(Instant::now()) > 0 {
                            self.wake.notify_one();
                        }
                    }
                }
            }
            debug!(event = "scheduler_ticker_exit");
        });
    }

    fn spawn_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let claimed = lock(&self.queue).claim_ready(Instant::now());
                if let Some(job) = claimed {
                    self.run_job(job).await;
                    tokio::time::sleep(self.config.inter_job_pause).await;
                    continue;
                }

                let next_due = lock(&self.queue)
                    .next_due()
                    .unwrap_or_else(|| Instant::now() + self.config.tick_interval);
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep_until(next_due) => {}
                }
            }
            debug!(event = "scheduler_worker_exit");
        });
    }

    /// Runs one job to completion. Failures and panics are logged and the
    /// job is dropped.
    async fn run_job(&self, job: PollJob) {
        let monitor = lock(&self.entries)
            .get(&job.resource_id)
            .map(|entry| entry.monitor.clone());
        let Some(monitor) = monitor else {
            lock(&self.queue).complete(&job.resource_id, Instant::now());
            return;
        };

        let started = Instant::now();
        let flags = job.flags;
        let result = {
            let _gate = self.poll_gate.lock().await;
            tokio::spawn(async move {
                if flags.force_refresh || flags.force_enrich {
                    monitor.refresh(flags.force_enrich).await
                } else {
                    monitor.poll(false).await
                }
            })
            .await
        };

        match result {
            Ok(PollOutcome::Failed(reason)) => {
                warn!(event = "poll_job_failed", resource = %job.resource_id, reason = %reason);
            }
            Ok(outcome) => {
                debug!(
                    event = "poll_job_done",
                    resource = %job.resource_id,
                    priority = ?job.priority,
                    outcome = ?outcome,
                    elapsed_ms = started.elapsed().as_millis() as u64
                );
            }
            Err(err) => {
                warn!(event = "poll_job_panicked", resource = %job.resource_id, error = %err);
            }
        }

        let now = Instant::now();
        if let Some(entry) = lock(&self.entries).get_mut(&job.resource_id) {
            entry.last_polled = now;
        }
        lock(&self.queue).complete(&job.resource_id, now);
    }
}
