//! Worktree monitoring engine: per-resource monitors driven by one serial
//! poll queue, change enrichment and pull-request peer detection, all
//! observed through a single event bus.

pub mod config;
pub mod monitor;
pub mod mood;
pub mod peers;
pub mod queue;
pub mod scheduler;

pub use config::{EngineConfig, MonitorConfig, PeerConfig, SchedulerConfig};
pub use monitor::{MonitorDeps, PollOutcome, ResourceMonitor, ResourceObserver};
pub use mood::{HeuristicMood, MoodScorer};
pub use peers::PeerDetector;
pub use queue::{PollFlags, PollJob, PollPriority, PollQueue};
pub use scheduler::Scheduler;

use canopy_core::{
    EngineEvent, EventBus, RemoteQuery, Resource, ResourceId, ResourceState, StatusProvider,
};
use canopy_enrich::{CompletionService, Enricher};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// External collaborators. Only the status provider is mandatory; without a
/// completion service enrichment reports `disabled`, without a remote query
/// no peer detection runs.
#[derive(Clone)]
pub struct EngineDeps {
    pub status: Arc<dyn StatusProvider>,
    pub completion: Option<Arc<dyn CompletionService>>,
    pub remote: Option<Arc<dyn RemoteQuery>>,
    pub mood: Arc<dyn MoodScorer>,
}

impl EngineDeps {
    pub fn new(status: Arc<dyn StatusProvider>) -> Self {
        Self {
            status,
            completion: None,
            remote: None,
            mood: Arc::new(HeuristicMood::default()),
        }
    }

    pub fn with_completion(mut self, completion: Arc<dyn CompletionService>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteQuery>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_mood(mut self, mood: Arc<dyn MoodScorer>) -> Self {
        self.mood = mood;
        self
    }
}

/// Composition root. Must be constructed inside a tokio runtime.
pub struct Engine {
    bus: EventBus,
    scheduler: Scheduler,
    peers: Option<PeerDetector>,
}

impl Engine {
    pub fn new(deps: EngineDeps, config: EngineConfig) -> Self {
        let bus = EventBus::new(config.event_capacity);
        let enricher = deps
            .completion
            .map(|service| Enricher::new(service, config.enrich.clone()));
        let enrichment = enricher.is_some();
        let peers = deps
            .remote
            .map(|query| PeerDetector::new(query, bus.clone(), config.peers.clone()));
        if let Some(peers) = &peers {
            peers.start_attached();
        }
        let observer = peers
            .clone()
            .map(|peers| Arc::new(peers) as Arc<dyn ResourceObserver>);

        let scheduler = Scheduler::new(
            MonitorDeps {
                status: deps.status,
                enricher,
                mood: deps.mood,
                bus: bus.clone(),
                observer,
            },
            config.monitor,
            config.scheduler,
        );
        scheduler.start();
        info!(
            event = "engine_started",
            enrichment,
            peers = peers.is_some()
        );
        Self {
            bus,
            scheduler,
            peers,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn sync(&self, resources: Vec<Resource>, active: Option<ResourceId>) {
        self.scheduler.sync(resources, active).await;
    }

    pub fn refresh(&self, resource_id: &ResourceId, force_enrich: bool) -> bool {
        self.scheduler.refresh(resource_id, force_enrich)
    }

    /// Manual peer check; also re-enables a detector disabled by failures.
    pub fn refresh_peers(&self) -> bool {
        match &self.peers {
            Some(peers) => {
                peers.refresh();
                true
            }
            None => false,
        }
    }

    pub fn snapshots(&self) -> Vec<ResourceState> {
        self.scheduler.snapshots()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn peers(&self) -> Option<&PeerDetector> {
        self.peers.as_ref()
    }

    pub fn stop(&self) {
        self.scheduler.stop();
        if let Some(peers) = &self.peers {
            peers.stop();
        }
        info!(event = "engine_stopped");
    }
}
