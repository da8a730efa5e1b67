use crate::{PeerLink, ResourceId, ResourceState};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub severity: Severity,
    pub message: String,
}

/// Everything the engine publishes. Payloads are owned snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    #[serde(rename = "resource:update")]
    ResourceUpdate(ResourceState),
    #[serde(rename = "resource:removed")]
    ResourceRemoved { resource_id: ResourceId },
    #[serde(rename = "peer:detected")]
    PeerDetected(PeerLink),
    #[serde(rename = "peer:cleared")]
    PeerCleared { resource_id: ResourceId },
    #[serde(rename = "notify")]
    Notify(Notification),
}

impl EngineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::ResourceUpdate(_) => "resource:update",
            EngineEvent::ResourceRemoved { .. } => "resource:removed",
            EngineEvent::PeerDetected(_) => "peer:detected",
            EngineEvent::PeerCleared { .. } => "peer:cleared",
            EngineEvent::Notify(_) => "notify",
        }
    }

    pub fn resource_id(&self) -> Option<&ResourceId> {
        match self {
            EngineEvent::ResourceUpdate(state) => Some(&state.resource.id),
            EngineEvent::ResourceRemoved { resource_id }
            | EngineEvent::PeerCleared { resource_id } => Some(resource_id),
            EngineEvent::PeerDetected(link) => Some(&link.resource_id),
            EngineEvent::Notify(_) => None,
        }
    }
}

/// Outbound channel shared by every component. Emission never blocks and
/// never fails: with no subscribers the event is simply dropped, and slow
/// subscribers observe `Lagged` rather than stalling producers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn notify(&self, severity: Severity, message: impl Into<String>) {
        self.emit(EngineEvent::Notify(Notification {
            severity,
            message: message.into(),
        }));
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
