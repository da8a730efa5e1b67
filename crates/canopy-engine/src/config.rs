use canopy_enrich::EnrichConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How often monitors are scanned for due polls.
    pub tick_interval: Duration,
    pub active_interval: Duration,
    pub background_interval: Duration,
    pub inter_job_pause: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            active_interval: Duration::from_secs(2),
            background_interval: Duration::from_secs(20),
            inter_job_pause: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Delay of the deferred enrichment timer armed by dirty-to-dirty polls.
    pub enrich_debounce: Duration,
    /// Minimum spacing between enrichment starts, except forced ones.
    pub enrich_min_interval: Duration,
    /// Sidecar note file, relative to the worktree root.
    pub note_file: Option<PathBuf>,
    pub note_max_chars: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enrich_debounce: Duration::from_secs(8),
            enrich_min_interval: Duration::from_secs(5),
            note_file: None,
            note_max_chars: 160,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub interval: Duration,
    /// Coalescing window for checks triggered by new or changed candidates.
    pub debounce: Duration,
    pub backoff: Vec<Duration>,
    pub max_consecutive_errors: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            debounce: Duration::from_secs(2),
            backoff: vec![
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ],
            max_consecutive_errors: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub monitor: MonitorConfig,
    pub peers: PeerConfig,
    pub enrich: EnrichConfig,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            monitor: MonitorConfig::default(),
            peers: PeerConfig::default(),
            enrich: EnrichConfig::default(),
            event_capacity: 256,
        }
    }
}
