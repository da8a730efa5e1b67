use canopy_core::{ChangeSet, Mood, Resource};
use chrono::{DateTime, Duration, Utc};

/// Pure classification of a resource's change set.
pub trait MoodScorer: Send + Sync {
    fn score(&self, resource: &Resource, changes: &ChangeSet, now: DateTime<Utc>) -> Mood;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeuristicMood {
    pub stale_after_days: i64,
    pub heavy_files: usize,
    pub heavy_lines: u64,
}

impl Default for HeuristicMood {
    fn default() -> Self {
        Self {
            stale_after_days: 3,
            heavy_files: 20,
            heavy_lines: 600,
        }
    }
}

impl MoodScorer for HeuristicMood {
    fn score(&self, _resource: &Resource, changes: &ChangeSet, now: DateTime<Utc>) -> Mood {
        if changes.is_clean() {
            return Mood::Clean;
        }
        if let Some(latest) = changes.latest_mtime {
            if now.signed_duration_since(latest) > Duration::days(self.stale_after_days) {
                return Mood::Stale;
            }
        }
        if changes.changed_files > self.heavy_files
            || changes.insertions + changes.deletions > self.heavy_lines
        {
            return Mood::Heavy;
        }
        Mood::Working
    }
}
