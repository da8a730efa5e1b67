use canopy_core::ResourceId;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PollPriority {
    Background,
    Active,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollFlags {
    /// Bypass the status provider's cache and the fingerprint shortcut.
    pub force_refresh: bool,
    /// Enrich regardless of dedup and debounce.
    pub force_enrich: bool,
}

impl PollFlags {
    fn merge(self, other: PollFlags) -> PollFlags {
        PollFlags {
            force_refresh: self.force_refresh || other.force_refresh,
            force_enrich: self.force_enrich || other.force_enrich,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollJob {
    pub resource_id: ResourceId,
    pub priority: PollPriority,
    pub due_at: Instant,
    pub flags: PollFlags,
    seq: u64,
}

/// Pending poll jobs, at most one per resource across queued and in-flight.
///
/// Re-enqueueing a queued resource upgrades its priority, pulls its due time
/// forward and merges flags. Enqueueing an in-flight resource is parked as a
/// follow-up and only becomes a queued job once the running one completes.
#[derive(Debug, Default)]
pub struct PollQueue {
    pending: BTreeMap<ResourceId, PollJob>,
    in_flight: HashSet<ResourceId>,
    follow_ups: HashMap<ResourceId, (PollPriority, PollFlags)>,
    seq: u64,
}

impl PollQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when a new job was queued, `false` when it merged into
    /// an existing one.
    pub fn enqueue(
        &mut self,
        resource_id: ResourceId,
        priority: PollPriority,
        due_at: Instant,
        flags: PollFlags,
    ) -> bool {
        if self.in_flight.contains(&resource_id) {
            if flags != PollFlags::default() || priority == PollPriority::Manual {
                let entry = self
                    .follow_ups
                    .entry(resource_id)
                    .or_insert((priority, PollFlags::default()));
                entry.0 = entry.0.max(priority);
                entry.1 = entry.1.merge(flags);
            }
            return false;
        }

        if let Some(existing) = self.pending.get_mut(&resource_id) {
            if priority > existing.priority {
                existing.priority = priority;
            }
            if due_at < existing.due_at {
                existing.due_at = due_at;
            }
            existing.flags = existing.flags.merge(flags);
            return false;
        }

        self.seq += 1;
        self.pending.insert(
            resource_id.clone(),
            PollJob {
                resource_id,
                priority,
                due_at,
                flags,
                seq: self.seq,
            },
        );
        true
    }

    /// Claims the highest-priority due job, oldest due time first within a
    /// priority, then insertion order.
    pub fn claim_ready(&mut self, now: Instant) -> Option<PollJob> {
        let selected = self
            .pending
            .values()
            .filter(|job| job.due_at <= now)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.due_at.cmp(&a.due_at))
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|job| job.resource_id.clone())?;
        let job = self.pending.remove(&selected)?;
        self.in_flight.insert(job.resource_id.clone());
        Some(job)
    }

    /// Marks a claimed job finished. A parked follow-up becomes due at `now`.
    pub fn complete(&mut self, resource_id: &ResourceId, now: Instant) {
        self.in_flight.remove(resource_id);
        if let Some((priority, flags)) = self.follow_ups.remove(resource_id) {
            self.enqueue(resource_id.clone(), priority, now, flags);
        }
    }

    /// Drops any queued job and follow-up for the resource. An in-flight job
    /// runs to completion.
    pub fn remove(&mut self, resource_id: &ResourceId) {
        self.pending.remove(resource_id);
        self.follow_ups.remove(resource_id);
    }

    pub fn is_tracked(&self, resource_id: &ResourceId) -> bool {
        self.pending.contains_key(resource_id) || self.in_flight.contains(resource_id)
    }

    pub fn is_in_flight(&self, resource_id: &ResourceId) -> bool {
        self.in_flight.contains(resource_id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|job| job.due_at).min()
    }
}
