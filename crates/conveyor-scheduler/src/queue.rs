//! Queue management for ready jobs.

use chrono::{DateTime, Utc};
use conveyor_core::ids::{JobId, TemplateId};
use petgraph::graph::NodeIndex;
use std::collections::{HashMap, VecDeque};

/// A ready job waiting for a free slot.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub node: NodeIndex,
    pub job_id: JobId,
    pub queued_at: DateTime<Utc>,
    /// Instances of one template share a group.
    pub concurrency_group: Option<TemplateId>,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id
    }
}

impl Eq for QueuedJob {}

/// FIFO dispatch queue bounded by a global slot count and per-group limits.
pub struct QueueManager {
    queue: VecDeque<QueuedJob>,
    max_running: Option<usize>,
    running: usize,
    concurrency_groups: HashMap<TemplateId, usize>,
    concurrency_limits: HashMap<TemplateId, usize>,
}

impl QueueManager {
    /// `max_running` of `None` means unlimited.
    pub fn new(max_running: Option<usize>) -> Self {
        Self {
            queue: VecDeque::new(),
            max_running,
            running: 0,
            concurrency_groups: HashMap::new(),
            concurrency_limits: HashMap::new(),
        }
    }

    /// Add a job to the back of the queue.
    pub fn enqueue(&mut self, job: QueuedJob) {
        self.queue.push_back(job);
    }

    /// Take the oldest job that may start now, claiming its slot.
    ///
    /// Jobs blocked only by their group limit are passed over, keeping
    /// their place in line.
    pub fn dequeue(&mut self) -> Option<QueuedJob> {
        if self.max_running.is_some_and(|max| self.running >= max) {
            return None;
        }

        let position = self.queue.iter().position(|job| self.can_execute(job))?;
        let job = self.queue.remove(position)?;

        // Mark as running
        self.running += 1;
        if let Some(ref group) = job.concurrency_group {
            *self.concurrency_groups.entry(group.clone()).or_insert(0) += 1;
        }
        Some(job)
    }

    /// Mark a job as completed, freeing up its slots.
    pub fn complete(&mut self, job: &QueuedJob) {
        self.running = self.running.saturating_sub(1);
        if let Some(ref group) = job.concurrency_group
            && let Some(count) = self.concurrency_groups.get_mut(group)
        {
            *count = count.saturating_sub(1);
        }
    }

    /// Drop every queued job, returning them in queue order.
    pub fn drain(&mut self) -> Vec<QueuedJob> {
        self.queue.drain(..).collect()
    }

    /// Set the concurrency limit for a group.
    pub fn set_concurrency_limit(&mut self, group: TemplateId, limit: usize) {
        self.concurrency_limits.insert(group, limit);
    }

    fn can_execute(&self, job: &QueuedJob) -> bool {
        let Some(ref group) = job.concurrency_group else {
            return true;
        };
        let Some(&limit) = self.concurrency_limits.get(group) else {
            return true;
        };
        self.concurrency_groups.get(group).copied().unwrap_or(0) < limit
    }
}
