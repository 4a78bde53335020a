//! Runner state and compatibility matching.

use crate::ids::TaskId;
use crate::task::Task;
use std::collections::BTreeSet;

/// A named, capacity-limited execution agent.
#[derive(Debug, Clone)]
pub struct Runner {
    pub name: String,
    /// Whether this runner can execute container-image jobs.
    pub supports_images: bool,
    pub tags: BTreeSet<String>,
    /// Concurrent slot count. The capacity planner raises this in place
    /// between runs.
    pub concurrency: u32,
    /// Every task admitted to this runner during the current run.
    pub assigned: Vec<TaskId>,
}

impl Runner {
    pub fn new(
        name: impl Into<String>,
        supports_images: bool,
        tags: BTreeSet<String>,
        concurrency: u32,
    ) -> Self {
        Self {
            name: name.into(),
            supports_images,
            tags,
            concurrency,
            assigned: Vec::new(),
        }
    }

    /// Capability check only: image requirement must match exactly and the
    /// task's tags must be a subset of the runner's. Capacity is ignored,
    /// so this is stable across the whole run.
    pub fn compatible(&self, task: &Task) -> bool {
        task.requires_image == self.supports_images && task.tags.is_subset(&self.tags)
    }

    /// Number of assigned tasks currently occupying a slot.
    pub fn active_count(&self, arena: &[Task]) -> usize {
        self.assigned
            .iter()
            .filter(|id| {
                let task = &arena[id.index()];
                task.started.is_some() && task.remaining > 0
            })
            .count()
    }

    /// Whether the runner can admit this task right now.
    pub fn can_execute(&self, task: &Task, arena: &[Task]) -> bool {
        self.compatible(task) && (self.active_count(arena) as u32) < self.concurrency
    }

    pub fn reset(&mut self) {
        self.assigned.clear();
    }
}
