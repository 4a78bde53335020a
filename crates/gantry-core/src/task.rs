//! Task state and delay accounting.

use crate::ids::{RunnerId, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Why a task spent a tick waiting instead of running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayCause {
    /// No compatible runner had a free slot.
    Runner,
    /// An earlier stage in the same pipeline instance was still running.
    Stage,
}

impl DelayCause {
    pub fn label(&self) -> &'static str {
        match self {
            DelayCause::Runner => "runner",
            DelayCause::Stage => "stage",
        }
    }
}

/// One recorded tick of waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delay {
    pub cause: DelayCause,
    pub cost: u32,
}

/// One job's execution instance within one pipeline instance.
///
/// Dependencies reference sibling tasks of the same instance by arena
/// index. A task is never destroyed mid-run; [`Task::reset`] restores it
/// so the same topology can be re-simulated with different capacities.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    /// Ordinal pipeline-instance id, starting at 1.
    pub instance: u32,
    pub stage: String,
    /// Position of `stage` in the declared stage order.
    pub stage_rank: usize,
    /// Total duration in ticks, immutable during a run.
    pub cost: u32,
    /// Counts down from `cost` while the task runs.
    pub remaining: u32,
    pub needs: Vec<TaskId>,
    pub tags: BTreeSet<String>,
    pub requires_image: bool,
    /// Tick at which the task was first admitted onto a runner.
    pub started: Option<u32>,
    /// Runner the task was admitted to.
    pub runner: Option<RunnerId>,
    /// Fraction of the admitting runner's capacity this task consumed,
    /// recorded as `1 / concurrency` at admission time.
    pub occupancy: f64,
    pub delays: Vec<Delay>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        instance: u32,
        stage: impl Into<String>,
        stage_rank: usize,
        cost: u32,
        needs: Vec<TaskId>,
        tags: BTreeSet<String>,
        requires_image: bool,
    ) -> Self {
        Self {
            name: name.into(),
            instance,
            stage: stage.into(),
            stage_rank,
            cost,
            remaining: cost,
            needs,
            tags,
            requires_image,
            started: None,
            runner: None,
            occupancy: 0.0,
            delays: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.remaining == 0
    }

    /// A task is ready once every dependency has finished.
    pub fn is_ready(&self, arena: &[Task]) -> bool {
        self.needs
            .iter()
            .all(|need| arena[need.index()].is_finished())
    }

    /// Tick at which the task finishes, once it has started.
    pub fn ended(&self) -> Option<u32> {
        self.started.map(|started| started + self.cost)
    }

    pub fn add_delay(&mut self, cause: DelayCause) {
        self.delays.push(Delay { cause, cost: 1 });
    }

    /// Restore the task to its pre-run state.
    pub fn reset(&mut self) {
        self.remaining = self.cost;
        self.started = None;
        self.runner = None;
        self.occupancy = 0.0;
        self.delays.clear();
    }

    /// Effective delay totals by cause label.
    ///
    /// The task's own ledger is summed per cause, then each direct
    /// dependency contributes its own effective total under a single
    /// `inherited <dep-name>` bucket.
    pub fn effective_delays(&self, arena: &[Task]) -> BTreeMap<String, u32> {
        let mut causes: BTreeMap<String, u32> = BTreeMap::new();
        for delay in &self.delays {
            if delay.cost > 0 {
                *causes.entry(delay.cause.label().to_string()).or_insert(0) += delay.cost;
            }
        }
        for need in &self.needs {
            let dep = &arena[need.index()];
            let inherited: u32 = dep.effective_delays(arena).values().sum();
            if inherited > 0 {
                *causes.entry(format!("inherited {}", dep.name)).or_insert(0) += inherited;
            }
        }
        causes
    }

    /// Total ticks of own (non-inherited) delay.
    pub fn own_delay_total(&self) -> u32 {
        self.delays.iter().map(|delay| delay.cost).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn task(name: &str, cost: u32, needs: Vec<TaskId>) -> Task {
        Task::new(name, 1, "build", 0, cost, needs, BTreeSet::new(), true)
    }

    #[test]
    fn test_ready_tracks_dependencies() {
        let mut arena = vec![task("compile", 3, vec![]), task("link", 1, vec![TaskId(0)])];
        assert!(!arena[1].is_ready(&arena));

        arena[0].remaining = 0;
        assert!(arena[1].is_ready(&arena));
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut item = task("compile", 5, vec![]);
        item.started = Some(2);
        item.runner = Some(RunnerId(0));
        item.occupancy = 0.5;
        item.remaining = 0;
        item.add_delay(DelayCause::Runner);

        item.reset();
        assert_eq!(item.remaining, 5);
        assert_eq!(item.started, None);
        assert_eq!(item.runner, None);
        assert!(item.delays.is_empty());
    }

    #[test]
    fn test_effective_delays_inherit_from_needs() {
        let mut arena = vec![
            task("windows-tools", 4, vec![]),
            task("installer", 2, vec![TaskId(0)]),
        ];
        arena[0].add_delay(DelayCause::Runner);
        arena[0].add_delay(DelayCause::Runner);
        arena[1].add_delay(DelayCause::Runner);

        let delays = arena[1].effective_delays(&arena);
        assert_eq!(delays.len(), 2);
        assert_eq!(delays["runner"], 1);
        assert_eq!(delays["inherited windows-tools"], 2);
    }

    #[test]
    fn test_effective_delays_skip_quiet_dependencies() {
        let arena = vec![task("compile", 4, vec![]), task("link", 2, vec![TaskId(0)])];
        assert!(arena[1].effective_delays(&arena).is_empty());
    }

    #[test]
    fn test_ended_requires_start() {
        let mut item = task("compile", 5, vec![]);
        assert_eq!(item.ended(), None);
        item.started = Some(7);
        assert_eq!(item.ended(), Some(12));
    }
}
