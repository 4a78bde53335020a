//! The simulation engine: pipeline-instance construction and the tick loop.

use crate::views::TaskView;
use gantry_core::error::{Error, Result};
use gantry_core::ids::{RunnerId, TaskId};
use gantry_core::jobgraph::JobGraph;
use gantry_core::profile::{CostProfile, ResourceProfile};
use gantry_core::runner::Runner;
use gantry_core::task::{DelayCause, Task};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use tracing::debug;

/// Owns the task arena and the runner pool, and advances discrete time.
///
/// One tick is one simulated minute. All state is mutated in place by
/// [`Simulation::reset`] and [`Simulation::run`]; repeated runs against the
/// same topology with different capacities are the intended usage.
#[derive(Debug, Clone, Default)]
pub struct Simulation {
    profile: CostProfile,
    tasks: Vec<Task>,
    runners: Vec<Runner>,
    instances: u32,
}

impl Simulation {
    pub fn new(profile: CostProfile) -> Self {
        Self {
            profile,
            tasks: Vec::new(),
            runners: Vec::new(),
            instances: 0,
        }
    }

    /// Build a simulation from a persisted resource profile: its timings
    /// become the cost profile and its runner definitions the pool.
    pub fn from_profile(profile: &ResourceProfile) -> Self {
        let mut sim = Self::new(profile.cost_profile());
        for spec in &profile.runners {
            sim.add_runner(&spec.name, spec.images, spec.tags.clone(), spec.concurrency);
        }
        sim
    }

    pub fn add_runner(
        &mut self,
        name: impl Into<String>,
        supports_images: bool,
        tags: BTreeSet<String>,
        concurrency: u32,
    ) -> RunnerId {
        self.runners
            .push(Runner::new(name, supports_images, tags, concurrency));
        RunnerId(self.runners.len() - 1)
    }

    /// Build one pipeline instance from a job graph.
    ///
    /// One task is created per job, in `jobs()` order; `needs` are resolved
    /// to sibling tasks of the new instance and stage ranks against the
    /// declared stage order. Cycles, unknown dependencies, and unknown
    /// stages are rejected here so the tick loop never has to care.
    pub fn load_instance(&mut self, graph: &dyn JobGraph) -> Result<u32> {
        let names = graph.jobs();
        if names.is_empty() {
            return Err(Error::EmptyPipeline);
        }

        let mut specs = Vec::with_capacity(names.len());
        for name in &names {
            let spec = graph
                .job(name)
                .ok_or_else(|| Error::JobNotFound(name.clone()))?;
            specs.push(spec);
        }

        let stage_rank: BTreeMap<String, usize> = graph
            .stages()
            .into_iter()
            .enumerate()
            .map(|(rank, stage)| (stage, rank))
            .collect();
        let mut ranks = Vec::with_capacity(names.len());
        for (name, spec) in names.iter().zip(&specs) {
            let rank = stage_rank
                .get(&spec.stage)
                .copied()
                .ok_or_else(|| Error::UnknownStage {
                    job: name.clone(),
                    stage: spec.stage.clone(),
                })?;
            ranks.push(rank);
        }

        // Dependency validation: every need must name a sibling job and the
        // graph must be acyclic, otherwise the tick loop would never finish.
        let mut dag = DiGraph::<usize, ()>::new();
        let mut node_of = BTreeMap::new();
        for (index, name) in names.iter().enumerate() {
            node_of.insert(name.as_str(), dag.add_node(index));
        }
        for (name, spec) in names.iter().zip(&specs) {
            for need in &spec.needs {
                let from =
                    node_of
                        .get(need.as_str())
                        .copied()
                        .ok_or_else(|| Error::UnknownDependency {
                            job: name.clone(),
                            need: need.clone(),
                        })?;
                dag.add_edge(from, node_of[name.as_str()], ());
            }
        }
        toposort(&dag, None)
            .map_err(|cycle| Error::DependencyCycle(names[dag[cycle.node_id()]].clone()))?;

        self.instances += 1;
        let instance = self.instances;
        let base = self.tasks.len();
        let index_of: BTreeMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(index, name)| (name.as_str(), index))
            .collect();

        for ((name, spec), rank) in names.iter().zip(specs.iter()).zip(ranks) {
            let needs = spec
                .needs
                .iter()
                .map(|need| TaskId(base + index_of[need.as_str()]))
                .collect();
            self.tasks.push(Task::new(
                name,
                instance,
                &spec.stage,
                rank,
                self.profile.cost(name),
                needs,
                spec.tags.clone(),
                spec.requires_image,
            ));
        }

        debug!(instance, tasks = names.len(), "Pipeline instance loaded");
        Ok(instance)
    }

    /// Replicate the first instance's full topology as a new instance.
    ///
    /// The clone preserves task order and the `needs` DAG, so every
    /// instance is structurally identical.
    pub fn clone_instance(&mut self) -> Result<u32> {
        let template: Vec<Task> = self
            .tasks
            .iter()
            .filter(|task| task.instance == 1)
            .cloned()
            .collect();
        if template.is_empty() {
            return Err(Error::EmptyPipeline);
        }

        self.instances += 1;
        let instance = self.instances;
        let base = self.tasks.len();
        for mut task in template {
            task.reset();
            task.instance = instance;
            // The first instance occupies indices 0..n, so a sibling's
            // absolute index is also its offset within the clone.
            task.needs = task
                .needs
                .iter()
                .map(|need| TaskId(base + need.index()))
                .collect();
            self.tasks.push(task);
        }
        Ok(instance)
    }

    /// Restore every task and runner to its pre-run state.
    pub fn reset(&mut self) {
        for task in &mut self.tasks {
            task.reset();
        }
        for runner in &mut self.runners {
            runner.reset();
        }
    }

    /// Run the simulation to completion and return the makespan in ticks.
    ///
    /// Fails with [`Error::NoCompatibleRunner`] if any task has zero
    /// capability-compatible runners in the pool. The check runs once,
    /// before ticking, and ignores capacity: a transient slot shortage is
    /// a delay, a missing capability is a configuration error.
    pub fn run(&mut self) -> Result<u32> {
        self.reset();

        for task in &self.tasks {
            if !self.runners.iter().any(|runner| runner.compatible(task)) {
                return Err(Error::NoCompatibleRunner {
                    tags: task.tags.iter().cloned().collect(),
                    requires_image: task.requires_image,
                });
            }
        }
        if self.tasks.is_empty() {
            return Ok(0);
        }

        let mut tick: u32 = 0;
        loop {
            for index in 0..self.tasks.len() {
                if self.tasks[index].started.is_some() {
                    continue;
                }
                if !self.tasks[index].is_ready(&self.tasks) {
                    continue;
                }
                if self.tasks[index].needs.is_empty() && self.stage_blocked(index) {
                    self.tasks[index].add_delay(DelayCause::Stage);
                    continue;
                }
                if !self.try_admit(index, tick) {
                    self.tasks[index].add_delay(DelayCause::Runner);
                }
            }

            tick += 1;
            for task in &mut self.tasks {
                if task.started.is_some() && task.remaining > 0 {
                    task.remaining -= 1;
                }
            }

            if self.tasks.iter().all(Task::is_finished) {
                debug!(makespan = tick, tasks = self.tasks.len(), "Run complete");
                return Ok(tick);
            }
        }
    }

    /// Stage gating for tasks with no explicit dependency list: blocked
    /// while any task of the same instance in an earlier stage is still
    /// unfinished.
    fn stage_blocked(&self, index: usize) -> bool {
        let task = &self.tasks[index];
        self.tasks.iter().any(|other| {
            other.instance == task.instance
                && other.stage_rank < task.stage_rank
                && !other.is_finished()
        })
    }

    /// First-fit admission over runners in pool order.
    fn try_admit(&mut self, index: usize, tick: u32) -> bool {
        for rid in 0..self.runners.len() {
            if self.runners[rid].can_execute(&self.tasks[index], &self.tasks) {
                let concurrency = self.runners[rid].concurrency;
                let task = &mut self.tasks[index];
                task.started = Some(tick);
                task.runner = Some(RunnerId(rid));
                task.occupancy = 1.0 / f64::from(concurrency);
                self.runners[rid].assigned.push(TaskId(index));
                return true;
            }
        }
        false
    }

    pub fn instance_count(&self) -> u32 {
        self.instances
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn runners(&self) -> &[Runner] {
        &self.runners
    }

    pub fn runners_mut(&mut self) -> &mut [Runner] {
        &mut self.runners
    }

    pub fn profile(&self) -> &CostProfile {
        &self.profile
    }

    /// Outward-facing per-task report records for the last run.
    pub fn task_views(&self) -> Vec<TaskView> {
        self.tasks
            .iter()
            .map(|task| TaskView {
                name: task.name.clone(),
                instance: task.instance,
                cost: task.cost,
                started: task.started,
                delays: task.effective_delays(&self.tasks),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::jobgraph::{JobSpec, StaticJobGraph};
    use pretty_assertions::assert_eq;

    fn tags(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn job(stage: &str, needs: &[&str]) -> JobSpec {
        JobSpec {
            stage: stage.to_string(),
            tags: BTreeSet::new(),
            needs: needs.iter().map(|need| need.to_string()).collect(),
            requires_image: true,
        }
    }

    fn single_stage_graph(jobs: &[(&str, &[&str])]) -> StaticJobGraph {
        let mut graph = StaticJobGraph::new(["build"]);
        for (name, needs) in jobs {
            graph.add_job(*name, job("build", needs));
        }
        graph
    }

    #[test]
    fn test_single_task_makespan_is_cost() {
        let mut sim = Simulation::new(CostProfile::new(BTreeMap::from([(
            "compile".to_string(),
            7,
        )])));
        sim.add_runner("linux", true, tags(&[]), 1);
        sim.load_instance(&single_stage_graph(&[("compile", &[])]))
            .unwrap();

        assert_eq!(sim.run().unwrap(), 7);
        let task = &sim.tasks()[0];
        assert_eq!(task.started, Some(0));
        assert_eq!(task.ended(), Some(7));
        assert!(task.delays.is_empty());
    }

    #[test]
    fn test_unknown_job_cost_defaults_to_one_tick() {
        let mut sim = Simulation::new(CostProfile::default());
        sim.add_runner("linux", true, tags(&[]), 1);
        sim.load_instance(&single_stage_graph(&[("mystery", &[])]))
            .unwrap();
        assert_eq!(sim.run().unwrap(), 1);
    }

    #[test]
    fn test_cycle_is_rejected_at_load_time() {
        let mut sim = Simulation::new(CostProfile::default());
        sim.add_runner("linux", true, tags(&[]), 1);
        let graph = single_stage_graph(&[("a", &["b"]), ("b", &["a"])]);
        assert!(matches!(
            sim.load_instance(&graph),
            Err(Error::DependencyCycle(_))
        ));
        assert!(sim.tasks().is_empty());
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let mut sim = Simulation::new(CostProfile::default());
        let graph = single_stage_graph(&[("a", &["ghost"])]);
        let err = sim.load_instance(&graph).unwrap_err();
        assert!(matches!(err, Error::UnknownDependency { .. }));
    }

    #[test]
    fn test_unknown_stage_is_rejected() {
        let mut sim = Simulation::new(CostProfile::default());
        let mut graph = StaticJobGraph::new(["build"]);
        graph.add_job("a", job("deploy", &[]));
        let err = sim.load_instance(&graph).unwrap_err();
        assert!(matches!(err, Error::UnknownStage { .. }));
        assert!(sim.tasks().is_empty());
    }

    #[test]
    fn test_missing_runner_capability_fails_before_ticking() {
        let mut sim = Simulation::new(CostProfile::default());
        sim.add_runner("linux", true, tags(&["docker"]), 4);
        let mut graph = StaticJobGraph::new(["build"]);
        graph.add_job(
            "esoteric",
            JobSpec {
                stage: "build".to_string(),
                tags: tags(&["gpu", "cuda"]),
                needs: vec![],
                requires_image: true,
            },
        );
        sim.load_instance(&graph).unwrap();

        match sim.run() {
            Err(Error::NoCompatibleRunner {
                tags,
                requires_image,
            }) => {
                assert_eq!(tags, vec!["cuda".to_string(), "gpu".to_string()]);
                assert!(requires_image);
            }
            other => panic!("expected NoCompatibleRunner, got {other:?}"),
        }
        // The check is static: nothing started.
        assert!(sim.tasks().iter().all(|task| task.started.is_none()));
    }

    #[test]
    fn test_first_fit_prefers_earlier_runner() {
        let mut sim = Simulation::new(CostProfile::default());
        sim.add_runner("first", true, tags(&[]), 1);
        sim.add_runner("second", true, tags(&[]), 1);
        sim.load_instance(&single_stage_graph(&[("solo", &[])]))
            .unwrap();
        sim.run().unwrap();

        assert_eq!(sim.tasks()[0].runner, Some(RunnerId(0)));
        assert_eq!(sim.runners()[0].assigned.len(), 1);
        assert!(sim.runners()[1].assigned.is_empty());
    }

    #[test]
    fn test_clone_instance_remaps_needs() {
        let mut sim = Simulation::new(CostProfile::default());
        sim.add_runner("linux", true, tags(&[]), 8);
        sim.load_instance(&single_stage_graph(&[("a", &[]), ("b", &["a"])]))
            .unwrap();
        let second = sim.clone_instance().unwrap();

        assert_eq!(second, 2);
        assert_eq!(sim.instance_count(), 2);
        assert_eq!(sim.tasks().len(), 4);
        let clone_b = &sim.tasks()[3];
        assert_eq!(clone_b.instance, 2);
        assert_eq!(clone_b.needs, vec![TaskId(2)]);
    }

    #[test]
    fn test_occupancy_recorded_at_admission() {
        let mut sim = Simulation::new(CostProfile::default());
        sim.add_runner("linux", true, tags(&[]), 4);
        sim.load_instance(&single_stage_graph(&[("solo", &[])]))
            .unwrap();
        sim.run().unwrap();
        assert!((sim.tasks()[0].occupancy - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_graph_is_rejected() {
        let mut sim = Simulation::new(CostProfile::default());
        let graph = StaticJobGraph::new(["build"]);
        assert!(matches!(
            sim.load_instance(&graph),
            Err(Error::EmptyPipeline)
        ));
    }
}
