//! Greedy capacity-planning search over repeated simulation runs.

use crate::critical_path::{CriticalPath, critical_path};
use gantry_core::error::{Error, Result};
use gantry_core::ids::RunnerId;
use gantry_core::task::{DelayCause, Task};
use gantry_sim::Simulation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Outcome of a capacity discovery: what to add, and what it buys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// Net concurrency added per runner name, auto-provisioned runners
    /// included.
    pub added: BTreeMap<String, u32>,
    /// Concurrent pipelines actually simulated for the final figure.
    pub pipelines: u32,
    /// Final makespan for `pipelines` concurrent pipelines, in ticks.
    pub duration: u32,
    /// How many pipelines fit within the acceptable slowdown with no extra
    /// resources, and how long they took.
    pub baseline_pipelines: u32,
    pub baseline_duration: u32,
    /// Pipelines per hour, after and before the added capacity.
    pub new_throughput: f64,
    pub old_throughput: f64,
    /// False when the pass cap expired before the target duration was met.
    pub converged: bool,
}

impl PlanResult {
    pub fn throughput_change_percent(&self) -> f64 {
        100.0 * (self.new_throughput - self.old_throughput) / self.old_throughput
    }
}

/// Per-runner summed task occupancy for the last run, heaviest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerPressure {
    pub name: String,
    pub usage: f64,
}

/// Iterative capacity-planning search.
///
/// The planner owns all mutation of the simulation while it runs: it clones
/// pipeline instances, raises runner concurrency in place, and re-runs the
/// engine to evaluate every change.
#[derive(Debug, Clone)]
pub struct CapacityPlanner {
    /// Safety valve on the greedy loop; the algorithm itself would keep
    /// going until the duration target is met.
    pub max_passes: usize,
    /// Safety valve on the baseline probe for pools that never saturate.
    pub max_probe_pipelines: u32,
}

impl Default for CapacityPlanner {
    fn default() -> Self {
        Self {
            max_passes: 64,
            max_probe_pipelines: 1024,
        }
    }
}

impl CapacityPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discover the minimal runner-capacity increases needed to run `aim`
    /// concurrent pipelines within an acceptable slowdown of the
    /// single-pipeline duration.
    ///
    /// Expects a simulation with one pipeline instance loaded. On return
    /// the simulation holds the cloned instances and the raised
    /// concurrency values of the discovered plan.
    pub fn discover(&self, sim: &mut Simulation, aim: u32) -> Result<PlanResult> {
        let mut added: BTreeMap<String, u32> = BTreeMap::new();

        let single_duration = run_with_provisioning(sim, &mut added)?;
        if let Some((name, weight)) = ranked_tasks(sim).into_iter().next() {
            debug!(task = %name, weight, "Heaviest task by runner occupancy");
        }
        let cpath = critical_path(sim)?;
        info!(jobs = ?cpath.jobs, length = cpath.length, "Critical path");

        let max_acceptable = f64::max(
            1.3 * f64::from(single_duration),
            f64::from(single_duration) + 40.0,
        );

        // Baseline probe: add pipelines one at a time until the makespan
        // overshoots the acceptable duration. The last passing count is
        // what the pool sustains with no extra resources.
        let mut duration = single_duration;
        let (baseline_pipelines, baseline_duration) = loop {
            let previous = duration;
            if sim.instance_count() >= self.max_probe_pipelines {
                warn!(
                    pipelines = sim.instance_count(),
                    "Probe cap reached before saturation"
                );
                break (sim.instance_count(), previous);
            }
            sim.clone_instance()?;
            duration = run_with_provisioning(sim, &mut added)?;
            info!(
                pipelines = sim.instance_count(),
                duration,
                slowdown = duration.saturating_sub(single_duration),
                "Probe"
            );
            if f64::from(duration) > max_acceptable {
                break (sim.instance_count() - 1, previous);
            }
        };
        info!(
            pipelines = baseline_pipelines,
            duration = baseline_duration,
            "Sustainable concurrency without extra resources"
        );

        // Grow to the aimed concurrency, then measure it unmodified.
        while sim.instance_count() < aim {
            sim.clone_instance()?;
        }
        let mut last_duration = run_with_provisioning(sim, &mut added)?;
        let pipelines = sim.instance_count();
        info!(
            pipelines,
            duration = last_duration,
            target = max_acceptable,
            "Unmodified duration at aimed concurrency"
        );

        for pass in 1..=self.max_passes {
            if f64::from(last_duration) <= max_acceptable {
                break;
            }
            let (stressed, critical) = contended_runners(sim, &cpath);
            debug!(
                pass,
                stressed = stressed.len(),
                critical = critical.len(),
                "Optimization pass"
            );

            // Front-load larger jumps in early passes.
            let min_bump = 1.max(4usize.saturating_sub(pass)) as u32;

            // One runner type at a time generally moves throughput most:
            // keep bumping each stressed runner until it stops helping.
            let mut helped = false;
            for runner in stressed {
                while self.try_bump(sim, runner, min_bump, &mut last_duration, &mut added)? {
                    helped = true;
                }
            }

            // Single-runner bumps can stall when a job waits on several
            // others; fall back to scaling whatever finishes last.
            if !helped {
                debug!(pass, "No stressed-runner improvement, trying last tasks");
                for runner in stuck_runners(sim) {
                    self.try_bump(sim, runner, 1, &mut last_duration, &mut added)?;
                }
            }
        }

        let converged = f64::from(last_duration) <= max_acceptable;
        if !converged {
            warn!(
                passes = self.max_passes,
                duration = last_duration,
                target = max_acceptable,
                "Did not converge"
            );
        }

        let old_throughput = 60.0 * f64::from(baseline_pipelines) / f64::from(baseline_duration);
        let new_throughput = 60.0 * f64::from(pipelines) / f64::from(last_duration);
        let result = PlanResult {
            added,
            pipelines,
            duration: last_duration,
            baseline_pipelines,
            baseline_duration,
            new_throughput,
            old_throughput,
            converged,
        };
        info!(
            added = ?result.added,
            new_throughput,
            old_throughput,
            change_percent = result.throughput_change_percent(),
            "Capacity plan"
        );
        Ok(result)
    }

    /// Raise one runner's concurrency to `max(round(1.1 * c), c + min_bump)`
    /// and keep the increase only if the re-run makespan strictly improves.
    fn try_bump(
        &self,
        sim: &mut Simulation,
        runner: RunnerId,
        min_bump: u32,
        last_duration: &mut u32,
        added: &mut BTreeMap<String, u32>,
    ) -> Result<bool> {
        let before = sim.runners()[runner.index()].concurrency;
        let target = u32::max(
            (f64::from(before) * 1.1).round() as u32,
            before + min_bump,
        );
        let additional = target - before;
        sim.runners_mut()[runner.index()].concurrency = target;

        let new_duration = run_with_provisioning(sim, added)?;
        if new_duration < *last_duration {
            let name = sim.runners()[runner.index()].name.clone();
            info!(
                runner = %name,
                additional,
                saved = *last_duration - new_duration,
                duration = new_duration,
                "Kept capacity increase"
            );
            *added.entry(name).or_default() += additional;
            *last_duration = new_duration;
            Ok(true)
        } else {
            sim.runners_mut()[runner.index()].concurrency = before;
            Ok(false)
        }
    }
}

/// Run the simulation, auto-provisioning a minimal runner whenever a task
/// has no compatible runner at all. This is the only recovery path; every
/// other error propagates unchanged.
fn run_with_provisioning(
    sim: &mut Simulation,
    added: &mut BTreeMap<String, u32>,
) -> Result<u32> {
    loop {
        match sim.run() {
            Ok(duration) => return Ok(duration),
            Err(Error::NoCompatibleRunner {
                tags,
                requires_image,
            }) => {
                let name = format!("generated-{}", sim.runners().len() + 1);
                warn!(
                    runner = %name,
                    ?tags,
                    requires_image,
                    "No compatible runner, provisioning one"
                );
                sim.add_runner(&name, requires_image, tags.into_iter().collect(), 2);
                *added.entry(name).or_default() += 2;
            }
            Err(other) => return Err(other),
        }
    }
}

/// Runners implicated in slot-contention delays, and runners executing
/// critical-path tasks, both in task discovery order.
fn contended_runners(sim: &Simulation, cpath: &CriticalPath) -> (Vec<RunnerId>, Vec<RunnerId>) {
    let mut stressed = Vec::new();
    let mut critical = Vec::new();
    for task in sim.tasks() {
        let Some(runner) = task.runner else { continue };
        if task
            .delays
            .iter()
            .any(|delay| delay.cause == DelayCause::Runner)
            && !stressed.contains(&runner)
        {
            stressed.push(runner);
        }
        if cpath.contains(&task.name) && !critical.contains(&runner) {
            critical.push(runner);
        }
    }
    (stressed, critical)
}

/// Assigned runners of the tasks that finish last, one entry per task.
fn stuck_runners(sim: &Simulation) -> Vec<RunnerId> {
    let Some(end) = sim.tasks().iter().filter_map(Task::ended).max() else {
        return Vec::new();
    };
    sim.tasks()
        .iter()
        .filter(|task| task.ended() == Some(end))
        .filter_map(|task| task.runner)
        .collect()
}

/// Tasks ranked by estimated resource pressure, heaviest first: the
/// fraction of the assigned runner's capacity the task held, times its
/// cost.
pub fn ranked_tasks(sim: &Simulation) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = sim
        .tasks()
        .iter()
        .map(|task| (task.name.clone(), task.occupancy * f64::from(task.cost)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

/// Summed task occupancy per runner for the last run, heaviest first.
pub fn runner_pressure(sim: &Simulation) -> Vec<RunnerPressure> {
    let mut usage: BTreeMap<RunnerId, f64> = BTreeMap::new();
    for task in sim.tasks() {
        if let Some(runner) = task.runner {
            *usage.entry(runner).or_default() += task.occupancy;
        }
    }
    let mut pressure: Vec<RunnerPressure> = usage
        .into_iter()
        .map(|(runner, usage)| RunnerPressure {
            name: sim.runners()[runner.index()].name.clone(),
            usage,
        })
        .collect();
    pressure.sort_by(|a, b| b.usage.total_cmp(&a.usage));
    pressure
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::jobgraph::{JobSpec, StaticJobGraph};
    use gantry_core::profile::CostProfile;
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeMap, BTreeSet};

    fn contention_sim() -> Simulation {
        let mut graph = StaticJobGraph::new(["build"]);
        for name in ["one", "two", "three"] {
            graph.add_job(
                name,
                JobSpec {
                    stage: "build".to_string(),
                    tags: BTreeSet::new(),
                    needs: vec![],
                    requires_image: true,
                },
            );
        }
        let timings = BTreeMap::from([
            ("one".to_string(), 4),
            ("two".to_string(), 4),
            ("three".to_string(), 4),
        ]);
        let mut sim = Simulation::new(CostProfile::new(timings));
        sim.add_runner("solo", true, BTreeSet::new(), 1);
        sim.load_instance(&graph).unwrap();
        sim
    }

    #[test]
    fn test_contended_runner_is_stressed() {
        let mut sim = contention_sim();
        sim.run().unwrap();
        let cpath = critical_path(&sim).unwrap();
        let (stressed, critical) = contended_runners(&sim, &cpath);
        assert_eq!(stressed, vec![RunnerId(0)]);
        assert_eq!(critical, vec![RunnerId(0)]);
    }

    #[test]
    fn test_stuck_runners_follow_last_finisher() {
        let mut sim = contention_sim();
        sim.run().unwrap();
        // Serialized on one slot: "three" finishes last at tick 12.
        assert_eq!(stuck_runners(&sim), vec![RunnerId(0)]);
    }

    #[test]
    fn test_bump_reverts_when_no_improvement() {
        let planner = CapacityPlanner::new();
        let mut sim = contention_sim();
        let mut added = BTreeMap::new();
        let mut last = sim.run().unwrap();
        assert_eq!(last, 12);

        // Three slots run everything in parallel: 12 -> 4.
        let improved = planner
            .try_bump(&mut sim, RunnerId(0), 2, &mut last, &mut added)
            .unwrap();
        assert!(improved);
        assert_eq!(last, 4);
        assert_eq!(sim.runners()[0].concurrency, 3);
        assert_eq!(added["solo"], 2);

        // Nothing left to gain: the bump must roll back.
        let improved = planner
            .try_bump(&mut sim, RunnerId(0), 2, &mut last, &mut added)
            .unwrap();
        assert!(!improved);
        assert_eq!(last, 4);
        assert_eq!(sim.runners()[0].concurrency, 3);
        assert_eq!(added["solo"], 2);
    }

    #[test]
    fn test_ranked_tasks_weigh_cost_and_occupancy() {
        let mut graph = StaticJobGraph::new(["build"]);
        for name in ["light", "heavy"] {
            graph.add_job(
                name,
                JobSpec {
                    stage: "build".to_string(),
                    tags: BTreeSet::new(),
                    needs: vec![],
                    requires_image: true,
                },
            );
        }
        let timings =
            BTreeMap::from([("light".to_string(), 2), ("heavy".to_string(), 9)]);
        let mut sim = Simulation::new(CostProfile::new(timings));
        sim.add_runner("pool", true, BTreeSet::new(), 2);
        sim.load_instance(&graph).unwrap();
        sim.run().unwrap();

        let ranked = ranked_tasks(&sim);
        assert_eq!(ranked[0].0, "heavy");
        assert!((ranked[0].1 - 4.5).abs() < 1e-9);
        assert!((ranked[1].1 - 1.0).abs() < 1e-9);

        let pressure = runner_pressure(&sim);
        assert_eq!(pressure.len(), 1);
        assert_eq!(pressure[0].name, "pool");
        assert!((pressure[0].usage - 1.0).abs() < 1e-9);
    }
}
