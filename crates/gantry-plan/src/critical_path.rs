//! Critical Path Method over one pipeline instance's job DAG.

use gantry_core::error::{Error, Result};
use gantry_core::task::Task;
use gantry_sim::Simulation;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet};

/// The zero-slack chain through a pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalPath {
    /// Job names in earliest-start order, virtual nodes excluded.
    pub jobs: Vec<String>,
    /// Duration-weighted length of the path. Equals the makespan of one
    /// instance run at unlimited capacity.
    pub length: u32,
}

impl CriticalPath {
    pub fn contains(&self, job: &str) -> bool {
        self.jobs.iter().any(|name| name == job)
    }
}

/// Compute the critical path of the loaded pipeline.
///
/// Tasks are deduplicated by job name: when several instances are loaded
/// only the first instance's topology contributes, since all instances
/// share identical structure. A virtual `start` node feeds every job with
/// no needs and every sink feeds a virtual `end` node; the forward and
/// backward passes run over topological order and the path is every node
/// with zero slack.
pub fn critical_path(sim: &Simulation) -> Result<CriticalPath> {
    let mut first: Vec<&Task> = Vec::new();
    let mut seen = BTreeSet::new();
    for task in sim.tasks() {
        if seen.insert(task.name.as_str()) {
            first.push(task);
        }
    }
    if first.is_empty() {
        return Ok(CriticalPath {
            jobs: Vec::new(),
            length: 0,
        });
    }

    let mut graph = DiGraph::<String, ()>::new();
    let mut cost = Vec::new();
    let start = graph.add_node("<start>".to_string());
    cost.push(0i64);
    let end = graph.add_node("<end>".to_string());
    cost.push(0i64);

    let mut node_of: BTreeMap<&str, NodeIndex> = BTreeMap::new();
    for task in &first {
        let node = graph.add_node(task.name.clone());
        cost.push(i64::from(task.cost));
        node_of.insert(task.name.as_str(), node);
    }

    let mut referenced = BTreeSet::new();
    for task in &first {
        let node = node_of[task.name.as_str()];
        if task.needs.is_empty() {
            graph.add_edge(start, node, ());
        }
        for need in &task.needs {
            let dep = &sim.tasks()[need.index()];
            graph.add_edge(node_of[dep.name.as_str()], node, ());
            referenced.insert(dep.name.as_str());
        }
    }
    for task in &first {
        if !referenced.contains(task.name.as_str()) {
            graph.add_edge(node_of[task.name.as_str()], end, ());
        }
    }

    // Instances are validated acyclic at load time, so this only trips on
    // a graph assembled by hand.
    let order = toposort(&graph, None)
        .map_err(|cycle| Error::DependencyCycle(graph[cycle.node_id()].clone()))?;

    // Forward pass: earliest start/finish.
    let count = graph.node_count();
    let mut earliest_start = vec![0i64; count];
    let mut earliest_finish = vec![0i64; count];
    for &node in &order {
        let from_preds = graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|pred| earliest_finish[pred.index()])
            .max()
            .unwrap_or(0);
        earliest_start[node.index()] = from_preds;
        earliest_finish[node.index()] = from_preds + cost[node.index()];
    }

    // Backward pass: latest finish/start.
    let makespan = earliest_finish[end.index()];
    let mut latest_finish = vec![makespan; count];
    let mut latest_start = vec![makespan; count];
    for &node in order.iter().rev() {
        let from_succs = graph
            .neighbors_directed(node, Direction::Outgoing)
            .map(|succ| latest_start[succ.index()])
            .min()
            .unwrap_or(makespan);
        latest_finish[node.index()] = from_succs;
        latest_start[node.index()] = from_succs - cost[node.index()];
    }

    let mut jobs: Vec<(i64, String)> = first
        .iter()
        .filter(|task| {
            let index = node_of[task.name.as_str()].index();
            latest_start[index] - earliest_start[index] == 0
        })
        .map(|task| {
            (
                earliest_start[node_of[task.name.as_str()].index()],
                task.name.clone(),
            )
        })
        .collect();
    jobs.sort_by_key(|(start, _)| *start);

    Ok(CriticalPath {
        jobs: jobs.into_iter().map(|(_, name)| name).collect(),
        length: makespan as u32,
    })
}
