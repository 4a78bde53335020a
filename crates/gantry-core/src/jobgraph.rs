//! Port for the external pipeline-definition loader.
//!
//! Parsing CI definition files is someone else's job; the simulation only
//! needs the job names, the per-job shape, and the declared stage order.

use std::collections::{BTreeMap, BTreeSet};

/// One job as the loader describes it. Durations are not part of the
/// definition; they come from the cost profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub stage: String,
    pub tags: BTreeSet<String>,
    /// Names of jobs this one waits for, within the same pipeline.
    pub needs: Vec<String>,
    pub requires_image: bool,
}

/// What the simulation consumes from a parsed pipeline definition.
pub trait JobGraph {
    /// Job names in declaration order. The order is load-bearing: it fixes
    /// task iteration order and therefore scheduling ties.
    fn jobs(&self) -> Vec<String>;

    fn job(&self, name: &str) -> Option<JobSpec>;

    /// Declared stage execution order. Jobs with no explicit `needs` are
    /// gated by this order.
    fn stages(&self) -> Vec<String>;
}

/// In-memory job graph for callers that already hold parsed data.
#[derive(Debug, Clone, Default)]
pub struct StaticJobGraph {
    order: Vec<String>,
    jobs: BTreeMap<String, JobSpec>,
    stages: Vec<String>,
}

impl StaticJobGraph {
    pub fn new(stages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            order: Vec::new(),
            jobs: BTreeMap::new(),
            stages: stages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn add_job(&mut self, name: impl Into<String>, spec: JobSpec) -> &mut Self {
        let name = name.into();
        if !self.jobs.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.jobs.insert(name, spec);
        self
    }
}

impl JobGraph for StaticJobGraph {
    fn jobs(&self) -> Vec<String> {
        self.order.clone()
    }

    fn job(&self, name: &str) -> Option<JobSpec> {
        self.jobs.get(name).cloned()
    }

    fn stages(&self) -> Vec<String> {
        self.stages.clone()
    }
}
