//! Cost profiles and the persisted resource-profile record.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

/// Build times for jobs, in ticks (minutes).
///
/// Jobs without a recorded timing default to 1 tick.
#[derive(Debug, Clone, Default)]
pub struct CostProfile {
    jobs: BTreeMap<String, u32>,
}

impl CostProfile {
    pub fn new(jobs: BTreeMap<String, u32>) -> Self {
        Self { jobs }
    }

    pub fn has_cost(&self, job: &str) -> bool {
        self.jobs.contains_key(job)
    }

    pub fn cost(&self, job: &str) -> u32 {
        self.jobs.get(job).copied().unwrap_or(1)
    }
}

fn default_concurrency() -> u32 {
    1
}

/// One runner definition in a persisted resource profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerSpec {
    pub name: String,
    #[serde(default)]
    pub images: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

/// The persisted resource profile: per-job timings plus the runner pool.
///
/// This is the record the CLI layer dumps and re-loads; simulations are
/// constructed directly from it. Malformed shapes are rejected here, never
/// during simulation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceProfile {
    #[serde(default)]
    pub timings: BTreeMap<String, u32>,
    #[serde(default)]
    pub runners: Vec<RunnerSpec>,
}

impl ResourceProfile {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let profile: ResourceProfile = serde_yaml::from_str(text)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let profile: ResourceProfile = serde_yaml::from_reader(reader)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Generate a skeleton profile for a pipeline: every job at a default
    /// cost, and one single-slot runner per unique capability requirement.
    pub fn template(
        job_names: impl IntoIterator<Item = impl Into<String>>,
        requirements: impl IntoIterator<Item = (BTreeSet<String>, bool)>,
        default_cost: u32,
    ) -> Self {
        let timings = job_names
            .into_iter()
            .map(|name| (name.into(), default_cost))
            .collect();

        let unique: BTreeSet<(BTreeSet<String>, bool)> = requirements.into_iter().collect();
        let runners = unique
            .into_iter()
            .enumerate()
            .map(|(index, (tags, images))| RunnerSpec {
                name: format!("generated-{index}"),
                images,
                tags,
                concurrency: 1,
            })
            .collect();

        Self { timings, runners }
    }

    pub fn cost_profile(&self) -> CostProfile {
        CostProfile::new(self.timings.clone())
    }

    fn validate(&self) -> Result<()> {
        for (job, cost) in &self.timings {
            if *cost == 0 {
                return Err(Error::InvalidProfile(format!(
                    "job {job} has a zero timing"
                )));
            }
        }
        let mut seen = BTreeSet::new();
        for runner in &self.runners {
            if runner.concurrency == 0 {
                return Err(Error::InvalidProfile(format!(
                    "runner {} has zero concurrency",
                    runner.name
                )));
            }
            if !seen.insert(runner.name.as_str()) {
                return Err(Error::InvalidProfile(format!(
                    "duplicate runner name: {}",
                    runner.name
                )));
            }
        }
        Ok(())
    }
}
