//! Critical-path analysis and iterative capacity planning on top of the
//! simulation engine.

pub mod critical_path;
pub mod planner;

pub use critical_path::{CriticalPath, critical_path};
pub use planner::{CapacityPlanner, PlanResult, RunnerPressure, ranked_tasks, runner_pressure};
