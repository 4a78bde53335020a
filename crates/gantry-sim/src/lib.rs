//! Deterministic discrete-tick simulation of pipeline runs against a
//! capacity-limited runner pool.

pub mod sim;
pub mod views;

pub use sim::Simulation;
pub use views::TaskView;
