//! Gantry Core
//!
//! Core domain types, traits, and error handling for Gantry.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the simulation engine and the capacity planner.

pub mod error;
pub mod ids;
pub mod jobgraph;
pub mod profile;
pub mod runner;
pub mod task;

pub use error::{Error, Result};
pub use ids::*;
