//! Outward-facing report records produced by the engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot of one task after a completed run, with effective delay totals
/// keyed by cause label (`runner`, `stage`, `inherited <dep-name>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub name: String,
    pub instance: u32,
    pub cost: u32,
    pub started: Option<u32>,
    pub delays: BTreeMap<String, u32>,
}
