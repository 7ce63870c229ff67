//! Sync orchestration: adapter selection, per-adapter job rows, background
//! re-execution, and the webhook trigger.

pub mod background;
pub mod orchestrator;
pub mod webhook;

use serde::{Deserialize, Serialize};

pub use orchestrator::Orchestrator;

/// Which adapters a sync invocation targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    One(String),
    All,
}

/// Terminal outcome of one adapter's run within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterRunReport {
    pub adapter: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<crate::adapter::AdapterResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate result of one orchestrator invocation. `ok` is the conjunction
/// of the per-adapter outcomes; an empty adapter set is vacuously ok.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub ok: bool,
    pub adapters: Vec<AdapterRunReport>,
}

impl SyncResult {
    pub fn empty() -> Self {
        Self {
            ok: true,
            adapters: Vec::new(),
        }
    }
}
