use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::now_utc_iso;

/// Totals for one queued batch, written to `summary.json` once dispatch ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub total_queries: u64,
    pub dispatched: u64,
    pub failed: u64,
    /// sha256 of the compiled query list.
    pub digest: String,
}

impl BatchSummary {
    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Writes `summary` plus a `ts` stamp; `extra` keys are merged last.
pub fn write_summary(
    path: &Path,
    summary: &BatchSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let Value::Object(mut payload) = serde_json::to_value(summary)? else {
        anyhow::bail!("batch summary did not serialize to an object");
    };
    payload.insert("ts".to_string(), Value::from(now_utc_iso()));
    payload.extend(extra.into_iter().flatten().map(|(k, v)| (k.clone(), v.clone())));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)
        .with_context(|| format!("failed to write summary {}", path.display()))
}

pub fn read_summary(path: &Path) -> anyhow::Result<BatchSummary> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read summary {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid summary {}", path.display()))
}
