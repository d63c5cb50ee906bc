use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

pub const BATCH_COMPILED: &str = "batch_compiled";
pub const QUERY_DISPATCHED: &str = "query_dispatched";
pub const QUERY_FAILED: &str = "query_failed";
pub const BATCH_FINISHED: &str = "batch_finished";

/// Append-only writer for a batch's `events.jsonl`.
///
/// Every line carries `type`, `batch_id` and `ts`; payload keys are merged
/// last and may override them. The file is opened on the first emit.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    batch_id: String,
    file: Mutex<Option<File>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, batch_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.into(),
                batch_id: batch_id.into(),
                file: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn batch_id(&self) -> &str {
        &self.shared.batch_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let event = self.stamp(event_type, payload);
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut slot = self
            .shared
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        if slot.is_none() {
            *slot = Some(self.open()?);
        }
        if let Some(file) = slot.as_mut() {
            file.write_all(&line)
                .with_context(|| format!("failed to append to {}", self.path().display()))?;
        }
        Ok(Value::Object(event))
    }

    fn stamp(&self, event_type: &str, payload: EventPayload) -> EventPayload {
        let mut event = EventPayload::new();
        event.insert("type".to_string(), Value::from(event_type));
        event.insert("batch_id".to_string(), Value::from(self.batch_id()));
        event.insert("ts".to_string(), Value::from(now_utc_iso()));
        event.extend(payload);
        event
    }

    fn open(&self) -> anyhow::Result<File> {
        if let Some(parent) = self.path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path())
            .with_context(|| format!("failed to open event log {}", self.path().display()))
    }
}

/// Every event in an `events.jsonl` file, in write order.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<Value>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read event log {}", path.display()))?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<Value>(line).map_err(anyhow::Error::from))
        .collect()
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn emitted_event_matches_the_logged_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "batch-123");

        let mut payload = EventPayload::new();
        payload.insert("queries".to_string(), json!(4));
        let emitted = writer.emit(BATCH_COMPILED, payload)?;

        let events = read_events(&path)?;
        assert_eq!(events, vec![emitted]);
        assert_eq!(events[0]["type"], json!("batch_compiled"));
        assert_eq!(events[0]["batch_id"], json!("batch-123"));
        assert_eq!(events[0]["queries"], json!(4));
        DateTime::parse_from_rfc3339(events[0]["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn payload_wins_over_stamped_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "batch-123");

        let mut payload = EventPayload::new();
        payload.insert("batch_id".to_string(), json!("override"));
        let emitted = writer.emit(QUERY_DISPATCHED, payload)?;
        assert_eq!(emitted["batch_id"], json!("override"));
        Ok(())
    }

    #[test]
    fn clones_share_one_log_and_create_its_directory() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("run").join("events.jsonl");
        let writer = EventWriter::new(&path, "batch-123");
        let clone = writer.clone();

        writer.emit(QUERY_DISPATCHED, EventPayload::new())?;
        clone.emit(BATCH_FINISHED, EventPayload::new())?;

        let types = read_events(&path)?
            .into_iter()
            .map(|event| event["type"].clone())
            .collect::<Vec<Value>>();
        assert_eq!(types, vec![json!("query_dispatched"), json!("batch_finished")]);
        Ok(())
    }
}
