use std::path::PathBuf;

use anyhow::Result;
use sdbatch_contracts::events::{EventPayload, EventWriter, QUERY_DISPATCHED, QUERY_FAILED};
use sdbatch_contracts::runs::receipts::{build_receipt, write_receipt};
use serde_json::Value;
use tracing::{info, warn};

use crate::compile::CompiledQuery;
use crate::transport::{error_chain_text, Transport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub total: usize,
    pub dispatched: usize,
    pub failed: usize,
}

/// Sends queries one at a time. A failed query is logged and the next one is
/// sent; only event-log and receipt I/O errors abort the run.
pub struct Dispatcher<'a> {
    transport: &'a dyn Transport,
    events: Option<EventWriter>,
    receipts_dir: Option<PathBuf>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(transport: &'a dyn Transport) -> Self {
        Self {
            transport,
            events: None,
            receipts_dir: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_receipts(mut self, dir: impl Into<PathBuf>) -> Self {
        self.receipts_dir = Some(dir.into());
        self
    }

    pub fn run(&self, queries: &[CompiledQuery]) -> Result<DispatchReport> {
        let total = queries.len();
        let mut report = DispatchReport {
            total,
            ..DispatchReport::default()
        };
        for (offset, query) in queries.iter().enumerate() {
            let index = offset + 1;
            let endpoint = query.kind.endpoint();
            info!(
                index,
                total,
                endpoint,
                transport = self.transport.name(),
                "dispatching query"
            );
            match self.transport.submit(query) {
                Ok(response) => {
                    report.dispatched += 1;
                    for warning in &response.warnings {
                        warn!(index, %warning, "backend warning");
                    }
                    if let Some(dir) = &self.receipts_dir {
                        let request = serde_json::to_value(query).unwrap_or(Value::Null);
                        let receipt = build_receipt(
                            index,
                            endpoint,
                            &request,
                            &response.payload,
                            &response.warnings,
                        );
                        write_receipt(&dir.join(format!("query-{index:04}.json")), &receipt)?;
                    }
                    let mut payload = EventPayload::new();
                    payload.insert("index".to_string(), Value::from(index));
                    payload.insert("endpoint".to_string(), Value::from(endpoint));
                    payload.insert("images".to_string(), Value::from(response.images));
                    payload.insert(
                        "seed".to_string(),
                        response.seed.map(Value::from).unwrap_or(Value::Null),
                    );
                    payload.insert(
                        "checkpoint".to_string(),
                        query.checkpoint().map(Value::from).unwrap_or(Value::Null),
                    );
                    self.emit(QUERY_DISPATCHED, payload)?;
                }
                Err(err) => {
                    report.failed += 1;
                    let message = error_chain_text(&err, 1024);
                    warn!(index, error = %message, "query failed");
                    let mut payload = EventPayload::new();
                    payload.insert("index".to_string(), Value::from(index));
                    payload.insert("endpoint".to_string(), Value::from(endpoint));
                    payload.insert("error".to_string(), Value::String(message));
                    self.emit(QUERY_FAILED, payload)?;
                }
            }
        }
        info!(
            total = report.total,
            dispatched = report.dispatched,
            failed = report.failed,
            "batch dispatched"
        );
        Ok(report)
    }

    fn emit(&self, event_type: &str, payload: EventPayload) -> Result<()> {
        if let Some(events) = &self.events {
            events.emit(event_type, payload)?;
        }
        Ok(())
    }
}
