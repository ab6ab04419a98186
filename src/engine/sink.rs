//! History sinks receive each top-level history entry of a root run as it
//! is appended; nested runs arrive inside their parent's entry

use std::sync::Mutex;

use tracing::info;

use crate::workflow::HistoryEntry;

/// Receiver of history entries, called synchronously by the executor
pub trait HistorySink: Send + Sync {
    fn record(&self, run_id: &str, workflow_id: &str, entry: &HistoryEntry);
}

/// Logs one line per entry
#[derive(Debug, Default)]
pub struct TracingSink;

impl HistorySink for TracingSink {
    fn record(&self, run_id: &str, workflow_id: &str, entry: &HistoryEntry) {
        let elapsed = (entry.ended_at - entry.started_at).num_milliseconds();
        match &entry.error {
            Some(error) => info!(
                run_id,
                workflow_id,
                step_id = %entry.step_id,
                attempt = entry.attempt,
                "{} {:?} after {}ms: {}",
                entry.action,
                entry.status,
                elapsed,
                error.message
            ),
            None => info!(
                run_id,
                workflow_id,
                step_id = %entry.step_id,
                attempt = entry.attempt,
                "{} {:?} after {}ms",
                entry.action,
                entry.status,
                elapsed
            ),
        }
    }
}

/// Keeps every entry in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    entries: Mutex<Vec<(String, HistoryEntry)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(run_id, entry)` pairs in arrival order
    pub fn entries(&self) -> Vec<(String, HistoryEntry)> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn entries_for_run(&self, run_id: &str) -> Vec<HistoryEntry> {
        self.entries()
            .into_iter()
            .filter(|(id, _)| id == run_id)
            .map(|(_, entry)| entry)
            .collect()
    }
}

impl HistorySink for CollectingSink {
    fn record(&self, run_id: &str, _workflow_id: &str, entry: &HistoryEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((run_id.to_string(), entry.clone()));
    }
}
