//! Execution result types

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use super::error::StepError;
use crate::workflow::{HistoryEntry, OutputResolutionError, RunStatus, StepStatus};

/// Outcome of evaluating one success criterion after a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "outcome", content = "detail")]
pub enum CriterionOutcome {
    Passed,
    Failed,
    /// Criterion has no check expression; reported for humans only
    Unchecked,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriterionReport {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    #[serde(flatten)]
    pub outcome: CriterionOutcome,
}

/// Result of a workflow run
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub workflow_id: String,
    pub execution_id: String,
    pub status: RunStatus,
    pub outputs: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub output_errors: Vec<OutputResolutionError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<CriterionReport>,
    pub history: Vec<HistoryEntry>,
    /// The step failure that ended the run, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Counts over a run's history, nested entries included
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Entries that ran, succeeded or failed
    pub executed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Entries with an attempt number above one
    pub retries: usize,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            RunStatus::Succeeded | RunStatus::PartiallySucceeded
        )
    }

    /// Every history entry, depth first
    pub fn all_entries(&self) -> Vec<&HistoryEntry> {
        self.history.iter().flat_map(|e| e.flatten()).collect()
    }

    /// Entries for a step id at any depth, one per attempt
    pub fn entries_for(&self, step_id: &str) -> Vec<&HistoryEntry> {
        self.all_entries()
            .into_iter()
            .filter(|e| e.step_id == step_id)
            .collect()
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for entry in self.all_entries() {
            match entry.status {
                StepStatus::Succeeded => summary.succeeded += 1,
                StepStatus::Failed => summary.failed += 1,
                StepStatus::Skipped => summary.skipped += 1,
            }
            if entry.status != StepStatus::Skipped {
                summary.executed += 1;
            }
            if entry.attempt > 1 {
                summary.retries += 1;
            }
        }
        summary
    }

    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ActionKind;

    fn entry(id: &str, status: StepStatus, attempt: u32) -> HistoryEntry {
        HistoryEntry {
            step_id: id.to_string(),
            action: ActionKind::ShellCommand,
            status,
            attempt,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            message: None,
            error: None,
            nested: Vec::new(),
        }
    }

    #[test]
    fn test_summary_counts_nested_entries() {
        let mut parent = entry("loop", StepStatus::Succeeded, 1);
        parent.nested = vec![
            entry("body", StepStatus::Failed, 1),
            entry("body", StepStatus::Succeeded, 2),
            HistoryEntry::skipped("cleanup", ActionKind::Log),
        ];

        let result = RunResult {
            run_id: "r".to_string(),
            workflow_id: "w".to_string(),
            execution_id: "w-1".to_string(),
            status: RunStatus::Succeeded,
            outputs: Map::new(),
            output_errors: Vec::new(),
            criteria: Vec::new(),
            history: vec![parent],
            error: None,
            started_at: Utc::now(),
            ended_at: Utc::now(),
        };

        assert_eq!(
            result.summary(),
            RunSummary {
                executed: 3,
                succeeded: 2,
                failed: 1,
                skipped: 1,
                retries: 1,
            }
        );
        assert_eq!(result.entries_for("body").len(), 2);
        assert!(result.is_success());
    }

    #[test]
    fn test_criterion_serialization() {
        let report = CriterionReport {
            description: "branch exists".to_string(),
            check: Some("${steps.branch.name} ne ''".to_string()),
            outcome: CriterionOutcome::Error("boom".to_string()),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "error");
        assert_eq!(json["detail"], "boom");
    }
}
