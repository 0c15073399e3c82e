//! Core data model.
//!
//! A work item is one execution request waiting to be submitted to the
//! remote platform. The queue state is the running tally of what has
//! already been processed, stored as the head of the queue file.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque execution request body. The remote client owns its shape.
pub type Payload = Map<String, Value>;

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of submittable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Run-scoped identifier, 1-based in insertion order.
    pub identifier: u64,

    /// Execution request body, stored inline next to the identifier.
    #[serde(flatten)]
    pub payload: Payload,
}

impl WorkItem {
    /// Build an item from raw content. Any `identifier` already present in
    /// the content is discarded in favour of the assigned one.
    pub fn new(identifier: u64, mut payload: Payload) -> Self {
        payload.remove("identifier");
        Self {
            identifier,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue State
// ---------------------------------------------------------------------------

/// Aggregate progress, persisted as element 0 of the queue file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub nb_processed_items: u64,
    pub processed_item_ids: Vec<u64>,
}

impl QueueState {
    /// Record `identifier` as processed. Returns false if it already was.
    pub fn record(&mut self, identifier: u64) -> bool {
        if self.processed_item_ids.contains(&identifier) {
            return false;
        }
        self.processed_item_ids.push(identifier);
        self.nb_processed_items += 1;
        true
    }

    pub fn is_processed(&self, identifier: u64) -> bool {
        self.processed_item_ids.contains(&identifier)
    }

    /// First identifier appearing twice in `processed_item_ids`, if any.
    pub fn duplicate_id(&self) -> Option<u64> {
        let mut seen = HashSet::with_capacity(self.processed_item_ids.len());
        self.processed_item_ids
            .iter()
            .copied()
            .find(|id| !seen.insert(*id))
    }
}

/// In-memory image of the queue file: head record plus pending items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub state: QueueState,
    pub items: Vec<WorkItem>,
}

impl QueueSnapshot {
    /// Processed so far plus still pending. Fixed for the duration of a run.
    pub fn total_items(&self) -> u64 {
        self.state.processed_item_ids.len() as u64 + self.items.len() as u64
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Lifecycle state of a single work item within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// In the pending list, not yet handed to the remote platform.
    Pending,
    /// Accepted by the remote platform, being polled.
    Submitted,
    /// Remote execution finished successfully. Terminal.
    Completed,
    /// Rejected, errored, or finished with a non-success status. Terminal.
    Failed,
}

impl ItemState {
    pub fn can_transition_to(self, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, to),
            (Pending, Submitted)
                | (Pending, Failed)     // rejected or errored before a handle exists
                | (Submitted, Completed)
                | (Submitted, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Completed | ItemState::Failed)
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemState::Pending => "pending",
            ItemState::Submitted => "submitted",
            ItemState::Completed => "completed",
            ItemState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Drained,
}

// ---------------------------------------------------------------------------
// Remote execution
// ---------------------------------------------------------------------------

/// What the remote platform returned for a submission.
///
/// A missing `id` means the platform did not accept the request; `message`
/// and `details` then carry its explanation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub id: Option<String>,
    /// Identifier the status endpoint is keyed by, when it differs from `id`.
    pub monitoring_id: Option<String>,
    pub message: Option<String>,
    pub details: Option<String>,
}

impl ExecutionHandle {
    pub fn accepted(id: impl Into<String>, monitoring_id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            monitoring_id: Some(monitoring_id.into()),
            message: None,
            details: None,
        }
    }

    pub fn rejected(message: Option<String>, details: Option<String>) -> Self {
        Self {
            id: None,
            monitoring_id: None,
            message,
            details,
        }
    }

    /// Key used to query status: the monitoring id, falling back to the execution id.
    pub fn status_key(&self) -> Option<&str> {
        self.monitoring_id.as_deref().or(self.id.as_deref())
    }
}

/// Remote execution status. The set is open: anything other than
/// `Running` is terminal, and only `Finished` counts as success.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    Running,
    Finished,
    Other(String),
}

impl ExecutionStatus {
    /// Parse a raw status body. The platform answers with a JSON string,
    /// so surrounding quotes and whitespace are stripped.
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim().trim_matches('"');
        match s {
            "Running" => ExecutionStatus::Running,
            "Finished" => ExecutionStatus::Finished,
            other => ExecutionStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Finished => "Finished",
            ExecutionStatus::Other(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Finished)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Status string written to the tracking record for driver-detected failures.
pub const FAILED_STATUS: &str = "FAILED";

/// Terminal result of processing one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Succeeded {
        status: ExecutionStatus,
    },
    Failed {
        /// Remote terminal status, when the platform reported one.
        status: Option<ExecutionStatus>,
        reason: String,
        details: Option<String>,
    },
}

impl ItemOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        ItemOutcome::Failed {
            status: None,
            reason: reason.into(),
            details: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Succeeded { .. })
    }

    pub fn state(&self) -> ItemState {
        if self.is_success() {
            ItemState::Completed
        } else {
            ItemState::Failed
        }
    }

    /// Status string recorded in the tracking sink.
    pub fn tracking_status(&self) -> &str {
        match self {
            ItemOutcome::Succeeded { status } => status.as_str(),
            ItemOutcome::Failed {
                status: Some(status),
                ..
            } => status.as_str(),
            ItemOutcome::Failed { status: None, .. } => FAILED_STATUS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_parse_strips_quotes() {
        assert_eq!(ExecutionStatus::parse("\"Running\""), ExecutionStatus::Running);
        assert_eq!(ExecutionStatus::parse("Finished\n"), ExecutionStatus::Finished);
        assert_eq!(
            ExecutionStatus::parse("\"Killed\""),
            ExecutionStatus::Other("Killed".to_string())
        );
        assert!(!ExecutionStatus::parse("\"Running\"").is_terminal());
        assert!(ExecutionStatus::parse("\"Killed\"").is_terminal());
    }

    #[test]
    fn work_item_flattens_payload() {
        let payload = json!({"identifier": 99, "name": "sims", "studyIdentifier": 3});
        let item = WorkItem::new(2, payload.as_object().cloned().unwrap());
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value, json!({"identifier": 2, "name": "sims", "studyIdentifier": 3}));

        let back: WorkItem = serde_json::from_value(value).unwrap();
        assert_eq!(back, item);
        assert!(!back.payload.contains_key("identifier"));
    }

    #[test]
    fn queue_state_records_each_id_once() {
        let mut state = QueueState::default();
        assert!(state.record(3));
        assert!(!state.record(3));
        assert!(state.record(1));
        assert_eq!(state.nb_processed_items, 2);
        assert_eq!(state.processed_item_ids, vec![3, 1]);
        assert_eq!(state.duplicate_id(), None);
    }

    #[test]
    fn item_state_transitions() {
        assert!(ItemState::Pending.can_transition_to(ItemState::Submitted));
        assert!(ItemState::Pending.can_transition_to(ItemState::Failed));
        assert!(!ItemState::Pending.can_transition_to(ItemState::Completed));
        assert!(!ItemState::Completed.can_transition_to(ItemState::Failed));
        assert!(ItemState::Failed.is_terminal());
    }

    #[test]
    fn outcome_tracking_status() {
        let ok = ItemOutcome::Succeeded {
            status: ExecutionStatus::Finished,
        };
        assert_eq!(ok.tracking_status(), "Finished");
        assert_eq!(ItemOutcome::failed("boom").tracking_status(), FAILED_STATUS);
        let remote = ItemOutcome::Failed {
            status: Some(ExecutionStatus::Other("Killed".into())),
            reason: "remote".into(),
            details: None,
        };
        assert_eq!(remote.tracking_status(), "Killed");
        assert_eq!(remote.state(), ItemState::Failed);
    }
}
