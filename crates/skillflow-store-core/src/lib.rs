#![forbid(unsafe_code)]

use anyhow::Result;
use skillflow_domain::{ActiveTeam, EventRecord, StateId, WorkflowState};

/// An event about to be appended; the store assigns `event_seq`.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub subject_id: String,
    pub event_type: String,
    pub occurred_at: skillflow_domain::DateTimeUtc,
    pub data: serde_json::Value,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

/// Write-through persistence for workflow runs, active teams and the event log.
///
/// Saves carry optimistic concurrency: the stored revision must equal the
/// caller's `revision`, otherwise the save fails with
/// `OrchestrationError::Conflict` and nothing is written.
pub trait StateStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    /// Insert or update a run and return the new revision.
    #[allow(clippy::missing_errors_doc)]
    fn save_workflow_state(&self, state: &WorkflowState) -> Result<u64>;

    #[allow(clippy::missing_errors_doc)]
    fn load_workflow_state(&self, id: &StateId) -> Result<Option<WorkflowState>>;

    /// All runs, oldest first.
    #[allow(clippy::missing_errors_doc)]
    fn list_workflow_states(&self) -> Result<Vec<WorkflowState>>;

    #[allow(clippy::missing_errors_doc)]
    fn save_team_state(&self, team: &ActiveTeam) -> Result<u64>;

    #[allow(clippy::missing_errors_doc)]
    fn load_team_state(&self, id: &StateId) -> Result<Option<ActiveTeam>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_team_states(&self) -> Result<Vec<ActiveTeam>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_event(&self, event: &NewEvent) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn list_events(&self, subject_id: &str) -> Result<Vec<EventRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn last_event_hash(&self, subject_id: &str) -> Result<Option<String>>;
}
