#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// Accumulated key/value state shared between workflow steps.
pub type StateMap = Map<String, Value>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum OrchestrationError {
    #[error("definition error: {0}")]
    Definition(String),
    #[error("step {step_index} ({skill}) is missing inputs: {}", missing.join(", "))]
    InputMissing {
        step_index: usize,
        skill: String,
        missing: Vec<String>,
    },
    #[error("step {step_index} ({skill}) failed: {message}")]
    StepExecution {
        step_index: usize,
        skill: String,
        message: String,
    },
    #[error("step {step_index} ({skill}) timed out after {timeout_ms}ms")]
    StepTimeout {
        step_index: usize,
        skill: String,
        timeout_ms: u64,
    },
    #[error("routing error: {0}")]
    Routing(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("revision conflict: {0}")]
    Conflict(String),
    #[error("cancelled")]
    Cancelled,
}

/// Identifier of a persisted workflow run or active team.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct StateId(pub String);

impl StateId {
    /// `wf_<workflow_id>_<ulid>`; the ULID carries the creation timestamp.
    #[must_use]
    pub fn for_workflow(workflow_id: &str) -> Self {
        Self(format!("wf_{workflow_id}_{}", Ulid::new()))
    }

    #[must_use]
    pub fn for_team(team_id: &str) -> Self {
        Self(format!("team_{team_id}_{}", Ulid::new()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StateId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    #[default]
    Sequential,
    /// Advisory only: steps still execute strictly in index order.
    Parallel,
    Conditional,
    Iterative,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum GateFailPolicy {
    Retry,
    Block,
    Warn,
}

fn default_max_iterations() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QualityGate {
    pub validator: String,
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    pub on_fail: GateFailPolicy,
}

/// Closed set of step conditions interpreted directly against state.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum StepCondition {
    Exists { key: String },
    Truthy { key: String },
    Equals { key: String, value: Value },
    Not { condition: Box<StepCondition> },
}

impl StepCondition {
    #[must_use]
    pub fn evaluate(&self, state: &StateMap) -> bool {
        match self {
            Self::Exists { key } => state.contains_key(key),
            Self::Truthy { key } => state.get(key).is_some_and(is_truthy),
            Self::Equals { key, value } => state.get(key) == Some(value),
            Self::Not { condition } => !condition.evaluate(state),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowStep {
    pub skill: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<QualityGate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mode: WorkflowMode,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub initial_state: StateMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_outputs: Option<Vec<String>>,
}

impl WorkflowDefinition {
    /// Every skill referenced by a step or a step's quality gate.
    #[must_use]
    pub fn referenced_skills(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        for step in &self.steps {
            out.insert(step.skill.as_str());
            if let Some(gate) = &step.gate {
                out.insert(gate.validator.as_str());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Blocked,
    Completed,
    Failed,
}

impl WorkflowStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "blocked" => Some(Self::Blocked),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    Continue,
    Retry,
    Block,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GateResult {
    pub passed: bool,
    pub failed_criteria: Vec<String>,
    pub errors: Vec<String>,
    pub attempt: u32,
    pub action: GateAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StepHistoryEntry {
    pub step_index: usize,
    pub skill: String,
    pub outputs: StateMap,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_result: Option<GateResult>,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: DateTimeUtc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InputMissing,
    StepExecution,
    StepTimeout,
    GateBlocked,
    Cancelled,
    SkillUnavailable,
}

/// Serializable record of why a run stopped, kept on the persisted state.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub step_index: Option<usize>,
    pub skill: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_result: Option<GateResult>,
}

impl FailureRecord {
    #[must_use]
    pub fn from_error(err: &OrchestrationError) -> Self {
        let (kind, step_index, skill, missing_inputs, timeout_ms) = match err {
            OrchestrationError::InputMissing {
                step_index,
                skill,
                missing,
            } => (
                FailureKind::InputMissing,
                Some(*step_index),
                Some(skill.clone()),
                missing.clone(),
                None,
            ),
            OrchestrationError::StepExecution {
                step_index, skill, ..
            } => (
                FailureKind::StepExecution,
                Some(*step_index),
                Some(skill.clone()),
                Vec::new(),
                None,
            ),
            OrchestrationError::StepTimeout {
                step_index,
                skill,
                timeout_ms,
            } => (
                FailureKind::StepTimeout,
                Some(*step_index),
                Some(skill.clone()),
                Vec::new(),
                Some(*timeout_ms),
            ),
            _ => (FailureKind::Cancelled, None, None, Vec::new(), None),
        };
        Self {
            kind,
            step_index,
            skill,
            message: err.to_string(),
            missing_inputs,
            timeout_ms,
            gate_result: None,
        }
    }

    /// Rebuild the typed error for callers that want to match on it.
    #[must_use]
    pub fn to_error(&self) -> OrchestrationError {
        let step_index = self.step_index.unwrap_or_default();
        let skill = self.skill.clone().unwrap_or_default();
        match self.kind {
            FailureKind::InputMissing => OrchestrationError::InputMissing {
                step_index,
                skill,
                missing: self.missing_inputs.clone(),
            },
            FailureKind::StepTimeout => OrchestrationError::StepTimeout {
                step_index,
                skill,
                timeout_ms: self.timeout_ms.unwrap_or_default(),
            },
            FailureKind::Cancelled => OrchestrationError::Cancelled,
            FailureKind::StepExecution | FailureKind::GateBlocked => {
                OrchestrationError::StepExecution {
                    step_index,
                    skill,
                    message: self.message.clone(),
                }
            }
            FailureKind::SkillUnavailable => OrchestrationError::NotFound(self.message.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WorkflowState {
    pub id: StateId,
    pub workflow_id: String,
    pub definition_hash: String,
    pub current_step: usize,
    pub state_data: StateMap,
    pub history: Vec<StepHistoryEntry>,
    #[serde(default)]
    pub skipped_steps: Vec<usize>,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_outputs: Option<StateMap>,
    #[serde(default)]
    pub revision: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: DateTimeUtc,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<DateTimeUtc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationPattern {
    Sequential,
    Parallel,
    Conditional,
    Supervised,
    #[serde(alias = "hub-spoke")]
    HubSpoke,
    Pipeline,
}

impl CommunicationPattern {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Conditional => "conditional",
            Self::Supervised => "supervised",
            Self::HubSpoke => "hub_spoke",
            Self::Pipeline => "pipeline",
        }
    }

    /// Whether the lead may hand leadership to another member.
    #[must_use]
    pub fn allows_delegation(self) -> bool {
        !matches!(self, Self::HubSpoke | Self::Pipeline)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SkillTeam {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub members: Vec<String>,
    pub lead: String,
    pub pattern: CommunicationPattern,
    #[serde(default)]
    pub triggers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TeamStatus {
    Active,
    Stopped,
    Completed,
}

impl TeamStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TeamMessage {
    pub seq: usize,
    pub from: String,
    pub to: String,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActiveTeam {
    pub id: StateId,
    pub team_id: String,
    pub pattern: CommunicationPattern,
    pub current_lead: String,
    pub members: Vec<String>,
    pub state_data: StateMap,
    pub communication_log: Vec<TeamMessage>,
    pub status: TeamStatus,
    #[serde(default)]
    pub revision: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CollaborationEdge {
    pub skill: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Collaboration descriptor a skill declares for its neighbours.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SkillCollaboration {
    pub skill: String,
    #[serde(default)]
    pub receives_from: Vec<CollaborationEdge>,
    #[serde(default)]
    pub hands_to: Vec<CollaborationEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StateContract {
    pub from: String,
    pub to: String,
    pub required_fields: Vec<String>,
    pub handoff_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContractValidation {
    pub valid: bool,
    pub missing_fields: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventRecord {
    pub event_seq: i64,
    pub subject_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: DateTimeUtc,
    pub data: Value,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// JavaScript-style truthiness over JSON values.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Copy the listed keys that are present in `source`, in list order.
#[must_use]
pub fn project(source: &StateMap, keys: &[String]) -> StateMap {
    let mut out = StateMap::new();
    for key in keys {
        if let Some(value) = source.get(key) {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Deterministic hash of a registered workflow definition.
///
/// # Errors
/// Returns an error if the definition cannot be serialized.
pub fn compute_definition_hash(definition: &WorkflowDefinition) -> Result<String> {
    let value = serde_json::to_value(definition)?;
    hash_json(&value)
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// Format a timestamp as RFC 3339.
///
/// # Errors
/// Returns an error if the timestamp cannot be formatted.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

/// Parse an RFC 3339 timestamp.
///
/// # Errors
/// Returns an error if the value is not valid RFC 3339.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}

#[cfg(test)]
mod tests {
    use super::{
        is_truthy, project, FailureKind, FailureRecord, OrchestrationError, StateId, StateMap,
        StepCondition, WorkflowDefinition,
    };
    use serde_json::{json, Value};

    fn state(value: Value) -> StateMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn truthiness_matches_loose_json_rules() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!(0.5)));
        assert!(is_truthy(&json!([])));
    }

    #[test]
    fn conditions_evaluate_against_state() {
        let data = state(json!({"env": "prod", "approved": false, "count": 3}));
        assert!(StepCondition::Exists { key: "approved".to_string() }.evaluate(&data));
        assert!(!StepCondition::Truthy { key: "approved".to_string() }.evaluate(&data));
        assert!(StepCondition::Equals {
            key: "env".to_string(),
            value: json!("prod")
        }
        .evaluate(&data));
        assert!(StepCondition::Not {
            condition: Box::new(StepCondition::Exists { key: "missing".to_string() })
        }
        .evaluate(&data));
    }

    #[test]
    fn condition_yaml_uses_op_tag() {
        let parsed: Result<StepCondition, _> =
            serde_yaml::from_str("op: equals\nkey: severity\nvalue: high\n");
        match parsed {
            Ok(condition) => assert_eq!(
                condition,
                StepCondition::Equals {
                    key: "severity".to_string(),
                    value: json!("high")
                }
            ),
            Err(err) => panic!("condition should parse: {err}"),
        }
    }

    #[test]
    fn project_keeps_only_listed_present_keys() {
        let data = state(json!({"a": 1, "b": 2}));
        let projected = project(&data, &["b".to_string(), "z".to_string()]);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected.get("b"), Some(&json!(2)));
    }

    #[test]
    fn state_ids_carry_prefix_and_are_unique() {
        let first = StateId::for_workflow("feature-build");
        let second = StateId::for_workflow("feature-build");
        assert!(first.as_str().starts_with("wf_feature-build_"));
        assert_ne!(first, second);
        assert!(StateId::for_team("squad").as_str().starts_with("team_squad_"));
    }

    #[test]
    fn failure_record_round_trips_typed_error() {
        let err = OrchestrationError::InputMissing {
            step_index: 2,
            skill: "frontend".to_string(),
            missing: vec!["api".to_string()],
        };
        let record = FailureRecord::from_error(&err);
        assert_eq!(record.kind, FailureKind::InputMissing);
        assert_eq!(record.to_error(), err);
    }

    #[test]
    fn referenced_skills_include_gate_validators() {
        let definition: Result<WorkflowDefinition, _> = serde_yaml::from_str(
            r"
id: audit
name: Audit
steps:
  - skill: scanner
    outputs: [report]
    gate:
      validator: reviewer
      criteria: [no_critical]
      on_fail: block
",
        );
        let definition = definition.unwrap_or_else(|err| panic!("fixture parse failed: {err}"));
        let skills: Vec<&str> = definition.referenced_skills().into_iter().collect();
        assert_eq!(skills, vec!["reviewer", "scanner"]);
    }
}
