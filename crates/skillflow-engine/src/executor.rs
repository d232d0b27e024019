use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use skillflow_contracts::ContractValidator;
use skillflow_domain::{
    now_utc, project, FailureKind, FailureRecord, GateAction, GateFailPolicy, GateResult,
    OrchestrationError, StateId, StateMap, StepHistoryEntry, WorkflowDefinition, WorkflowState,
    WorkflowStatus, WorkflowStep,
};
use skillflow_events::{EventSink, EventType};
use skillflow_registry::WorkflowRegistry;
use skillflow_store_core::StateStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event_log::EventLog;
use crate::gate::check_gate;
use crate::skills::{SkillAction, SkillContext, SkillResolver};

/// Result of a single `step` call.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StepOutcome {
    Advanced,
    Skipped,
    Completed,
    Blocked,
    Failed,
}

enum InvokeFailure {
    Failed(String),
    TimedOut(u64),
    Cancelled,
}

enum AttemptOutcome {
    Accepted(StateMap, Option<GateResult>),
    Retry,
    Stopped(StepOutcome),
}

/// Drives workflow runs through the step state machine, persisting every
/// transition write-through.
pub struct WorkflowExecutor<'a> {
    registry: &'a WorkflowRegistry,
    skills: &'a dyn SkillResolver,
    store: &'a dyn StateStore,
    log: EventLog<'a>,
    contracts: Option<&'a ContractValidator>,
}

impl<'a> WorkflowExecutor<'a> {
    #[must_use]
    pub fn new(
        registry: &'a WorkflowRegistry,
        skills: &'a dyn SkillResolver,
        store: &'a dyn StateStore,
        events: &'a dyn EventSink,
    ) -> Self {
        Self {
            registry,
            skills,
            store,
            log: EventLog::new(store, events),
            contracts: None,
        }
    }

    #[must_use]
    pub fn with_contracts(mut self, contracts: &'a ContractValidator) -> Self {
        self.contracts = Some(contracts);
        self
    }

    /// Build a pending run: `initial_state` overlaid with `overrides`. Not persisted.
    ///
    /// # Errors
    /// Returns `OrchestrationError::NotFound` for unknown workflows.
    pub fn prepare(&self, workflow_id: &str, overrides: StateMap) -> Result<WorkflowState> {
        let definition = self.registry.get(workflow_id)?;
        let definition_hash = self.registry.definition_hash(workflow_id)?.to_string();
        let mut state_data = definition.initial_state.clone();
        state_data.extend(overrides);
        let now = now_utc();
        Ok(WorkflowState {
            id: StateId::for_workflow(workflow_id),
            workflow_id: workflow_id.to_string(),
            definition_hash,
            current_step: 0,
            state_data,
            history: Vec::new(),
            skipped_steps: Vec::new(),
            status: WorkflowStatus::Pending,
            error: None,
            final_outputs: None,
            revision: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    /// `pending -> running`. A workflow without steps completes immediately.
    ///
    /// # Errors
    /// Returns `OrchestrationError::InvalidState` unless the run is pending, or
    /// a persistence error.
    pub fn start(&self, state: &mut WorkflowState) -> Result<()> {
        if state.status != WorkflowStatus::Pending {
            return Err(invalid_state(state, "start"));
        }
        let definition = self.registry.get(&state.workflow_id)?;
        state.status = WorkflowStatus::Running;
        self.persist(state)?;
        info!(state_id = %state.id, workflow_id = %state.workflow_id, "workflow started");
        self.log.record(
            state.id.as_str(),
            EventType::WorkflowStart,
            json!({
                "state_id": state.id,
                "workflow_id": state.workflow_id,
                "steps": definition.steps.len(),
            }),
        )?;

        if definition.steps.is_empty() {
            self.complete(state, definition)?;
        }
        Ok(())
    }

    /// Perform exactly one transition for `current_step`.
    ///
    /// Step failures are recorded on the state and reported as
    /// `StepOutcome::Failed`; `Err` is reserved for misuse and persistence.
    ///
    /// # Errors
    /// Returns `OrchestrationError::InvalidState` unless the run is running, or
    /// a persistence error.
    pub async fn step(
        &self,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        if state.status != WorkflowStatus::Running {
            return Err(invalid_state(state, "step"));
        }
        let definition = self.registry.get(&state.workflow_id)?;
        let index = state.current_step;
        let Some(step) = definition.steps.get(index) else {
            self.complete(state, definition)?;
            return Ok(StepOutcome::Completed);
        };

        if cancel.is_cancelled() {
            return self.fail_cancelled(state, Some(index));
        }

        if let Some(condition) = &step.condition {
            if !condition.evaluate(&state.state_data) {
                return self.skip(state, definition, index, step);
            }
        }

        let missing: Vec<String> = step
            .inputs
            .iter()
            .filter(|key| !state.state_data.contains_key(key.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let err = OrchestrationError::InputMissing {
                step_index: index,
                skill: step.skill.clone(),
                missing,
            };
            return self.fail(state, &err, None);
        }

        let Some(action) = self.skills.resolve(&step.skill) else {
            return self.block(state, index, &step.skill);
        };
        let validator = match &step.gate {
            Some(gate) => match self.skills.resolve(&gate.validator) {
                Some(validator) => Some(validator),
                None => return self.block(state, index, &gate.validator),
            },
            None => None,
        };

        let max_attempts = match &step.gate {
            Some(gate) if gate.on_fail == GateFailPolicy::Retry => gate.max_iterations.max(1),
            _ => 1,
        };

        for attempt in 1..=max_attempts {
            let outcome = self
                .attempt(
                    state,
                    index,
                    step,
                    action.as_ref(),
                    validator.as_deref(),
                    attempt,
                    max_attempts,
                    cancel,
                )
                .await?;
            match outcome {
                AttemptOutcome::Accepted(outputs, gate_result) => {
                    return self.accept(state, definition, index, step, outputs, attempt, gate_result);
                }
                AttemptOutcome::Retry => {}
                AttemptOutcome::Stopped(outcome) => return Ok(outcome),
            }
        }

        Err(anyhow!(
            "step {index} of {} exhausted {max_attempts} attempts without a verdict",
            state.id
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        state: &mut WorkflowState,
        index: usize,
        step: &WorkflowStep,
        action: &dyn SkillAction,
        validator: Option<&dyn SkillAction>,
        attempt: u32,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome> {
        let inputs = project(&state.state_data, &step.inputs);
        let ctx = SkillContext {
            state_id: state.id.clone(),
            workflow_id: state.workflow_id.clone(),
            skill: step.skill.clone(),
            step_index: index,
            attempt,
            declared_outputs: step.outputs.clone(),
            cancel: cancel.clone(),
        };
        debug!(state_id = %state.id, step_index = index, skill = %step.skill, attempt, "invoking skill");

        let raw = match invoke_bounded(action, &inputs, &ctx, step.timeout_ms, cancel).await {
            Ok(raw) => raw,
            Err(InvokeFailure::Cancelled) => {
                return self
                    .fail_cancelled(state, Some(index))
                    .map(AttemptOutcome::Stopped)
            }
            Err(InvokeFailure::TimedOut(timeout_ms)) => {
                let err = OrchestrationError::StepTimeout {
                    step_index: index,
                    skill: step.skill.clone(),
                    timeout_ms,
                };
                return self.retry_or_fail(state, &err, attempt, max_attempts);
            }
            Err(InvokeFailure::Failed(message)) => {
                let err = OrchestrationError::StepExecution {
                    step_index: index,
                    skill: step.skill.clone(),
                    message,
                };
                return self.retry_or_fail(state, &err, attempt, max_attempts);
            }
        };
        let outputs = project(&raw, &step.outputs);

        let (Some(gate), Some(validator)) = (&step.gate, validator) else {
            return Ok(AttemptOutcome::Accepted(outputs, None));
        };

        let validator_ctx = SkillContext {
            skill: gate.validator.clone(),
            declared_outputs: Vec::new(),
            ..ctx
        };
        let report = match invoke_bounded(validator, &outputs, &validator_ctx, step.timeout_ms, cancel)
            .await
        {
            Ok(report) => report,
            Err(InvokeFailure::Cancelled) => {
                return self
                    .fail_cancelled(state, Some(index))
                    .map(AttemptOutcome::Stopped)
            }
            Err(InvokeFailure::Failed(message)) => {
                let err = OrchestrationError::StepExecution {
                    step_index: index,
                    skill: step.skill.clone(),
                    message: format!("quality gate validator {} failed: {message}", gate.validator),
                };
                return self.fail(state, &err, None).map(AttemptOutcome::Stopped);
            }
            Err(InvokeFailure::TimedOut(timeout_ms)) => {
                let err = OrchestrationError::StepExecution {
                    step_index: index,
                    skill: step.skill.clone(),
                    message: format!(
                        "quality gate validator {} timed out after {timeout_ms}ms",
                        gate.validator
                    ),
                };
                return self.fail(state, &err, None).map(AttemptOutcome::Stopped);
            }
        };

        let mut evidence = outputs.clone();
        evidence.extend(report);
        let result = check_gate(
            &gate.criteria,
            &evidence,
            gate.on_fail,
            attempt,
            gate.max_iterations,
        );
        self.log.record(
            state.id.as_str(),
            EventType::GateCheck,
            json!({
                "state_id": state.id,
                "step_index": index,
                "skill": step.skill,
                "validator": gate.validator,
                "result": result,
            }),
        )?;

        match result.action {
            GateAction::Continue => Ok(AttemptOutcome::Accepted(outputs, Some(result))),
            GateAction::Warn => {
                warn!(state_id = %state.id, step_index = index, skill = %step.skill, failed = ?result.failed_criteria, "quality gate failed; continuing");
                Ok(AttemptOutcome::Accepted(outputs, Some(result)))
            }
            GateAction::Retry => {
                info!(state_id = %state.id, step_index = index, skill = %step.skill, attempt, "quality gate failed; retrying");
                Ok(AttemptOutcome::Retry)
            }
            GateAction::Block => {
                let err = OrchestrationError::StepExecution {
                    step_index: index,
                    skill: step.skill.clone(),
                    message: format!(
                        "quality gate failed after {attempt} attempt(s): {}",
                        result
                            .failed_criteria
                            .iter()
                            .chain(result.errors.iter())
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                };
                self.fail(state, &err, Some(result))
                    .map(AttemptOutcome::Stopped)
            }
        }
    }

    /// Drive `step` until the run completes, fails or blocks. A pending run is
    /// started first; a blocked run is moved back to running.
    ///
    /// # Errors
    /// Returns an error for terminal runs or persistence failures.
    pub async fn run(&self, state: &mut WorkflowState, cancel: &CancellationToken) -> Result<()> {
        match state.status {
            WorkflowStatus::Pending => self.start(state)?,
            WorkflowStatus::Blocked => {
                state.status = WorkflowStatus::Running;
                state.error = None;
                self.persist(state)?;
                info!(state_id = %state.id, step_index = state.current_step, "workflow unblocked");
            }
            WorkflowStatus::Running => {}
            WorkflowStatus::Completed | WorkflowStatus::Failed => {
                return Err(invalid_state(state, "run"));
            }
        }
        while state.status == WorkflowStatus::Running {
            self.step(state, cancel).await?;
        }
        Ok(())
    }

    /// Prepare, start and run a workflow to its first stopping point.
    ///
    /// # Errors
    /// Returns an error for unknown workflows or persistence failures.
    pub async fn execute(
        &self,
        workflow_id: &str,
        overrides: StateMap,
        cancel: &CancellationToken,
    ) -> Result<WorkflowState> {
        let mut state = self.prepare(workflow_id, overrides)?;
        self.start(&mut state)?;
        if state.status == WorkflowStatus::Running {
            self.run(&mut state, cancel).await?;
        }
        Ok(state)
    }

    /// Load a persisted run for continuation. Never mutates the stored run.
    ///
    /// # Errors
    /// `NotFound` for unknown ids; `InvalidState` for completed or failed runs
    /// and for runs whose definition changed since they started.
    pub fn resume(&self, state_id: &StateId) -> Result<WorkflowState> {
        let state = self
            .store
            .load_workflow_state(state_id)?
            .ok_or_else(|| OrchestrationError::NotFound(format!("workflow state {state_id}")))?;
        if state.status.is_terminal() {
            return Err(OrchestrationError::InvalidState(format!(
                "workflow state {state_id} is {}; start a new run instead",
                state.status.as_str()
            ))
            .into());
        }
        let current_hash = self.registry.definition_hash(&state.workflow_id)?;
        if current_hash != state.definition_hash {
            return Err(OrchestrationError::InvalidState(format!(
                "workflow {} changed since {state_id} started",
                state.workflow_id
            ))
            .into());
        }
        Ok(state)
    }

    /// Mark a non-terminal run as failed with reason `cancelled`.
    ///
    /// # Errors
    /// `NotFound` for unknown ids, `InvalidState` for terminal runs.
    pub fn cancel(&self, state_id: &StateId) -> Result<WorkflowState> {
        let mut state = self
            .store
            .load_workflow_state(state_id)?
            .ok_or_else(|| OrchestrationError::NotFound(format!("workflow state {state_id}")))?;
        if state.status.is_terminal() {
            return Err(invalid_state(&state, "cancel"));
        }
        let mut record = FailureRecord::from_error(&OrchestrationError::Cancelled);
        record.step_index = Some(state.current_step);
        state.status = WorkflowStatus::Failed;
        state.error = Some(record);
        self.persist(&mut state)?;
        info!(state_id = %state.id, "workflow cancelled");
        self.log.record(
            state.id.as_str(),
            EventType::WorkflowCancel,
            json!({"state_id": state.id, "workflow_id": state.workflow_id, "current_step": state.current_step}),
        )?;
        Ok(state)
    }

    /// Skill errors and timeouts are only retried under a `retry` gate.
    fn retry_or_fail(
        &self,
        state: &mut WorkflowState,
        err: &OrchestrationError,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<AttemptOutcome> {
        if attempt < max_attempts {
            warn!(state_id = %state.id, attempt, error = %err, "step attempt failed; retrying");
            return Ok(AttemptOutcome::Retry);
        }
        self.fail(state, err, None).map(AttemptOutcome::Stopped)
    }

    fn skip(
        &self,
        state: &mut WorkflowState,
        definition: &WorkflowDefinition,
        index: usize,
        step: &WorkflowStep,
    ) -> Result<StepOutcome> {
        state.skipped_steps.push(index);
        state.current_step = index + 1;
        self.persist(state)?;
        debug!(state_id = %state.id, step_index = index, skill = %step.skill, "step skipped");
        self.log.record(
            state.id.as_str(),
            EventType::WorkflowStep,
            json!({
                "state_id": state.id,
                "step_index": index,
                "skill": step.skill,
                "skipped": true,
            }),
        )?;
        if state.current_step >= definition.steps.len() {
            self.complete(state, definition)?;
            return Ok(StepOutcome::Completed);
        }
        Ok(StepOutcome::Skipped)
    }

    #[allow(clippy::too_many_arguments)]
    fn accept(
        &self,
        state: &mut WorkflowState,
        definition: &WorkflowDefinition,
        index: usize,
        step: &WorkflowStep,
        outputs: StateMap,
        attempts: u32,
        gate_result: Option<GateResult>,
    ) -> Result<StepOutcome> {
        state.state_data.extend(outputs.clone());
        state.history.push(StepHistoryEntry {
            step_index: index,
            skill: step.skill.clone(),
            outputs: outputs.clone(),
            attempts,
            gate_result,
            completed_at: now_utc(),
        });
        state.current_step = index + 1;

        if let (Some(contracts), Some(next)) = (self.contracts, definition.steps.get(index + 1)) {
            let validation = contracts.validate(&step.skill, &next.skill, &Value::Object(outputs.clone()));
            if !validation.valid {
                warn!(state_id = %state.id, from = %step.skill, to = %next.skill, missing = ?validation.missing_fields, "handoff contract not satisfied");
            }
            self.log.record(
                state.id.as_str(),
                EventType::ContractCheck,
                json!({
                    "state_id": state.id,
                    "from": step.skill,
                    "to": next.skill,
                    "validation": validation,
                }),
            )?;
        }

        self.persist(state)?;
        info!(state_id = %state.id, step_index = index, skill = %step.skill, attempts, "step completed");
        self.log.record(
            state.id.as_str(),
            EventType::WorkflowStep,
            json!({
                "state_id": state.id,
                "step_index": index,
                "skill": step.skill,
                "outputs": outputs,
                "attempts": attempts,
            }),
        )?;

        if state.current_step >= definition.steps.len() {
            self.complete(state, definition)?;
            return Ok(StepOutcome::Completed);
        }
        Ok(StepOutcome::Advanced)
    }

    fn complete(&self, state: &mut WorkflowState, definition: &WorkflowDefinition) -> Result<()> {
        let final_outputs = match &definition.final_outputs {
            Some(keys) => project(&state.state_data, keys),
            None => state.state_data.clone(),
        };
        state.status = WorkflowStatus::Completed;
        state.final_outputs = Some(final_outputs.clone());
        state.completed_at = Some(now_utc());
        self.persist(state)?;
        info!(state_id = %state.id, workflow_id = %state.workflow_id, "workflow completed");
        self.log.record(
            state.id.as_str(),
            EventType::WorkflowComplete,
            json!({
                "state_id": state.id,
                "workflow_id": state.workflow_id,
                "final_outputs": final_outputs,
            }),
        )?;
        Ok(())
    }

    fn block(&self, state: &mut WorkflowState, index: usize, skill: &str) -> Result<StepOutcome> {
        state.status = WorkflowStatus::Blocked;
        state.error = Some(FailureRecord {
            kind: FailureKind::SkillUnavailable,
            step_index: Some(index),
            skill: Some(skill.to_string()),
            message: format!("no action available for skill {skill}"),
            missing_inputs: Vec::new(),
            timeout_ms: None,
            gate_result: None,
        });
        self.persist(state)?;
        warn!(state_id = %state.id, step_index = index, skill, "workflow blocked on unavailable skill");
        self.log.record(
            state.id.as_str(),
            EventType::WorkflowBlocked,
            json!({"state_id": state.id, "step_index": index, "skill": skill}),
        )?;
        Ok(StepOutcome::Blocked)
    }

    fn fail_cancelled(&self, state: &mut WorkflowState, index: Option<usize>) -> Result<StepOutcome> {
        let mut record = FailureRecord::from_error(&OrchestrationError::Cancelled);
        record.step_index = index;
        self.fail_with(state, record)
    }

    fn fail(
        &self,
        state: &mut WorkflowState,
        err: &OrchestrationError,
        gate_result: Option<GateResult>,
    ) -> Result<StepOutcome> {
        let mut record = FailureRecord::from_error(err);
        if gate_result.is_some() {
            record.kind = FailureKind::GateBlocked;
            record.gate_result = gate_result;
        }
        self.fail_with(state, record)
    }

    fn fail_with(&self, state: &mut WorkflowState, record: FailureRecord) -> Result<StepOutcome> {
        warn!(state_id = %state.id, step_index = ?record.step_index, kind = ?record.kind, error = %record.message, "workflow failed");
        let data = json!({
            "state_id": state.id,
            "workflow_id": state.workflow_id,
            "error": record,
        });
        state.status = WorkflowStatus::Failed;
        state.error = Some(record);
        self.persist(state)?;
        let event_type = if state
            .error
            .as_ref()
            .is_some_and(|record| record.kind == FailureKind::Cancelled)
        {
            EventType::WorkflowCancel
        } else {
            EventType::WorkflowError
        };
        self.log.record(state.id.as_str(), event_type, data)?;
        Ok(StepOutcome::Failed)
    }

    fn persist(&self, state: &mut WorkflowState) -> Result<()> {
        state.updated_at = now_utc();
        state.revision = self.store.save_workflow_state(state)?;
        Ok(())
    }
}

async fn invoke_bounded(
    action: &dyn SkillAction,
    inputs: &StateMap,
    ctx: &SkillContext,
    timeout_ms: Option<u64>,
    cancel: &CancellationToken,
) -> Result<StateMap, InvokeFailure> {
    let call = async {
        let invocation = action.invoke(inputs, ctx);
        let result = match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), invocation).await {
                Ok(result) => result,
                Err(_) => return Err(InvokeFailure::TimedOut(ms)),
            },
            None => invocation.await,
        };
        result.map_err(|err| InvokeFailure::Failed(format!("{err:#}")))
    };
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(InvokeFailure::Cancelled),
        result = call => result,
    }
}

fn invalid_state(state: &WorkflowState, operation: &str) -> anyhow::Error {
    OrchestrationError::InvalidState(format!(
        "cannot {operation} workflow state {} while {}",
        state.id,
        state.status.as_str()
    ))
    .into()
}
