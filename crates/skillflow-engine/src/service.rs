//! Request/response facade over the registries, executor and coordinator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skillflow_contracts::ContractValidator;
use skillflow_domain::{
    ActiveTeam, CommunicationPattern, ContractValidation, DateTimeUtc, FailureRecord,
    GateFailPolicy, GateResult, OrchestrationError, SkillTeam, StateContract, StateId, StateMap,
    TeamStatus, WorkflowDefinition, WorkflowMode, WorkflowState, WorkflowStatus,
};
use skillflow_events::EventSink;
use skillflow_registry::{write_team_yaml, write_workflow_yaml, Catalog, TeamMatch};
use skillflow_store_core::StateStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::coordinator::{Delivery, TeamCoordinator};
use crate::event_log::{verify_chain, ChainReport};
use crate::executor::WorkflowExecutor;
use crate::gate;
use crate::skills::SkillResolver;

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub mode: WorkflowMode,
    pub steps: usize,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct SkillCheck {
    pub skill: String,
    pub action_available: bool,
    pub collaboration_declared: bool,
    pub workflows: Vec<String>,
    pub teams: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ActiveWorkflow {
    pub state_id: StateId,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub current_step: usize,
    pub total_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureRecord>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ActiveTeamSummary {
    pub state_id: StateId,
    pub team_id: String,
    pub pattern: CommunicationPattern,
    pub current_lead: String,
    pub messages: usize,
}

/// Every run that has not completed, plus active teams.
#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct ActiveReport {
    pub workflows: Vec<ActiveWorkflow>,
    pub teams: Vec<ActiveTeamSummary>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct HandoffReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract: Option<StateContract>,
    pub validation: ContractValidation,
}

fn default_attempt() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GateCheckRequest {
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default)]
    pub outputs: StateMap,
    pub on_fail: GateFailPolicy,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(default = "default_attempt")]
    pub max_iterations: u32,
}

pub struct Skillflow<'a> {
    catalog: Catalog,
    contracts: ContractValidator,
    catalog_dir: Option<PathBuf>,
    skills: &'a dyn SkillResolver,
    store: &'a dyn StateStore,
    events: &'a dyn EventSink,
}

impl<'a> Skillflow<'a> {
    #[must_use]
    pub fn new(
        catalog: Catalog,
        skills: &'a dyn SkillResolver,
        store: &'a dyn StateStore,
        events: &'a dyn EventSink,
    ) -> Self {
        let contracts = ContractValidator::new(&catalog.collaborations);
        Self {
            catalog,
            contracts,
            catalog_dir: None,
            skills,
            store,
            events,
        }
    }

    /// Persist created workflows and teams under `dir`.
    #[must_use]
    pub fn with_catalog_dir(mut self, dir: &Path) -> Self {
        self.catalog_dir = Some(dir.to_path_buf());
        self
    }

    fn executor(&self) -> WorkflowExecutor<'_> {
        WorkflowExecutor::new(&self.catalog.workflows, self.skills, self.store, self.events)
            .with_contracts(&self.contracts)
    }

    fn coordinator(&self) -> TeamCoordinator<'_> {
        TeamCoordinator::new(&self.catalog.teams, self.store, self.events)
            .with_contracts(&self.contracts)
    }

    #[must_use]
    pub fn list_workflows(&self) -> Vec<WorkflowSummary> {
        self.catalog
            .workflows
            .list()
            .into_iter()
            .map(|definition| WorkflowSummary {
                id: definition.id.clone(),
                name: definition.name.clone(),
                description: definition.description.clone(),
                mode: definition.mode,
                steps: definition.steps.len(),
                skills: definition.steps.iter().map(|step| step.skill.clone()).collect(),
            })
            .collect()
    }

    #[must_use]
    pub fn list_teams(&self) -> Vec<SkillTeam> {
        self.catalog.teams.list().into_iter().cloned().collect()
    }

    /// Start a run and, when `run` is set, drive it to its first stopping point.
    ///
    /// # Errors
    /// `NotFound` for unknown workflows, or a persistence error. Step failures
    /// are reported on the returned state.
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        overrides: StateMap,
        run: bool,
        cancel: &CancellationToken,
    ) -> Result<WorkflowState> {
        let executor = self.executor();
        let mut state = executor.prepare(workflow_id, overrides)?;
        executor.start(&mut state)?;
        if run && state.status == WorkflowStatus::Running {
            executor.run(&mut state, cancel).await?;
        }
        Ok(state)
    }

    /// Load a run; with `continue_run`, drive it on from `current_step`.
    ///
    /// # Errors
    /// See `WorkflowExecutor::resume`.
    pub async fn resume(
        &self,
        state_id: &StateId,
        continue_run: bool,
        cancel: &CancellationToken,
    ) -> Result<WorkflowState> {
        let executor = self.executor();
        let mut state = executor.resume(state_id)?;
        if continue_run {
            executor.run(&mut state, cancel).await?;
        }
        Ok(state)
    }

    /// # Errors
    /// `NotFound` for unknown ids, `InvalidState` for terminal runs.
    pub fn cancel(&self, state_id: &StateId) -> Result<WorkflowState> {
        self.executor().cancel(state_id)
    }

    /// # Errors
    /// `NotFound` for unknown teams, or a persistence error.
    pub fn start_team(&self, team_id: &str, initial_state: StateMap) -> Result<ActiveTeam> {
        self.coordinator().activate(team_id, initial_state)
    }

    /// # Errors
    /// `NotFound`, `Routing` or `InvalidState` from the coordinator.
    pub fn send_team_message(
        &self,
        state_id: &StateId,
        from: &str,
        to: &str,
        payload: Value,
    ) -> Result<Delivery> {
        let coordinator = self.coordinator();
        let mut team = coordinator.load(state_id)?;
        coordinator.send_message(&mut team, from, to, payload)
    }

    /// # Errors
    /// `NotFound`, `Routing` or `InvalidState` from the coordinator.
    pub fn delegate_team(&self, state_id: &StateId, new_lead: &str) -> Result<ActiveTeam> {
        let coordinator = self.coordinator();
        let mut team = coordinator.load(state_id)?;
        coordinator.delegate(&mut team, new_lead)?;
        Ok(team)
    }

    /// # Errors
    /// `NotFound` for unknown ids, `InvalidState` for finished teams.
    pub fn stop_team(&self, state_id: &StateId) -> Result<ActiveTeam> {
        let coordinator = self.coordinator();
        let mut team = coordinator.load(state_id)?;
        coordinator.stop(&mut team)?;
        Ok(team)
    }

    #[must_use]
    pub fn validate_handoff(&self, from: &str, to: &str, payload: &Value) -> HandoffReport {
        HandoffReport {
            contract: self.contracts.contract_for(from, to),
            validation: self.contracts.validate(from, to, payload),
        }
    }

    #[must_use]
    pub fn find_team(&self, query: &str) -> Vec<TeamMatch> {
        self.catalog.teams.find(query)
    }

    /// Validate and register a team; written to the catalog directory when one is set.
    ///
    /// # Errors
    /// `Definition` for malformed or duplicate teams, or a file write error.
    pub fn create_team(&mut self, team: SkillTeam) -> Result<Option<PathBuf>> {
        skillflow_registry::validate_team(&team)?;
        if self.catalog.teams.contains(&team.id) {
            return Err(
                OrchestrationError::Definition(format!("duplicate team id: {}", team.id)).into(),
            );
        }
        let written = match &self.catalog_dir {
            Some(dir) => Some(write_team_yaml(dir, &team)?),
            None => None,
        };
        let team_id = team.id.clone();
        self.catalog.teams.register(team)?;
        info!(team_id = %team_id, written = ?written, "team created");
        Ok(written)
    }

    /// Validate and register a workflow; written to the catalog directory when one is set.
    ///
    /// # Errors
    /// `Definition` for malformed or duplicate workflows, or a file write error.
    pub fn create_workflow(&mut self, definition: WorkflowDefinition) -> Result<Option<PathBuf>> {
        skillflow_registry::validate_workflow(&definition)?;
        if self.catalog.workflows.contains(&definition.id) {
            return Err(OrchestrationError::Definition(format!(
                "duplicate workflow id: {}",
                definition.id
            ))
            .into());
        }
        let written = match &self.catalog_dir {
            Some(dir) => Some(write_workflow_yaml(dir, &definition)?),
            None => None,
        };
        let workflow_id = definition.id.clone();
        self.catalog.workflows.register(definition)?;
        info!(workflow_id = %workflow_id, written = ?written, "workflow created");
        Ok(written)
    }

    /// Availability report per skill; an empty list checks every catalog skill.
    #[must_use]
    pub fn check_skills(&self, skills: &[String]) -> Vec<SkillCheck> {
        let names: Vec<String> = if skills.is_empty() {
            self.catalog.referenced_skills().into_iter().collect()
        } else {
            skills.to_vec()
        };
        names
            .into_iter()
            .map(|skill| {
                let workflows = self
                    .catalog
                    .workflows
                    .list()
                    .into_iter()
                    .filter(|definition| definition.referenced_skills().contains(skill.as_str()))
                    .map(|definition| definition.id.clone())
                    .collect();
                let teams = self
                    .catalog
                    .teams
                    .list()
                    .into_iter()
                    .filter(|team| team.members.contains(&skill))
                    .map(|team| team.id.clone())
                    .collect();
                SkillCheck {
                    action_available: self.skills.resolve(&skill).is_some(),
                    collaboration_declared: self.contracts.has_descriptor(&skill),
                    workflows,
                    teams,
                    skill,
                }
            })
            .collect()
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_active(&self) -> Result<ActiveReport> {
        let workflows = self
            .store
            .list_workflow_states()?
            .into_iter()
            .filter(|state| state.status != WorkflowStatus::Completed)
            .map(|state| ActiveWorkflow {
                total_steps: self
                    .catalog
                    .workflows
                    .get(&state.workflow_id)
                    .map_or(0, |definition| definition.steps.len()),
                state_id: state.id,
                workflow_id: state.workflow_id,
                status: state.status,
                current_step: state.current_step,
                error: state.error,
                updated_at: state.updated_at,
            })
            .collect();
        let teams = self
            .store
            .list_team_states()?
            .into_iter()
            .filter(|team| team.status == TeamStatus::Active)
            .map(|team| ActiveTeamSummary {
                messages: team.communication_log.len(),
                state_id: team.id,
                team_id: team.team_id,
                pattern: team.pattern,
                current_lead: team.current_lead,
            })
            .collect();
        Ok(ActiveReport { workflows, teams })
    }

    #[must_use]
    pub fn check_gate(&self, request: &GateCheckRequest) -> GateResult {
        gate::check_gate(
            &request.criteria,
            &request.outputs,
            request.on_fail,
            request.attempt.max(1),
            request.max_iterations.max(1),
        )
    }

    /// # Errors
    /// Returns an error when the event log cannot be read or hashed.
    pub fn verify_events(&self, subject_id: &str) -> Result<ChainReport> {
        verify_chain(self.store, subject_id)
            .with_context(|| format!("failed to verify events for {subject_id}"))
    }
}
