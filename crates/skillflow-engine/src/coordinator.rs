use anyhow::Result;
use serde_json::{json, Value};
use skillflow_contracts::ContractValidator;
use skillflow_domain::{
    now_utc, ActiveTeam, CommunicationPattern, ContractValidation, OrchestrationError, StateId,
    StateMap, TeamMessage, TeamStatus,
};
use skillflow_events::{EventSink, EventType};
use skillflow_registry::TeamRegistry;
use skillflow_store_core::StateStore;
use tracing::{info, warn};

use crate::event_log::EventLog;

/// An accepted team message and the handoff check that ran against it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Delivery {
    pub message: TeamMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract: Option<ContractValidation>,
}

pub struct TeamCoordinator<'a> {
    teams: &'a TeamRegistry,
    store: &'a dyn StateStore,
    log: EventLog<'a>,
    contracts: Option<&'a ContractValidator>,
}

impl<'a> TeamCoordinator<'a> {
    #[must_use]
    pub fn new(
        teams: &'a TeamRegistry,
        store: &'a dyn StateStore,
        events: &'a dyn EventSink,
    ) -> Self {
        Self {
            teams,
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

    /// # Errors
    /// `NotFound` for unknown teams, or a persistence error.
    pub fn activate(&self, team_id: &str, initial_state: StateMap) -> Result<ActiveTeam> {
        let team = self.teams.get(team_id)?;
        let now = now_utc();
        let mut active = ActiveTeam {
            id: StateId::for_team(team_id),
            team_id: team.id.clone(),
            pattern: team.pattern,
            current_lead: team.lead.clone(),
            members: team.members.clone(),
            state_data: initial_state,
            communication_log: Vec::new(),
            status: TeamStatus::Active,
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        self.persist(&mut active)?;
        info!(state_id = %active.id, team_id, pattern = team.pattern.as_str(), "team activated");
        self.log.record(
            active.id.as_str(),
            EventType::TeamActivate,
            json!({
                "state_id": active.id,
                "team_id": active.team_id,
                "lead": active.current_lead,
                "members": active.members,
                "pattern": active.pattern,
            }),
        )?;
        Ok(active)
    }

    /// Route a message between members under the team's pattern.
    ///
    /// Object payloads are merged into the team's state map.
    ///
    /// # Errors
    /// `Routing` when the pattern forbids the message (nothing is recorded),
    /// `InvalidState` when the team is no longer active, or a persistence error.
    pub fn send_message(
        &self,
        team: &mut ActiveTeam,
        from: &str,
        to: &str,
        payload: Value,
    ) -> Result<Delivery> {
        ensure_active(team)?;
        check_route(team, from, to)?;

        let contract = self
            .contracts
            .filter(|contracts| contracts.contract_for(from, to).is_some())
            .map(|contracts| contracts.validate(from, to, &payload));

        let message = TeamMessage {
            seq: team.communication_log.len(),
            from: from.to_string(),
            to: to.to_string(),
            payload,
            sent_at: now_utc(),
        };
        let mut next = team.clone();
        if let Value::Object(fields) = &message.payload {
            next.state_data
                .extend(fields.iter().map(|(key, value)| (key.clone(), value.clone())));
        }
        next.communication_log.push(message.clone());
        self.commit(team, next)?;

        if let Some(validation) = &contract {
            if !validation.valid {
                warn!(state_id = %team.id, from, to, missing = ?validation.missing_fields, "team handoff contract not satisfied");
            }
            self.log.record(
                team.id.as_str(),
                EventType::ContractCheck,
                json!({"state_id": team.id, "from": from, "to": to, "validation": validation}),
            )?;
        }
        self.log.record(
            team.id.as_str(),
            EventType::TeamMessage,
            json!({"state_id": team.id, "message": message}),
        )?;
        Ok(Delivery { message, contract })
    }

    /// Hand leadership to another member.
    ///
    /// # Errors
    /// `Routing` for patterns with a fixed lead or non-member targets.
    pub fn delegate(&self, team: &mut ActiveTeam, new_lead: &str) -> Result<()> {
        ensure_active(team)?;
        if !team.pattern.allows_delegation() {
            return Err(OrchestrationError::Routing(format!(
                "{} teams keep a fixed lead",
                team.pattern.as_str()
            ))
            .into());
        }
        if !is_member(team, new_lead) {
            return Err(OrchestrationError::Routing(format!(
                "{new_lead} is not a member of {}",
                team.team_id
            ))
            .into());
        }
        let mut next = team.clone();
        let previous = std::mem::replace(&mut next.current_lead, new_lead.to_string());
        self.commit(team, next)?;
        info!(state_id = %team.id, from = %previous, to = new_lead, "team lead delegated");
        Ok(())
    }

    /// # Errors
    /// `InvalidState` when the team is not active, or a persistence error.
    pub fn stop(&self, team: &mut ActiveTeam) -> Result<()> {
        self.finish(team, TeamStatus::Stopped)
    }

    /// # Errors
    /// `InvalidState` when the team is not active, or a persistence error.
    pub fn complete(&self, team: &mut ActiveTeam) -> Result<()> {
        self.finish(team, TeamStatus::Completed)
    }

    /// # Errors
    /// `NotFound` for unknown ids.
    pub fn load(&self, id: &StateId) -> Result<ActiveTeam> {
        Ok(self
            .store
            .load_team_state(id)?
            .ok_or_else(|| OrchestrationError::NotFound(format!("team state {id}")))?)
    }

    fn finish(&self, team: &mut ActiveTeam, status: TeamStatus) -> Result<()> {
        ensure_active(team)?;
        let mut next = team.clone();
        next.status = status;
        self.commit(team, next)?;
        info!(state_id = %team.id, status = status.as_str(), "team finished");
        Ok(())
    }

    fn persist(&self, team: &mut ActiveTeam) -> Result<()> {
        team.updated_at = now_utc();
        team.revision = self.store.save_team_state(team)?;
        Ok(())
    }

    /// Save `next` and only then replace `team`; a rejected save leaves `team` untouched.
    fn commit(&self, team: &mut ActiveTeam, mut next: ActiveTeam) -> Result<()> {
        self.persist(&mut next)?;
        *team = next;
        Ok(())
    }
}

fn ensure_active(team: &ActiveTeam) -> Result<()> {
    if team.status == TeamStatus::Active {
        return Ok(());
    }
    Err(OrchestrationError::InvalidState(format!(
        "team state {} is {}",
        team.id,
        team.status.as_str()
    ))
    .into())
}

fn is_member(team: &ActiveTeam, skill: &str) -> bool {
    team.members.iter().any(|member| member == skill)
}

fn position(team: &ActiveTeam, skill: &str) -> Option<usize> {
    team.members.iter().position(|member| member == skill)
}

/// Topology rules; advisory patterns only require membership.
fn check_route(team: &ActiveTeam, from: &str, to: &str) -> Result<(), OrchestrationError> {
    let (Some(from_idx), Some(to_idx)) = (position(team, from), position(team, to)) else {
        return Err(OrchestrationError::Routing(format!(
            "{from} -> {to}: both ends must be members of {}",
            team.team_id
        )));
    };

    match team.pattern {
        CommunicationPattern::HubSpoke => {
            if from != team.current_lead && to != team.current_lead {
                return Err(OrchestrationError::Routing(format!(
                    "{from} -> {to}: hub_spoke messages must go through lead {}",
                    team.current_lead
                )));
            }
        }
        CommunicationPattern::Pipeline => {
            if to_idx != from_idx + 1 {
                return Err(OrchestrationError::Routing(format!(
                    "{from} -> {to}: pipeline messages must go to the next stage"
                )));
            }
            let furthest = team
                .communication_log
                .iter()
                .filter_map(|message| position(team, &message.to))
                .max();
            if furthest.is_some_and(|stage| to_idx < stage) {
                return Err(OrchestrationError::Routing(format!(
                    "{from} -> {to}: pipeline already advanced past this stage"
                )));
            }
        }
        CommunicationPattern::Sequential
        | CommunicationPattern::Parallel
        | CommunicationPattern::Conditional
        | CommunicationPattern::Supervised => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use skillflow_contracts::ContractValidator;
    use skillflow_domain::{
        CollaborationEdge, CommunicationPattern, OrchestrationError, SkillCollaboration,
        SkillTeam, StateMap, TeamStatus,
    };
    use skillflow_events::{EventQueue, EventType};
    use skillflow_registry::TeamRegistry;
    use skillflow_store_core::StateStore;
    use skillflow_store_sqlite::SqliteStateStore;

    use super::TeamCoordinator;

    fn registry() -> TeamRegistry {
        let mut registry = TeamRegistry::new();
        for (id, pattern) in [
            ("hub", CommunicationPattern::HubSpoke),
            ("pipe", CommunicationPattern::Pipeline),
            ("crew", CommunicationPattern::Parallel),
        ] {
            let registered = registry.register(SkillTeam {
                id: id.to_string(),
                name: id.to_string(),
                description: String::new(),
                members: vec!["lead".to_string(), "a".to_string(), "b".to_string()],
                lead: "lead".to_string(),
                pattern,
                triggers: Vec::new(),
            });
            assert!(registered.is_ok());
        }
        registry
    }

    fn store() -> SqliteStateStore {
        let store = SqliteStateStore::open_in_memory().unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        store
    }

    fn is_routing(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<OrchestrationError>(),
            Some(OrchestrationError::Routing(_))
        )
    }

    #[test]
    fn hub_spoke_rejects_spoke_to_spoke() {
        let (registry, store, queue) = (registry(), store(), EventQueue::new());
        let coordinator = TeamCoordinator::new(&registry, &store, &queue);
        let mut team = coordinator
            .activate("hub", StateMap::new())
            .unwrap_or_else(|err| panic!("activate: {err:#}"));
        assert_eq!(team.current_lead, "lead");

        let rejected = coordinator.send_message(&mut team, "a", "b", json!({"x": 1}));
        assert!(rejected.as_ref().is_err_and(is_routing));
        assert!(team.communication_log.is_empty());

        assert!(coordinator
            .send_message(&mut team, "a", "lead", json!({"x": 1}))
            .is_ok());
        assert!(coordinator
            .send_message(&mut team, "lead", "b", json!({"y": 2}))
            .is_ok());
        assert_eq!(team.communication_log.len(), 2);
        assert_eq!(team.state_data.get("y"), Some(&json!(2)));

        let reloaded = coordinator
            .load(&team.id)
            .unwrap_or_else(|err| panic!("load: {err:#}"));
        assert_eq!(reloaded.communication_log.len(), 2);
        assert_eq!(
            queue.types(),
            vec![
                EventType::TeamActivate,
                EventType::TeamMessage,
                EventType::TeamMessage
            ]
        );
    }

    #[test]
    fn pipeline_moves_forward_one_stage_at_a_time() {
        let (registry, store, queue) = (registry(), store(), EventQueue::new());
        let coordinator = TeamCoordinator::new(&registry, &store, &queue);
        let mut team = coordinator
            .activate("pipe", StateMap::new())
            .unwrap_or_else(|err| panic!("activate: {err:#}"));

        assert!(coordinator
            .send_message(&mut team, "lead", "b", json!({}))
            .as_ref()
            .is_err_and(is_routing));
        assert!(coordinator.send_message(&mut team, "lead", "a", json!({})).is_ok());
        assert!(coordinator.send_message(&mut team, "a", "b", json!({})).is_ok());
        assert!(coordinator
            .send_message(&mut team, "lead", "a", json!({}))
            .as_ref()
            .is_err_and(is_routing));
        assert!(coordinator
            .send_message(&mut team, "b", "a", json!({}))
            .as_ref()
            .is_err_and(is_routing));
        assert_eq!(team.communication_log.len(), 2);
    }

    #[test]
    fn advisory_patterns_only_check_membership_and_allow_delegation() {
        let (registry, store, queue) = (registry(), store(), EventQueue::new());
        let coordinator = TeamCoordinator::new(&registry, &store, &queue);
        let mut team = coordinator
            .activate("crew", StateMap::new())
            .unwrap_or_else(|err| panic!("activate: {err:#}"));

        assert!(coordinator.send_message(&mut team, "b", "a", json!(null)).is_ok());
        assert!(coordinator
            .send_message(&mut team, "b", "outsider", json!(null))
            .as_ref()
            .is_err_and(is_routing));

        assert!(coordinator.delegate(&mut team, "a").is_ok());
        assert_eq!(team.current_lead, "a");
        assert!(coordinator.delegate(&mut team, "outsider").is_err());

        assert!(coordinator.stop(&mut team).is_ok());
        assert_eq!(team.status, TeamStatus::Stopped);
        assert!(coordinator.send_message(&mut team, "a", "b", json!(null)).is_err());
        assert_eq!(
            store
                .load_team_state(&team.id)
                .ok()
                .flatten()
                .map(|stored| stored.status),
            Some(TeamStatus::Stopped)
        );
    }

    #[test]
    fn fixed_lead_patterns_refuse_delegation() {
        let (registry, store, queue) = (registry(), store(), EventQueue::new());
        let coordinator = TeamCoordinator::new(&registry, &store, &queue);
        for team_id in ["hub", "pipe"] {
            let mut team = coordinator
                .activate(team_id, StateMap::new())
                .unwrap_or_else(|err| panic!("activate: {err:#}"));
            assert!(coordinator
                .delegate(&mut team, "a")
                .as_ref()
                .is_err_and(is_routing));
            assert_eq!(team.current_lead, "lead");
        }
    }

    #[test]
    fn stale_team_copies_are_left_untouched_on_conflict() {
        let (registry, store, queue) = (registry(), store(), EventQueue::new());
        let coordinator = TeamCoordinator::new(&registry, &store, &queue);
        let mut team = coordinator
            .activate("crew", StateMap::new())
            .unwrap_or_else(|err| panic!("activate: {err:#}"));
        let mut stale = team.clone();

        assert!(coordinator
            .send_message(&mut team, "a", "b", json!({"winner": "fresh"}))
            .is_ok());

        let rejected = coordinator.send_message(&mut stale, "b", "a", json!({"winner": "stale"}));
        assert!(rejected.as_ref().is_err_and(|err| matches!(
            err.downcast_ref::<OrchestrationError>(),
            Some(OrchestrationError::Conflict(_))
        )));
        assert!(stale.communication_log.is_empty());
        assert!(stale.state_data.is_empty());

        let revision = stale.revision;
        assert!(coordinator.delegate(&mut stale, "b").is_err());
        assert_eq!(stale.current_lead, "lead");
        assert!(coordinator.stop(&mut stale).is_err());
        assert_eq!(stale.status, TeamStatus::Active);
        assert_eq!(stale.revision, revision);

        let stored = coordinator
            .load(&team.id)
            .unwrap_or_else(|err| panic!("load: {err:#}"));
        assert_eq!(stored.state_data.get("winner"), Some(&json!("fresh")));
        assert_eq!(stored.communication_log.len(), 1);
    }

    #[test]
    fn declared_contracts_are_checked_on_delivery() {
        let (registry, store, queue) = (registry(), store(), EventQueue::new());
        let contracts = ContractValidator::new(&[SkillCollaboration {
            skill: "lead".to_string(),
            receives_from: vec![CollaborationEdge {
                skill: "a".to_string(),
                fields: vec!["report".to_string()],
            }],
            hands_to: Vec::new(),
        }]);
        let coordinator = TeamCoordinator::new(&registry, &store, &queue).with_contracts(&contracts);
        let mut team = coordinator
            .activate("hub", StateMap::new())
            .unwrap_or_else(|err| panic!("activate: {err:#}"));

        let delivery = coordinator
            .send_message(&mut team, "a", "lead", json!({"draft": true}))
            .unwrap_or_else(|err| panic!("send: {err:#}"));
        let contract = delivery.contract.unwrap_or_else(|| panic!("contract expected"));
        assert!(!contract.valid);
        assert_eq!(contract.missing_fields, vec!["report".to_string()]);
        assert!(queue.types().contains(&EventType::ContractCheck));
    }
}
