#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use skillflow_domain::{
    compute_definition_hash, ensure_non_empty, OrchestrationError, SkillCollaboration, SkillTeam,
    WorkflowDefinition, WorkflowStep,
};
use tracing::debug;

const BUILTIN_WORKFLOWS: [&str; 4] = [
    include_str!("../catalog/workflows/feature-build.yaml"),
    include_str!("../catalog/workflows/bug-fix.yaml"),
    include_str!("../catalog/workflows/security-audit.yaml"),
    include_str!("../catalog/workflows/content-launch.yaml"),
];

const BUILTIN_TEAMS: [&str; 4] = [
    include_str!("../catalog/teams/product-squad.yaml"),
    include_str!("../catalog/teams/delivery-pipeline.yaml"),
    include_str!("../catalog/teams/growth-team.yaml"),
    include_str!("../catalog/teams/review-board.yaml"),
];

const BUILTIN_COLLABORATIONS: &str = include_str!("../catalog/collaborations/builtin.yaml");

/// Registered workflow definitions plus their definition hashes.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    definitions: BTreeMap<String, (WorkflowDefinition, String)>,
}

impl WorkflowRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a definition.
    ///
    /// # Errors
    /// Returns `OrchestrationError::Definition` when the definition is malformed
    /// or its id is already registered.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), OrchestrationError> {
        validate_workflow(&definition)?;
        if self.definitions.contains_key(&definition.id) {
            return Err(OrchestrationError::Definition(format!(
                "duplicate workflow id: {}",
                definition.id
            )));
        }
        let hash = compute_definition_hash(&definition)
            .map_err(|err| OrchestrationError::Definition(err.to_string()))?;
        debug!(workflow_id = %definition.id, %hash, "registered workflow");
        self.definitions
            .insert(definition.id.clone(), (definition, hash));
        Ok(())
    }

    /// # Errors
    /// Returns `OrchestrationError::NotFound` for unknown ids.
    pub fn get(&self, id: &str) -> Result<&WorkflowDefinition, OrchestrationError> {
        self.definitions
            .get(id)
            .map(|(definition, _)| definition)
            .ok_or_else(|| OrchestrationError::NotFound(format!("workflow {id}")))
    }

    /// # Errors
    /// Returns `OrchestrationError::NotFound` for unknown ids.
    pub fn definition_hash(&self, id: &str) -> Result<&str, OrchestrationError> {
        self.definitions
            .get(id)
            .map(|(_, hash)| hash.as_str())
            .ok_or_else(|| OrchestrationError::NotFound(format!("workflow {id}")))
    }

    /// All definitions ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<&WorkflowDefinition> {
        self.definitions
            .values()
            .map(|(definition, _)| definition)
            .collect()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.definitions.contains_key(id)
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct TeamMatch {
    pub team_id: String,
    pub name: String,
    pub score: u32,
    pub matched: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TeamRegistry {
    teams: BTreeMap<String, SkillTeam>,
}

impl TeamRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `OrchestrationError::Definition` when the team is malformed or
    /// its id is already registered.
    pub fn register(&mut self, team: SkillTeam) -> Result<(), OrchestrationError> {
        validate_team(&team)?;
        if self.teams.contains_key(&team.id) {
            return Err(OrchestrationError::Definition(format!(
                "duplicate team id: {}",
                team.id
            )));
        }
        debug!(team_id = %team.id, pattern = team.pattern.as_str(), "registered team");
        self.teams.insert(team.id.clone(), team);
        Ok(())
    }

    /// # Errors
    /// Returns `OrchestrationError::NotFound` for unknown ids.
    pub fn get(&self, id: &str) -> Result<&SkillTeam, OrchestrationError> {
        self.teams
            .get(id)
            .ok_or_else(|| OrchestrationError::NotFound(format!("team {id}")))
    }

    #[must_use]
    pub fn list(&self) -> Vec<&SkillTeam> {
        self.teams.values().collect()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.teams.contains_key(id)
    }

    /// Rank teams against a free-text request.
    ///
    /// Trigger phrases weigh 3, team id or name 2, member skill ids 1.
    #[must_use]
    pub fn find(&self, query: &str) -> Vec<TeamMatch> {
        let query = query.to_lowercase();
        let mut matches: Vec<TeamMatch> = self
            .teams
            .values()
            .filter_map(|team| score_team(team, &query))
            .collect();
        matches.sort_by(|lhs, rhs| {
            rhs.score
                .cmp(&lhs.score)
                .then_with(|| lhs.team_id.cmp(&rhs.team_id))
        });
        matches
    }
}

fn score_team(team: &SkillTeam, query: &str) -> Option<TeamMatch> {
    let mut score = 0;
    let mut matched = Vec::new();
    for trigger in &team.triggers {
        if !trigger.trim().is_empty() && query.contains(&trigger.to_lowercase()) {
            score += 3;
            matched.push(trigger.clone());
        }
    }
    let labels: &[&String] = if team.name.eq_ignore_ascii_case(&team.id) {
        &[&team.id]
    } else {
        &[&team.id, &team.name]
    };
    for &label in labels {
        if query.contains(&label.to_lowercase()) {
            score += 2;
            matched.push(label.clone());
        }
    }
    for member in &team.members {
        if query.contains(&member.to_lowercase()) {
            score += 1;
            matched.push(member.clone());
        }
    }
    (score > 0).then(|| TeamMatch {
        team_id: team.id.clone(),
        name: team.name.clone(),
        score,
        matched,
    })
}

fn definition_error(err: &anyhow::Error) -> OrchestrationError {
    OrchestrationError::Definition(err.to_string())
}

/// Static well-formedness check applied once at registration.
///
/// Every step input must be present in `initial_state` or declared as an
/// output of an earlier step.
///
/// # Errors
/// Returns `OrchestrationError::Definition` describing the first violation.
pub fn validate_workflow(definition: &WorkflowDefinition) -> Result<(), OrchestrationError> {
    ensure_non_empty("workflow id", &definition.id).map_err(|err| definition_error(&err))?;
    ensure_non_empty("workflow name", &definition.name).map_err(|err| definition_error(&err))?;

    let mut available: BTreeSet<&str> = definition
        .initial_state
        .keys()
        .map(String::as_str)
        .collect();
    for (index, step) in definition.steps.iter().enumerate() {
        validate_step(index, step)?;
        let missing: Vec<&str> = step
            .inputs
            .iter()
            .map(String::as_str)
            .filter(|input| !available.contains(input))
            .collect();
        if !missing.is_empty() {
            return Err(OrchestrationError::Definition(format!(
                "workflow {} step {index} ({}) has unsatisfiable inputs: {}",
                definition.id,
                step.skill,
                missing.join(", ")
            )));
        }
        available.extend(step.outputs.iter().map(String::as_str));
    }
    Ok(())
}

fn validate_step(index: usize, step: &WorkflowStep) -> Result<(), OrchestrationError> {
    ensure_non_empty(&format!("step {index} skill"), &step.skill)
        .map_err(|err| definition_error(&err))?;
    if let Some(gate) = &step.gate {
        ensure_non_empty(&format!("step {index} gate validator"), &gate.validator)
            .map_err(|err| definition_error(&err))?;
        if gate.max_iterations < 1 {
            return Err(OrchestrationError::Definition(format!(
                "step {index} gate max_iterations MUST be >= 1"
            )));
        }
    }
    if step.timeout_ms == Some(0) {
        return Err(OrchestrationError::Definition(format!(
            "step {index} timeout_ms MUST be > 0"
        )));
    }
    Ok(())
}

/// # Errors
/// Returns `OrchestrationError::Definition` describing the first violation.
pub fn validate_team(team: &SkillTeam) -> Result<(), OrchestrationError> {
    ensure_non_empty("team id", &team.id).map_err(|err| definition_error(&err))?;
    ensure_non_empty("team name", &team.name).map_err(|err| definition_error(&err))?;
    if team.members.is_empty() {
        return Err(OrchestrationError::Definition(format!(
            "team {} has no members",
            team.id
        )));
    }
    let mut seen = BTreeSet::new();
    for member in &team.members {
        ensure_non_empty("team member", member).map_err(|err| definition_error(&err))?;
        if !seen.insert(member.as_str()) {
            return Err(OrchestrationError::Definition(format!(
                "team {} lists member {member} twice",
                team.id
            )));
        }
    }
    if !seen.contains(team.lead.as_str()) {
        return Err(OrchestrationError::Definition(format!(
            "team {} lead {} is not a member",
            team.id, team.lead
        )));
    }
    Ok(())
}

/// # Errors
/// Returns an error when the YAML does not describe a workflow definition.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition> {
    serde_yaml::from_str(yaml).map_err(|err| anyhow!("invalid workflow YAML structure: {err}"))
}

/// # Errors
/// Returns an error when the YAML does not describe a team.
pub fn parse_team_yaml(yaml: &str) -> Result<SkillTeam> {
    serde_yaml::from_str(yaml).map_err(|err| anyhow!("invalid team YAML structure: {err}"))
}

/// # Errors
/// Returns an error when the YAML is not a list of collaboration descriptors.
pub fn parse_collaborations_yaml(yaml: &str) -> Result<Vec<SkillCollaboration>> {
    serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid collaboration YAML structure: {err}"))
}

/// Everything the engine reads as static configuration.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub workflows: WorkflowRegistry,
    pub teams: TeamRegistry,
    pub collaborations: Vec<SkillCollaboration>,
}

#[derive(Debug, Default)]
struct CatalogSource {
    workflows: Vec<WorkflowDefinition>,
    teams: Vec<SkillTeam>,
    collaborations: Vec<SkillCollaboration>,
}

impl Catalog {
    /// The embedded catalog shipped with the crate.
    ///
    /// # Errors
    /// Returns an error if an embedded definition fails to parse or register.
    pub fn builtin() -> Result<Self> {
        let source = builtin_source()?;
        Self::from_source(source)
    }

    /// Load a catalog directory without the built-ins.
    ///
    /// # Errors
    /// Returns an error when a file cannot be read, parsed, or registered.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        Self::from_source(read_dir_source(dir)?)
    }

    /// Built-ins overlaid by a catalog directory; directory entries replace
    /// built-ins with the same id, collaborations replace per skill.
    ///
    /// # Errors
    /// Returns an error when a file cannot be read, parsed, or registered.
    pub fn with_dir(dir: &Path) -> Result<Self> {
        let overlay = read_dir_source(dir)?;
        let base = builtin_source()?;

        let workflow_ids: BTreeSet<String> =
            overlay.workflows.iter().map(|def| def.id.clone()).collect();
        let team_ids: BTreeSet<String> = overlay.teams.iter().map(|team| team.id.clone()).collect();
        let collab_skills: BTreeSet<String> = overlay
            .collaborations
            .iter()
            .map(|collab| collab.skill.clone())
            .collect();

        let mut merged = CatalogSource::default();
        merged.workflows.extend(
            base.workflows
                .into_iter()
                .filter(|def| !workflow_ids.contains(&def.id)),
        );
        merged.workflows.extend(overlay.workflows);
        merged.teams.extend(
            base.teams
                .into_iter()
                .filter(|team| !team_ids.contains(&team.id)),
        );
        merged.teams.extend(overlay.teams);
        merged.collaborations.extend(
            base.collaborations
                .into_iter()
                .filter(|collab| !collab_skills.contains(&collab.skill)),
        );
        merged.collaborations.extend(overlay.collaborations);
        Self::from_source(merged)
    }

    fn from_source(source: CatalogSource) -> Result<Self> {
        let mut catalog = Self::default();
        for definition in source.workflows {
            let id = definition.id.clone();
            catalog
                .workflows
                .register(definition)
                .with_context(|| format!("failed to register workflow {id}"))?;
        }
        for team in source.teams {
            let id = team.id.clone();
            catalog
                .teams
                .register(team)
                .with_context(|| format!("failed to register team {id}"))?;
        }
        catalog.collaborations = source.collaborations;
        Ok(catalog)
    }

    #[must_use]
    pub fn collaboration(&self, skill: &str) -> Option<&SkillCollaboration> {
        self.collaborations
            .iter()
            .find(|collab| collab.skill == skill)
    }

    /// Every skill named by a workflow step, gate validator, or team member.
    #[must_use]
    pub fn referenced_skills(&self) -> BTreeSet<String> {
        let mut skills: BTreeSet<String> = BTreeSet::new();
        for definition in self.workflows.list() {
            skills.extend(definition.referenced_skills().into_iter().map(str::to_string));
        }
        for team in self.teams.list() {
            skills.extend(team.members.iter().cloned());
        }
        skills
    }
}

fn builtin_source() -> Result<CatalogSource> {
    let mut source = CatalogSource::default();
    for yaml in BUILTIN_WORKFLOWS {
        source
            .workflows
            .push(parse_workflow_yaml(yaml).context("embedded workflow")?);
    }
    for yaml in BUILTIN_TEAMS {
        source
            .teams
            .push(parse_team_yaml(yaml).context("embedded team")?);
    }
    source.collaborations =
        parse_collaborations_yaml(BUILTIN_COLLABORATIONS).context("embedded collaborations")?;
    Ok(source)
}

fn read_dir_source(dir: &Path) -> Result<CatalogSource> {
    let mut source = CatalogSource::default();
    for path in yaml_files(&dir.join("workflows"))? {
        let content = read_file(&path)?;
        source.workflows.push(
            parse_workflow_yaml(&content).with_context(|| format!("in {}", path.display()))?,
        );
    }
    for path in yaml_files(&dir.join("teams"))? {
        let content = read_file(&path)?;
        source
            .teams
            .push(parse_team_yaml(&content).with_context(|| format!("in {}", path.display()))?);
    }
    for path in yaml_files(&dir.join("collaborations"))? {
        let content = read_file(&path)?;
        source.collaborations.extend(
            parse_collaborations_yaml(&content)
                .with_context(|| format!("in {}", path.display()))?,
        );
    }
    Ok(source)
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Sorted `*.yaml`/`*.yml` files in `dir`; a missing directory is empty.
fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if is_yaml && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Write a workflow definition to `<dir>/workflows/<id>.yaml`.
///
/// # Errors
/// Returns an error when serialization or the file write fails.
pub fn write_workflow_yaml(dir: &Path, definition: &WorkflowDefinition) -> Result<PathBuf> {
    let yaml = serde_yaml::to_string(definition)?;
    write_entry(&dir.join("workflows"), &definition.id, &yaml)
}

/// Write a team definition to `<dir>/teams/<id>.yaml`.
///
/// # Errors
/// Returns an error when serialization or the file write fails.
pub fn write_team_yaml(dir: &Path, team: &SkillTeam) -> Result<PathBuf> {
    let yaml = serde_yaml::to_string(team)?;
    write_entry(&dir.join("teams"), &team.id, &yaml)
}

fn write_entry(dir: &Path, id: &str, yaml: &str) -> Result<PathBuf> {
    if id.contains(['/', '\\']) || id.starts_with('.') {
        return Err(anyhow!("id {id} is not usable as a file name"));
    }
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("{id}.yaml"));
    fs::write(&path, yaml).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use proptest::prelude::*;
    use serde_json::json;
    use skillflow_domain::{
        CommunicationPattern, OrchestrationError, SkillTeam, StateMap, WorkflowDefinition,
        WorkflowMode, WorkflowStep,
    };

    use super::{
        parse_workflow_yaml, validate_workflow, write_workflow_yaml, Catalog, TeamRegistry,
        WorkflowRegistry,
    };

    fn step(skill: &str, inputs: &[&str], outputs: &[&str]) -> WorkflowStep {
        WorkflowStep {
            skill: skill.to_string(),
            description: None,
            inputs: inputs.iter().map(ToString::to_string).collect(),
            outputs: outputs.iter().map(ToString::to_string).collect(),
            condition: None,
            gate: None,
            timeout_ms: None,
        }
    }

    fn definition(id: &str, initial: &[&str], steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        let mut initial_state = StateMap::new();
        for key in initial {
            initial_state.insert((*key).to_string(), json!(true));
        }
        WorkflowDefinition {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            mode: WorkflowMode::Sequential,
            steps,
            initial_state,
            final_outputs: None,
        }
    }

    fn team(id: &str, members: &[&str], lead: &str, triggers: &[&str]) -> SkillTeam {
        SkillTeam {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            members: members.iter().map(ToString::to_string).collect(),
            lead: lead.to_string(),
            pattern: CommunicationPattern::HubSpoke,
            triggers: triggers.iter().map(ToString::to_string).collect(),
        }
    }

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("skillflow-{name}-{}", ulid::Ulid::new()));
        fs::create_dir_all(&dir).unwrap_or_else(|err| panic!("temp dir: {err}"));
        dir
    }

    #[test]
    fn builtin_catalog_registers_everything() {
        let catalog = Catalog::builtin().unwrap_or_else(|err| panic!("builtin: {err:#}"));
        let ids: Vec<&str> = catalog
            .workflows
            .list()
            .into_iter()
            .map(|def| def.id.as_str())
            .collect();
        assert_eq!(
            ids,
            vec!["bug-fix", "content-launch", "feature-build", "security-audit"]
        );
        assert_eq!(catalog.teams.list().len(), 4);
        assert!(catalog.collaboration("backend").is_some());
        assert!(catalog.referenced_skills().contains("security-review"));
    }

    #[test]
    fn unsatisfiable_input_fails_registration() {
        let mut registry = WorkflowRegistry::new();
        let result = registry.register(definition(
            "broken",
            &[],
            vec![step("a", &[], &["x"]), step("b", &["y"], &[])],
        ));
        assert!(matches!(result, Err(OrchestrationError::Definition(msg)) if msg.contains('y')));
        assert!(!registry.contains("broken"));
    }

    #[test]
    fn inputs_may_come_from_initial_state() {
        let mut registry = WorkflowRegistry::new();
        let result = registry.register(definition("ok", &["seed"], vec![step("a", &["seed"], &[])]));
        assert!(result.is_ok());
        assert!(registry.definition_hash("ok").is_ok());
    }

    #[test]
    fn later_outputs_do_not_satisfy_earlier_inputs() {
        let result = validate_workflow(&definition(
            "order",
            &[],
            vec![step("a", &["x"], &[]), step("b", &[], &["x"])],
        ));
        assert!(result.is_err());
    }

    #[test]
    fn zero_max_iterations_is_rejected() {
        let yaml = r"
id: gated
name: Gated
steps:
  - skill: a
    gate:
      validator: v
      max_iterations: 0
      on_fail: retry
";
        let parsed = parse_workflow_yaml(yaml).unwrap_or_else(|err| panic!("parse: {err}"));
        assert!(validate_workflow(&parsed).is_err());
    }

    #[test]
    fn unknown_yaml_fields_are_rejected() {
        assert!(parse_workflow_yaml("id: a\nname: b\nbogus: 1\n").is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut registry = WorkflowRegistry::new();
        assert!(registry.register(definition("dup", &[], vec![])).is_ok());
        assert!(registry.register(definition("dup", &[], vec![])).is_err());
    }

    #[test]
    fn team_lead_must_be_member() {
        let mut registry = TeamRegistry::new();
        assert!(registry
            .register(team("t", &["a", "b"], "c", &[]))
            .is_err());
        assert!(registry.register(team("t", &["a", "a"], "a", &[])).is_err());
        assert!(registry.register(team("t", &[], "a", &[])).is_err());
        assert!(registry.register(team("t", &["a", "b"], "a", &[])).is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(OrchestrationError::NotFound(_))
        ));
    }

    #[test]
    fn find_ranks_triggers_above_members() {
        let mut registry = TeamRegistry::new();
        let registered = registry
            .register(team("alpha", &["seo", "copy"], "seo", &["launch campaign"]))
            .and_then(|()| registry.register(team("beta", &["seo", "backend"], "seo", &[])));
        assert!(registered.is_ok());

        let matches = registry.find("Plan a LAUNCH CAMPAIGN with strong SEO");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].team_id, "alpha");
        assert_eq!(matches[0].score, 4);
        assert_eq!(matches[1].team_id, "beta");
        assert_eq!(matches[1].score, 1);
        assert!(registry.find("nothing relevant").is_empty());
    }

    #[test]
    fn find_matches_team_ids_and_distinct_names() {
        let mut named = team("growth-squad", &["seo", "copy"], "seo", &[]);
        named.name = "Marketing Crew".to_string();
        let mut registry = TeamRegistry::new();
        let registered = registry
            .register(named)
            .and_then(|()| registry.register(team("ops", &["infra", "oncall"], "infra", &[])));
        assert!(registered.is_ok());

        let matches = registry.find("ask the Marketing Crew, or growth-squad, about copy");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].team_id, "growth-squad");
        assert_eq!(matches[0].score, 5);
        assert_eq!(
            matches[0].matched,
            vec![
                "growth-squad".to_string(),
                "Marketing Crew".to_string(),
                "copy".to_string()
            ]
        );

        let by_id = registry.find("page ops");
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].matched, vec!["ops".to_string()]);
        assert_eq!(by_id[0].score, 2);
    }

    #[test]
    fn directory_overlays_builtins() {
        let dir = temp_dir("catalog");
        let mut custom = definition("feature-build", &[], vec![step("solo", &[], &["done"])]);
        custom.name = "Custom Feature".to_string();
        write_workflow_yaml(&dir, &custom).unwrap_or_else(|err| panic!("write: {err:#}"));

        let catalog = Catalog::with_dir(&dir).unwrap_or_else(|err| panic!("load: {err:#}"));
        let loaded = catalog
            .workflows
            .get("feature-build")
            .unwrap_or_else(|err| panic!("get: {err}"));
        assert_eq!(loaded.name, "Custom Feature");
        assert!(catalog.workflows.contains("bug-fix"));

        let only_dir = Catalog::load_dir(&dir).unwrap_or_else(|err| panic!("load: {err:#}"));
        assert_eq!(only_dir.workflows.list().len(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    proptest! {
        #[test]
        fn registration_fails_iff_some_input_is_unsatisfied(
            shape in proptest::collection::vec(
                (proptest::collection::vec(0u8..6, 0..3), proptest::collection::vec(0u8..6, 0..3)),
                0..6,
            ),
            initial in proptest::collection::vec(0u8..6, 0..3),
        ) {
            let key = |k: &u8| format!("k{k}");
            let initial_keys: Vec<String> = initial.iter().map(key).collect();
            let initial_refs: Vec<&str> = initial_keys.iter().map(String::as_str).collect();

            let mut available: std::collections::BTreeSet<String> = initial_keys.iter().cloned().collect();
            let mut expected_ok = true;
            let mut steps = Vec::new();
            for (index, (inputs, outputs)) in shape.iter().enumerate() {
                let inputs: Vec<String> = inputs.iter().map(key).collect();
                let outputs: Vec<String> = outputs.iter().map(key).collect();
                if inputs.iter().any(|input| !available.contains(input)) {
                    expected_ok = false;
                }
                available.extend(outputs.iter().cloned());
                let input_refs: Vec<&str> = inputs.iter().map(String::as_str).collect();
                let output_refs: Vec<&str> = outputs.iter().map(String::as_str).collect();
                steps.push(step(&format!("s{index}"), &input_refs, &output_refs));
            }

            let mut registry = WorkflowRegistry::new();
            let result = registry.register(definition("generated", &initial_refs, steps));
            prop_assert_eq!(result.is_ok(), expected_ok);
        }
    }
}
