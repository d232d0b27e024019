use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use skillflow_domain::{StateId, StateMap};
use tokio_util::sync::CancellationToken;

/// What a skill action knows about the invocation it serves.
#[derive(Debug, Clone)]
pub struct SkillContext {
    pub state_id: StateId,
    pub workflow_id: String,
    pub skill: String,
    pub step_index: usize,
    pub attempt: u32,
    pub declared_outputs: Vec<String>,
    /// Cancelled when the run is cancelled; long-running actions should watch it.
    pub cancel: CancellationToken,
}

/// An externally supplied unit of work bound to a skill id.
#[async_trait]
pub trait SkillAction: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    async fn invoke(&self, inputs: &StateMap, ctx: &SkillContext) -> Result<StateMap>;
}

pub trait SkillResolver {
    fn resolve(&self, skill: &str) -> Option<Arc<dyn SkillAction>>;
}

/// Named skill actions with an optional catch-all.
#[derive(Default, Clone)]
pub struct SkillSet {
    actions: BTreeMap<String, Arc<dyn SkillAction>>,
    fallback: Option<Arc<dyn SkillAction>>,
}

impl SkillSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, skill: &str, action: Arc<dyn SkillAction>) -> Self {
        self.insert(skill, action);
        self
    }

    /// Used for every skill without an explicit action.
    #[must_use]
    pub fn with_fallback(mut self, action: Arc<dyn SkillAction>) -> Self {
        self.fallback = Some(action);
        self
    }

    pub fn insert(&mut self, skill: &str, action: Arc<dyn SkillAction>) {
        self.actions.insert(skill.to_string(), action);
    }
}

impl SkillResolver for SkillSet {
    fn resolve(&self, skill: &str) -> Option<Arc<dyn SkillAction>> {
        self.actions
            .get(skill)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

/// Adapts a synchronous closure into a skill action.
pub struct FnSkill<F> {
    func: F,
}

impl<F> FnSkill<F>
where
    F: Fn(&StateMap, &SkillContext) -> Result<StateMap> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }

    pub fn shared(func: F) -> Arc<dyn SkillAction> {
        Arc::new(Self::new(func))
    }
}

#[async_trait]
impl<F> SkillAction for FnSkill<F>
where
    F: Fn(&StateMap, &SkillContext) -> Result<StateMap> + Send + Sync + 'static,
{
    async fn invoke(&self, inputs: &StateMap, ctx: &SkillContext) -> Result<StateMap> {
        (self.func)(inputs, ctx)
    }
}

/// Deterministic stand-in: answers every declared output with `"<skill>:<key>"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockSkill;

#[async_trait]
impl SkillAction for MockSkill {
    async fn invoke(&self, _inputs: &StateMap, ctx: &SkillContext) -> Result<StateMap> {
        let mut out = StateMap::new();
        for key in &ctx.declared_outputs {
            out.insert(key.clone(), Value::String(format!("{}:{key}", ctx.skill)));
        }
        Ok(out)
    }
}
