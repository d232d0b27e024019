#![forbid(unsafe_code)]

pub mod coordinator;
pub mod event_log;
pub mod executor;
pub mod gate;
pub mod service;
pub mod skills;

pub use coordinator::{Delivery, TeamCoordinator};
pub use event_log::{verify_chain, ChainReport, EventLog};
pub use executor::{StepOutcome, WorkflowExecutor};
pub use gate::check_gate;
pub use service::{
    ActiveReport, ActiveTeamSummary, ActiveWorkflow, GateCheckRequest, HandoffReport, SkillCheck,
    Skillflow, WorkflowSummary,
};
pub use skills::{FnSkill, MockSkill, SkillAction, SkillContext, SkillResolver, SkillSet};
