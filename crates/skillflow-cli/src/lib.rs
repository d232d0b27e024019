//! `skillflow` command surface.
//!
//! Every command prints one JSON document on stdout. Lifecycle events go to
//! stderr in the format selected by `--events`; logs go to stderr through
//! `tracing` (`RUST_LOG`, default `warn`).

#![forbid(unsafe_code)]

use std::fs;
use std::io::{self, Stderr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};
use skillflow_domain::{GateFailPolicy, StateId, StateMap};
use skillflow_engine::{GateCheckRequest, MockSkill, SkillSet, Skillflow};
use skillflow_events::{EventSink, JsonLinesWriter, MarkerWriter, NoopSink};
use skillflow_registry::{parse_team_yaml, parse_workflow_yaml, Catalog};
use skillflow_store_core::StateStore;
use skillflow_store_sqlite::SqliteStateStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "skillflow")]
#[command(about = "Skill workflow and team orchestration with SQLite-backed state")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "SKILLFLOW_STATE_DB",
        default_value = "./skillflow.sqlite3"
    )]
    state_db: PathBuf,

    /// Catalog directory overlaid on the built-in workflows and teams.
    #[arg(long, global = true, env = "SKILLFLOW_CATALOG")]
    catalog: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = EventsFormat::Markers)]
    events: EventsFormat,

    /// Answer every skill with a deterministic echo of its declared outputs.
    #[arg(long, global = true)]
    mock_skills: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EventsFormat {
    Markers,
    Json,
    None,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    ListWorkflows,
    ListTeams,
    StartWorkflow(StartWorkflowArgs),
    StartTeam(StartTeamArgs),
    TeamMessage(TeamMessageArgs),
    TeamDelegate(TeamDelegateArgs),
    TeamStop(StateIdArgs),
    ValidateHandoff(ValidateHandoffArgs),
    FindTeam(FindTeamArgs),
    CreateTeam(DefinitionFileArgs),
    CreateWorkflow(DefinitionFileArgs),
    CheckSkills(CheckSkillsArgs),
    ListActive,
    Resume(ResumeArgs),
    Cancel(StateIdArgs),
    CheckGate(CheckGateArgs),
    Events(StateIdArgs),
}

#[derive(Debug, Args)]
pub struct StartWorkflowArgs {
    #[arg(long)]
    workflow_id: String,
    /// JSON object merged over the workflow's initial state.
    #[arg(long, default_value = "{}")]
    state_json: String,
    /// Persist the run as started without executing any step.
    #[arg(long)]
    no_run: bool,
}

#[derive(Debug, Args)]
pub struct StartTeamArgs {
    #[arg(long)]
    team_id: String,
    #[arg(long, default_value = "{}")]
    state_json: String,
}

#[derive(Debug, Args)]
pub struct TeamMessageArgs {
    #[arg(long)]
    state_id: String,
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
    #[arg(long, default_value = "{}")]
    payload_json: String,
}

#[derive(Debug, Args)]
pub struct TeamDelegateArgs {
    #[arg(long)]
    state_id: String,
    #[arg(long)]
    lead: String,
}

#[derive(Debug, Args)]
pub struct StateIdArgs {
    #[arg(long)]
    state_id: String,
}

#[derive(Debug, Args)]
pub struct ValidateHandoffArgs {
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
    #[arg(long, default_value = "{}")]
    payload_json: String,
}

#[derive(Debug, Args)]
pub struct FindTeamArgs {
    #[arg(long)]
    query: String,
}

#[derive(Debug, Args)]
pub struct DefinitionFileArgs {
    /// YAML definition to validate and add to the catalog directory.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct CheckSkillsArgs {
    /// Skills to check; defaults to every skill the catalog references.
    #[arg(long = "skill")]
    skills: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ResumeArgs {
    #[arg(long)]
    state_id: String,
    /// Continue executing from the persisted step instead of only loading.
    #[arg(long)]
    run: bool,
}

#[derive(Debug, Args)]
pub struct CheckGateArgs {
    #[arg(long = "criterion", value_delimiter = ',')]
    criteria: Vec<String>,
    #[arg(long, default_value = "{}")]
    outputs_json: String,
    #[arg(long, value_enum, default_value_t = OnFailArg::Block)]
    on_fail: OnFailArg,
    #[arg(long, default_value_t = 1)]
    attempt: u32,
    #[arg(long, default_value_t = 1)]
    max_iterations: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OnFailArg {
    Retry,
    Block,
    Warn,
}

impl From<OnFailArg> for GateFailPolicy {
    fn from(value: OnFailArg) -> Self {
        match value {
            OnFailArg::Retry => Self::Retry,
            OnFailArg::Block => Self::Block,
            OnFailArg::Warn => Self::Warn,
        }
    }
}

/// Install the stderr log subscriber; `RUST_LOG` overrides the `warn` default.
///
/// # Errors
/// Returns an error when a global subscriber is already installed.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to initialize tracing subscriber: {err}"))
}

/// Executes the parsed command graph on a current-thread runtime.
///
/// # Errors
/// Returns an error when the store or catalog cannot be opened, or the
/// command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let catalog = match &cli.catalog {
        Some(dir) => Catalog::with_dir(dir)
            .with_context(|| format!("failed to load catalog {}", dir.display()))?,
        None => Catalog::builtin()?,
    };
    let store = SqliteStateStore::open(&cli.state_db)?;
    store.migrate()?;

    let skills = if cli.mock_skills {
        SkillSet::new().with_fallback(Arc::new(MockSkill))
    } else {
        SkillSet::new()
    };
    let sink = event_sink(cli.events);

    let mut service = Skillflow::new(catalog, &skills, &store, sink.as_ref());
    if let Some(dir) = &cli.catalog {
        service = service.with_catalog_dir(dir);
    }
    let cancel = CancellationToken::new();

    match cli.command {
        Command::ListWorkflows => print_json(&service.list_workflows()),
        Command::ListTeams => print_json(&service.list_teams()),
        Command::StartWorkflow(args) => {
            let overrides = parse_state_json(&args.state_json)?;
            let state = service
                .start_workflow(&args.workflow_id, overrides, !args.no_run, &cancel)
                .await?;
            print_json(&state)
        }
        Command::StartTeam(args) => {
            let initial = parse_state_json(&args.state_json)?;
            print_json(&service.start_team(&args.team_id, initial)?)
        }
        Command::TeamMessage(args) => {
            let payload = parse_json_arg("payload_json", &args.payload_json)?;
            let delivery = service.send_team_message(
                &StateId::from(args.state_id.as_str()),
                &args.from,
                &args.to,
                payload,
            )?;
            print_json(&delivery)
        }
        Command::TeamDelegate(args) => print_json(
            &service.delegate_team(&StateId::from(args.state_id.as_str()), &args.lead)?,
        ),
        Command::TeamStop(args) => {
            print_json(&service.stop_team(&StateId::from(args.state_id.as_str()))?)
        }
        Command::ValidateHandoff(args) => {
            let payload = parse_json_arg("payload_json", &args.payload_json)?;
            print_json(&service.validate_handoff(&args.from, &args.to, &payload))
        }
        Command::FindTeam(args) => print_json(&service.find_team(&args.query)),
        Command::CreateTeam(args) => {
            require_catalog_dir(cli.catalog.as_deref(), "create-team")?;
            let team = parse_team_yaml(&read_definition(&args.file)?)?;
            let team_id = team.id.clone();
            let written = service.create_team(team)?;
            print_json(&json!({"team_id": team_id, "written": written}))
        }
        Command::CreateWorkflow(args) => {
            require_catalog_dir(cli.catalog.as_deref(), "create-workflow")?;
            let definition = parse_workflow_yaml(&read_definition(&args.file)?)?;
            let workflow_id = definition.id.clone();
            let written = service.create_workflow(definition)?;
            print_json(&json!({"workflow_id": workflow_id, "written": written}))
        }
        Command::CheckSkills(args) => print_json(&service.check_skills(&args.skills)),
        Command::ListActive => print_json(&service.list_active()?),
        Command::Resume(args) => {
            let state = service
                .resume(&StateId::from(args.state_id.as_str()), args.run, &cancel)
                .await?;
            print_json(&state)
        }
        Command::Cancel(args) => {
            print_json(&service.cancel(&StateId::from(args.state_id.as_str()))?)
        }
        Command::CheckGate(args) => {
            let request = GateCheckRequest {
                criteria: args.criteria,
                outputs: parse_state_json(&args.outputs_json)?,
                on_fail: args.on_fail.into(),
                attempt: args.attempt,
                max_iterations: args.max_iterations,
            };
            print_json(&service.check_gate(&request))
        }
        Command::Events(args) => {
            let report = service.verify_events(&args.state_id)?;
            let events = store.list_events(&args.state_id)?;
            print_json(&json!({"report": report, "events": events}))
        }
    }
}

fn event_sink(format: EventsFormat) -> Box<dyn EventSink> {
    match format {
        EventsFormat::Markers => Box::new(MarkerWriter::<Stderr>::new(io::stderr())),
        EventsFormat::Json => Box::new(JsonLinesWriter::<Stderr>::new(io::stderr())),
        EventsFormat::None => Box::new(NoopSink),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_json_arg(name: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{name} must be valid JSON: {raw}"))
}

fn parse_state_json(raw: &str) -> Result<StateMap> {
    match parse_json_arg("state", raw)? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("expected a JSON object, got {other}")),
    }
}

fn read_definition(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn require_catalog_dir(dir: Option<&Path>, command: &str) -> Result<()> {
    if dir.is_some() {
        return Ok(());
    }
    Err(anyhow!(
        "{command} needs --catalog (or SKILLFLOW_CATALOG) so the definition persists"
    ))
}
