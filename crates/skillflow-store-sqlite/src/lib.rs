#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use skillflow_domain::{
    format_rfc3339, now_utc, parse_rfc3339, ActiveTeam, EventRecord, OrchestrationError, StateId,
    TeamStatus, WorkflowState, WorkflowStatus,
};
use skillflow_store_core::{NewEvent, StateStore};

const STATE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_states (
  state_id TEXT PRIMARY KEY,
  workflow_id TEXT NOT NULL,
  definition_hash TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','running','blocked','completed','failed')),
  current_step INTEGER NOT NULL,
  error_json TEXT,
  state_json TEXT NOT NULL,
  revision INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  completed_at TEXT
);

CREATE TABLE IF NOT EXISTS team_states (
  state_id TEXT PRIMARY KEY,
  team_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('active','stopped','completed')),
  current_lead TEXT NOT NULL,
  state_json TEXT NOT NULL,
  revision INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  subject_id TEXT NOT NULL,
  event_type TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  data_json TEXT NOT NULL,
  prev_event_hash TEXT,
  event_hash TEXT NOT NULL UNIQUE
);

CREATE INDEX IF NOT EXISTS idx_workflow_states_status ON workflow_states(status, created_at);
CREATE INDEX IF NOT EXISTS idx_team_states_status ON team_states(status, created_at);
CREATE INDEX IF NOT EXISTS idx_events_subject_seq ON events(subject_id, event_seq);

CREATE TRIGGER IF NOT EXISTS trg_events_no_update
BEFORE UPDATE ON events
BEGIN
  SELECT RAISE(FAIL, 'events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_events_no_delete
BEFORE DELETE ON events
BEGIN
  SELECT RAISE(FAIL, 'events is append-only');
END;
";

pub struct SqliteStateStore {
    conn: Connection,
}

impl SqliteStateStore {
    /// Open or create a `SQLite` state database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Private in-memory database, mostly for tests and dry runs.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }
}

impl StateStore for SqliteStateStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply state schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STATE_SCHEMA_VERSION, format_rfc3339(now_utc())?],
            )
            .context("failed to record state migration")?;

        Ok(())
    }

    fn save_workflow_state(&self, state: &WorkflowState) -> Result<u64> {
        let next_revision = state.revision + 1;
        let mut stored = state.clone();
        stored.revision = next_revision;

        let state_json = serde_json::to_string(&stored)?;
        let error_json = state
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let current_step = i64::try_from(state.current_step)
            .map_err(|_| anyhow!("current_step too large for sqlite"))?;
        let completed_at = state.completed_at.map(format_rfc3339).transpose()?;

        let changed = if state.revision == 0 {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO workflow_states(
                        state_id, workflow_id, definition_hash, status, current_step,
                        error_json, state_json, revision, created_at, updated_at, completed_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        state.id.as_str(),
                        state.workflow_id,
                        state.definition_hash,
                        state.status.as_str(),
                        current_step,
                        error_json,
                        state_json,
                        revision_to_sql(next_revision)?,
                        format_rfc3339(state.created_at)?,
                        format_rfc3339(state.updated_at)?,
                        completed_at,
                    ],
                )
                .context("failed to insert workflow state")?
        } else {
            self.conn
                .execute(
                    "UPDATE workflow_states SET
                        status = ?3, current_step = ?4, error_json = ?5, state_json = ?6,
                        revision = ?7, updated_at = ?8, completed_at = ?9
                     WHERE state_id = ?1 AND revision = ?2",
                    params![
                        state.id.as_str(),
                        revision_to_sql(state.revision)?,
                        state.status.as_str(),
                        current_step,
                        error_json,
                        state_json,
                        revision_to_sql(next_revision)?,
                        format_rfc3339(state.updated_at)?,
                        completed_at,
                    ],
                )
                .context("failed to update workflow state")?
        };

        if changed == 0 {
            return Err(OrchestrationError::Conflict(format!(
                "workflow state {} is not at revision {}",
                state.id, state.revision
            ))
            .into());
        }
        Ok(next_revision)
    }

    fn load_workflow_state(&self, id: &StateId) -> Result<Option<WorkflowState>> {
        let row = self
            .conn
            .query_row(
                "SELECT state_json, revision, status FROM workflow_states WHERE state_id = ?1",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("failed to load workflow state")?;

        row.map(|(json, revision, status)| decode_workflow_state(&json, revision, &status))
            .transpose()
    }

    fn list_workflow_states(&self) -> Result<Vec<WorkflowState>> {
        let mut stmt = self.conn.prepare(
            "SELECT state_json, revision, status FROM workflow_states
             ORDER BY created_at ASC, state_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let json: String = row.get(0)?;
            let status: String = row.get(2)?;
            out.push(decode_workflow_state(&json, row.get(1)?, &status)?);
        }
        Ok(out)
    }

    fn save_team_state(&self, team: &ActiveTeam) -> Result<u64> {
        let next_revision = team.revision + 1;
        let mut stored = team.clone();
        stored.revision = next_revision;
        let state_json = serde_json::to_string(&stored)?;

        let changed = if team.revision == 0 {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO team_states(
                        state_id, team_id, status, current_lead, state_json,
                        revision, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        team.id.as_str(),
                        team.team_id,
                        team.status.as_str(),
                        team.current_lead,
                        state_json,
                        revision_to_sql(next_revision)?,
                        format_rfc3339(team.created_at)?,
                        format_rfc3339(team.updated_at)?,
                    ],
                )
                .context("failed to insert team state")?
        } else {
            self.conn
                .execute(
                    "UPDATE team_states SET
                        status = ?3, current_lead = ?4, state_json = ?5,
                        revision = ?6, updated_at = ?7
                     WHERE state_id = ?1 AND revision = ?2",
                    params![
                        team.id.as_str(),
                        revision_to_sql(team.revision)?,
                        team.status.as_str(),
                        team.current_lead,
                        state_json,
                        revision_to_sql(next_revision)?,
                        format_rfc3339(team.updated_at)?,
                    ],
                )
                .context("failed to update team state")?
        };

        if changed == 0 {
            return Err(OrchestrationError::Conflict(format!(
                "team state {} is not at revision {}",
                team.id, team.revision
            ))
            .into());
        }
        Ok(next_revision)
    }

    fn load_team_state(&self, id: &StateId) -> Result<Option<ActiveTeam>> {
        let row = self
            .conn
            .query_row(
                "SELECT state_json, revision, status FROM team_states WHERE state_id = ?1",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("failed to load team state")?;

        row.map(|(json, revision, status)| decode_team_state(&json, revision, &status))
            .transpose()
    }

    fn list_team_states(&self) -> Result<Vec<ActiveTeam>> {
        let mut stmt = self.conn.prepare(
            "SELECT state_json, revision, status FROM team_states
             ORDER BY created_at ASC, state_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let json: String = row.get(0)?;
            let status: String = row.get(2)?;
            out.push(decode_team_state(&json, row.get(1)?, &status)?);
        }
        Ok(out)
    }

    fn append_event(&self, event: &NewEvent) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO events(
                    subject_id, event_type, occurred_at, data_json, prev_event_hash, event_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.subject_id,
                    event.event_type,
                    format_rfc3339(event.occurred_at)?,
                    serde_json::to_string(&event.data)?,
                    event.prev_event_hash,
                    event.event_hash,
                ],
            )
            .context("failed to append event")?;

        Ok(self.conn.last_insert_rowid())
    }

    fn list_events(&self, subject_id: &str) -> Result<Vec<EventRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_seq, subject_id, event_type, occurred_at, data_json,
                    prev_event_hash, event_hash
             FROM events
             WHERE subject_id = ?1
             ORDER BY event_seq ASC",
        )?;

        let mut rows = stmt.query(params![subject_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let data_raw: String = row.get(4)?;
            out.push(EventRecord {
                event_seq: row.get(0)?,
                subject_id: row.get(1)?,
                event_type: row.get(2)?,
                occurred_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
                data: serde_json::from_str(&data_raw).context("invalid data_json")?,
                prev_event_hash: row.get(5)?,
                event_hash: row.get(6)?,
            });
        }
        Ok(out)
    }

    fn last_event_hash(&self, subject_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT event_hash FROM events WHERE subject_id = ?1
                 ORDER BY event_seq DESC LIMIT 1",
                params![subject_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read last event hash")
    }
}

fn decode_workflow_state(json: &str, revision: i64, status: &str) -> Result<WorkflowState> {
    let mut state: WorkflowState =
        serde_json::from_str(json).context("invalid workflow state_json")?;
    state.revision = revision_from_sql(revision)?;
    let status = WorkflowStatus::parse(status)
        .ok_or_else(|| anyhow!("unknown workflow status: {status}"))?;
    if state.status != status {
        return Err(anyhow!(
            "workflow state {} row status {} disagrees with stored state {}",
            state.id,
            status.as_str(),
            state.status.as_str()
        ));
    }
    Ok(state)
}

fn decode_team_state(json: &str, revision: i64, status: &str) -> Result<ActiveTeam> {
    let mut team: ActiveTeam = serde_json::from_str(json).context("invalid team state_json")?;
    team.revision = revision_from_sql(revision)?;
    let status =
        TeamStatus::parse(status).ok_or_else(|| anyhow!("unknown team status: {status}"))?;
    if team.status != status {
        return Err(anyhow!(
            "team state {} row status {} disagrees with stored state {}",
            team.id,
            status.as_str(),
            team.status.as_str()
        ));
    }
    Ok(team)
}

fn revision_to_sql(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("revision too large for sqlite"))
}

fn revision_from_sql(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("negative revision in sqlite"))
}

#[cfg(test)]
mod tests {
    use super::SqliteStateStore;
    use serde_json::json;
    use skillflow_domain::{
        now_utc, ActiveTeam, CommunicationPattern, OrchestrationError, StateId, StateMap,
        TeamStatus, WorkflowState, WorkflowStatus,
    };
    use skillflow_store_core::{NewEvent, StateStore};
    use ulid::Ulid;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "skillflow-sqlite-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn open_store(name: &str) -> SqliteStateStore {
        let store = SqliteStateStore::open(&temp_db_path(name));
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        store
    }

    fn fixture_state() -> WorkflowState {
        let now = now_utc();
        let mut state_data = StateMap::new();
        state_data.insert("spec".to_string(), json!("v1"));
        WorkflowState {
            id: StateId::for_workflow("feature-build"),
            workflow_id: "feature-build".to_string(),
            definition_hash: "hash".to_string(),
            current_step: 1,
            state_data,
            history: Vec::new(),
            skipped_steps: Vec::new(),
            status: WorkflowStatus::Running,
            error: None,
            final_outputs: None,
            revision: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn fixture_team() -> ActiveTeam {
        let now = now_utc();
        ActiveTeam {
            id: StateId::for_team("product-squad"),
            team_id: "product-squad".to_string(),
            pattern: CommunicationPattern::HubSpoke,
            current_lead: "lead".to_string(),
            members: vec!["lead".to_string(), "a".to_string()],
            state_data: StateMap::new(),
            communication_log: Vec::new(),
            status: TeamStatus::Active,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = open_store("migrate");
        assert!(store.migrate().is_ok());
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(count, 1);
    }

    #[test]
    fn workflow_state_round_trips_with_revision() {
        let store = open_store("round-trip");
        let mut state = fixture_state();
        let revision = store.save_workflow_state(&state);
        assert!(matches!(revision, Ok(1)));
        state.revision = 1;

        let loaded = store
            .load_workflow_state(&state.id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(loaded.as_ref(), Some(&state));

        state.current_step = 2;
        assert!(matches!(store.save_workflow_state(&state), Ok(2)));
        assert_eq!(
            store
                .list_workflow_states()
                .unwrap_or_else(|_| unreachable!())
                .len(),
            1
        );
    }

    #[test]
    fn stale_revision_is_a_conflict() {
        let store = open_store("conflict");
        let state = fixture_state();
        assert!(store.save_workflow_state(&state).is_ok());

        let err = store.save_workflow_state(&state);
        let err = err.err().unwrap_or_else(|| panic!("duplicate insert must conflict"));
        assert!(matches!(
            err.downcast_ref::<OrchestrationError>(),
            Some(OrchestrationError::Conflict(_))
        ));

        let mut stale = state.clone();
        stale.revision = 7;
        assert!(store.save_workflow_state(&stale).is_err());
    }

    #[test]
    fn missing_state_loads_as_none() {
        let store = open_store("missing");
        let loaded = store.load_workflow_state(&StateId::from("wf_nope_0"));
        assert!(matches!(loaded, Ok(None)));
        assert!(matches!(
            store.load_team_state(&StateId::from("team_nope_0")),
            Ok(None)
        ));
    }

    #[test]
    fn team_state_round_trips() {
        let store = open_store("team");
        let mut team = fixture_team();
        assert!(matches!(store.save_team_state(&team), Ok(1)));
        team.revision = 1;
        team.status = TeamStatus::Stopped;
        assert!(matches!(store.save_team_state(&team), Ok(2)));

        let loaded = store
            .load_team_state(&team.id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| panic!("team should exist"));
        assert_eq!(loaded.status, TeamStatus::Stopped);
        assert_eq!(loaded.revision, 2);
        assert_eq!(store.list_team_states().map(|t| t.len()).ok(), Some(1));
    }

    #[test]
    fn events_are_append_only_and_ordered() {
        let store = open_store("events");
        for (index, hash) in ["h1", "h2"].iter().enumerate() {
            let appended = store.append_event(&NewEvent {
                subject_id: "wf_x".to_string(),
                event_type: "workflow_step".to_string(),
                occurred_at: now_utc(),
                data: json!({ "step": index }),
                prev_event_hash: (index > 0).then(|| "h1".to_string()),
                event_hash: (*hash).to_string(),
            });
            assert!(appended.is_ok());
        }

        let events = store.list_events("wf_x").unwrap_or_else(|_| unreachable!());
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].prev_event_hash.as_deref(), Some("h1"));
        assert_eq!(
            store.last_event_hash("wf_x").unwrap_or_else(|_| unreachable!()),
            Some("h2".to_string())
        );
        assert!(matches!(store.last_event_hash("other"), Ok(None)));

        let mutated = store.conn.execute(
            "UPDATE events SET event_type = 'mutated' WHERE event_seq = 1",
            [],
        );
        assert!(mutated.is_err());
        assert!(store.conn.execute("DELETE FROM events", []).is_err());
    }

    #[test]
    fn in_memory_store_works() {
        let store = SqliteStateStore::open_in_memory().unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        assert!(store.save_workflow_state(&fixture_state()).is_ok());
    }
}
