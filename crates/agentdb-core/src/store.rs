//! Append-only synchronization event log.
//!
//! One SQLite file per repository, shared by every sandbox through its alias.
//! Concurrent writers are separate processes; SQLite's own file locking (WAL
//! journal plus a busy timeout) serialises them. Rows are never updated. The
//! only deletion is the explicit [`EventStore::prune_older_than`].
//!
//! Each append is a new row. A caller retrying the same delivery passes an
//! idempotency key; a second append with that key returns the first row's
//! id. The provenance hash is a content fingerprint only, so a token that
//! revisits an earlier state still gets a row.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{
    params, Connection, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::rules;

pub const SCHEMA_VERSION: &str = "2.0.0";

/// Patterns the phase table and quality gates understand. Others are stored
/// as given.
pub const KNOWN_PATTERNS: &[&str] = &[
    "phase_1_specify",
    "phase_2_plan",
    "phase_3_tasks",
    "phase_4_implement",
    "phase_5_integrate",
    "phase_6_release",
    "phase_7_backmerge",
    "quality_gate_passed",
    "quality_gate_failed",
];

pub fn is_known_pattern(pattern: &str) -> bool {
    KNOWN_PATTERNS.contains(&pattern)
}

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_metadata (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS agent_synchronizations (
        sync_id         TEXT PRIMARY KEY,
        agent_id        TEXT NOT NULL,
        worktree_path   TEXT,
        flow_token      TEXT,
        sync_type       TEXT NOT NULL
            CHECK (sync_type IN ('workflow_transition', 'quality_gate', 'file_update')),
        source_location TEXT NOT NULL DEFAULT '',
        target_location TEXT NOT NULL DEFAULT '',
        pattern         TEXT NOT NULL,
        status          TEXT NOT NULL
            CHECK (status IN ('pending', 'in_progress', 'completed', 'failed', 'rolled_back')),
        created_at      INTEGER NOT NULL,
        completed_at    INTEGER,
        created_by      TEXT NOT NULL,
        phi_flagged     INTEGER NOT NULL DEFAULT 0,
        provenance_hash TEXT,
        metadata        TEXT NOT NULL DEFAULT '{}',
        idempotency_key TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_flow_created
        ON agent_synchronizations (flow_token, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_sync_worktree_created
        ON agent_synchronizations (worktree_path, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_sync_created
        ON agent_synchronizations (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_sync_pattern
        ON agent_synchronizations (pattern)",
    "CREATE INDEX IF NOT EXISTS idx_sync_flagged
        ON agent_synchronizations (phi_flagged, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_sync_provenance
        ON agent_synchronizations (provenance_hash)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_idempotency
        ON agent_synchronizations (idempotency_key)",
];

const SELECT_COLUMNS: &str = "sync_id, agent_id, worktree_path, flow_token, sync_type, \
     source_location, target_location, pattern, status, created_at, completed_at, \
     created_by, phi_flagged, provenance_hash, metadata, idempotency_key";

// ---------------------------------------------------------------------------
// EventId
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn generate() -> Self {
        EventId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        EventId(s)
    }
}

// ---------------------------------------------------------------------------
// EventCategory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    WorkflowTransition,
    QualityGate,
    FileUpdate,
}

impl EventCategory {
    pub fn all() -> &'static [EventCategory] {
        &[
            EventCategory::WorkflowTransition,
            EventCategory::QualityGate,
            EventCategory::FileUpdate,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventCategory::WorkflowTransition => "workflow_transition",
            EventCategory::QualityGate => "quality_gate",
            EventCategory::FileUpdate => "file_update",
        }
    }

    /// Category implied by an action name when the caller gives none.
    pub fn infer(action: &str) -> Self {
        if action.starts_with("quality_gate") {
            EventCategory::QualityGate
        } else {
            EventCategory::WorkflowTransition
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventCategory {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        EventCategory::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| SyncError::InvalidSyncType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// EventStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl EventStatus {
    pub fn all() -> &'static [EventStatus] {
        &[
            EventStatus::Pending,
            EventStatus::InProgress,
            EventStatus::Completed,
            EventStatus::Failed,
            EventStatus::RolledBack,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::InProgress => "in_progress",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, EventStatus::Pending | EventStatus::InProgress)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        EventStatus::all()
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| SyncError::InvalidStatus(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// SyncEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub sync_id: EventId,
    pub agent_id: String,
    /// `None` for events recorded from the primary checkout.
    pub worktree_path: Option<PathBuf>,
    pub flow_token: Option<String>,
    pub sync_type: EventCategory,
    pub source_location: String,
    pub target_location: String,
    pub pattern: String,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub phi_flagged: bool,
    pub provenance_hash: Option<String>,
    pub metadata: serde_json::Value,
    /// Caller-chosen delivery key; at most one row per key.
    pub idempotency_key: Option<String>,
}

impl SyncEvent {
    /// A completed event stamped now, created by `agent_id`.
    pub fn new(
        agent_id: impl Into<String>,
        sync_type: EventCategory,
        pattern: impl Into<String>,
    ) -> Self {
        let agent_id = agent_id.into();
        let now = Utc::now();
        Self {
            sync_id: EventId::generate(),
            created_by: agent_id.clone(),
            agent_id,
            worktree_path: None,
            flow_token: None,
            sync_type,
            source_location: String::new(),
            target_location: String::new(),
            pattern: pattern.into(),
            status: EventStatus::Completed,
            created_at: now,
            completed_at: Some(now),
            phi_flagged: false,
            provenance_hash: None,
            metadata: serde_json::Value::Object(Default::default()),
            idempotency_key: None,
        }
    }

    pub fn with_worktree_path(mut self, path: Option<PathBuf>) -> Self {
        self.worktree_path = path;
        self
    }

    pub fn with_flow_token(mut self, token: Option<String>) -> Self {
        self.flow_token = token;
        self
    }

    pub fn with_locations(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.source_location = source.into();
        self.target_location = target.into();
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self.completed_at = status.is_terminal().then_some(self.created_at);
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        if self.completed_at.is_some() {
            self.completed_at = Some(at);
        }
        self
    }

    pub fn with_created_by(mut self, creator: impl Into<String>) -> Self {
        self.created_by = creator.into();
        self
    }

    pub fn with_phi_flagged(mut self, flagged: bool) -> Self {
        self.phi_flagged = flagged;
        self
    }

    pub fn with_provenance_hash(mut self, hash: Option<String>) -> Self {
        self.provenance_hash = hash;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key.filter(|k| !k.trim().is_empty());
        self
    }
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

/// Which slice of the log a "latest event" query looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "by", content = "key", rename_all = "snake_case")]
pub enum Correlation {
    FlowToken(String),
    Sandbox(PathBuf),
    /// Events with no sandbox path.
    Primary,
}

impl fmt::Display for Correlation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Correlation::FlowToken(t) => write!(f, "flow token {t}"),
            Correlation::Sandbox(p) => write!(f, "sandbox {}", p.display()),
            Correlation::Primary => f.write_str("primary checkout"),
        }
    }
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

pub struct EventStore {
    conn: Connection,
    path: PathBuf,
}

impl EventStore {
    /// Open (creating if absent) the store at `path`.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::configure(conn, path, busy_timeout)
    }

    /// Open an existing store without creating one.
    pub fn open_existing(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if !path.exists() {
            return Err(SyncError::StoreUnavailable {
                path: path.to_path_buf(),
                reason: "store file does not exist".into(),
            });
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::configure(conn, path, busy_timeout)
    }

    fn configure(conn: Connection, path: &Path, busy_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(busy_timeout)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(store = %path.display(), mode = %mode, "store is not in WAL mode");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a write transaction that takes the file lock up front, so
    /// statements inside it never wait on another writer.
    pub fn immediate_transaction(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    /// Create tables and indexes if absent and record the schema version.
    ///
    /// Each statement runs on its own; a failure (typically a concurrent
    /// first-time initializer) is logged and the rest still run.
    pub fn initialize_schema(&self) -> Result<()> {
        for stmt in SCHEMA_STATEMENTS.iter().chain(rules::RULE_SCHEMA_STATEMENTS) {
            if let Err(e) = self.conn.execute_batch(stmt) {
                tracing::warn!(store = %self.path.display(), error = %e, "schema statement failed; continuing");
            }
        }
        if let Err(e) = self.upgrade_dedupe_columns() {
            tracing::warn!(store = %self.path.display(), error = %e, "schema upgrade failed; continuing");
        }

        let now = Utc::now().to_rfc3339();
        let metadata = [
            (
                "INSERT INTO schema_metadata (key, value) VALUES ('schema_version', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                SCHEMA_VERSION.to_string(),
            ),
            (
                "INSERT OR IGNORE INTO schema_metadata (key, value) VALUES ('initialized_at', ?1)",
                now,
            ),
        ];
        for (sql, value) in metadata {
            if let Err(e) = self.conn.execute(sql, params![value]) {
                tracing::warn!(store = %self.path.display(), error = %e, "schema metadata write failed; continuing");
            }
        }

        if !self.is_initialized()? {
            return Err(SyncError::StoreUnavailable {
                path: self.path.clone(),
                reason: "schema could not be created".into(),
            });
        }
        tracing::debug!(store = %self.path.display(), version = SCHEMA_VERSION, "schema ready");
        Ok(())
    }

    /// Stores written before idempotency keys existed have no
    /// `idempotency_key` column and a UNIQUE provenance index.
    fn upgrade_dedupe_columns(&self) -> Result<()> {
        let has_key: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('agent_synchronizations')
             WHERE name = 'idempotency_key'",
            [],
            |r| r.get(0),
        )?;
        if has_key == 0 {
            self.conn
                .execute_batch("ALTER TABLE agent_synchronizations ADD COLUMN idempotency_key TEXT")?;
            self.conn.execute_batch(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_idempotency
                 ON agent_synchronizations (idempotency_key)",
            )?;
            tracing::info!(store = %self.path.display(), "added idempotency_key column");
        }

        let unique: Option<bool> = self
            .conn
            .query_row(
                "SELECT \"unique\" FROM pragma_index_list('agent_synchronizations')
                 WHERE name = 'idx_sync_provenance'",
                [],
                |r| r.get(0),
            )
            .optional()?;
        if unique == Some(true) {
            self.conn.execute_batch(
                "DROP INDEX idx_sync_provenance;
                 CREATE INDEX idx_sync_provenance ON agent_synchronizations (provenance_hash);",
            )?;
            tracing::info!(store = %self.path.display(), "provenance index is no longer unique");
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> Result<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'agent_synchronizations'",
            [],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn schema_version(&self) -> Result<Option<String>> {
        let has_table: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_metadata'",
            [],
            |r| r.get(0),
        )?;
        if has_table == 0 {
            return Ok(None);
        }
        let version = self
            .conn
            .query_row(
                "SELECT value FROM schema_metadata WHERE key = 'schema_version'",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(version)
    }

    /// Append one event. When the event carries an idempotency key that is
    /// already stored, nothing is inserted and the existing id is returned.
    pub fn append(&self, event: &SyncEvent) -> Result<EventId> {
        if !is_known_pattern(&event.pattern) {
            tracing::debug!(pattern = %event.pattern, "pattern is not in the standard list");
        }
        let metadata = serde_json::to_string(&event.metadata)?;
        let inserted = self.conn.execute(
            "INSERT INTO agent_synchronizations (
                sync_id, agent_id, worktree_path, flow_token, sync_type,
                source_location, target_location, pattern, status,
                created_at, completed_at, created_by, phi_flagged,
                provenance_hash, metadata, idempotency_key
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(idempotency_key) DO NOTHING",
            params![
                event.sync_id.as_str(),
                event.agent_id,
                event
                    .worktree_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                event.flow_token,
                event.sync_type.as_str(),
                event.source_location,
                event.target_location,
                event.pattern,
                event.status.as_str(),
                event.created_at.timestamp_micros(),
                event.completed_at.map(|t| t.timestamp_micros()),
                event.created_by,
                event.phi_flagged,
                event.provenance_hash,
                metadata,
                event.idempotency_key,
            ],
        )?;

        if inserted == 0 {
            if let Some(key) = &event.idempotency_key {
                let existing: String = self.conn.query_row(
                    "SELECT sync_id FROM agent_synchronizations WHERE idempotency_key = ?1",
                    params![key],
                    |r| r.get(0),
                )?;
                tracing::debug!(sync_id = %existing, key = %key, "idempotency key already recorded");
                return Ok(EventId(existing));
            }
        }
        Ok(event.sync_id.clone())
    }

    /// Most recent event for `correlation`, or `None` when nothing matches.
    pub fn query_latest(&self, correlation: &Correlation) -> Result<Option<SyncEvent>> {
        let (filter, key) = match correlation {
            Correlation::FlowToken(t) => ("flow_token = ?1", Some(t.clone())),
            Correlation::Sandbox(p) => ("worktree_path = ?1", Some(p.to_string_lossy().into_owned())),
            Correlation::Primary => ("worktree_path IS NULL", None),
        };
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM agent_synchronizations
             WHERE {filter} ORDER BY created_at DESC, rowid DESC LIMIT 1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = match key {
            Some(k) => stmt.query_row(params![k], RawEvent::from_row).optional()?,
            None => stmt.query_row([], RawEvent::from_row).optional()?,
        };
        raw.map(SyncEvent::try_from).transpose()
    }

    /// The `limit` most recent events across every correlation key.
    pub fn query_recent(&self, limit: usize) -> Result<Vec<SyncEvent>> {
        self.query_many(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM agent_synchronizations
                 ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            ),
            limit,
        )
    }

    /// Flagged events, newest first: the compliance audit view.
    pub fn query_flagged(&self, limit: usize) -> Result<Vec<SyncEvent>> {
        self.query_many(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM agent_synchronizations
                 WHERE phi_flagged = 1 ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            ),
            limit,
        )
    }

    fn query_many(&self, sql: &str, limit: usize) -> Result<Vec<SyncEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![limit], RawEvent::from_row)?;
        let mut events = Vec::new();
        for raw in rows {
            events.push(SyncEvent::try_from(raw?)?);
        }
        Ok(events)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM agent_synchronizations", [], |r| {
                r.get(0)
            })?;
        Ok(n.max(0) as u64)
    }

    /// Delete events created before `cutoff`. Returns the number removed.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM agent_synchronizations WHERE created_at < ?1",
            params![cutoff.timestamp_micros()],
        )?;
        tracing::info!(store = %self.path.display(), removed, cutoff = %cutoff, "pruned events");
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

struct RawEvent {
    sync_id: String,
    agent_id: String,
    worktree_path: Option<String>,
    flow_token: Option<String>,
    sync_type: String,
    source_location: String,
    target_location: String,
    pattern: String,
    status: String,
    created_at: i64,
    completed_at: Option<i64>,
    created_by: String,
    phi_flagged: bool,
    provenance_hash: Option<String>,
    metadata: String,
    idempotency_key: Option<String>,
}

impl RawEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sync_id: row.get(0)?,
            agent_id: row.get(1)?,
            worktree_path: row.get(2)?,
            flow_token: row.get(3)?,
            sync_type: row.get(4)?,
            source_location: row.get(5)?,
            target_location: row.get(6)?,
            pattern: row.get(7)?,
            status: row.get(8)?,
            created_at: row.get(9)?,
            completed_at: row.get(10)?,
            created_by: row.get(11)?,
            phi_flagged: row.get(12)?,
            provenance_hash: row.get(13)?,
            metadata: row.get(14)?,
            idempotency_key: row.get(15)?,
        })
    }
}

impl TryFrom<RawEvent> for SyncEvent {
    type Error = SyncError;

    fn try_from(raw: RawEvent) -> Result<Self> {
        let corrupt = |reason: String| SyncError::CorruptRow {
            sync_id: raw.sync_id.clone(),
            reason,
        };
        let created_at = DateTime::from_timestamp_micros(raw.created_at)
            .ok_or_else(|| corrupt(format!("created_at out of range: {}", raw.created_at)))?;
        let completed_at = match raw.completed_at {
            Some(us) => Some(
                DateTime::from_timestamp_micros(us)
                    .ok_or_else(|| corrupt(format!("completed_at out of range: {us}")))?,
            ),
            None => None,
        };
        let sync_type = raw
            .sync_type
            .parse::<EventCategory>()
            .map_err(|e| corrupt(e.to_string()))?;
        let status = raw
            .status
            .parse::<EventStatus>()
            .map_err(|e| corrupt(e.to_string()))?;
        let metadata = serde_json::from_str(&raw.metadata)
            .map_err(|e| corrupt(format!("metadata is not JSON: {e}")))?;

        Ok(SyncEvent {
            sync_id: EventId(raw.sync_id),
            agent_id: raw.agent_id,
            worktree_path: raw.worktree_path.map(PathBuf::from),
            flow_token: raw.flow_token,
            sync_type,
            source_location: raw.source_location,
            target_location: raw.target_location,
            pattern: raw.pattern,
            status,
            created_at,
            completed_at,
            created_by: raw.created_by,
            phi_flagged: raw.phi_flagged,
            provenance_hash: raw.provenance_hash,
            metadata,
            idempotency_key: raw.idempotency_key,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
