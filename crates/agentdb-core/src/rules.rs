//! Declarative sync rules.
//!
//! A rule names a trigger (agent, action, and a partial state pattern) and a
//! target (agent, action, parameter template). When a recorded action matches,
//! the rule fires once per distinct `(rule, flow token, state)`: a row lands in
//! `sync_executions` and a `sync_initiated` entry in `sync_audit_trail`. Target
//! agents are not invoked here; the pending execution row is the hand-off.
//!
//! Both execution tables are append-only. Triggers in the schema reject any
//! UPDATE or DELETE.

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};
use crate::store::{EventId, EventStatus, EventStore};

pub(crate) const RULE_SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sync_rules (
        rule_id          TEXT PRIMARY KEY,
        trigger_agent_id TEXT NOT NULL,
        trigger_action   TEXT NOT NULL,
        trigger_pattern  TEXT NOT NULL DEFAULT '{}',
        target_agent_id  TEXT NOT NULL,
        target_action    TEXT NOT NULL,
        params           TEXT NOT NULL DEFAULT '{}',
        priority         INTEGER NOT NULL DEFAULT 0,
        enabled          INTEGER NOT NULL DEFAULT 1,
        updated_at       INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_rules_trigger
        ON sync_rules (trigger_agent_id, trigger_action, enabled, priority)",
    "CREATE TABLE IF NOT EXISTS sync_executions (
        execution_id    TEXT PRIMARY KEY,
        rule_id         TEXT NOT NULL REFERENCES sync_rules (rule_id),
        event_id        TEXT NOT NULL,
        flow_token      TEXT NOT NULL,
        provenance_hash TEXT NOT NULL UNIQUE,
        trigger_state   TEXT NOT NULL,
        resolved_params TEXT NOT NULL,
        exec_status     TEXT NOT NULL
            CHECK (exec_status IN ('pending', 'in_progress', 'completed', 'failed', 'rolled_back')),
        execution_order INTEGER NOT NULL,
        phi_accessed    INTEGER NOT NULL DEFAULT 0,
        created_at      INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_exec_flow_order
        ON sync_executions (flow_token, execution_order)",
    "CREATE TABLE IF NOT EXISTS sync_audit_trail (
        audit_id           TEXT PRIMARY KEY,
        rule_id            TEXT NOT NULL,
        execution_id       TEXT NOT NULL,
        event_type         TEXT NOT NULL,
        actor              TEXT NOT NULL,
        actor_role         TEXT NOT NULL,
        phi_involved       INTEGER NOT NULL DEFAULT 0,
        compliance_context TEXT NOT NULL,
        event_details      TEXT NOT NULL,
        created_at         INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_audit_created
        ON sync_audit_trail (created_at)",
    "CREATE TRIGGER IF NOT EXISTS sync_executions_no_update
        BEFORE UPDATE ON sync_executions
    BEGIN
        SELECT RAISE(ABORT, 'sync_executions is append-only');
    END",
    "CREATE TRIGGER IF NOT EXISTS sync_executions_no_delete
        BEFORE DELETE ON sync_executions
    BEGIN
        SELECT RAISE(ABORT, 'sync_executions is append-only');
    END",
    "CREATE TRIGGER IF NOT EXISTS sync_audit_trail_no_update
        BEFORE UPDATE ON sync_audit_trail
    BEGIN
        SELECT RAISE(ABORT, 'sync_audit_trail is append-only');
    END",
    "CREATE TRIGGER IF NOT EXISTS sync_audit_trail_no_delete
        BEFORE DELETE ON sync_audit_trail
    BEGIN
        SELECT RAISE(ABORT, 'sync_audit_trail is append-only');
    END",
];

pub const AUDIT_ACTOR: &str = "sync_engine";
pub const AUDIT_ACTOR_ROLE: &str = "autonomous_agent";
pub const SYNC_INITIATED: &str = "sync_initiated";

// ---------------------------------------------------------------------------
// SyncRule
// ---------------------------------------------------------------------------

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRule {
    pub rule_id: String,
    pub trigger_agent_id: String,
    pub trigger_action: String,
    /// Partial state the trigger must contain. `{}` matches any state.
    #[serde(default = "empty_object")]
    pub trigger_pattern: Value,
    pub target_agent_id: String,
    pub target_action: String,
    /// Parameter template; `${trigger_state.a.b}` placeholders are filled
    /// from the triggering state.
    #[serde(default = "empty_object")]
    pub params: Value,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl SyncRule {
    pub fn new(
        rule_id: impl Into<String>,
        trigger: (impl Into<String>, impl Into<String>),
        target: (impl Into<String>, impl Into<String>),
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            trigger_agent_id: trigger.0.into(),
            trigger_action: trigger.1.into(),
            trigger_pattern: empty_object(),
            target_agent_id: target.0.into(),
            target_action: target.1.into(),
            params: empty_object(),
            priority: 0,
            enabled: true,
        }
    }

    pub fn with_pattern(mut self, pattern: Value) -> Self {
        self.trigger_pattern = pattern;
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("rule_id", &self.rule_id),
            ("trigger_agent_id", &self.trigger_agent_id),
            ("trigger_action", &self.trigger_action),
            ("target_agent_id", &self.target_agent_id),
            ("target_action", &self.target_action),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(SyncError::InvalidRule(format!("{field} must not be empty")));
            }
        }
        if !self.trigger_pattern.is_object() {
            return Err(SyncError::InvalidRule(format!(
                "{}: trigger_pattern must be a JSON object",
                self.rule_id
            )));
        }
        if !self.params.is_object() {
            return Err(SyncError::InvalidRule(format!(
                "{}: params must be a JSON object",
                self.rule_id
            )));
        }
        Ok(())
    }

    pub fn matches(&self, actor: &str, action: &str, state: &Value) -> bool {
        self.enabled
            && self.trigger_agent_id == actor
            && self.trigger_action == action
            && pattern_matches(&self.trigger_pattern, state)
    }

    /// `sha256("<rule_id>:<flow_token>:<state as sorted compact JSON>")`.
    pub fn provenance_hash(&self, flow_token: &str, state: &Value) -> Result<String> {
        let payload = serde_json::to_string(state)?;
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{flow_token}:{payload}", self.rule_id).as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Target action with its parameter template filled from `state`.
    pub fn resolve_target(&self, state: &Value) -> Value {
        json!({
            "agent_id": self.target_agent_id,
            "action": self.target_action,
            "params": resolve_params(&self.params, state),
        })
    }
}

impl fmt::Display for SyncRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.trigger_agent_id, self.trigger_action, self.target_agent_id, self.target_action
        )
    }
}

#[derive(Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<SyncRule>,
}

/// Rules from a YAML document with a top-level `rules:` list.
pub fn load_rule_file(path: &Path) -> Result<Vec<SyncRule>> {
    let raw = std::fs::read_to_string(path)?;
    let file: RuleFile = serde_yaml::from_str(&raw)?;
    for rule in &file.rules {
        rule.validate()?;
    }
    Ok(file.rules)
}

// ---------------------------------------------------------------------------
// Matching and parameter templates
// ---------------------------------------------------------------------------

/// Whether `state` contains `pattern`. Objects match key by key, recursively;
/// any other value must be equal.
pub fn pattern_matches(pattern: &Value, state: &Value) -> bool {
    match (pattern, state) {
        (Value::Object(expected), Value::Object(actual)) => {
            expected.iter().all(|(key, want)| match actual.get(key) {
                Some(have) if want.is_object() && have.is_object() => pattern_matches(want, have),
                Some(have) => want == have,
                None => false,
            })
        }
        (Value::Object(expected), _) => expected.is_empty(),
        _ => pattern == state,
    }
}

/// Value at a dotted path such as `coverage.percentage`.
pub fn nested_value<'a>(state: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(state, |node, key| node.as_object()?.get(key))
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{trigger_state\.([^}]+)\}").expect("valid regex"))
}

/// Fill `${trigger_state.path}` placeholders in every string of `template`.
///
/// A string that is exactly one placeholder takes the referenced value with
/// its type. Placeholders inside longer strings are interpolated: strings
/// as-is, anything else as JSON. A missing path resolves to `null` and is
/// logged.
pub fn resolve_params(template: &Value, state: &Value) -> Value {
    match template {
        Value::String(s) => resolve_string(s, state),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_params(v, state)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_params(v, state)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn lookup(state: &Value, path: &str) -> Value {
    match nested_value(state, path) {
        Some(v) => v.clone(),
        None => {
            tracing::warn!(path, "missing path in trigger state");
            Value::Null
        }
    }
}

fn resolve_string(s: &str, state: &Value) -> Value {
    let re = placeholder_re();
    if let Some(caps) = re.captures(s) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
            return lookup(state, &caps[1]);
        }
    } else {
        return Value::String(s.to_string());
    }
    let filled = re.replace_all(s, |caps: &regex::Captures<'_>| match lookup(state, &caps[1]) {
        Value::String(text) => text,
        other => other.to_string(),
    });
    Value::String(filled.into_owned())
}

// ---------------------------------------------------------------------------
// Executions and audit trail
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn generate() -> Self {
        ExecutionId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleExecution {
    pub execution_id: ExecutionId,
    pub rule_id: String,
    pub event_id: EventId,
    pub flow_token: String,
    pub provenance_hash: String,
    pub trigger_state: Value,
    pub resolved_params: Value,
    pub status: EventStatus,
    /// 1-based position among the executions of this flow token.
    pub execution_order: u32,
    pub phi_accessed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub audit_id: String,
    pub rule_id: String,
    pub execution_id: ExecutionId,
    pub event_type: String,
    pub actor: String,
    pub actor_role: String,
    pub phi_involved: bool,
    pub compliance_context: Value,
    pub event_details: Value,
    pub created_at: DateTime<Utc>,
}

/// A recorded action, as seen by rule evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Trigger<'a> {
    pub event: &'a EventId,
    pub actor: &'a str,
    pub action: &'a str,
    pub flow_token: &'a str,
    pub state: &'a Value,
    pub phi_involved: bool,
    pub justification: Option<&'a str>,
}

/// Fire every enabled rule matching `trigger`, highest priority first.
///
/// A rule that already fired for the same flow token and state is skipped.
/// A rule that fails to record is logged and the rest still run. Returns the
/// new execution ids.
pub fn fire_matching(store: &EventStore, trigger: &Trigger<'_>) -> Result<Vec<ExecutionId>> {
    let rules = store.matching_rules(trigger.actor, trigger.action, trigger.state)?;
    let mut fired = Vec::new();
    for rule in rules {
        match fire_one(store, &rule, trigger) {
            Ok(Some(id)) => fired.push(id),
            Ok(None) => {
                tracing::debug!(rule = %rule.rule_id, "rule already fired for this state");
            }
            Err(e) => {
                tracing::error!(rule = %rule.rule_id, error = %e, "sync rule failed; continuing");
            }
        }
    }
    Ok(fired)
}

fn fire_one(store: &EventStore, rule: &SyncRule, trigger: &Trigger<'_>) -> Result<Option<ExecutionId>> {
    let hash = rule.provenance_hash(trigger.flow_token, trigger.state)?;
    if store.execution_exists(&hash)? {
        return Ok(None);
    }

    let now = Utc::now();
    let target = rule.resolve_target(trigger.state);
    let execution = RuleExecution {
        execution_id: ExecutionId::generate(),
        rule_id: rule.rule_id.clone(),
        event_id: trigger.event.clone(),
        flow_token: trigger.flow_token.to_string(),
        provenance_hash: hash,
        trigger_state: trigger.state.clone(),
        resolved_params: target["params"].clone(),
        status: EventStatus::Pending,
        execution_order: store.next_execution_order(trigger.flow_token)?,
        phi_accessed: trigger.phi_involved,
        created_at: now,
    };

    let mut compliance = json!({"purpose": "Workflow synchronization"});
    if let Some(justification) = trigger.justification {
        compliance["justification"] = Value::String(justification.to_string());
    }
    let audit = AuditEntry {
        audit_id: uuid::Uuid::new_v4().to_string(),
        rule_id: rule.rule_id.clone(),
        execution_id: execution.execution_id.clone(),
        event_type: SYNC_INITIATED.to_string(),
        actor: AUDIT_ACTOR.to_string(),
        actor_role: AUDIT_ACTOR_ROLE.to_string(),
        phi_involved: trigger.phi_involved,
        compliance_context: compliance,
        event_details: json!({
            "trigger_agent": rule.trigger_agent_id,
            "trigger_action": rule.trigger_action,
            "target_agent": rule.target_agent_id,
            "target_action": rule.target_action,
            "flow_token": trigger.flow_token,
            "resolved_params": execution.resolved_params,
        }),
        created_at: now,
    };

    if !store.record_execution(&execution, &audit)? {
        return Ok(None);
    }
    tracing::info!(
        rule = %rule.rule_id,
        execution = %execution.execution_id,
        order = execution.execution_order,
        "sync recorded: {rule}"
    );
    Ok(Some(execution.execution_id))
}

// ---------------------------------------------------------------------------
// EventStore: rule tables
// ---------------------------------------------------------------------------

const RULE_COLUMNS: &str = "rule_id, trigger_agent_id, trigger_action, trigger_pattern, \
     target_agent_id, target_action, params, priority, enabled";

const EXECUTION_COLUMNS: &str = "execution_id, rule_id, event_id, flow_token, provenance_hash, \
     trigger_state, resolved_params, exec_status, execution_order, phi_accessed, created_at";

const AUDIT_COLUMNS: &str = "audit_id, rule_id, execution_id, event_type, actor, actor_role, \
     phi_involved, compliance_context, event_details, created_at";

fn timestamp(us: i64, id: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us).ok_or_else(|| SyncError::CorruptRow {
        sync_id: id.to_string(),
        reason: format!("created_at out of range: {us}"),
    })
}

fn json_column(raw: &str, id: &str, column: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| SyncError::CorruptRow {
        sync_id: id.to_string(),
        reason: format!("{column} is not JSON: {e}"),
    })
}

struct RawRule {
    rule_id: String,
    trigger_agent_id: String,
    trigger_action: String,
    trigger_pattern: String,
    target_agent_id: String,
    target_action: String,
    params: String,
    priority: i64,
    enabled: bool,
}

impl RawRule {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            rule_id: row.get(0)?,
            trigger_agent_id: row.get(1)?,
            trigger_action: row.get(2)?,
            trigger_pattern: row.get(3)?,
            target_agent_id: row.get(4)?,
            target_action: row.get(5)?,
            params: row.get(6)?,
            priority: row.get(7)?,
            enabled: row.get(8)?,
        })
    }

    fn decode(self) -> Result<SyncRule> {
        Ok(SyncRule {
            trigger_pattern: json_column(&self.trigger_pattern, &self.rule_id, "trigger_pattern")?,
            params: json_column(&self.params, &self.rule_id, "params")?,
            rule_id: self.rule_id,
            trigger_agent_id: self.trigger_agent_id,
            trigger_action: self.trigger_action,
            target_agent_id: self.target_agent_id,
            target_action: self.target_action,
            priority: self.priority,
            enabled: self.enabled,
        })
    }
}

impl EventStore {
    /// Insert or replace a rule by id.
    pub fn upsert_rule(&self, rule: &SyncRule) -> Result<()> {
        rule.validate()?;
        self.conn().execute(
            "INSERT INTO sync_rules (
                rule_id, trigger_agent_id, trigger_action, trigger_pattern,
                target_agent_id, target_action, params, priority, enabled, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(rule_id) DO UPDATE SET
                trigger_agent_id = excluded.trigger_agent_id,
                trigger_action   = excluded.trigger_action,
                trigger_pattern  = excluded.trigger_pattern,
                target_agent_id  = excluded.target_agent_id,
                target_action    = excluded.target_action,
                params           = excluded.params,
                priority         = excluded.priority,
                enabled          = excluded.enabled,
                updated_at       = excluded.updated_at",
            params![
                rule.rule_id,
                rule.trigger_agent_id,
                rule.trigger_action,
                serde_json::to_string(&rule.trigger_pattern)?,
                rule.target_agent_id,
                rule.target_action,
                serde_json::to_string(&rule.params)?,
                rule.priority,
                rule.enabled,
                Utc::now().timestamp_micros(),
            ],
        )?;
        tracing::debug!(rule = %rule.rule_id, "sync rule saved");
        Ok(())
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE sync_rules SET enabled = ?2, updated_at = ?3 WHERE rule_id = ?1",
            params![rule_id, enabled, Utc::now().timestamp_micros()],
        )?;
        if changed == 0 {
            return Err(SyncError::UnknownRule(rule_id.to_string()));
        }
        Ok(())
    }

    /// Every rule, highest priority first.
    pub fn list_rules(&self) -> Result<Vec<SyncRule>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM sync_rules ORDER BY priority DESC, rule_id"
        ))?;
        let rows = stmt.query_map([], RawRule::from_row)?;
        let mut rules = Vec::new();
        for raw in rows {
            rules.push(raw?.decode()?);
        }
        Ok(rules)
    }

    /// Enabled rules for `actor`/`action` whose pattern `state` contains,
    /// highest priority first. A rule with an unreadable pattern is logged
    /// and skipped.
    pub fn matching_rules(&self, actor: &str, action: &str, state: &Value) -> Result<Vec<SyncRule>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM sync_rules
             WHERE trigger_agent_id = ?1 AND trigger_action = ?2 AND enabled = 1
             ORDER BY priority DESC, rule_id"
        ))?;
        let rows = stmt.query_map(params![actor, action], RawRule::from_row)?;
        let mut matched = Vec::new();
        for raw in rows {
            match raw?.decode() {
                Ok(rule) if rule.matches(actor, action, state) => matched.push(rule),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "unreadable sync rule; skipping"),
            }
        }
        Ok(matched)
    }

    fn execution_exists(&self, provenance_hash: &str) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM sync_executions WHERE provenance_hash = ?1",
                params![provenance_hash],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn next_execution_order(&self, flow_token: &str) -> Result<u32> {
        let max: Option<i64> = self.conn().query_row(
            "SELECT MAX(execution_order) FROM sync_executions WHERE flow_token = ?1",
            params![flow_token],
            |r| r.get(0),
        )?;
        Ok(u32::try_from(max.unwrap_or(0).max(0)).unwrap_or(u32::MAX).saturating_add(1))
    }

    /// Write an execution and its audit entry. Returns `false` when an
    /// execution with the same provenance hash already exists.
    fn record_execution(&self, execution: &RuleExecution, audit: &AuditEntry) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT INTO sync_executions (
                execution_id, rule_id, event_id, flow_token, provenance_hash,
                trigger_state, resolved_params, exec_status, execution_order,
                phi_accessed, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(provenance_hash) DO NOTHING",
            params![
                execution.execution_id.as_str(),
                execution.rule_id,
                execution.event_id.as_str(),
                execution.flow_token,
                execution.provenance_hash,
                serde_json::to_string(&execution.trigger_state)?,
                serde_json::to_string(&execution.resolved_params)?,
                execution.status.as_str(),
                execution.execution_order,
                execution.phi_accessed,
                execution.created_at.timestamp_micros(),
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        self.conn().execute(
            "INSERT INTO sync_audit_trail (
                audit_id, rule_id, execution_id, event_type, actor, actor_role,
                phi_involved, compliance_context, event_details, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                audit.audit_id,
                audit.rule_id,
                audit.execution_id.as_str(),
                audit.event_type,
                audit.actor,
                audit.actor_role,
                audit.phi_involved,
                serde_json::to_string(&audit.compliance_context)?,
                serde_json::to_string(&audit.event_details)?,
                audit.created_at.timestamp_micros(),
            ],
        )?;
        Ok(true)
    }

    /// The `limit` most recent executions.
    pub fn query_executions(&self, limit: usize) -> Result<Vec<RuleExecution>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM sync_executions
             ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let mut rows = stmt.query(params![limit])?;
        let mut executions = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let status: String = row.get(7)?;
            let order: i64 = row.get(8)?;
            executions.push(RuleExecution {
                rule_id: row.get(1)?,
                event_id: EventId::from(row.get::<_, String>(2)?),
                flow_token: row.get(3)?,
                provenance_hash: row.get(4)?,
                trigger_state: json_column(&row.get::<_, String>(5)?, &id, "trigger_state")?,
                resolved_params: json_column(&row.get::<_, String>(6)?, &id, "resolved_params")?,
                status: status.parse()?,
                execution_order: u32::try_from(order).unwrap_or(0),
                phi_accessed: row.get(9)?,
                created_at: timestamp(row.get(10)?, &id)?,
                execution_id: ExecutionId(id),
            });
        }
        Ok(executions)
    }

    /// The `limit` most recent audit-trail entries.
    pub fn query_audit_trail(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM sync_audit_trail
             ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let mut rows = stmt.query(params![limit])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            entries.push(AuditEntry {
                rule_id: row.get(1)?,
                execution_id: ExecutionId(row.get(2)?),
                event_type: row.get(3)?,
                actor: row.get(4)?,
                actor_role: row.get(5)?,
                phi_involved: row.get(6)?,
                compliance_context: json_column(&row.get::<_, String>(7)?, &id, "compliance_context")?,
                event_details: json_column(&row.get::<_, String>(8)?, &id, "event_details")?,
                created_at: timestamp(row.get(9)?, &id)?,
                audit_id: id,
            });
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
