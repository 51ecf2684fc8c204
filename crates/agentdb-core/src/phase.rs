//! Workflow phase reconstruction.
//!
//! Phases are never stored. The current phase of a run is the phase named by
//! the `pattern` of its most recent event; anything unmapped reads as
//! "not started".

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, SyncError};
use crate::identity;
use crate::paths::PRIMARY_LABEL;
use crate::store::{Correlation, EventId, EventStatus, EventStore};

const READ_TIMEOUT: Duration = Duration::from_millis(5000);

// ---------------------------------------------------------------------------
// WorkflowPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    NotStarted,
    Specify,
    Plan,
    Tasks,
    Implement,
    Integrate,
    Release,
    Backmerge,
}

impl WorkflowPhase {
    pub fn all() -> &'static [WorkflowPhase] {
        &[
            WorkflowPhase::NotStarted,
            WorkflowPhase::Specify,
            WorkflowPhase::Plan,
            WorkflowPhase::Tasks,
            WorkflowPhase::Implement,
            WorkflowPhase::Integrate,
            WorkflowPhase::Release,
            WorkflowPhase::Backmerge,
        ]
    }

    pub fn number(self) -> u8 {
        match self {
            WorkflowPhase::NotStarted => 0,
            WorkflowPhase::Specify => 1,
            WorkflowPhase::Plan => 2,
            WorkflowPhase::Tasks => 3,
            WorkflowPhase::Implement => 4,
            WorkflowPhase::Integrate => 5,
            WorkflowPhase::Release => 6,
            WorkflowPhase::Backmerge => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowPhase::NotStarted => "not_started",
            WorkflowPhase::Specify => "specify",
            WorkflowPhase::Plan => "plan",
            WorkflowPhase::Tasks => "tasks",
            WorkflowPhase::Implement => "implement",
            WorkflowPhase::Integrate => "integrate",
            WorkflowPhase::Release => "release",
            WorkflowPhase::Backmerge => "backmerge",
        }
    }

    /// Event pattern that marks this phase complete.
    pub fn pattern(self) -> Option<&'static str> {
        match self {
            WorkflowPhase::NotStarted => None,
            WorkflowPhase::Specify => Some("phase_1_specify"),
            WorkflowPhase::Plan => Some("phase_2_plan"),
            WorkflowPhase::Tasks => Some("phase_3_tasks"),
            WorkflowPhase::Implement => Some("phase_4_implement"),
            WorkflowPhase::Integrate => Some("phase_5_integrate"),
            WorkflowPhase::Release => Some("phase_6_release"),
            WorkflowPhase::Backmerge => Some("phase_7_backmerge"),
        }
    }

    /// Command that starts the following phase; `None` once the workflow
    /// is complete.
    pub fn next_command(self) -> Option<&'static str> {
        match self {
            WorkflowPhase::NotStarted => Some("/1_specify"),
            WorkflowPhase::Specify => Some("/2_plan"),
            WorkflowPhase::Plan => Some("/3_tasks"),
            WorkflowPhase::Tasks => Some("/4_implement"),
            WorkflowPhase::Implement => Some("/5_integrate"),
            WorkflowPhase::Integrate => Some("/6_release"),
            WorkflowPhase::Release => Some("/7_backmerge"),
            WorkflowPhase::Backmerge => None,
        }
    }

    pub fn from_pattern(pattern: &str) -> Option<Self> {
        WorkflowPhase::all()
            .iter()
            .copied()
            .find(|p| p.pattern() == Some(pattern))
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowPhase {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        WorkflowPhase::all()
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| SyncError::InvalidPhase(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub correlation: Correlation,
    pub phase: WorkflowPhase,
    pub phase_number: u8,
    pub pattern: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub sync_id: Option<EventId>,
    pub suggested_next_action: Option<String>,
}

impl PhaseReport {
    fn not_started(correlation: &Correlation) -> Self {
        Self::for_phase(correlation, WorkflowPhase::NotStarted)
    }

    fn for_phase(correlation: &Correlation, phase: WorkflowPhase) -> Self {
        Self {
            correlation: correlation.clone(),
            phase,
            phase_number: phase.number(),
            pattern: None,
            last_sync_time: None,
            sync_id: None,
            suggested_next_action: phase.next_command().map(str::to_string),
        }
    }
}

/// "Store unavailable" is kept apart from "not started" so a misconfigured
/// store never looks like a fresh run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PhaseStatus {
    StoreUnavailable { path: PathBuf, reason: String },
    Known(PhaseReport),
}

impl PhaseStatus {
    pub fn phase(&self) -> Option<WorkflowPhase> {
        match self {
            PhaseStatus::Known(r) => Some(r.phase),
            PhaseStatus::StoreUnavailable { .. } => None,
        }
    }

    pub fn render_text(&self) -> String {
        let mut lines = vec!["Current Workflow State:".to_string()];
        let report = match self {
            PhaseStatus::StoreUnavailable { path, reason } => {
                lines.push(format!("  Error: state store unavailable at {}", path.display()));
                lines.push(format!("  Reason: {reason}"));
                lines.push("  Suggestion: initialise the shared store in the primary checkout".into());
                return lines.join("\n");
            }
            PhaseStatus::Known(report) => report,
        };

        lines.push(match &report.correlation {
            Correlation::FlowToken(t) => format!("  Flow token: {t}"),
            Correlation::Sandbox(p) => format!("  Worktree: {}", p.display()),
            Correlation::Primary => "  Location: Main repository".to_string(),
        });
        lines.push(format!(
            "  Phase: {} ({})",
            report.phase.number(),
            report.phase
        ));
        if let Some(at) = report.last_sync_time {
            lines.push(format!("  Last Sync: {}", at.format("%Y-%m-%d %H:%M:%S")));
        }
        if let Some(pattern) = &report.pattern {
            lines.push(format!("  Pattern: {pattern}"));
        }
        match &report.suggested_next_action {
            Some(next) => lines.push(format!("  Next: {next}")),
            None => lines.push("  Next: Workflow complete".to_string()),
        }
        lines.join("\n")
    }
}

/// Current phase for `correlation` according to the store at `store_path`.
pub fn current_phase(store_path: &Path, correlation: &Correlation) -> PhaseStatus {
    match read_latest(store_path, correlation) {
        Ok(report) => PhaseStatus::Known(report),
        Err(e) => {
            tracing::warn!(store = %store_path.display(), error = %e, "phase query failed");
            PhaseStatus::StoreUnavailable {
                path: store_path.to_path_buf(),
                reason: match e {
                    SyncError::StoreUnavailable { reason, .. } => reason,
                    other => other.to_string(),
                },
            }
        }
    }
}

fn read_latest(store_path: &Path, correlation: &Correlation) -> Result<PhaseReport> {
    let store = EventStore::open_existing(store_path, READ_TIMEOUT)?;
    if !store.is_initialized()? {
        return Ok(PhaseReport::not_started(correlation));
    }
    let Some(event) = store.query_latest(correlation)? else {
        return Ok(PhaseReport::not_started(correlation));
    };

    let phase = WorkflowPhase::from_pattern(&event.pattern).unwrap_or(WorkflowPhase::NotStarted);
    Ok(PhaseReport {
        pattern: Some(event.pattern),
        last_sync_time: Some(event.created_at),
        sync_id: Some(event.sync_id),
        ..PhaseReport::for_phase(correlation, phase)
    })
}

// ---------------------------------------------------------------------------
// Cross-sandbox activity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityEntry {
    /// Identity of the recording sandbox, or `main` for the primary.
    pub sandbox_identity: String,
    /// Directory name of the recording sandbox, or `main`.
    pub sandbox_label: String,
    pub flow_token: Option<String>,
    pub pattern: String,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
}

/// The `limit` most recent events across every sandbox.
pub fn all_recent_activity(store_path: &Path, limit: usize) -> Result<Vec<ActivityEntry>> {
    let store = EventStore::open_existing(store_path, READ_TIMEOUT)?;
    if !store.is_initialized()? {
        return Ok(Vec::new());
    }
    let entries = store
        .query_recent(limit)?
        .into_iter()
        .map(|event| {
            let (sandbox_identity, sandbox_label) = match &event.worktree_path {
                Some(path) => (
                    identity::identity_for(&path.to_string_lossy()).to_string(),
                    path.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| path.display().to_string()),
                ),
                None => (PRIMARY_LABEL.to_string(), PRIMARY_LABEL.to_string()),
            };
            ActivityEntry {
                sandbox_identity,
                sandbox_label,
                flow_token: event.flow_token,
                pattern: event.pattern,
                status: event.status,
                created_at: event.created_at,
            }
        })
        .collect();
    Ok(entries)
}

pub fn render_activity_text(entries: &[ActivityEntry]) -> String {
    if entries.is_empty() {
        return "No workflow records found.".to_string();
    }
    let rule = "=".repeat(50);
    let mut lines = vec!["Workflow State (All Sessions):".to_string(), rule.clone()];
    for e in entries {
        lines.push(format!(
            "[{}] {} ({}) - {}",
            e.sandbox_label,
            e.pattern,
            e.status,
            e.created_at.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    lines.push(rule);
    lines.push(format!("Total: {} records", entries.len()));
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EventCategory, SyncEvent};
    use tempfile::TempDir;

    fn store_with(dir: &TempDir, events: &[SyncEvent]) -> PathBuf {
        let path = dir.path().join("agentdb.db");
        let store = EventStore::open(&path, READ_TIMEOUT).unwrap();
        store.initialize_schema().unwrap();
        for e in events {
            store.append(e).unwrap();
        }
        path
    }

    fn token(t: &str) -> Correlation {
        Correlation::FlowToken(t.to_string())
    }

    #[test]
    fn phase_table() {
        assert_eq!(WorkflowPhase::from_pattern("phase_3_tasks"), Some(WorkflowPhase::Tasks));
        assert_eq!(WorkflowPhase::from_pattern("quality_gate_passed"), None);
        assert_eq!(WorkflowPhase::Release.next_command(), Some("/7_backmerge"));
        assert_eq!(WorkflowPhase::Backmerge.next_command(), None);
        assert_eq!("integrate".parse::<WorkflowPhase>().unwrap().number(), 5);
        assert!("deploy".parse::<WorkflowPhase>().is_err());
    }

    #[test]
    fn single_plan_event_suggests_tasks() {
        let dir = TempDir::new().unwrap();
        let event = SyncEvent::new("planner", EventCategory::WorkflowTransition, "phase_2_plan")
            .with_flow_token(Some("T".into()));
        let path = store_with(&dir, &[event.clone()]);

        let PhaseStatus::Known(report) = current_phase(&path, &token("T")) else {
            panic!("expected a known phase");
        };
        assert_eq!(report.phase, WorkflowPhase::Plan);
        assert_eq!(report.suggested_next_action.as_deref(), Some("/3_tasks"));
        assert_eq!(report.sync_id, Some(event.sync_id));
        assert!(report.last_sync_time.is_some());
    }

    #[test]
    fn unseen_token_is_not_started() {
        let dir = TempDir::new().unwrap();
        let path = store_with(&dir, &[]);
        let status = current_phase(&path, &token("feature/unseen"));
        assert_eq!(status.phase(), Some(WorkflowPhase::NotStarted));
        let PhaseStatus::Known(report) = status else { unreachable!() };
        assert_eq!(report.suggested_next_action.as_deref(), Some("/1_specify"));
        assert!(report.last_sync_time.is_none());
    }

    #[test]
    fn unmapped_pattern_is_not_started_but_reported() {
        let dir = TempDir::new().unwrap();
        let e = SyncEvent::new("gate", EventCategory::QualityGate, "quality_gate_passed")
            .with_flow_token(Some("T".into()));
        let path = store_with(&dir, &[e]);
        let PhaseStatus::Known(report) = current_phase(&path, &token("T")) else {
            panic!("expected a known phase");
        };
        assert_eq!(report.phase, WorkflowPhase::NotStarted);
        assert_eq!(report.pattern.as_deref(), Some("quality_gate_passed"));
        assert_eq!(report.suggested_next_action.as_deref(), Some("/1_specify"));
    }

    #[test]
    fn missing_store_is_distinct_from_not_started() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nowhere/agentdb.db");
        let status = current_phase(&path, &Correlation::Primary);
        assert!(matches!(status, PhaseStatus::StoreUnavailable { .. }));
        assert!(status.render_text().contains("unavailable"));
        assert!(!path.exists());
    }

    #[test]
    fn empty_file_without_tables_is_not_started() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agentdb.db");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            current_phase(&path, &Correlation::Primary).phase(),
            Some(WorkflowPhase::NotStarted)
        );
    }

    #[test]
    fn render_text_for_completed_workflow() {
        let dir = TempDir::new().unwrap();
        let e = SyncEvent::new("release", EventCategory::WorkflowTransition, "phase_7_backmerge");
        let path = store_with(&dir, &[e]);
        let text = current_phase(&path, &Correlation::Primary).render_text();
        assert!(text.contains("Location: Main repository"));
        assert!(text.contains("Phase: 7 (backmerge)"));
        assert!(text.contains("Next: Workflow complete"));
    }

    #[test]
    fn activity_labels_primary_and_sandboxes() {
        let dir = TempDir::new().unwrap();
        let t0 = Utc::now();
        let path = store_with(
            &dir,
            &[
                SyncEvent::new("a", EventCategory::WorkflowTransition, "phase_1_specify")
                    .with_created_at(t0 - chrono::Duration::seconds(5)),
                SyncEvent::new("b", EventCategory::WorkflowTransition, "phase_2_plan")
                    .with_worktree_path(Some(PathBuf::from("/w/proj_feature_x")))
                    .with_created_at(t0),
            ],
        );
        let entries = all_recent_activity(&path, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sandbox_label, "proj_feature_x");
        assert_eq!(
            entries[0].sandbox_identity,
            identity::identity_for("/w/proj_feature_x").to_string()
        );
        assert_eq!(entries[1].sandbox_identity, "main");

        let text = render_activity_text(&entries);
        assert!(text.contains("[proj_feature_x] phase_2_plan (completed)"));
        assert!(text.ends_with("Total: 2 records"));
        assert_eq!(render_activity_text(&[]), "No workflow records found.");
    }

    #[test]
    fn activity_on_missing_store_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(all_recent_activity(&dir.path().join("missing.db"), 5).is_err());
    }
}
