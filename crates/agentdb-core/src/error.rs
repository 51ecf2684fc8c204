use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not a git repository (or any parent): {0}")]
    NotARepository(PathBuf),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid sandbox identity '{0}': expected 12 lowercase hex characters")]
    InvalidIdentity(String),

    #[error("invalid sync type '{0}': must be one of workflow_transition, quality_gate, file_update")]
    InvalidSyncType(String),

    #[error("invalid sync status '{0}'")]
    InvalidStatus(String),

    #[error("invalid phase: {0}")]
    InvalidPhase(String),

    #[error("corrupt event row {sync_id}: {reason}")]
    CorruptRow { sync_id: String, reason: String },

    #[error("state store unavailable at {path}: {reason}")]
    StoreUnavailable { path: PathBuf, reason: String },

    #[error("compliance screening failed: {0}")]
    Screening(String),

    #[error("sync sink failed: {0}")]
    Sink(String),

    #[error("unknown sync rule '{0}'")]
    UnknownRule(String),

    #[error("invalid sync rule: {0}")]
    InvalidRule(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
