use crate::error::Result;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_ENABLED: &str = "SYNC_ENGINE_ENABLED";
pub const ENV_STORE_PATH: &str = "AGENTDB_PATH";
pub const ENV_BUSY_TIMEOUT: &str = "AGENTDB_BUSY_TIMEOUT_MS";
pub const ENV_RETENTION_DAYS: &str = "AGENTDB_RETENTION_DAYS";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// TokenRules
// ---------------------------------------------------------------------------

/// Naming conventions the flow-token deriver recognises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRules {
    /// Sandbox kinds in `<project>_<kind>_<suffix>` directory names.
    #[serde(default = "default_kinds")]
    pub kinds: Vec<String>,
    /// Branch prefixes used verbatim as tokens.
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<String>,
}

fn default_kinds() -> Vec<String> {
    vec!["feature".to_string(), "hotfix".to_string()]
}

fn default_namespaces() -> Vec<String> {
    vec!["contrib/".to_string(), "claude/".to_string()]
}

impl Default for TokenRules {
    fn default() -> Self {
        Self {
            kinds: default_kinds(),
            namespaces: default_namespaces(),
        }
    }
}

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Explicit store location; `None` means locate it from the checkout.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub tokens: TokenRules,
}

fn default_busy_timeout() -> u64 {
    5000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            store_path: None,
            busy_timeout_ms: default_busy_timeout(),
            retention_days: None,
            tokens: TokenRules::default(),
        }
    }
}

impl SyncConfig {
    /// Read `<primary>/.claude-state/sync.yaml`. A missing file yields defaults.
    pub fn load(primary_root: &Path) -> Result<Self> {
        let path = paths::config_path(primary_root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: SyncConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, primary_root: &Path) -> Result<()> {
        let path = paths::config_path(primary_root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Overlay environment-style overrides. Unparseable values leave the
    /// field untouched and come back as warnings.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Vec<ConfigWarning>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut warnings = Vec::new();
        for (key, value) in vars {
            let value = value.as_ref().trim();
            match key.as_ref() {
                ENV_ENABLED => match parse_flag(value) {
                    Some(flag) => self.enabled = flag,
                    None => warnings.push(ConfigWarning::warning(format!(
                        "{ENV_ENABLED}='{value}' is not a boolean; keeping {}",
                        self.enabled
                    ))),
                },
                ENV_STORE_PATH if !value.is_empty() => {
                    self.store_path = Some(PathBuf::from(value));
                }
                ENV_BUSY_TIMEOUT => match value.parse() {
                    Ok(ms) => self.busy_timeout_ms = ms,
                    Err(_) => warnings.push(ConfigWarning::warning(format!(
                        "{ENV_BUSY_TIMEOUT}='{value}' is not a number of milliseconds"
                    ))),
                },
                ENV_RETENTION_DAYS => match value.parse() {
                    Ok(days) => self.retention_days = Some(days),
                    Err(_) => warnings.push(ConfigWarning::warning(format!(
                        "{ENV_RETENTION_DAYS}='{value}' is not a number of days"
                    ))),
                },
                _ => {}
            }
        }
        warnings
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> (Self, Vec<ConfigWarning>) {
        let mut cfg = Self::default();
        let warnings = cfg.apply_env(std::env::vars());
        (cfg, warnings)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.tokens.kinds.is_empty() {
            warnings.push(ConfigWarning::warning(
                "tokens.kinds is empty; sandbox directory names will never produce a token",
            ));
        }
        for kind in &self.tokens.kinds {
            if kind.is_empty() || !kind.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                warnings.push(ConfigWarning::error(format!(
                    "token kind '{kind}' must be non-empty and alphanumeric"
                )));
            }
        }
        for ns in &self.tokens.namespaces {
            if !ns.ends_with('/') {
                warnings.push(ConfigWarning::warning(format!(
                    "namespace '{ns}' has no trailing '/'; it will also match longer prefixes"
                )));
            }
        }

        if self.busy_timeout_ms == 0 {
            warnings.push(ConfigWarning::warning(
                "busy_timeout_ms=0: concurrent writers will fail immediately on lock contention",
            ));
        }

        if let Some(path) = &self.store_path {
            if path.is_relative() {
                warnings.push(ConfigWarning::warning(format!(
                    "store_path '{}' is relative; it resolves against each caller's working directory",
                    path.display()
                )));
            }
        }

        if self.retention_days == Some(0) {
            warnings.push(ConfigWarning::warning(
                "retention_days=0 would prune every event",
            ));
        }

        warnings
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_disabled() {
        let cfg = SyncConfig::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.busy_timeout_ms, 5000);
        assert_eq!(cfg.tokens.kinds, vec!["feature", "hotfix"]);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        assert_eq!(SyncConfig::load(dir.path()).unwrap(), SyncConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let cfg = SyncConfig {
            enabled: true,
            retention_days: Some(30),
            ..SyncConfig::default()
        };
        cfg.save(dir.path()).unwrap();
        assert_eq!(SyncConfig::load(dir.path()).unwrap(), cfg);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        crate::io::atomic_write(
            &paths::config_path(dir.path()),
            b"enabled: true\ntokens:\n  namespaces: [\"agent/\"]\n",
        )
        .unwrap();
        let cfg = SyncConfig::load(dir.path()).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.tokens.namespaces, vec!["agent/"]);
        assert_eq!(cfg.tokens.kinds, default_kinds());
        assert_eq!(cfg.busy_timeout_ms, 5000);
    }

    #[test]
    fn env_overrides() {
        let mut cfg = SyncConfig::default();
        let warnings = cfg.apply_env([
            ("SYNC_ENGINE_ENABLED", "Yes"),
            ("AGENTDB_PATH", "/srv/agentdb.db"),
            ("AGENTDB_BUSY_TIMEOUT_MS", "250"),
            ("UNRELATED", "x"),
        ]);
        assert!(warnings.is_empty());
        assert!(cfg.enabled);
        assert_eq!(cfg.store_path, Some(PathBuf::from("/srv/agentdb.db")));
        assert_eq!(cfg.busy_timeout_ms, 250);
    }

    #[test]
    fn unparseable_env_values_warn() {
        let mut cfg = SyncConfig::default();
        let warnings = cfg.apply_env([
            ("SYNC_ENGINE_ENABLED", "maybe"),
            ("AGENTDB_RETENTION_DAYS", "forever"),
        ]);
        assert_eq!(warnings.len(), 2);
        assert!(!cfg.enabled);
        assert_eq!(cfg.retention_days, None);
    }

    #[test]
    fn validate_flags_questionable_settings() {
        let cfg = SyncConfig {
            busy_timeout_ms: 0,
            store_path: Some(PathBuf::from("relative/agentdb.db")),
            tokens: TokenRules {
                kinds: vec!["bad kind".to_string()],
                namespaces: vec!["contrib".to_string()],
            },
            ..SyncConfig::default()
        };
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 4);
        assert!(warnings.iter().any(|w| w.level == WarnLevel::Error));
    }
}
