//! Flow tokens: the correlation key grouping one workflow run's events.
//!
//! Tokens are never stored on their own; they are re-derived from where the
//! process runs. Derivation order:
//!
//! 1. sandbox directory `<project>_<kind>_<suffix>` gives `<kind>/<suffix>`
//! 2. a branch under a recognised namespace is used verbatim
//! 3. otherwise `ad-hoc-<8 hex>`, random per call; a long-lived caller keeps
//!    the first one it draws so its steps stay correlated

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::config::TokenRules;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowTokenKind {
    /// From the sandbox directory name.
    Worktree,
    /// From the current branch.
    Branch,
    AdHoc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowToken {
    pub value: String,
    pub kind: FlowTokenKind,
}

impl FlowToken {
    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn is_stable(&self) -> bool {
        self.kind != FlowTokenKind::AdHoc
    }
}

impl fmt::Display for FlowToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Derive the token for a process running in `cwd` on `branch`. Never fails:
/// unrecognised context falls through to an ad-hoc token.
pub fn derive_token(cwd: &Path, branch: Option<&str>, rules: &TokenRules) -> FlowToken {
    derive_stable_token(cwd, branch, rules).unwrap_or_else(ad_hoc_token)
}

/// The deterministic part of [`derive_token`]: `None` where that would fall
/// back to a random token. Read paths use this to find the key a writer in
/// the same context would have used.
pub fn derive_stable_token(
    cwd: &Path,
    branch: Option<&str>,
    rules: &TokenRules,
) -> Option<FlowToken> {
    if let Some(token) = token_from_dir_name(cwd, &rules.kinds) {
        return Some(token);
    }
    let branch = branch.map(str::trim).filter(|b| !b.is_empty())?;
    rules
        .namespaces
        .iter()
        .any(|ns| !ns.is_empty() && branch.starts_with(ns.as_str()))
        .then(|| FlowToken {
            value: branch.to_string(),
            kind: FlowTokenKind::Branch,
        })
}

fn token_from_dir_name(cwd: &Path, kinds: &[String]) -> Option<FlowToken> {
    if kinds.is_empty() {
        return None;
    }
    let name = cwd.file_name()?.to_str()?;
    let alternatives = kinds
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    let re = Regex::new(&format!(
        r"^(?P<project>.+?)_(?P<kind>{alternatives})_(?P<suffix>.+)$"
    ))
    .ok()?;
    let caps = re.captures(name)?;
    Some(FlowToken {
        value: format!("{}/{}", &caps["kind"], &caps["suffix"]),
        kind: FlowTokenKind::Worktree,
    })
}

/// A fresh random fallback token.
pub fn ad_hoc_token() -> FlowToken {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    FlowToken {
        value: format!("ad-hoc-{}", &hex[..8]),
        kind: FlowTokenKind::AdHoc,
    }
}

static ISSUE_RE: OnceLock<Regex> = OnceLock::new();

fn issue_re() -> &'static Regex {
    ISSUE_RE.get_or_init(|| Regex::new(r"issue-(\d+)").unwrap())
}

/// Issue number embedded in a token (`…issue-42…`), if any.
pub fn extract_correlated_number(token: &str) -> Option<u64> {
    issue_re()
        .captures(token)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
