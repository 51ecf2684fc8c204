//! Stable sandbox identity.
//!
//! A sandbox (the primary checkout or any worktree derived from it) is
//! identified by the first 12 hex characters of the SHA-256 of its absolute
//! path. The identity is recomputed on demand and persisted once into
//! `.claude-state/.worktree-id`; the marker is rewritten only when it no
//! longer matches (the checkout moved, e.g. a container remounted it
//! elsewhere).

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};
use crate::{io, paths};

pub const IDENTITY_LEN: usize = 12;

// ---------------------------------------------------------------------------
// SandboxId
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for SandboxId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let valid = s.len() == IDENTITY_LEN
            && s.bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(SyncError::InvalidIdentity(s.to_string()));
        }
        Ok(SandboxId(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Computation
// ---------------------------------------------------------------------------

/// Hash an already-normalised path string into an identity.
pub fn identity_for(path: &str) -> SandboxId {
    let digest = Sha256::digest(path.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(IDENTITY_LEN);
    SandboxId(hex)
}

/// Normalise `path` the way identities are computed: canonical when the path
/// exists, otherwise absolute against the current directory.
pub fn normalize(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(SyncError::InvalidPath("empty path".into()));
    }
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

/// Compute the identity of the sandbox rooted at `path`. Pure apart from the
/// filesystem lookup needed to canonicalise.
pub fn compute_identity(path: &Path) -> Result<SandboxId> {
    let normalized = normalize(path)?;
    Ok(identity_for(&normalized.to_string_lossy()))
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedIdentity {
    pub id: SandboxId,
    /// True when the marker was created or rewritten by this call.
    pub refreshed: bool,
}

/// Read the identity recorded in `sandbox_dir`'s marker file, if any.
pub fn read_persisted_identity(sandbox_dir: &Path) -> Option<SandboxId> {
    let raw = std::fs::read_to_string(paths::worktree_id_path(sandbox_dir)).ok()?;
    raw.parse().ok()
}

/// Ensure `sandbox_dir/.claude-state/` exists and its marker holds the
/// freshly computed identity. Repeated calls with an unchanged path write
/// nothing.
pub fn ensure_persisted_identity(sandbox_dir: &Path) -> Result<PersistedIdentity> {
    let id = compute_identity(sandbox_dir)?;
    io::ensure_dir(&paths::state_dir(sandbox_dir))?;
    io::write_if_missing(
        &paths::state_gitignore_path(sandbox_dir),
        paths::STATE_GITIGNORE_CONTENT.as_bytes(),
    )?;

    if read_persisted_identity(sandbox_dir).as_ref() == Some(&id) {
        return Ok(PersistedIdentity {
            id,
            refreshed: false,
        });
    }

    io::atomic_write(&paths::worktree_id_path(sandbox_dir), id.as_str().as_bytes())?;
    tracing::debug!(sandbox = %sandbox_dir.display(), id = %id, "wrote worktree identity marker");
    Ok(PersistedIdentity {
        id,
        refreshed: true,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
