//! Shared state store location.
//!
//! Every repository has exactly one physical store file, in the primary
//! checkout's `.claude-state/`. Each sandbox reaches it through an alias at
//! the same relative location in its own `.claude-state/`. The alias is a
//! relative symlink when the platform allows it, otherwise a hard link. When
//! neither works the sandbox runs with an isolated store and says so.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::error::{Result, SyncError};
use crate::git::{CheckoutKind, WorktreeContext};
use crate::identity::{self, SandboxId};
use crate::{io, paths};

// ---------------------------------------------------------------------------
// Canonical store path
// ---------------------------------------------------------------------------

/// Real path of the store reachable from `ctx`.
///
/// A sandbox resolves to the primary's store file whenever the primary's
/// state directory exists, whatever kind of alias it holds: a hard-linked
/// alias is a second name for the same inode, and SQLite keeps its WAL and
/// shared-memory files next to the name it was opened by. The sandbox's own
/// alias path is used only when the primary is unreachable.
pub fn resolve_canonical_store_path(ctx: &WorktreeContext) -> PathBuf {
    match &ctx.kind {
        CheckoutKind::Primary => canonical_or_self(paths::store_path(&ctx.root)),
        CheckoutKind::Derived { primary } => {
            if paths::state_dir(primary).is_dir() {
                return canonical_or_self(paths::store_path(primary));
            }
            tracing::warn!(
                sandbox = %ctx.root.display(),
                primary = %primary.display(),
                "primary state directory unreachable; using isolated sandbox store"
            );
            canonical_or_self(paths::store_path(&ctx.root))
        }
    }
}

fn canonical_or_self(path: PathBuf) -> PathBuf {
    path.canonicalize().unwrap_or(path)
}

// ---------------------------------------------------------------------------
// Alias creation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum LinkOutcome {
    /// Something already sits at the alias path; left untouched.
    AlreadyPresent,
    Symlinked,
    HardLinked,
    /// No alias could be created; the sandbox records into its own store.
    Isolated(String),
}

impl LinkOutcome {
    pub fn is_shared(&self) -> bool {
        !matches!(self, LinkOutcome::Isolated(_))
    }
}

/// Alias `sandbox_dir`'s store path to `primary_dir`'s store file.
///
/// Link failures degrade to [`LinkOutcome::Isolated`] and are never errors.
/// Calling this again once an alias exists is a no-op.
pub fn ensure_alias(sandbox_dir: &Path, primary_dir: &Path) -> LinkOutcome {
    let alias = paths::store_path(sandbox_dir);
    if alias.symlink_metadata().is_ok() {
        return LinkOutcome::AlreadyPresent;
    }

    let target = paths::store_path(primary_dir);
    if let Err(e) = prepare_target(primary_dir, &target) {
        return isolated(sandbox_dir, format!("cannot create shared store: {e}"));
    }
    if same_checkout(sandbox_dir, primary_dir) {
        return LinkOutcome::AlreadyPresent;
    }
    if let Err(e) = io::ensure_dir(&paths::state_dir(sandbox_dir)) {
        return isolated(sandbox_dir, format!("cannot create state directory: {e}"));
    }

    let link_target = relative_link_target(&target, &paths::state_dir(sandbox_dir));
    let symlink_err = match symlink_file(&link_target, &alias) {
        Ok(()) => {
            tracing::info!(
                alias = %alias.display(),
                target = %link_target.display(),
                "linked sandbox store to primary"
            );
            return LinkOutcome::Symlinked;
        }
        Err(e) => e,
    };

    match std::fs::hard_link(&target, &alias) {
        Ok(()) => {
            tracing::info!(
                alias = %alias.display(),
                target = %target.display(),
                symlink_error = %symlink_err,
                "hard-linked sandbox store to primary"
            );
            LinkOutcome::HardLinked
        }
        Err(hard_err) => isolated(
            sandbox_dir,
            format!("symlink failed ({symlink_err}); hard link failed ({hard_err})"),
        ),
    }
}

fn isolated(sandbox_dir: &Path, reason: String) -> LinkOutcome {
    tracing::warn!(
        sandbox = %sandbox_dir.display(),
        reason = %reason,
        "sandbox will use an isolated store; events stay local until the alias is fixed"
    );
    LinkOutcome::Isolated(reason)
}

/// The store file must exist before a hard link can point at it.
fn prepare_target(primary_dir: &Path, target: &Path) -> Result<()> {
    io::ensure_dir(&paths::state_dir(primary_dir))?;
    io::write_if_missing(
        &paths::state_gitignore_path(primary_dir),
        paths::STATE_GITIGNORE_CONTENT.as_bytes(),
    )?;
    io::touch(target)?;
    Ok(())
}

fn same_checkout(a: &Path, b: &Path) -> bool {
    match (identity::normalize(a), identity::normalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(unix)]
fn symlink_file(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_file(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(not(any(unix, windows)))]
fn symlink_file(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks unsupported on this platform",
    ))
}

/// `target` expressed relative to `base_dir`, falling back to the absolute
/// target when the two share no root.
fn relative_link_target(target: &Path, base_dir: &Path) -> PathBuf {
    let (Ok(target_abs), Ok(base_abs)) = (
        identity::normalize(target),
        identity::normalize(base_dir),
    ) else {
        return target.to_path_buf();
    };
    relative_path(&target_abs, &base_abs).unwrap_or(target_abs)
}

fn relative_path(target: &Path, base: &Path) -> Option<PathBuf> {
    let target: Vec<Component> = target.components().collect();
    let base: Vec<Component> = base.components().collect();
    if target.first() != base.first() {
        return None;
    }
    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base.len() {
        rel.push("..");
    }
    for part in &target[common..] {
        rel.push(part.as_os_str());
    }
    Some(rel)
}

// ---------------------------------------------------------------------------
// Sandbox creation hook
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxState {
    pub id: SandboxId,
    pub link: LinkOutcome,
}

/// Everything a freshly created sandbox needs: its identity marker and the
/// alias to the shared store.
pub fn prepare_sandbox_state(sandbox_dir: &Path, primary_dir: &Path) -> Result<SandboxState> {
    if !sandbox_dir.is_dir() {
        return Err(SyncError::InvalidPath(format!(
            "sandbox directory does not exist: {}",
            sandbox_dir.display()
        )));
    }
    let persisted = identity::ensure_persisted_identity(sandbox_dir)?;
    let link = ensure_alias(sandbox_dir, primary_dir);
    Ok(SandboxState {
        id: persisted.id,
        link,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::fixture::*;
    use crate::git::{GitLayout, WorktreeProbe};
    use tempfile::TempDir;

    fn layout() -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("proj");
        std::fs::create_dir_all(&primary).unwrap();
        init_primary(&primary, "main");
        let sandbox = add_worktree(&primary, &dir.path().join("proj_feature_x"), "feature/x");
        (dir, primary, sandbox)
    }

    #[test]
    fn relative_path_climbs_to_common_ancestor() {
        let rel = relative_path(
            Path::new("/a/b/c/.claude-state/agentdb.db"),
            Path::new("/a/d/.claude-state"),
        )
        .unwrap();
        assert_eq!(rel, PathBuf::from("../../b/c/.claude-state/agentdb.db"));
    }

    #[cfg(unix)]
    #[test]
    fn alias_is_relative_symlink_to_primary_store() {
        let (_dir, primary, sandbox) = layout();
        assert_eq!(ensure_alias(&sandbox, &primary), LinkOutcome::Symlinked);

        let alias = paths::store_path(&sandbox);
        let link = std::fs::read_link(&alias).unwrap();
        assert!(link.is_relative());
        assert_eq!(
            alias.canonicalize().unwrap(),
            paths::store_path(&primary).canonicalize().unwrap()
        );
        assert!(paths::state_gitignore_path(&primary).exists());
    }

    #[test]
    fn ensure_alias_is_idempotent() {
        let (_dir, primary, sandbox) = layout();
        let first = ensure_alias(&sandbox, &primary);
        assert!(first.is_shared());
        let entries_before: Vec<_> = std::fs::read_dir(paths::state_dir(&sandbox))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();

        assert_eq!(ensure_alias(&sandbox, &primary), LinkOutcome::AlreadyPresent);
        let entries_after: Vec<_> = std::fs::read_dir(paths::state_dir(&sandbox))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries_before, entries_after);
    }

    #[test]
    fn existing_file_at_alias_is_left_alone() {
        let (_dir, primary, sandbox) = layout();
        let alias = paths::store_path(&sandbox);
        io::atomic_write(&alias, b"local").unwrap();
        assert_eq!(ensure_alias(&sandbox, &primary), LinkOutcome::AlreadyPresent);
        assert_eq!(std::fs::read(&alias).unwrap(), b"local");
    }

    #[test]
    fn unusable_primary_degrades_to_isolated() {
        let (_dir, primary, sandbox) = layout();
        // A plain file where the state directory should be.
        std::fs::write(paths::state_dir(&primary), b"not a dir").unwrap();
        let outcome = ensure_alias(&sandbox, &primary);
        assert!(matches!(outcome, LinkOutcome::Isolated(_)));
        assert!(!outcome.is_shared());
    }

    #[test]
    fn canonical_path_for_primary_is_own_store() {
        let (_dir, primary, _sandbox) = layout();
        let ctx = GitLayout.context(&primary).unwrap();
        assert_eq!(
            resolve_canonical_store_path(&ctx),
            paths::store_path(&primary.canonicalize().unwrap())
        );
    }

    #[test]
    fn canonical_path_for_sandbox_resolves_alias() {
        let (_dir, primary, sandbox) = layout();
        ensure_alias(&sandbox, &primary);
        let ctx = GitLayout.context(&sandbox).unwrap();
        assert_eq!(
            resolve_canonical_store_path(&ctx),
            paths::store_path(&primary).canonicalize().unwrap()
        );
    }

    #[test]
    fn canonical_path_without_alias_prefers_primary() {
        let (_dir, primary, sandbox) = layout();
        io::ensure_dir(&paths::state_dir(&primary)).unwrap();
        let ctx = GitLayout.context(&sandbox).unwrap();
        assert_eq!(
            resolve_canonical_store_path(&ctx),
            paths::store_path(&primary.canonicalize().unwrap())
        );
    }

    #[test]
    fn canonical_path_for_hard_linked_alias_is_primary_file() {
        let (_dir, primary, sandbox) = layout();
        let target = paths::store_path(&primary);
        io::ensure_dir(&paths::state_dir(&primary)).unwrap();
        io::touch(&target).unwrap();
        io::ensure_dir(&paths::state_dir(&sandbox)).unwrap();
        std::fs::hard_link(&target, paths::store_path(&sandbox)).unwrap();

        let ctx = GitLayout.context(&sandbox).unwrap();
        assert_eq!(
            resolve_canonical_store_path(&ctx),
            target.canonicalize().unwrap()
        );
    }

    #[test]
    fn canonical_path_falls_back_to_sandbox_when_primary_unreachable() {
        let (_dir, primary, sandbox) = layout();
        std::fs::write(paths::state_dir(&primary), b"not a dir").unwrap();
        let ctx = GitLayout.context(&sandbox).unwrap();
        assert_eq!(
            resolve_canonical_store_path(&ctx),
            paths::store_path(&sandbox.canonicalize().unwrap())
        );
    }

    #[test]
    fn prepare_sandbox_state_writes_marker_and_alias() {
        let (_dir, primary, sandbox) = layout();
        let state = prepare_sandbox_state(&sandbox, &primary).unwrap();
        assert!(state.link.is_shared());
        assert_eq!(identity::read_persisted_identity(&sandbox), Some(state.id));
    }

    #[test]
    fn prepare_sandbox_state_rejects_missing_dir() {
        let (dir, primary, _sandbox) = layout();
        assert!(prepare_sandbox_state(&dir.path().join("gone"), &primary).is_err());
    }
}
