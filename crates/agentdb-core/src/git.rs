//! Worktree detection from git's on-disk metadata.
//!
//! The sync engine needs three answers from the branch/worktree lifecycle
//! manager: which checkout are we in (primary or derived), what branch is
//! checked out, and which worktrees are currently registered. [`WorktreeProbe`]
//! is that boundary; [`GitLayout`] answers it by reading the metadata files
//! git itself maintains, so no `git` binary is required:
//!
//! ```text
//! <primary>/.git/                      directory  -> primary checkout
//! <sandbox>/.git                       file       "gitdir: <primary>/.git/worktrees/<name>"
//! <primary>/.git/worktrees/<name>/
//!     commondir                        "../.."    -> shared metadata dir
//!     gitdir                           "<sandbox>/.git"
//!     HEAD                             "ref: refs/heads/<branch>"
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Result, SyncError};
use crate::identity::{self, SandboxId};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckoutKind {
    Primary,
    Derived { primary: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeContext {
    /// Root of the checkout containing the probed directory.
    pub root: PathBuf,
    /// Shared git metadata directory (`<primary>/.git`).
    pub common_dir: PathBuf,
    pub kind: CheckoutKind,
    pub branch: Option<String>,
    pub id: SandboxId,
}

impl WorktreeContext {
    /// Context for a directory outside any repository: treated as a primary
    /// checkout of itself with no branch.
    pub fn fallback(dir: &Path) -> Result<Self> {
        let root = identity::normalize(dir)?;
        Ok(Self {
            common_dir: root.join(".git"),
            id: identity::identity_for(&root.to_string_lossy()),
            root,
            kind: CheckoutKind::Primary,
            branch: None,
        })
    }

    pub fn is_worktree(&self) -> bool {
        matches!(self.kind, CheckoutKind::Derived { .. })
    }

    /// Root of the primary checkout: the root itself, or the checkout this
    /// sandbox was derived from.
    pub fn primary_root(&self) -> &Path {
        match &self.kind {
            CheckoutKind::Primary => &self.root,
            CheckoutKind::Derived { primary } => primary,
        }
    }

    /// The sandbox path recorded on events: `None` for the primary checkout.
    pub fn sandbox_path(&self) -> Option<&Path> {
        match self.kind {
            CheckoutKind::Primary => None,
            CheckoutKind::Derived { .. } => Some(&self.root),
        }
    }
}

/// Lifecycle-manager boundary consumed by the engine and orphan detector.
pub trait WorktreeProbe: Send + Sync {
    fn context(&self, dir: &Path) -> Result<WorktreeContext>;

    /// Every checkout currently registered with the repository rooted at
    /// `primary`, including `primary` itself.
    fn active_worktrees(&self, primary: &Path) -> Result<Vec<PathBuf>>;
}

// ---------------------------------------------------------------------------
// GitLayout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct GitLayout;

impl WorktreeProbe for GitLayout {
    fn context(&self, dir: &Path) -> Result<WorktreeContext> {
        let start = identity::normalize(dir)?;
        let root = find_checkout_root(&start).ok_or_else(|| SyncError::NotARepository(start))?;
        let dot_git = root.join(".git");

        let (git_dir, common_dir, kind) = if dot_git.is_dir() {
            (dot_git.clone(), dot_git, CheckoutKind::Primary)
        } else {
            let git_dir = read_gitdir_pointer(&root, &dot_git)?;
            match read_commondir(&git_dir)? {
                Some(common) => {
                    let primary = common
                        .parent()
                        .map(Path::to_path_buf)
                        .ok_or_else(|| SyncError::InvalidPath(common.display().to_string()))?;
                    (git_dir, common, CheckoutKind::Derived { primary })
                }
                // A `.git` file without `commondir` is a submodule checkout,
                // which owns its metadata outright.
                None => (git_dir.clone(), git_dir, CheckoutKind::Primary),
            }
        };

        Ok(WorktreeContext {
            branch: read_head_branch(&git_dir),
            id: identity::identity_for(&root.to_string_lossy()),
            root,
            common_dir,
            kind,
        })
    }

    fn active_worktrees(&self, primary: &Path) -> Result<Vec<PathBuf>> {
        let ctx = self.context(primary)?;
        let mut active = vec![ctx.primary_root().to_path_buf()];

        let registry = ctx.common_dir.join("worktrees");
        if !registry.is_dir() {
            return Ok(active);
        }
        for entry in std::fs::read_dir(&registry)? {
            let entry = entry?;
            let Ok(raw) = std::fs::read_to_string(entry.path().join("gitdir")) else {
                continue;
            };
            let pointer = PathBuf::from(raw.trim());
            if let Some(worktree) = pointer.parent() {
                active.push(identity::normalize(worktree)?);
            }
        }
        active.sort();
        active.dedup();
        Ok(active)
    }
}

// ---------------------------------------------------------------------------
// Metadata parsing
// ---------------------------------------------------------------------------

fn find_checkout_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Parse a `.git` file (`gitdir: <path>`), resolving relative pointers
/// against the checkout root.
pub(crate) fn read_gitdir_pointer(root: &Path, dot_git: &Path) -> Result<PathBuf> {
    let raw = std::fs::read_to_string(dot_git)?;
    let target = raw
        .lines()
        .find_map(|line| line.strip_prefix("gitdir:"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SyncError::NotARepository(root.to_path_buf()))?;
    let target = PathBuf::from(target);
    let absolute = if target.is_absolute() {
        target
    } else {
        root.join(target)
    };
    identity::normalize(&absolute)
}

fn read_commondir(git_dir: &Path) -> Result<Option<PathBuf>> {
    let path = git_dir.join("commondir");
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)?;
    let common = PathBuf::from(raw.trim());
    let absolute = if common.is_absolute() {
        common
    } else {
        git_dir.join(common)
    };
    identity::normalize(&absolute).map(Some)
}

/// Branch checked out in `git_dir`. A detached HEAD reports the short SHA.
fn read_head_branch(git_dir: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = raw.trim();
    if let Some(reference) = head.strip_prefix("ref:") {
        let reference = reference.trim();
        return Some(
            reference
                .strip_prefix("refs/heads/")
                .unwrap_or(reference)
                .to_string(),
        );
    }
    if head.len() >= 7 && head.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Some(head[..7].to_string());
    }
    None
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

/// On-disk fixtures that mimic `git init` / `git worktree add` without
/// invoking git.
#[cfg(test)]
pub(crate) mod fixture {
    use std::path::{Path, PathBuf};

    pub fn init_primary(root: &Path, branch: &str) {
        let git = root.join(".git");
        std::fs::create_dir_all(git.join("refs/heads")).unwrap();
        std::fs::write(git.join("HEAD"), format!("ref: refs/heads/{branch}\n")).unwrap();
    }

    pub fn add_worktree(primary: &Path, worktree: &Path, branch: &str) -> PathBuf {
        let name = worktree.file_name().unwrap().to_string_lossy().into_owned();
        let meta = primary.join(".git/worktrees").join(&name);
        std::fs::create_dir_all(&meta).unwrap();
        std::fs::create_dir_all(worktree).unwrap();
        std::fs::write(meta.join("commondir"), "../..\n").unwrap();
        std::fs::write(
            meta.join("gitdir"),
            format!("{}\n", worktree.join(".git").display()),
        )
        .unwrap();
        std::fs::write(meta.join("HEAD"), format!("ref: refs/heads/{branch}\n")).unwrap();
        std::fs::write(
            worktree.join(".git"),
            format!("gitdir: {}\n", meta.display()),
        )
        .unwrap();
        worktree.to_path_buf()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::fixture::*;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn primary_checkout_detected() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("proj");
        std::fs::create_dir_all(primary.join("src")).unwrap();
        init_primary(&primary, "contrib/alice");

        let ctx = GitLayout.context(&primary.join("src")).unwrap();
        assert_eq!(ctx.kind, CheckoutKind::Primary);
        assert_eq!(ctx.root, primary.canonicalize().unwrap());
        assert_eq!(ctx.branch.as_deref(), Some("contrib/alice"));
        assert!(ctx.sandbox_path().is_none());
    }

    #[test]
    fn derived_worktree_detected() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("proj");
        std::fs::create_dir_all(&primary).unwrap();
        init_primary(&primary, "main");
        let wt = add_worktree(
            &primary,
            &dir.path().join("proj_feature_20250101T000000Z_foo"),
            "feature/20250101T000000Z_foo",
        );

        let ctx = GitLayout.context(&wt).unwrap();
        assert!(ctx.is_worktree());
        assert_eq!(ctx.primary_root(), primary.canonicalize().unwrap());
        assert_eq!(ctx.common_dir, primary.join(".git").canonicalize().unwrap());
        assert_eq!(ctx.branch.as_deref(), Some("feature/20250101T000000Z_foo"));
        assert_eq!(ctx.sandbox_path(), Some(wt.canonicalize().unwrap().as_path()));
    }

    #[test]
    fn detached_head_reports_short_sha() {
        let dir = TempDir::new().unwrap();
        init_primary(dir.path(), "main");
        std::fs::write(
            dir.path().join(".git/HEAD"),
            "0123456789abcdef0123456789abcdef01234567\n",
        )
        .unwrap();
        let ctx = GitLayout.context(dir.path()).unwrap();
        assert_eq!(ctx.branch.as_deref(), Some("0123456"));
    }

    #[test]
    fn outside_repository_is_an_error() {
        let dir = TempDir::new().unwrap();
        // TempDir may itself live under a repository on some hosts; only
        // assert when no ancestor carries a .git entry.
        if dir.path().ancestors().any(|a| a.join(".git").exists()) {
            return;
        }
        assert!(matches!(
            GitLayout.context(dir.path()),
            Err(SyncError::NotARepository(_))
        ));
    }

    #[test]
    fn active_worktrees_lists_primary_and_registered() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("proj");
        std::fs::create_dir_all(&primary).unwrap();
        init_primary(&primary, "main");
        let a = add_worktree(&primary, &dir.path().join("proj_feature_a"), "feature/a");
        let b = add_worktree(&primary, &dir.path().join("proj_hotfix_b"), "hotfix/b");

        let active = GitLayout.active_worktrees(&primary).unwrap();
        assert_eq!(active.len(), 3);
        for path in [&primary, &a, &b] {
            assert!(active.contains(&path.canonicalize().unwrap()));
        }
    }

    #[test]
    fn fallback_context_is_primary_without_branch() {
        let dir = TempDir::new().unwrap();
        let ctx = WorktreeContext::fallback(dir.path()).unwrap();
        assert_eq!(ctx.kind, CheckoutKind::Primary);
        assert!(ctx.branch.is_none());
        assert_eq!(ctx.id, identity::compute_identity(dir.path()).unwrap());
    }
}
