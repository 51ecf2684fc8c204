//! Report state directories left behind by deleted sandboxes.
//!
//! Sandboxes live next to the primary checkout. A sibling that still holds a
//! `.claude-state/` directory but is no longer a registered worktree is
//! orphaned. Siblings that belong to another repository (their own `.git`
//! directory, or a `.git` file pointing into some other repository's
//! metadata) are never reported. Nothing here deletes anything.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::git::{self, WorktreeProbe};
use crate::identity;
use crate::paths;

/// State directories of `primary`'s siblings that are not in `active`.
/// Paths are compared after canonicalisation; results are sorted.
pub fn find_orphaned_state_dirs(primary: &Path, active: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let primary = identity::normalize(primary)?;
    let Some(parent) = primary.parent() else {
        return Ok(Vec::new());
    };
    let common_dir = identity::normalize(&primary.join(".git")).ok();

    let active: HashSet<PathBuf> = active
        .iter()
        .filter_map(|p| identity::normalize(p).ok())
        .collect();

    let mut orphans = Vec::new();
    for entry in std::fs::read_dir(parent)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let state = paths::state_dir(&path);
        if !state.is_dir() {
            continue;
        }
        let candidate = identity::normalize(&path)?;
        if candidate == primary || active.contains(&candidate) {
            continue;
        }
        if belongs_to_other_repository(&candidate, common_dir.as_deref()) {
            tracing::debug!(dir = %candidate.display(), "sibling belongs to another repository");
            continue;
        }
        tracing::debug!(state = %state.display(), "orphaned state directory");
        orphans.push(state);
    }
    orphans.sort();
    Ok(orphans)
}

/// A sibling with its own `.git` directory is another primary checkout. One
/// with a `.git` file is a worktree of whichever repository the pointer
/// names; an unreadable pointer is treated as ours.
fn belongs_to_other_repository(dir: &Path, common_dir: Option<&Path>) -> bool {
    let dot_git = dir.join(".git");
    if dot_git.is_dir() {
        return true;
    }
    if !dot_git.is_file() {
        return false;
    }
    match (git::read_gitdir_pointer(dir, &dot_git), common_dir) {
        (Ok(pointer), Some(common)) => !pointer.starts_with(common),
        _ => false,
    }
}

/// Orphan scan that asks the worktree probe which sandboxes are active.
pub struct OrphanDetector<P> {
    probe: P,
}

impl<P: WorktreeProbe> OrphanDetector<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    /// `primary` may be any directory inside the repository; the scan runs
    /// from its primary checkout.
    pub fn scan(&self, primary: &Path) -> Result<Vec<PathBuf>> {
        let ctx = self.probe.context(primary)?;
        let root = ctx.primary_root().to_path_buf();
        let active = self.probe.active_worktrees(&root)?;
        find_orphaned_state_dirs(&root, &active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::fixture::*;
    use crate::git::GitLayout;
    use tempfile::TempDir;

    fn with_state(dir: &Path) -> PathBuf {
        std::fs::create_dir_all(paths::state_dir(dir)).unwrap();
        dir.to_path_buf()
    }

    #[test]
    fn pure_report_over_given_active_list() {
        let dir = TempDir::new().unwrap();
        let primary = with_state(&dir.path().join("proj"));
        let live = with_state(&dir.path().join("proj_feature_live"));
        let dead = with_state(&dir.path().join("proj_feature_dead"));
        std::fs::create_dir_all(dir.path().join("unrelated")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let orphans = find_orphaned_state_dirs(&primary, &[primary.clone(), live]).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(
            orphans[0].canonicalize().unwrap(),
            paths::state_dir(&dead).canonicalize().unwrap()
        );
    }

    #[test]
    fn unrelated_repositories_are_not_orphans() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("proj");
        std::fs::create_dir_all(&primary).unwrap();
        init_primary(&primary, "main");
        with_state(&primary);

        let other = dir.path().join("other_repo");
        std::fs::create_dir_all(&other).unwrap();
        init_primary(&other, "main");
        with_state(&other);
        let other_wt = add_worktree(&other, &dir.path().join("other_repo_feature_x"), "feature/x");
        with_state(&other_wt);

        // Stale registration of our own: pointer into proj/.git, not active.
        let stale = add_worktree(&primary, &dir.path().join("proj_feature_gone"), "feature/gone");
        with_state(&stale);
        let abandoned = with_state(&dir.path().join("proj_feature_abandoned"));

        let orphans = find_orphaned_state_dirs(&primary, &[primary.clone()]).unwrap();
        let names: Vec<_> = orphans
            .iter()
            .map(|p| p.parent().unwrap().file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["proj_feature_abandoned", "proj_feature_gone"]);
        assert!(abandoned.exists());
    }

    #[test]
    fn primary_is_never_orphaned() {
        let dir = TempDir::new().unwrap();
        let primary = with_state(&dir.path().join("proj"));
        assert!(find_orphaned_state_dirs(&primary, &[]).unwrap().is_empty());
    }

    #[test]
    fn scan_uses_registered_worktrees() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("proj");
        std::fs::create_dir_all(&primary).unwrap();
        init_primary(&primary, "main");
        with_state(&primary);
        let live = add_worktree(&primary, &dir.path().join("proj_feature_a"), "feature/a");
        with_state(&live);
        let b = dir.path().join("proj_feature_b");
        with_state(&b);
        let c = dir.path().join("proj_hotfix_c");
        with_state(&c);

        let orphans = OrphanDetector::new(GitLayout).scan(&live).unwrap();
        let names: Vec<_> = orphans
            .iter()
            .map(|p| p.parent().unwrap().file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["proj_feature_b", "proj_hotfix_c"]);
    }
}
