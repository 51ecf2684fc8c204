use std::path::{Path, PathBuf};

/// Resolve the checkout the command acts from.
///
/// Priority:
/// 1. `--root` flag / `AGENTDB_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.git` (a directory in the primary
///    checkout, a file in a worktree)
/// 3. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_checkout(&cwd).unwrap_or(cwd)
}

fn find_checkout(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_root_wins() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_root(Some(dir.path())), dir.path());
    }

    #[test]
    fn finds_worktree_git_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".git"), "gitdir: /elsewhere\n").unwrap();
        let deep = dir.path().join("src/deep");
        std::fs::create_dir_all(&deep).unwrap();
        assert_eq!(find_checkout(&deep).as_deref(), Some(dir.path()));
    }
}
