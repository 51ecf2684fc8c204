use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

/// Private per-checkout state directory, present in the primary checkout and
/// in every sandbox derived from it.
pub const STATE_DIR: &str = ".claude-state";

pub const WORKTREE_ID_FILE: &str = ".worktree-id";
pub const STATE_GITIGNORE_FILE: &str = ".gitignore";
pub const STORE_FILE: &str = "agentdb.db";
pub const CONFIG_FILE: &str = "sync.yaml";

pub const STATE_GITIGNORE_CONTENT: &str = "# Ignore all files in state directory\n*\n";

/// Label used for rows recorded from the primary checkout (no sandbox path).
pub const PRIMARY_LABEL: &str = "main";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn state_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR)
}

pub fn worktree_id_path(root: &Path) -> PathBuf {
    state_dir(root).join(WORKTREE_ID_FILE)
}

pub fn state_gitignore_path(root: &Path) -> PathBuf {
    state_dir(root).join(STATE_GITIGNORE_FILE)
}

pub fn store_path(root: &Path) -> PathBuf {
    state_dir(root).join(STORE_FILE)
}

pub fn config_path(root: &Path) -> PathBuf {
    state_dir(root).join(CONFIG_FILE)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
