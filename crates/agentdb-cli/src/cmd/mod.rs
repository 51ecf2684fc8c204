pub mod activity;
pub mod audit;
pub mod identity;
pub mod init;
pub mod link;
pub mod orphans;
pub mod phase;
pub mod prune;
pub mod record;
pub mod rule;
pub mod trigger;

use agentdb_core::config::{SyncConfig, WarnLevel};
use agentdb_core::git::{GitLayout, WorktreeContext, WorktreeProbe};
use agentdb_core::locator;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The checkout a command runs in, with its configuration loaded.
pub struct Workspace {
    pub ctx: WorktreeContext,
    pub config: SyncConfig,
}

impl Workspace {
    /// Detect the checkout at `root` (falling back to treating `root` as a
    /// primary checkout outside git) and load `sync.yaml` plus env overrides.
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        let ctx = match GitLayout.context(root) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::debug!(root = %root.display(), error = %e, "not a git checkout");
                WorktreeContext::fallback(root)
                    .with_context(|| format!("invalid root {}", root.display()))?
            }
        };
        let mut config = SyncConfig::load(ctx.primary_root()).context("failed to load sync.yaml")?;
        let mut warnings = config.apply_env(std::env::vars());
        warnings.extend(config.validate());
        for w in &warnings {
            match w.level {
                WarnLevel::Error => tracing::error!("config: {}", w.message),
                WarnLevel::Warning => tracing::warn!("config: {}", w.message),
            }
        }
        Ok(Self { ctx, config })
    }

    pub fn primary_root(&self) -> &Path {
        self.ctx.primary_root()
    }

    /// Explicit `store_path` from config, else the canonical shared store.
    pub fn store_path(&self) -> PathBuf {
        match &self.config.store_path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => self.ctx.root.join(p),
            None => locator::resolve_canonical_store_path(&self.ctx),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.config.busy_timeout_ms)
    }
}
