use crate::cmd::Workspace;
use crate::output::print_json;
use agentdb_core::identity::{self, SandboxId};
use agentdb_core::locator::{self, LinkOutcome};
use agentdb_core::store::EventStore;
use anyhow::Context;
use std::path::{Path, PathBuf};

#[derive(serde::Serialize)]
struct InitOutput {
    root: PathBuf,
    primary: PathBuf,
    identity: SandboxId,
    store: PathBuf,
    schema_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<LinkOutcome>,
}

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    let primary = ws.primary_root().to_path_buf();

    identity::ensure_persisted_identity(&primary)
        .with_context(|| format!("failed to initialise {}", primary.display()))?;

    let (id, link) = if ws.ctx.is_worktree() {
        let state = locator::prepare_sandbox_state(&ws.ctx.root, &primary)
            .context("failed to prepare sandbox state")?;
        (state.id, Some(state.link))
    } else {
        let persisted = identity::ensure_persisted_identity(&ws.ctx.root)?;
        (persisted.id, None)
    };

    let store_path = ws.store_path();
    let store = EventStore::open(&store_path, ws.busy_timeout())
        .with_context(|| format!("failed to open store {}", store_path.display()))?;
    store.initialize_schema().context("failed to initialise schema")?;
    let schema_version = store.schema_version()?;

    let out = InitOutput {
        root: ws.ctx.root.clone(),
        primary,
        identity: id,
        store: store_path,
        schema_version,
        link,
    };

    if json {
        print_json(&out)?;
    } else {
        println!("Initialized agentdb in {}", out.root.display());
        println!("  identity: {}", out.identity);
        println!("  store:    {}", out.store.display());
        if let Some(version) = &out.schema_version {
            println!("  schema:   {version}");
        }
        match &out.link {
            Some(LinkOutcome::Isolated(reason)) => {
                println!("  link:     isolated ({reason})");
            }
            Some(outcome) => println!("  link:     {}", link_label(outcome)),
            None => {}
        }
    }
    Ok(())
}

pub fn link_label(outcome: &LinkOutcome) -> &'static str {
    match outcome {
        LinkOutcome::AlreadyPresent => "already present",
        LinkOutcome::Symlinked => "symlinked",
        LinkOutcome::HardLinked => "hard-linked",
        LinkOutcome::Isolated(_) => "isolated",
    }
}
