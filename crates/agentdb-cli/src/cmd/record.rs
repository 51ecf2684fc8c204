use crate::cmd::Workspace;
use crate::output::print_json;
use agentdb_core::flow_token;
use agentdb_core::store::{is_known_pattern, EventCategory, EventStore, SyncEvent};
use anyhow::Context;
use clap::Args;
use std::path::{Path, PathBuf};

#[derive(Args)]
pub struct RecordArgs {
    /// workflow_transition, quality_gate or file_update
    #[arg(long)]
    pub sync_type: String,

    /// Phase pattern, e.g. phase_1_specify
    #[arg(long)]
    pub pattern: String,

    #[arg(long, default_value = "")]
    pub source: String,

    #[arg(long, default_value = "")]
    pub target: String,

    /// Sandbox path (default: this checkout when it is a worktree)
    #[arg(long)]
    pub worktree: Option<PathBuf>,

    /// Flow token (default: derived from the checkout)
    #[arg(long)]
    pub flow_token: Option<String>,

    /// Additional JSON metadata
    #[arg(long)]
    pub metadata: Option<String>,

    /// Recording agent
    #[arg(long, default_value = "agentdb")]
    pub agent: String,

    /// Delivery key; re-recording the same key returns the first event
    #[arg(long)]
    pub idempotency_key: Option<String>,
}

pub fn run(root: &Path, args: RecordArgs, json: bool) -> anyhow::Result<()> {
    let category: EventCategory = args.sync_type.parse()?;
    let metadata = match &args.metadata {
        Some(raw) => serde_json::from_str(raw).context("--metadata is not valid JSON")?,
        None => serde_json::json!({}),
    };
    if !is_known_pattern(&args.pattern) {
        eprintln!("warning: pattern '{}' is not in the standard list", args.pattern);
    }

    let ws = Workspace::open(root)?;
    let worktree = match args.worktree {
        Some(p) => Some(agentdb_core::identity::normalize(&p)?),
        None => ws.ctx.sandbox_path().map(Path::to_path_buf),
    };
    let token = args.flow_token.or_else(|| {
        flow_token::derive_stable_token(&ws.ctx.root, ws.ctx.branch.as_deref(), &ws.config.tokens)
            .map(|t| t.value)
    });

    let event = SyncEvent::new(args.agent, category, args.pattern)
        .with_worktree_path(worktree)
        .with_flow_token(token)
        .with_locations(args.source, args.target)
        .with_metadata(metadata)
        .with_idempotency_key(args.idempotency_key);

    let store_path = ws.store_path();
    let store = EventStore::open(&store_path, ws.busy_timeout())
        .with_context(|| format!("failed to open store {}", store_path.display()))?;
    store.initialize_schema()?;
    let id = store.append(&event).context("failed to record event")?;

    if json {
        print_json(&serde_json::json!({
            "sync_id": id,
            "flow_token": event.flow_token,
            "pattern": event.pattern,
            "store": store_path,
        }))?;
    } else {
        println!("Recorded {} ({})", event.pattern, id);
    }
    Ok(())
}
