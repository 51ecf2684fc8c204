use crate::cmd::Workspace;
use crate::output::print_json;
use agentdb_core::git::CheckoutKind;
use agentdb_core::identity;
use anyhow::Context;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    let persisted = identity::ensure_persisted_identity(&ws.ctx.root)
        .with_context(|| format!("failed to persist identity for {}", ws.ctx.root.display()))?;

    if json {
        print_json(&serde_json::json!({
            "root": ws.ctx.root,
            "id": persisted.id,
            "refreshed": persisted.refreshed,
            "checkout": ws.ctx.kind,
            "branch": ws.ctx.branch,
        }))?;
    } else {
        let kind = match &ws.ctx.kind {
            CheckoutKind::Primary => "primary".to_string(),
            CheckoutKind::Derived { primary } => format!("worktree of {}", primary.display()),
        };
        println!("{}", persisted.id);
        eprintln!("{} ({kind})", ws.ctx.root.display());
    }
    Ok(())
}
