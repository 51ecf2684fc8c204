use crate::cmd::Workspace;
use crate::output::print_json;
use agentdb_core::flow_token;
use agentdb_core::phase::{self, PhaseStatus};
use agentdb_core::store::Correlation;
use clap::Args;
use std::path::{Path, PathBuf};

#[derive(Args)]
#[group(multiple = false)]
pub struct PhaseArgs {
    /// Correlate by flow token
    #[arg(long)]
    pub token: Option<String>,

    /// Correlate by sandbox path
    #[arg(long)]
    pub worktree: Option<PathBuf>,

    /// Events recorded from the primary checkout
    #[arg(long)]
    pub primary: bool,
}

pub fn run(root: &Path, args: PhaseArgs, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    let correlation = correlation_for(&ws, args)?;
    let status = phase::current_phase(&ws.store_path(), &correlation);

    if json {
        print_json(&status)?;
    } else {
        println!("{}", status.render_text());
    }
    if let PhaseStatus::StoreUnavailable { path, .. } = &status {
        anyhow::bail!("state store unavailable at {}", path.display());
    }
    Ok(())
}

/// Explicit flag, else the stable flow token for this checkout, else the
/// sandbox path, else primary-checkout events.
fn correlation_for(ws: &Workspace, args: PhaseArgs) -> anyhow::Result<Correlation> {
    if let Some(token) = args.token {
        return Ok(Correlation::FlowToken(token));
    }
    if let Some(path) = args.worktree {
        return Ok(Correlation::Sandbox(agentdb_core::identity::normalize(&path)?));
    }
    if args.primary {
        return Ok(Correlation::Primary);
    }
    if let Some(token) =
        flow_token::derive_stable_token(&ws.ctx.root, ws.ctx.branch.as_deref(), &ws.config.tokens)
    {
        return Ok(Correlation::FlowToken(token.value));
    }
    Ok(match ws.ctx.sandbox_path() {
        Some(p) => Correlation::Sandbox(p.to_path_buf()),
        None => Correlation::Primary,
    })
}
