use crate::cmd::Workspace;
use crate::output::print_json;
use agentdb_core::context::SyncContext;
use agentdb_core::engine::{SyncFacade, SyncOutcome};
use agentdb_core::git::GitLayout;
use clap::Args;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

#[derive(Args)]
pub struct TriggerArgs {
    /// Agent or automation stage that completed the step
    pub actor: String,

    /// Completed action, e.g. phase_2_plan
    pub action: String,

    /// State payload (JSON object)
    #[arg(long)]
    pub state: Option<String>,

    /// Context (JSON object): user, phi_justification, issue_number, ...
    #[arg(long)]
    pub context: Option<String>,

    /// Delivery key; re-sending the same key records nothing new
    #[arg(long)]
    pub idempotency_key: Option<String>,
}

/// Fire-and-forget: always succeeds, printing whether the step was recorded.
pub fn run(root: &Path, args: TriggerArgs, json: bool) -> anyhow::Result<()> {
    let outcome = dispatch(root, args);
    if json {
        print_json(&outcome)?;
    } else {
        println!("{}", outcome.is_recorded());
    }
    Ok(())
}

fn dispatch(root: &Path, args: TriggerArgs) -> SyncOutcome {
    let ws = match Workspace::open(root) {
        Ok(ws) => ws,
        Err(e) => return failed(format!("{e:#}")),
    };
    let state = match parse_json(args.state.as_deref(), "--state") {
        Ok(v) => v,
        Err(reason) => return failed(reason),
    };
    let mut context = match parse_json(args.context.as_deref(), "--context")
        .and_then(|v| SyncContext::from_value(v).map_err(|e| format!("--context: {e}")))
    {
        Ok(c) => c,
        Err(reason) => return failed(reason),
    };

    if args.idempotency_key.is_some() {
        context.idempotency_key = args.idempotency_key;
    }

    let facade = SyncFacade::new(ws.config, Arc::new(GitLayout), ws.ctx.root);
    facade.dispatch(&args.actor, &args.action, state, context)
}

fn parse_json(raw: Option<&str>, flag: &str) -> Result<Value, String> {
    match raw {
        None => Ok(Value::Object(Default::default())),
        Some(s) => serde_json::from_str(s).map_err(|e| format!("{flag} is not valid JSON: {e}")),
    }
}

fn failed(reason: String) -> SyncOutcome {
    tracing::error!(reason = %reason, "sync failed before dispatch");
    SyncOutcome::Failed(reason)
}
