use crate::cmd::init::link_label;
use crate::cmd::Workspace;
use crate::output::print_json;
use agentdb_core::locator::{self, LinkOutcome};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    if !ws.ctx.is_worktree() {
        if json {
            print_json(&LinkOutcome::AlreadyPresent)?;
        } else {
            println!("primary checkout: the shared store lives here");
        }
        return Ok(());
    }

    let state = locator::prepare_sandbox_state(&ws.ctx.root, ws.primary_root())?;
    if json {
        print_json(&state)?;
    } else {
        match &state.link {
            LinkOutcome::Isolated(reason) => {
                println!("isolated: {reason}");
                println!("events recorded here stay local until the alias is fixed");
            }
            other => println!("{}", link_label(other)),
        }
    }
    Ok(())
}
