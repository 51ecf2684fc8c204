use crate::cmd::Workspace;
use crate::output::print_json;
use agentdb_core::phase;
use anyhow::Context;
use std::path::Path;

pub fn run(root: &Path, limit: usize, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    let store_path = ws.store_path();
    let entries = phase::all_recent_activity(&store_path, limit)
        .with_context(|| format!("cannot read store {}", store_path.display()))?;

    if json {
        print_json(&entries)?;
    } else {
        println!("{}", phase::render_activity_text(&entries));
    }
    Ok(())
}
