use crate::output::print_json;
use agentdb_core::git::GitLayout;
use agentdb_core::orphan::OrphanDetector;
use anyhow::Context;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let orphans = OrphanDetector::new(GitLayout)
        .scan(root)
        .with_context(|| format!("orphan scan failed from {}", root.display()))?;

    if json {
        return print_json(&orphans);
    }
    if orphans.is_empty() {
        println!("No orphaned state directories.");
        return Ok(());
    }
    for path in &orphans {
        println!("{}", path.display());
    }
    println!("{} orphaned (not deleted)", orphans.len());
    Ok(())
}
