use crate::cmd::Workspace;
use crate::output::print_json;
use agentdb_core::store::EventStore;
use anyhow::Context;
use std::path::Path;

pub fn run(root: &Path, older_than_days: Option<u32>, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    let Some(days) = older_than_days.or(ws.config.retention_days) else {
        anyhow::bail!("no retention window: pass --older-than-days or set retention_days");
    };
    if days == 0 {
        anyhow::bail!("--older-than-days must be at least 1");
    }

    let store_path = ws.store_path();
    let store = EventStore::open_existing(&store_path, ws.busy_timeout())
        .with_context(|| format!("cannot open store {}", store_path.display()))?;
    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
    let removed = if store.is_initialized()? {
        store.prune_older_than(cutoff)?
    } else {
        0
    };

    if json {
        print_json(&serde_json::json!({
            "removed": removed,
            "cutoff": cutoff,
            "store": store_path,
        }))?;
    } else {
        println!("Pruned {removed} event(s) older than {days} day(s)");
    }
    Ok(())
}
