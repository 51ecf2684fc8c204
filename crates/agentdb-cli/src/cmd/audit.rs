use crate::cmd::Workspace;
use crate::output::{print_json, print_table, truncate};
use agentdb_core::store::EventStore;
use anyhow::Context;
use std::path::Path;

pub fn run(root: &Path, limit: usize, trail: bool, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    let store_path = ws.store_path();
    let store = EventStore::open_existing(&store_path, ws.busy_timeout())
        .with_context(|| format!("cannot read store {}", store_path.display()))?;
    if trail {
        return rule_trail(&store, limit, json);
    }
    let events = if store.is_initialized()? {
        store.query_flagged(limit)?
    } else {
        Vec::new()
    };

    if json {
        return print_json(&events);
    }
    if events.is_empty() {
        println!("No flagged events.");
        return Ok(());
    }
    let rows = events
        .iter()
        .map(|e| {
            let justification = e.metadata["context"]["phi_justification"]
                .as_str()
                .unwrap_or("-");
            vec![
                e.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                e.agent_id.clone(),
                e.pattern.clone(),
                e.flow_token.clone().unwrap_or_else(|| "-".to_string()),
                truncate(justification, 60),
            ]
        })
        .collect();
    print_table(&["CREATED", "AGENT", "PATTERN", "FLOW TOKEN", "JUSTIFICATION"], rows);
    Ok(())
}

/// Entries of the append-only rule audit trail.
fn rule_trail(store: &EventStore, limit: usize, json: bool) -> anyhow::Result<()> {
    let entries = if store.is_initialized()? {
        store.query_audit_trail(limit)?
    } else {
        Vec::new()
    };
    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No audit trail entries.");
        return Ok(());
    }
    let rows = entries
        .iter()
        .map(|a| {
            let details = &a.event_details;
            vec![
                a.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                a.event_type.clone(),
                a.rule_id.clone(),
                format!(
                    "{} -> {}",
                    details["trigger_agent"].as_str().unwrap_or("-"),
                    details["target_agent"].as_str().unwrap_or("-")
                ),
                details["flow_token"].as_str().unwrap_or("-").to_string(),
                if a.phi_involved { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    print_table(&["CREATED", "EVENT", "RULE", "AGENTS", "FLOW TOKEN", "SENSITIVE"], rows);
    Ok(())
}
