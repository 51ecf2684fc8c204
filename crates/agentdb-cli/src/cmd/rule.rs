use crate::cmd::Workspace;
use crate::output::{print_json, print_table, truncate};
use agentdb_core::rules::{load_rule_file, SyncRule};
use agentdb_core::store::EventStore;
use anyhow::Context;
use clap::Subcommand;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum RuleSubcommand {
    /// Add or replace a sync rule
    Add {
        rule_id: String,
        /// Agent whose completed action triggers the rule
        #[arg(long)]
        trigger_agent: String,
        #[arg(long)]
        trigger_action: String,
        /// Partial state the trigger must contain (JSON object)
        #[arg(long)]
        pattern: Option<String>,
        #[arg(long)]
        target_agent: String,
        #[arg(long)]
        target_action: String,
        /// Parameter template (JSON object); ${trigger_state.path} is filled in
        #[arg(long)]
        params: Option<String>,
        #[arg(long, default_value = "0")]
        priority: i64,
        /// Store the rule disabled
        #[arg(long)]
        disabled: bool,
    },
    /// Load every rule from a YAML file with a top-level `rules:` list
    Import { file: PathBuf },
    /// List rules, highest priority first
    List,
    Enable { rule_id: String },
    Disable { rule_id: String },
    /// Show recent rule executions
    Executions {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

pub fn run(root: &Path, subcmd: RuleSubcommand, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    match subcmd {
        RuleSubcommand::Add {
            rule_id,
            trigger_agent,
            trigger_action,
            pattern,
            target_agent,
            target_action,
            params,
            priority,
            disabled,
        } => {
            let rule = SyncRule::new(rule_id, (trigger_agent, trigger_action), (target_agent, target_action))
                .with_pattern(parse_object(pattern.as_deref(), "--pattern")?)
                .with_params(parse_object(params.as_deref(), "--params")?)
                .with_priority(priority)
                .with_enabled(!disabled);
            store.upsert_rule(&rule)?;
            if json {
                return print_json(&rule);
            }
            println!("Saved rule {}: {rule}", rule.rule_id);
            Ok(())
        }
        RuleSubcommand::Import { file } => {
            let rules = load_rule_file(&file)
                .with_context(|| format!("failed to load rules from {}", file.display()))?;
            for rule in &rules {
                store.upsert_rule(rule)?;
            }
            if json {
                return print_json(&json!({ "imported": rules.len() }));
            }
            println!("Imported {} rule(s)", rules.len());
            Ok(())
        }
        RuleSubcommand::List => list(&store, json),
        RuleSubcommand::Enable { rule_id } => toggle(&store, &rule_id, true, json),
        RuleSubcommand::Disable { rule_id } => toggle(&store, &rule_id, false, json),
        RuleSubcommand::Executions { limit } => executions(&store, limit, json),
    }
}

fn open_store(root: &Path) -> anyhow::Result<EventStore> {
    let ws = Workspace::open(root)?;
    let store_path = ws.store_path();
    let store = EventStore::open(&store_path, ws.busy_timeout())
        .with_context(|| format!("failed to open store {}", store_path.display()))?;
    store.initialize_schema()?;
    Ok(store)
}

fn parse_object(raw: Option<&str>, flag: &str) -> anyhow::Result<Value> {
    let value = match raw {
        Some(s) => serde_json::from_str(s).with_context(|| format!("{flag} is not valid JSON"))?,
        None => Value::Object(Default::default()),
    };
    if !value.is_object() {
        anyhow::bail!("{flag} must be a JSON object");
    }
    Ok(value)
}

fn list(store: &EventStore, json: bool) -> anyhow::Result<()> {
    let rules = store.list_rules()?;
    if json {
        return print_json(&rules);
    }
    if rules.is_empty() {
        println!("No sync rules.");
        return Ok(());
    }
    let rows = rules
        .iter()
        .map(|r| {
            vec![
                r.rule_id.clone(),
                r.priority.to_string(),
                if r.enabled { "yes" } else { "no" }.to_string(),
                format!("{}.{}", r.trigger_agent_id, r.trigger_action),
                format!("{}.{}", r.target_agent_id, r.target_action),
                truncate(&r.trigger_pattern.to_string(), 40),
            ]
        })
        .collect();
    print_table(&["RULE", "PRIORITY", "ENABLED", "TRIGGER", "TARGET", "PATTERN"], rows);
    Ok(())
}

fn toggle(store: &EventStore, rule_id: &str, enabled: bool, json: bool) -> anyhow::Result<()> {
    store.set_rule_enabled(rule_id, enabled)?;
    if json {
        return print_json(&json!({ "rule_id": rule_id, "enabled": enabled }));
    }
    println!("Rule {rule_id} {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

fn executions(store: &EventStore, limit: usize, json: bool) -> anyhow::Result<()> {
    let executions = store.query_executions(limit)?;
    if json {
        return print_json(&executions);
    }
    if executions.is_empty() {
        println!("No rule executions.");
        return Ok(());
    }
    let rows = executions
        .iter()
        .map(|e| {
            vec![
                e.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                e.rule_id.clone(),
                e.flow_token.clone(),
                e.execution_order.to_string(),
                e.status.to_string(),
                truncate(&e.resolved_params.to_string(), 50),
            ]
        })
        .collect();
    print_table(&["CREATED", "RULE", "FLOW TOKEN", "ORDER", "STATUS", "PARAMS"], rows);
    Ok(())
}
