mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "agentdb",
    about = "Shared workflow state for git worktrees: record steps, reconstruct phases",
    version,
    propagate_version = true
)]
struct Cli {
    /// Checkout to act from (default: auto-detect from .git)
    #[arg(long, global = true, env = "AGENTDB_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the state directory, identity marker and store schema
    Init,

    /// Append one event directly to the shared store
    Record(cmd::record::RecordArgs),

    /// Record a completed step through the sync engine (never fails)
    Trigger(cmd::trigger::TriggerArgs),

    /// Show the current workflow phase
    Phase(cmd::phase::PhaseArgs),

    /// Show recent activity across all sandboxes
    Activity {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// List events flagged for sensitive content
    Audit {
        #[arg(long, default_value = "50")]
        limit: usize,
        /// Show the sync-rule audit trail instead
        #[arg(long)]
        trail: bool,
    },

    /// Manage declarative sync rules
    Rule {
        #[command(subcommand)]
        subcommand: cmd::rule::RuleSubcommand,
    },

    /// Print (and persist) this checkout's identity
    Identity,

    /// Link this sandbox's store to the primary checkout's
    Link,

    /// List state directories of deleted sandboxes
    Orphans,

    /// Delete events older than the retention window
    Prune {
        /// Defaults to retention_days from sync.yaml / AGENTDB_RETENTION_DAYS
        #[arg(long)]
        older_than_days: Option<u32>,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root, cli.json),
        Commands::Record(args) => cmd::record::run(&root, args, cli.json),
        Commands::Trigger(args) => cmd::trigger::run(&root, args, cli.json),
        Commands::Phase(args) => cmd::phase::run(&root, args, cli.json),
        Commands::Activity { limit } => cmd::activity::run(&root, limit, cli.json),
        Commands::Audit { limit, trail } => cmd::audit::run(&root, limit, trail, cli.json),
        Commands::Rule { subcommand } => cmd::rule::run(&root, subcommand, cli.json),
        Commands::Identity => cmd::identity::run(&root, cli.json),
        Commands::Link => cmd::link::run(&root, cli.json),
        Commands::Orphans => cmd::orphans::run(&root, cli.json),
        Commands::Prune { older_than_days } => cmd::prune::run(&root, older_than_days, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
