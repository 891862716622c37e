use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "regmirror", version, about = "Mirror a package registry's change feed into staged storage")]
pub struct Args {
    /// Configuration file (TOML, YAML or JSON). Defaults to config.toml in
    /// the platform config directory, if present.
    #[arg(short, long, global = true, env = "REGMIRROR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log as JSON lines instead of human-readable text.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Log writes and deletes instead of performing them.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Follow the registry change feed and dispatch accepted versions.
    Follow {
        /// Stage accepted versions in-process instead of queueing them.
        #[arg(long)]
        direct: bool,
        /// Override the configured time budget, in seconds.
        #[arg(long)]
        budget_secs: Option<u64>,
    },
    /// Drain the staging queue.
    StageWorker,
    /// Move dead-lettered messages back onto a queue.
    Redrive {
        #[arg(value_enum)]
        queue: QueueName,
    },
    /// Queue every deny-listed object for deletion.
    Prune,
    /// Drain the prune queue, deleting objects.
    PruneWorker,
    /// Rebuild the catalog.
    Catalog,
    /// Rebuild the versions index.
    Inventory,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum QueueName {
    Staging,
    Ingestion,
    Prune,
}
