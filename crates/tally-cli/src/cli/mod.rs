//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tally_core::model::VoteIntent;

pub mod commands;

/// Vote tallies, reconciliation and score upkeep for entity pages
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format: text (default) or JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Path to the SQLite system of record
    #[arg(long, global = true, env = "TALLY_DB", default_value = "tally.db")]
    pub db: PathBuf,

    /// Redis URL for the counter store (per-process tallies with the pending set in the database when omitted)
    #[arg(long, global = true, env = "TALLY_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Counter store timeout in milliseconds
    #[arg(long, global = true, env = "TALLY_COUNTER_TIMEOUT_MS", default_value_t = 50)]
    pub counter_timeout_ms: u64,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database schema
    Init,

    /// Cast, switch or retract a vote
    Vote {
        /// Voter ID
        voter_id: i64,

        /// Entity ID
        entity_id: i64,

        /// up, down or retract
        #[arg(value_enum)]
        intent: VoteIntent,
    },

    /// Show vote counts for an entity
    Show {
        /// Entity ID
        entity_id: i64,

        /// Include this voter's own vote
        #[arg(long)]
        voter: Option<i64>,
    },

    /// Recompute counts from vote rows and repair drift (full sweep by default)
    Reconcile {
        /// Reconcile a single entity
        #[arg(long, conflicts_with = "dirty")]
        entity: Option<i64>,

        /// Drain the pending-sync set instead of sweeping everything
        #[arg(long)]
        dirty: bool,

        /// Entities to drain with --dirty
        #[arg(long, default_value_t = 256, requires = "dirty")]
        batch: usize,
    },

    /// Recompute the total score of an entity
    Recompute {
        /// Entity ID
        entity_id: i64,
    },

    /// Run the background reconciliation worker
    Worker {
        /// Seconds between pending-sync drains
        #[arg(long, default_value_t = 5)]
        drain_interval: u64,

        /// Seconds between full sweeps
        #[arg(long, default_value_t = 900)]
        sweep_interval: u64,

        /// Skip the sweep at startup
        #[arg(long)]
        no_initial_sweep: bool,

        /// Stop after this many seconds (runs until killed when omitted)
        #[arg(long)]
        run_for: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_vote() {
        let cli = Cli::try_parse_from(["tally", "--db", "x.db", "vote", "3", "7", "retract"]).unwrap();
        assert_eq!(cli.db, PathBuf::from("x.db"));
        match cli.command {
            Commands::Vote {
                voter_id,
                entity_id,
                intent,
            } => {
                assert_eq!((voter_id, entity_id), (3, 7));
                assert_eq!(intent, VoteIntent::Retract);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_batch_requires_dirty() {
        assert!(Cli::try_parse_from(["tally", "reconcile", "--batch", "5"]).is_err());
        assert!(Cli::try_parse_from(["tally", "reconcile", "--dirty", "--batch", "5"]).is_ok());
        assert!(Cli::try_parse_from(["tally", "reconcile", "--entity", "1", "--dirty"]).is_err());
    }
}
