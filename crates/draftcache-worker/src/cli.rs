//! CLI argument definitions using clap derive macros.

use clap::{Parser, Subcommand};

/// Draft workspace persistence worker
///
/// Drains queued write-back tasks into the relational artifact store.
#[derive(Parser, Debug)]
#[command(name = "draftcache-worker")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Emit logs (and status output) as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the worker pool until interrupted
    Run {
        /// Number of concurrent workers (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Move dead-lettered tasks back onto the queue
    Replay {
        /// Maximum number of tasks to replay
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },

    /// Show queue and dead-letter depth
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_workers() {
        let cli = Cli::parse_from(["draftcache-worker", "run", "--workers", "4"]);
        assert!(matches!(cli.command, Commands::Run { workers: Some(4) }));
        assert!(!cli.json);
    }

    #[test]
    fn test_parse_replay_default_limit() {
        let cli = Cli::parse_from(["draftcache-worker", "replay"]);
        assert!(matches!(cli.command, Commands::Replay { limit: 100 }));
    }

    #[test]
    fn test_json_flag_is_global() {
        let cli = Cli::parse_from(["draftcache-worker", "status", "--json"]);
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Status));
    }
}
