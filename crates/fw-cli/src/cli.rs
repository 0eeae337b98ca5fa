//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Fuel session reconstruction.
///
/// Turns raw fuel telemetry into operating sessions and fuel fill events,
/// and repairs what earlier runs left behind.
#[derive(Debug, Parser)]
#[command(name = "fw", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Consume the live WebSocket feed until interrupted.
    Run {
        /// Feed URL; overrides `ingest.websocket_url`.
        #[arg(long)]
        url: Option<String>,
    },

    /// Feed newline-delimited JSON telemetry through the pipeline.
    Replay {
        /// Input file, or `-` for stdin.
        input: PathBuf,

        /// Output the summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Clean up persisted sessions.
    Repair {
        /// Print the plan without writing anything.
        #[arg(long)]
        dry_run: bool,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List operating sessions.
    Sessions {
        #[arg(long)]
        plate: Option<String>,

        /// ONGOING, COMPLETED or `FUEL_FILL_COMPLETED`.
        #[arg(long)]
        status: Option<String>,

        /// Only sessions starting at or after this time (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List fuel fill events.
    Fills {
        #[arg(long)]
        plate: Option<String>,

        /// Only fills starting at or after this time (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Merge fills separated by at most this many minutes; 0 lists raw events.
        #[arg(long, default_value_t = 0)]
        merge_gap_mins: i64,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the activity audit trail, newest first.
    Activity {
        #[arg(long)]
        plate: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show database status.
    Status {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}
