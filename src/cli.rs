//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "fleetline-worker", about = "School bus fleet scheduling worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the API server and worker pool (default)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Optimize a request file inline and print the schedule.
    /// Exit codes: 0 success, 1 infeasible input, 2 timeout,
    /// 3 cancelled, 4 internal error.
    Optimize {
        /// Path to a JSON file with { routes, options }
        #[arg(long)]
        input: PathBuf,
        /// Pretty-print the resulting schedule
        #[arg(long, default_value_t = false)]
        pretty: bool,
    },
}
