// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

#[derive(Parser, Debug)]
#[command(
    name = "lattice",
    about = "Agent orchestration runtime: minions, history, tool policy, MCP pools",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (overrides auto-discovery)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single turn against a minion, printing streamed events to stdout.
    Run {
        /// The message to send.
        message: String,
        /// Minion id. Generated if omitted.
        #[arg(long, value_name = "ID")]
        minion_id: Option<String>,
        /// Agent id to resolve the turn against.
        #[arg(long, default_value = "exec")]
        agent: String,
        /// Directory under which minion session state is stored.
        #[arg(long, value_name = "DIR")]
        state_dir: Option<PathBuf>,
        /// Project directory the minion operates on.
        #[arg(long, value_name = "DIR", default_value = ".")]
        project: PathBuf,
    },
    /// Resume the most recent interrupted stream for a minion.
    Resume {
        minion_id: String,
        #[arg(long, default_value = "exec")]
        agent: String,
        #[arg(long, value_name = "DIR")]
        state_dir: Option<PathBuf>,
        #[arg(long, value_name = "DIR", default_value = ".")]
        project: PathBuf,
    },
    /// Print the effective configuration and exit.
    ShowConfig,
    /// Generate a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "lattice", &mut std::io::stdout());
}
