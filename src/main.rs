// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use latt_core::{
    AIService, AgentCatalog, AgentDefinition, AgentSession, DelegatedToolCallRegistry, HistoryStore, McpServerPool, Minion, MinionFileLocks, StreamEvent, StreamManager,
};
use latt_model::MockProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Completions { shell } => {
            cli::print_completions(*shell);
            Ok(())
        }
        Commands::ShowConfig => {
            let config = latt_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Commands::Run { message, minion_id, agent, state_dir, project } => {
            let minion_id = minion_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let session = build_session(cli.config.as_deref(), &minion_id, agent, state_dir.clone(), project.clone()).await?;
            session.send_message(message.clone()).await?;
            run_and_print(&session, Some(agent.as_str())).await
        }
        Commands::Resume { minion_id, agent, state_dir, project } => {
            let session = build_session(cli.config.as_deref(), minion_id, agent, state_dir.clone(), project.clone()).await?;
            resume_and_print(&session, Some(agent.as_str())).await
        }
    }
}

fn state_root(state_dir: Option<PathBuf>) -> PathBuf {
    state_dir.unwrap_or_else(|| PathBuf::from(".lattice/sessions"))
}

async fn build_session(config_path: Option<&std::path::Path>, minion_id: &str, agent: &str, state_dir: Option<PathBuf>, project: PathBuf) -> anyhow::Result<AgentSession> {
    let config = latt_config::load(config_path)?;
    let root = state_root(state_dir);
    let locks = Arc::new(MinionFileLocks::new());
    let history = Arc::new(HistoryStore::new(root, locks));
    let streams = Arc::new(StreamManager::new(history.clone()));
    let mcp = Arc::new(McpServerPool::new(&config.mcp));
    let delegated = Arc::new(DelegatedToolCallRegistry::new());
    let agents = Arc::new(AgentCatalog::new(vec![AgentDefinition::new(agent)], agent));
    let ai = Arc::new(AIService::new(agents, history.clone(), streams, mcp, delegated));
    let minion = Minion::new(minion_id, minion_id, project);
    Ok(AgentSession::new(minion, ai, history))
}

async fn run_and_print(session: &AgentSession, agent: Option<&str>) -> anyhow::Result<()> {
    let provider = MockProvider;
    let outcome = session.run_turn(agent, None, None, Vec::new(), &provider, print_event).await?;
    println!("\n-- {outcome:?}");
    Ok(())
}

async fn resume_and_print(session: &AgentSession, agent: Option<&str>) -> anyhow::Result<()> {
    let provider = MockProvider;
    let outcome = session.resume_stream(agent, None, None, Vec::new(), &provider, print_event).await?;
    println!("\n-- {outcome:?}");
    Ok(())
}

fn print_event(event: StreamEvent) {
    match event {
        StreamEvent::StreamDelta { text, .. } => print!("{text}"),
        StreamEvent::ReasoningDelta { text, .. } => eprint!("{text}"),
        StreamEvent::ToolCallStart { name, .. } => eprintln!("\n[tool call: {name}]"),
        StreamEvent::Error { kind, message, .. } => eprintln!("\n[error: {kind:?} {message}]"),
        _ => {}
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();
}
