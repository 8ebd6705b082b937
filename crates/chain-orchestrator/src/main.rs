//! `chain-orchestrator` command line.
//!
//! ```bash
//! # Run a simulated workload against in-memory collaborators
//! chain-orchestrator demo --agents 3 --tasks 12
//!
//! # Print the effective configuration
//! chain-orchestrator --config ./orchestrator.json config
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use anyhow::Context;
use chain_orchestrator::config::CONFIG_ENV_VAR;
use chain_orchestrator::{
    AgentConfig, AgentManager, InMemorySigner, MockChainClient, OrchestratorConfig,
    StaticChainDirectory, Task, TaskPayload, TaskPriority, TransactionRequest,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chain-orchestrator", version)]
#[command(about = "Schedule and execute agent transactions with retry, rate limiting and approval")]
struct Cli {
    /// Config file (JSON). Falls back to $CHAIN_ORCHESTRATOR_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a simulated workload and print the final stats
    Demo {
        /// Agents to register
        #[arg(long, default_value_t = 2)]
        agents: usize,

        /// Transfer tasks to submit
        #[arg(long, default_value_t = 8)]
        tasks: usize,

        /// Network id for every agent
        #[arg(long, default_value_t = 11_155_111)]
        network: u64,

        /// Fail this many broadcasts first to exercise retries
        #[arg(long, default_value_t = 0)]
        flaky_broadcasts: usize,
    },
    /// Print the effective configuration
    Config,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<OrchestratorConfig> {
    let path = explicit.or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));
    match path {
        Some(path) => OrchestratorConfig::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(OrchestratorConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    let config = load_config(cli.config)?;

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Demo {
            agents,
            tasks,
            network,
            flaky_broadcasts,
        } => run_demo(config, agents, tasks, network, flaky_broadcasts).await?,
    }
    Ok(())
}

async fn run_demo(
    config: OrchestratorConfig,
    agent_count: usize,
    task_count: usize,
    network: u64,
    flaky_broadcasts: usize,
) -> anyhow::Result<()> {
    let chain = Arc::new(MockChainClient::new());
    if flaky_broadcasts > 0 {
        chain.fail_next_broadcasts(flaky_broadcasts, "connection reset by peer");
    }
    let tick = config.scheduler.tick_interval();
    let manager = AgentManager::new(
        config,
        Arc::new(InMemorySigner::new()),
        chain.clone(),
        Arc::new(StaticChainDirectory::default()),
    );

    manager.subscribe_task_events(|event| {
        info!(event = event.name(), task_id = %event.task_id(), "Task event");
        Ok(())
    });

    for index in 0..agent_count {
        manager
            .add_agent(AgentConfig::new(format!("agent-{index}"), network))
            .await?;
    }

    let priorities = [
        TaskPriority::Low,
        TaskPriority::Normal,
        TaskPriority::High,
        TaskPriority::Critical,
    ];
    for index in 0..task_count {
        let recipient = format!("0x{:040x}", index + 1);
        let task = Task::new(
            format!("transfer-{index}"),
            format!("Transfer #{index}"),
            TaskPayload::Transaction(TransactionRequest::transfer(
                recipient,
                U256::from(1_000_000_000_000_000u64),
            )),
        )
        .with_priority(priorities[index % priorities.len()]);
        manager.schedule_task(task, None)?;
    }

    manager.start()?;
    let deadline = tokio::time::Instant::now() + tick * (task_count as u32 + 5) + Duration::from_secs(30);
    loop {
        let stats = manager.get_stats();
        let finished = stats.tasks.completed + stats.tasks.failed + stats.tasks.timeout;
        if finished >= task_count || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(tick / 2).await;
    }
    manager.stop().await;

    let stats = manager.get_stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    info!(broadcasts = chain.broadcast_count(), "Demo finished");
    manager.shutdown().await;
    Ok(())
}
