//! ilmctl - operator tool for index lifecycle management state.

use anyhow::Result;
use clap::{Parser, Subcommand};
use ilm_core::{IlmConfig, InstanceStatus, ResourceId, Settings};
use ilm_storage::{AuditLog, Backend, StateRepository};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ilmctl")]
#[command(about = "Inspect and maintain lifecycle management state", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, env = "ILM_CONFIG")]
    config: Option<String>,

    /// Log level, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Policy instance states
    States {
        #[command(subcommand)]
        command: StatesCommand,
    },
    /// State audit log
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    /// Print the effective configuration
    Settings,
}

#[derive(Subcommand)]
enum StatesCommand {
    /// List instance states
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one instance state
    Show {
        /// Resource (index) name
        id: String,
    },
    /// Remove DELETED states
    Purge,
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Show the most recent audit records
    Tail {
        /// Number of records
        #[arg(short = 'n', long, default_value = "10")]
        lines: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = IlmConfig::load(cli.config.as_deref())?;

    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let backend = Backend::open(&config.storage).await?;
    let settings = Settings::new(config.engine.clone(), config.dynamic.clone());

    match cli.command {
        Commands::States { command } => {
            let repository = StateRepository::without_audit(backend.states.clone());
            match command {
                StatesCommand::List { status } => {
                    let status = status
                        .map(|s| s.parse::<InstanceStatus>())
                        .transpose()
                        .map_err(|e| anyhow::anyhow!("Invalid status: {}", e))?;
                    let states = repository.list().await?;

                    let shown: Vec<_> = states
                        .iter()
                        .filter(|(_, state)| status.map_or(true, |s| state.status == s))
                        .collect();
                    println!("States ({})", shown.len());
                    for (id, state) in shown {
                        println!(
                            "  {} | {} | {} | {}",
                            id,
                            state.status,
                            state.policy_name(),
                            state.current_step,
                        );
                    }
                }
                StatesCommand::Show { id } => {
                    let Some(state) = repository.get(&ResourceId::new(id)).await? else {
                        println!("State not found");
                        return Ok(());
                    };
                    println!("{}", serde_json::to_string_pretty(&state)?);
                }
                StatesCommand::Purge => {
                    let purged = repository.purge_deleted().await?;
                    info!("Purged {} deleted states", purged);
                    println!("Purged {} deleted states", purged);
                }
            }
        }
        Commands::Audit { command } => match command {
            AuditCommand::Tail { lines } => {
                let audit = AuditLog::new(backend.audit.clone(), settings);
                for record in audit.tail(lines).await? {
                    println!(
                        "{} | {} | {} | {}",
                        record.timestamp.to_rfc3339(),
                        record.resource_id,
                        record.state.status,
                        record.state.current_step,
                    );
                }
            }
        },
        Commands::Settings => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
