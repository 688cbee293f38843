//! Entry point for the `hvagent` command-line agent.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hvagent_agent::{AgentConfig, AgentContext, Dispatcher};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hvagent", version, about = "Node-level hypervisor control agent")]
struct Cli {
    /// TOML configuration file. `HVAGENT_*` variables override its values.
    #[arg(long, env = "HVAGENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Probe the host and print its capability snapshot as JSON.
    Probe,
    /// Execute the JSON array of commands in FILE concurrently and print the answers.
    Dispatch {
        /// File holding `[{"type": ..., "payload": ...}, ...]`; `-` reads stdin.
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match AgentConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let ctx = Arc::new(AgentContext::bootstrap(config).await);
    match cli.command {
        Cmd::Probe => print_json(&*ctx.capabilities().await),
        Cmd::Dispatch { file } => {
            let commands = match read_commands(&file).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(file = %file.display(), error = %e, "cannot read commands");
                    return ExitCode::FAILURE;
                }
            };
            let dispatcher = Dispatcher::with_default_handlers(ctx);
            let answers = dispatcher.dispatch_all(commands).await;
            let failed = answers.iter().filter(|a| !a.success).count();
            tracing::info!(total = answers.len(), failed, "commands processed");
            print_json(&answers)
        }
    }
}

async fn read_commands(file: &PathBuf) -> Result<Vec<serde_json::Value>, String> {
    let raw = if file.as_os_str() == "-" {
        let mut buf = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut tokio::io::stdin(), &mut buf)
            .await
            .map_err(|e| e.to_string())?;
        buf
    } else {
        tokio::fs::read_to_string(file).await.map_err(|e| e.to_string())?
    };
    serde_json::from_str(&raw).map_err(|e| e.to_string())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(s) => {
            println!("{s}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "cannot serialize output");
            ExitCode::FAILURE
        }
    }
}
