use clap::Parser;
use std::error::Error;
use std::process::ExitCode;
use thiserror::Error;
use toolbridge::agent::Agent;
use toolbridge::bridge::ToolBridge;
use toolbridge::catalog::{self, CatalogError};
use toolbridge::cli::Cli;
use toolbridge::config::{ConfigError, Settings};
use toolbridge::model::OpenAiProvider;
use toolbridge::server::{McpProcess, ToolInvokeError};
use toolbridge::session::{self, SessionError};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] ToolInvokeError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    // Clap exits with 2 on bad usage; a missing server script must exit 1.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "Fatal error");
            eprintln!("Error: {err}");
            if let Some(source) = err.source() {
                eprintln!("Caused by: {source}");
            }
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<(), StartupError> {
    let settings = Settings::from_env()?;

    info!(script = %cli.server_script.display(), "Connecting to tool server");
    let process = McpProcess::connect(&cli.server_script).await?;

    // The connection is released exactly once, on every exit path below.
    let outcome = run_session(&process, &settings).await;
    process.shutdown().await;
    outcome
}

async fn run_session(process: &McpProcess, settings: &Settings) -> Result<(), StartupError> {
    let descriptors = process.list_tools().await?;
    let tool_names: Vec<String> = descriptors.iter().map(|tool| tool.name.clone()).collect();
    info!(tools = tool_names.len(), "Tool catalog loaded");

    let specs = catalog::adapt(&descriptors)?;
    let provider = OpenAiProvider::new(settings);
    let agent = Agent::new(
        provider,
        ToolBridge::new(process.clone()),
        specs,
        settings.max_tool_rounds,
    );

    session::run(&agent, &tool_names).await?;
    info!("Session finished");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}
