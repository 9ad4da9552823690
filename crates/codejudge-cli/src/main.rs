//! Operator tooling for the codejudge execution sandbox
//!
//! Inspects what the host can execute, runs single submissions through the same
//! dispatch path the judge uses, and clears workspaces left behind by crashes.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codejudge_core::{
    config::{ConfigLoader, SandboxConfig},
    workspace::WorkspaceManager,
    stale_workspace_age, ExecuteRequest, ExecutionService, LanguageRegistry,
};
use log::LevelFilter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about = "codejudge - run untrusted submissions in a sandbox")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        long,
        short,
        default_value = "codejudge.yaml",
        help = "Configuration file; defaults apply when it does not exist"
    )]
    config: PathBuf,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe container and native capabilities and print the report
    Probe {
        #[clap(long, help = "Print the health object as JSON")]
        json: bool,
    },
    /// Execute one source file and print the JSON result
    Run {
        #[clap(long, short)]
        language: String,

        /// Source file to execute
        file: PathBuf,

        #[clap(long, help = "File whose contents are fed to the program's stdin")]
        stdin: Option<PathBuf>,
    },
    /// Remove workspaces left behind by a previous process
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let config = ConfigLoader::from_file_or_default(&cli.config)
        .await
        .with_context(|| {
            format!("Failed to load configuration from {}", cli.config.display())
        })?;

    match cli.command {
        Commands::Probe { json } => probe(config, json).await,
        Commands::Run { language, file, stdin } => run(config, language, file, stdin).await,
        Commands::Sweep => sweep(config).await,
    }
}

async fn probe(mut config: SandboxConfig, json: bool) -> Result<()> {
    // probing must not touch other processes' workspaces
    config.workspace.sweep_on_startup = false;
    let service = ExecutionService::initialize(config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&service.health().await)?);
    } else {
        print!("{}", service.capabilities().await.report());
        let health = service.health().await;
        println!("Overall status: {:?}", health.overall_status);
    }
    Ok(())
}

async fn run(
    mut config: SandboxConfig,
    language: String,
    file: PathBuf,
    stdin: Option<PathBuf>,
) -> Result<()> {
    let code = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read source file {}", file.display()))?;
    let stdin = match stdin {
        Some(path) => Some(
            tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read stdin file {}", path.display()))?,
        ),
        None => None,
    };

    // a one-off run shares the root with any judge process on this host
    config.workspace.sweep_on_startup = false;
    let service = ExecutionService::initialize(config).await?;
    let result = service
        .execute(&ExecuteRequest {
            code,
            language,
            stdin,
        })
        .await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn sweep(config: SandboxConfig) -> Result<()> {
    config.validate()?;
    let workspaces = WorkspaceManager::new(&config.workspace.root).await?;
    let registry = LanguageRegistry::from_config(&config);
    let removed = workspaces
        .sweep_stale(stale_workspace_age(&config, &registry))
        .await;
    println!(
        "Removed {} stale workspace(s) from {}",
        removed,
        workspaces.root().display()
    );
    Ok(())
}
