use anyhow::Context;
use clap::{Parser, Subcommand};
use fileshare_transfer::config::Settings;
use fileshare_transfer::container::{self, ContainerIndex};
use fileshare_transfer::service::{log_commands, TransferService};
use fileshare_transfer::transfer::command_channel;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fileshare-transferd")]
#[command(about = "Peer-to-peer file transfer engine")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the transfer engine until interrupted (default)
    Run,
    /// Inspect or write container files
    Container {
        #[command(subcommand)]
        action: ContainerAction,
    },
}

#[derive(Subcommand)]
enum ContainerAction {
    /// Print a container's index and hash log as JSON
    Show { file: PathBuf },
    /// Write a container indexing the given paths
    Write {
        file: PathBuf,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List the containers in the configured container directory
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fileshare_transfer={}", log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(settings).await,
        Command::Container { action } => container_command(action, &settings),
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    info!("Starting transfer engine v{}", env!("CARGO_PKG_VERSION"));

    let (commands, receiver) = command_channel();
    let (handle, engine) = TransferService::start(&settings, commands);
    let sink = tokio::spawn(log_commands(receiver));

    tokio::select! {
        result = engine => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Engine error: {}", e);
                    return Err(e.into());
                }
                Err(e) => return Err(e).context("engine task panicked"),
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping engine...");
            if let Err(e) = handle.shutdown().await {
                warn!("Engine already gone: {}", e);
            }
        }
    }

    drop(handle);
    let seen = sink.await.context("command sink panicked")?;
    info!("Transfer engine stopped after {} commands", seen);
    Ok(())
}

fn container_command(action: ContainerAction, settings: &Settings) -> anyhow::Result<()> {
    match action {
        ContainerAction::Show { file } => {
            let index = ContainerIndex::read_from(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let files = container::read_hash_log(&file)?;
            let report = serde_json::json!({ "index": index, "files": files });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        ContainerAction::Write { file, paths } => {
            let index = ContainerIndex::from_paths(&paths)?;
            index.write_to(&file)?;
            info!(
                "Wrote {} ({} paths, {} bytes)",
                file.display(),
                index.entries.len(),
                index.total_size
            );
        }
        ContainerAction::List => {
            let dir = &settings.storage.container_dir;
            let found = container::scan_containers(dir)
                .with_context(|| format!("scanning {}", dir.display()))?;
            println!("{}", serde_json::to_string_pretty(&found)?);
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal::unix::signal(signal::unix::SignalKind::terminate()),
            signal::unix::signal(signal::unix::SignalKind::interrupt()),
        ) else {
            warn!("Could not install signal handlers, falling back to ctrl-c");
            let _ = signal::ctrl_c().await;
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
