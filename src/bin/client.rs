use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hook_relay::client::RelayClient;
use hook_relay::config::Settings;
use hook_relay::dispatch::{Dispatcher, NotificationProcessor};
use hook_relay::routing::RoutingTable;

/// Consumer for a hook-relay server: fetches stored webhook notifications,
/// delivers them to their configured targets, and acknowledges them.
#[derive(Parser)]
#[command(name = "hook-relay-client", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List pending notifications without processing them.
    Check {
        /// Also print resolved targets, captured headers, and the payload.
        #[arg(short, long)]
        verbose: bool,
    },
    /// Process and acknowledge the pending backlog once, then exit.
    Process,
    /// Run continuously until interrupted.
    Start {
        /// Poll over HTTP instead of streaming over WebSocket.
        #[arg(long)]
        poll: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hook_relay=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let settings = Arc::new(Settings::new().context("failed to load configuration")?);
    let router =
        RoutingTable::compile(&settings.handlers).context("invalid handler configuration")?;
    let dispatcher = Dispatcher::new(settings.relay.request_timeout())
        .context("failed to build HTTP client")?;
    let processor = NotificationProcessor::new(router, dispatcher);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut client = RelayClient::new(settings, processor, shutdown_rx)?;

    match cli.command {
        Command::Check { verbose } => check(&client, verbose).await,
        Command::Process => {
            let count = client.process_pending().await?;
            println!("Processed {count} notifications");
            Ok(ExitCode::SUCCESS)
        }
        Command::Start { poll } => {
            tokio::spawn(async move {
                shutdown_signal().await;
                let _ = shutdown_tx.send(true);
            });
            if poll {
                client.run_polling().await?;
            } else {
                client.run_streaming().await?;
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Print the pending backlog. Exits non-zero when there is nothing pending so
/// the command composes in shell scripts.
async fn check(client: &RelayClient, verbose: bool) -> anyhow::Result<ExitCode> {
    let notifications = client.fetch_notifications().await?;
    if notifications.is_empty() {
        println!("No pending notifications");
        return Ok(ExitCode::FAILURE);
    }

    println!("{} pending notifications:", notifications.len());
    for n in &notifications {
        println!("  [{}] {}/{} ({})", n.id, n.handler, n.path, n.received_at);
        if verbose {
            match client.processor().router().resolve(n) {
                Ok(targets) => {
                    for target in targets {
                        println!("      -> {:?} {}", target.method, target.url);
                    }
                }
                Err(e) => println!("      !! {e}"),
            }
            for (name, value) in &n.headers {
                println!("      {name}: {value}");
            }
            println!("      {}", n.payload);
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
