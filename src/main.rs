use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::{LoggingConfig, TurnstileConfig};
use turnstile::connection::ConnectionController;
use turnstile::ratelimit::{OperationClass, SlidingWindowLimiter};

/// Operator tool for the Turnstile admission-control counters.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// YAML configuration file (TURNSTILE__* environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record one request against a key and print the decision
    CheckRate {
        #[arg(long)]
        key: String,
        #[arg(long)]
        max_requests: u64,
        #[arg(long)]
        window_ms: u64,
    },
    /// Record one request against an operation-class preset
    CheckClass {
        /// ai, email_by_user, email_by_recipient, email_global, sms or api
        #[arg(long)]
        class: OperationClass,
        #[arg(long, default_value = "")]
        subject: String,
    },
    /// Report whether a connection would be admitted, without taking a slot
    CanConnect {
        #[arg(long)]
        user: String,
        #[arg(long)]
        company: String,
    },
    /// Print current connection counters
    Counts {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        company: Option<String>,
    },
    /// Reset a user's connection counter to zero
    ForceDisconnectUser { user: String },
    /// Reset a company's connection counter to zero
    ForceDisconnectCompany { company: String },
    /// Take a connection slot and hold it until Ctrl+C or SIGTERM
    Hold {
        #[arg(long)]
        user: String,
        #[arg(long)]
        company: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TurnstileConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Turnstile starting");

    let store = config.store.connect().await?;

    match cli.command {
        Command::CheckRate {
            key,
            max_requests,
            window_ms,
        } => {
            let limiter = SlidingWindowLimiter::from_config(store, &config.rate_limiting)?;
            print_json(&limiter.check_rate_limit(&key, max_requests, window_ms).await?)?;
        }
        Command::CheckClass { class, subject } => {
            let limiter = SlidingWindowLimiter::from_config(store, &config.rate_limiting)?;
            print_json(&limiter.check_operation(class, &subject).await?)?;
        }
        Command::CanConnect { user, company } => {
            let controller = ConnectionController::new(store, config.connections);
            print_json(&controller.can_connect(&user, &company).await?)?;
        }
        Command::Counts { user, company } => {
            let controller = ConnectionController::new(store, config.connections);
            let counts = controller
                .get_counts(user.as_deref(), company.as_deref())
                .await?;
            print_json(&counts)?;
        }
        Command::ForceDisconnectUser { user } => {
            let controller = ConnectionController::new(store, config.connections);
            controller.force_disconnect_user(&user).await?;
            print_json(&controller.get_counts(Some(&user), None).await?)?;
        }
        Command::ForceDisconnectCompany { company } => {
            let controller = ConnectionController::new(store, config.connections);
            controller.force_disconnect_company(&company).await?;
            print_json(&controller.get_counts(None, Some(&company)).await?)?;
        }
        Command::Hold { user, company } => {
            let controller = ConnectionController::new(store, config.connections);
            let guard = controller.acquire(&user, &company).await?;
            info!(guard = %guard.id(), "Holding connection slot");
            print_json(&controller.get_counts(Some(&user), Some(&company)).await?)?;

            shutdown_signal().await;

            guard.release().await;
            info!(guard = %guard.id(), "Connection slot released");
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // Logs go to stderr so stdout stays clean JSON.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, releasing");
        }
        _ = terminate => {
            info!("Received SIGTERM, releasing");
        }
    }
}
