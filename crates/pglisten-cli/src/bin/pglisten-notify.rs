use std::time::Duration;

use clap::{Parser, Subcommand};
use pglisten::notify::{emit_continuously, emit_sequence, send_notification};
use pglisten::{Channel, ConnectionManager};
use pglisten_cli::config::Settings;
use pglisten_cli::logging::init_logging;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Send PostgreSQL notifications, for trying out a running listener.
#[derive(Debug, Parser)]
#[command(name = "pglisten-notify", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send a single notification.
    Once { channel: String, payload: String },

    /// Send `<prefix>_0` .. `<prefix>_<count - 1>` with a delay between each.
    Sequence {
        channel: String,
        #[arg(long, default_value_t = 10)]
        count: usize,
        #[arg(long, default_value = "test_payload")]
        prefix: String,
        #[arg(long, default_value_t = 1000)]
        delay_ms: u64,
    },

    /// Send `<prefix>_<uuid>` until interrupted, then send "stop".
    Continuous {
        channel: String,
        #[arg(long, default_value = "test_payload")]
        prefix: String,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new()?;
    init_logging(&settings.log)?;

    let manager = ConnectionManager::new(settings.database);
    let pool = manager.connect_pool(1).await?;

    match cli.command {
        Command::Once { channel, payload } => {
            let channel = Channel::new(channel)?;
            send_notification(&pool, &channel, &payload).await?;
            info!(channel = %channel, "Sent notification");
        }
        Command::Sequence {
            channel,
            count,
            prefix,
            delay_ms,
        } => {
            let channel = Channel::new(channel)?;
            emit_sequence(
                &pool,
                &channel,
                &prefix,
                count,
                Duration::from_millis(delay_ms),
            )
            .await?;
        }
        Command::Continuous {
            channel,
            prefix,
            interval_ms,
        } => {
            let channel = Channel::new(channel)?;
            let shutdown = CancellationToken::new();
            let interrupt = shutdown.clone();
            tokio::spawn(async move {
                match signal::ctrl_c().await {
                    Ok(()) => interrupt.cancel(),
                    Err(e) => error!(error = %e, "Failed to listen for interrupt signal"),
                }
            });

            emit_continuously(
                &pool,
                &channel,
                &prefix,
                Duration::from_millis(interval_ms),
                shutdown,
            )
            .await?;
        }
    }

    pool.close().await;
    Ok(())
}
