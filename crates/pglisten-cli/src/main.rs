use std::process::ExitCode;

use clap::Parser;
use pglisten::{Channel, ConnectionManager, ListenerLoop, NotificationQueue};
use pglisten_cli::config::Settings;
use pglisten_cli::logging::init_logging;
use pglisten_cli::output::print_payloads;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Listen for PostgreSQL notifications on a channel and print each payload.
#[derive(Debug, Parser)]
#[command(name = "pglisten", version)]
struct Cli {
    /// The channel to listen for notifications on.
    channel: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&settings.log) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "pglisten stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, settings: Settings) -> anyhow::Result<()> {
    let channel = Channel::new(cli.channel)?;
    let queue = NotificationQueue::new(&settings.queue);
    let manager = ConnectionManager::new(settings.database.clone());
    let listener = ListenerLoop::new(
        manager,
        channel.clone(),
        queue.clone(),
        settings.listener.clone(),
    );

    let shutdown = CancellationToken::new();

    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping listener");
                interrupt.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for interrupt signal"),
        }
    });

    // Stopped only after the listener returns, so payloads drained during
    // teardown still get printed.
    let listener_done = CancellationToken::new();
    let consumer = {
        let queue = queue.clone();
        let stop = listener_done.clone();
        tokio::spawn(async move {
            let mut stdout = std::io::stdout();
            print_payloads(&queue, &stop, &mut stdout).await
        })
    };

    let result = listener.run(shutdown).await;

    listener_done.cancel();
    match consumer.await {
        Ok(Ok(printed)) => debug!(printed, "Notification consumer stopped"),
        Ok(Err(e)) => error!(error = %e, "Failed to write notifications"),
        Err(e) => error!(error = %e, "Notification consumer panicked"),
    }

    result?;
    info!(channel = %channel, "Listener stopped");
    Ok(())
}
