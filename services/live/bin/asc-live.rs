//! Main Entrypoint for the Live Study Assistant
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Initializing logging.
//! 3. Opening the speaker and starting a live session on the microphone.
//! 4. Rendering status and transcript until Ctrl+C or the remote side ends it.

use anyhow::Context;
use asc_live_service::{
    audio::{CpalOutput, list_input_devices},
    config::Config,
    render::render_snapshots,
    runner::LiveAssistant,
};
use clap::Parser;
use std::time::Duration;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(version, about = "Talk to your study tutor over Gemini Live")]
struct Cli {
    /// Input device name, overrides INPUT_DEVICE.
    #[arg(long)]
    input_device: Option<String>,

    /// Seconds to wait for the live session to open, overrides CONNECT_TIMEOUT_SECS.
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Print the available input devices and exit.
    #[arg(long)]
    list_devices: bool,
}

/// Listens for the `Ctrl+C` signal to end the session.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal. Ending session..."),
        Err(e) => {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.list_devices {
        for name in list_input_devices().context("Failed to list input devices")? {
            println!("{name}");
        }
        return Ok(());
    }

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(device) = cli.input_device {
        config.input_device = Some(device);
    }
    if let Some(secs) = cli.connect_timeout {
        anyhow::ensure!(secs > 0, "--connect-timeout must be a positive number of seconds");
        config.connect_timeout = Duration::from_secs(secs);
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(?config, "Configuration loaded.");

    // --- 3. Open the speaker and the session ---
    let output = CpalOutput::open().context("Failed to open the speaker")?;
    let mut assistant = LiveAssistant::new(config, output);
    let renderer = tokio::spawn(render_snapshots(assistant.subscribe()));

    // --- 4. Run until Ctrl+C or the remote side ends it ---
    let span = info_span!("live_session", session_id = %Uuid::new_v4());
    let result = async {
        match assistant.start().await {
            Ok(()) => assistant.run_until(shutdown_signal()).await,
            Err(e) => Err(e),
        }
    }
    .instrument(span)
    .await;

    drop(assistant);
    if let Err(e) = renderer.await {
        error!(error = %e, "Renderer task failed");
    }

    result.context("Live session failed")?;
    info!("Session ended.");
    Ok(())
}
