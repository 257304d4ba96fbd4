//! MetalGuard Daemon (metalguardd)
//!
//! Supervises one device: thermal control, power management, power
//! stability analytics and tamper detection, each running as its own task
//! under a shared cancellation token.
//!
//! # Lifecycle
//! - **Startup**: parse CLI, initialize logging, load settings, build subsystems
//! - **Run**: spawn every monitor; SIGINT/SIGTERM cancels the token
//! - **Failure**: the first monitor error cancels the rest and the exit code is non-zero
//! - **Shutdown**: wait for every task, then stop PWM and drive all pins low

mod cli;
mod system;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mg_core::constants::paths;
use mg_core::{load_settings, DeviceSettings, TestStatus};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::system::System;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Logging
// ============================================================================

/// Journald when the journal socket exists, stdout otherwise
fn init_logging() -> bool {
    let log_level = std::env::var("METALGUARD_LOG").unwrap_or_else(|_| "info".to_string());

    if Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
                return true;
            }
            Err(e) => eprintln!("Failed to create journald layer: {}, falling back to stdout", e),
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(&log_level)
        .init();
    false
}

// ============================================================================
// Settings
// ============================================================================

fn resolve_settings(cli: &Cli) -> anyhow::Result<DeviceSettings> {
    if let Some(path) = &cli.config {
        return load_settings(path).with_context(|| format!("loading settings from {}", path.display()));
    }

    let default_path = Path::new(paths::SETTINGS_FILE);
    if default_path.exists() {
        return load_settings(default_path)
            .with_context(|| format!("loading settings from {}", default_path.display()));
    }

    warn!(path = %default_path.display(), "No settings file, using built-in defaults");
    Ok(DeviceSettings::default())
}

// ============================================================================
// Run modes
// ============================================================================

/// Spawn every monitor and wait for all of them
///
/// Returns false when any monitor failed.
async fn supervise(system: &System, token: CancellationToken) -> bool {
    let mut tasks: JoinSet<(&'static str, mg_error::Result<()>)> = JoinSet::new();

    let thermal = system.thermal.clone();
    let t = token.clone();
    tasks.spawn(async move { ("thermal", thermal.run(t).await) });

    let power = system.power.clone();
    let t = token.clone();
    tasks.spawn(async move { ("power", power.run(t).await) });

    let stability = system.stability.clone();
    let t = token.clone();
    tasks.spawn(async move { ("stability", stability.run(t).await) });

    let edges = system.gpio.edges();
    let t = token.clone();
    tasks.spawn(async move { ("edges", edges.run(t).await) });

    if let Some(tamper) = &system.tamper {
        let tamper = Arc::clone(tamper);
        let t = token.clone();
        tasks.spawn(async move { ("tamper", tamper.run(t).await) });
    }

    info!(tasks = tasks.len(), "Monitors started");

    let mut healthy = true;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!(monitor = name, "Monitor stopped"),
            Ok((name, Err(e))) => {
                error!(monitor = name, error = %e, "Monitor failed, shutting down");
                healthy = false;
                token.cancel();
            }
            Err(e) => {
                error!(error = %e, "Monitor task panicked, shutting down");
                healthy = false;
                token.cancel();
            }
        }
    }
    healthy
}

async fn run_diagnostics(system: &System, settings: &DeviceSettings, token: CancellationToken) -> bool {
    system::prime(system);
    let diag = system::diagnostics(system, settings);
    let outcome = diag.run_all(token).await;

    let results = diag.results();
    let count = |status: TestStatus| results.iter().filter(|r| r.status == status).count();
    info!(
        passed = count(TestStatus::Pass),
        failed = count(TestStatus::Fail),
        warnings = count(TestStatus::Warning),
        "Diagnostics summary"
    );

    match outcome {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "Diagnostics failed");
            false
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // PHASE 1: Arguments and logging
    let cli = Cli::parse();
    let journald = init_logging();
    info!("STARTUP: metalguardd {} starting", VERSION);
    info!("STARTUP: Logging to {}", if journald { "systemd journal" } else { "stdout" });

    // PHASE 2: Settings and subsystems
    let settings = resolve_settings(&cli)?;
    let system = system::build(&settings, cli.simulate).context("building subsystems")?;
    info!(device = %settings.device_id, simulate = cli.simulate, "STARTUP: Subsystems ready");

    // PHASE 3: Signal handling
    let token = CancellationToken::new();
    let signal_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("SIGNAL: Received SIGINT/SIGTERM - initiating shutdown");
        signal_token.cancel();
    }) {
        warn!("Failed to set signal handler: {}. Shutdown via signals may not work cleanly.", e);
    }

    // PHASE 4: Run
    let healthy = if cli.diagnostics {
        run_diagnostics(&system, &settings, token).await
    } else {
        supervise(&system, token).await
    };

    // PHASE 5: Release hardware
    if let Err(e) = system.gpio.close().await {
        error!(error = %e, "Failed to release GPIO cleanly");
    }
    info!("SHUTDOWN: metalguardd stopped");

    Ok(if healthy { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
