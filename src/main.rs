use log::{error, info, warn};

use gaia_station::utils::{format_datetime, round_to};
use gaia_station::{connect_with_config, SessionHandle, StationConfig};

fn log_summary(session: &SessionHandle) {
    let state = session.state();
    let snapshot = &state.snapshot;

    info!(
        "Snapshot for {} at {}",
        session.host(),
        format_datetime(&snapshot.taken_at)
    );
    if !state.health.available {
        warn!(
            "  Station unavailable ({} consecutive failures), showing stale data",
            state.health.consecutive_failures
        );
    }

    for channel in state.channels.values().filter(|c| c.is_enabled_by_default()) {
        let Some(stats) = snapshot.get(&channel.id) else {
            continue;
        };
        let unit = channel.unit.unwrap_or("");
        match (stats.window, stats.rolling) {
            (Some(window), Some(rolling)) => info!(
                "  {}: {} {} (mean {}, min {}, max {}, median {}, rolling {}, {} samples)",
                channel.name,
                round_to(stats.latest, 2),
                unit,
                round_to(window.mean, 2),
                round_to(window.min, 2),
                round_to(window.max, 2),
                round_to(window.median, 2),
                round_to(rolling, 2),
                window.samples
            ),
            _ => info!("  {}: {} {}", channel.name, round_to(stats.latest, 2), unit),
        }
    }
}

async fn main_loop(mut session: SessionHandle) {
    log_summary(&session);
    while session.changed().await {
        log_summary(&session);
    }
    warn!("Polling for {} stopped unexpectedly", session.host());
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match StationConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let session = match connect_with_config(config).await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to connect: {}", e);
            return Err(e.into());
        }
    };

    // Run until the session ends or Ctrl+C arrives; dropping the session stops polling
    tokio::select! {
        _ = main_loop(session) => {}
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Program terminated by user. Exiting gracefully."),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        }
    }

    Ok(())
}
