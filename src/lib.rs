pub mod commands;
pub mod config;
pub mod hub;
pub mod serial;
pub mod telemetry;

use std::sync::Arc;

use anyhow::Context;

use config::{AppConfig, PublishMode};
use hub::BroadcastHub;
use serial::SerialInterface;
use telemetry::{EphemeralSocketPublisher, HubPublisher, SnapshotPublisher, TelemetryController};

/// Bring up the relay and the telemetry controller, serve the control
/// console on stdin/stdout and shut everything down on EOF or Ctrl-C.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let hub = BroadcastHub::bind(config.hub.authority(), config.hub.queue_size)
        .await
        .with_context(|| format!("Failed to bind overlay hub on {}", config.hub.authority()))?;
    hub.start().await.context("Failed to start overlay hub")?;

    let publisher: Arc<dyn SnapshotPublisher> = match config.telemetry.publish_mode {
        PublishMode::InProcess => Arc::new(HubPublisher::new(
            hub.registry(),
            config.telemetry.channels.clone(),
        )),
        PublishMode::EphemeralSocket => Arc::new(EphemeralSocketPublisher::new(
            &hub.local_addr().to_string(),
            config.telemetry.channels.clone(),
            config.telemetry.connect_timeout(),
        )),
    };

    let controller = TelemetryController::new(
        Arc::new(SerialInterface::new()),
        publisher,
        config.serial.clone(),
        config.telemetry.settings(),
    );

    if config.auto_open {
        if let Err(e) = controller.open_current_serial().await {
            log::warn!("Auto-open of {} failed: {}", config.serial.path, e);
        }
    }

    log::info!("Control console ready; consumers connect to {}", hub.url_for(1));

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    tokio::select! {
        result = commands::serve_console(&controller, stdin, stdout) => {
            if let Err(e) = result {
                log::error!("Control console failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupt received, shutting down");
        }
    }

    controller.dispose().await;
    hub.stop().await.context("Failed to stop overlay hub")?;
    Ok(())
}
