use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use overlay_telemetry_lib::config::AppConfig;

#[derive(Parser)]
#[command(name = "overlay-telemetry")]
#[command(about = "Serial telemetry to overlay relay")]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hub listen host
    #[arg(long)]
    host: Option<String>,

    /// Hub listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Serial device path, e.g. /dev/ttyUSB0 or COM3
    #[arg(short, long)]
    device: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Open the serial device at startup
    #[arg(long)]
    open: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(self, config: &mut AppConfig) -> Result<()> {
        if let Some(host) = self.host {
            config.hub.host = host;
        }
        if let Some(port) = self.port {
            config.hub.port = port;
        }
        if let Some(device) = self.device {
            config.serial.path = device;
        }
        if let Some(baud) = self.baud {
            if baud == 0 {
                anyhow::bail!("--baud must be positive");
            }
            config.serial.baud_rate = baud;
        }
        if self.open {
            config.auto_open = true;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config)?;

    log::info!("overlay-telemetry starting");
    log::info!("  Hub: {}", config.hub.authority());
    log::info!("  Serial: {}", config.serial);
    log::info!("  Publish mode: {:?}", config.telemetry.publish_mode);

    overlay_telemetry_lib::run(config).await
}
