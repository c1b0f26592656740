//! EMS gateway
//!
//! Runs the bus service against the serial port(s) named in a YAML file and
//! prints the status JSON at a fixed interval until Ctrl-C. Naming a
//! telegram logging mode (`raw`, `interpreted` or `both`) mirrors every
//! telegram to the console.
//!
//! ```text
//! ems_gateway [config.yaml] [status-interval-secs] [telegram-log-mode]
//! ```

use std::time::Duration;

use anyhow::Context;
use ems_bus::{BusService, CallbackLogger, EmsConfig, EmsService, LoggingMode};
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => EmsConfig::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => {
            warn!("no configuration file given, using defaults");
            EmsConfig::default()
        }
    };
    let status_interval = match args.next() {
        Some(secs) => Duration::from_secs(secs.parse().context("status interval must be whole seconds")?),
        None => Duration::from_secs(DEFAULT_STATUS_INTERVAL_SECS),
    };

    let telegram_logger = match args.next() {
        Some(name) => {
            let mut logger = CallbackLogger::console();
            logger.set_mode(name.parse::<LoggingMode>()?);
            logger
        }
        None => CallbackLogger::disabled(),
    };

    info!("{}", ems_bus::info());
    let mut service = EmsService::new(config)?.with_logger(telegram_logger);
    service.start().await.context("starting EMS service")?;

    let mut ticker = tokio::time::interval(status_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match service.status_json() {
                    Ok(json) => println!("{}", json),
                    Err(e) => warn!("status unavailable: {}", e),
                }
                let energy = service.metrics().take_energy();
                info!(
                    total_kwh = energy.total_kwh,
                    heating_kwh = energy.heating_kwh,
                    warm_water_kwh = energy.warm_water_kwh,
                    "gas used since last report"
                );
            }
            _ = signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
        }
    }

    service.stop().await?;
    Ok(())
}
