//! # ems_bus - EMS Heating-Bus Protocol Stack
//!
//! An async implementation of the EMS bus used by Bosch / Buderus / Nefit
//! boilers: a half-duplex 9600 baud serial bus where the boiler polls every
//! device in turn and frames are delimited by a line break instead of a
//! length byte.
//!
//! ## Features
//!
//! - **Telegram codec**: legacy and extended (`0xFF`) dialects, CRC-8, typed field extraction
//! - **Break-framed transport**: tokio task per UART with timed transmit and self-healing resync
//! - **Poll-driven controller**: priority send queue, echo confirmation, read-request answers
//! - **Forwarder**: bridges a second bus segment and answers polls on its devices' behalf
//! - **Boiler state**: last-known values with JSON export, energy accounting
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ems_bus::{BusService, EmsConfig, EmsService};
//!
//! #[tokio::main]
//! async fn main() -> ems_bus::EmsResult<()> {
//!     let config = EmsConfig::from_file("ems.yaml")?;
//!     let mut service = EmsService::new(config)?;
//!     service.start().await?;
//!
//!     if let Some(controller) = service.controller() {
//!         controller.register_handler(0x00D1, |telegram| println!("{}", telegram));
//!         controller.change_state(true, 55);
//!     }
//!
//!     tokio::signal::ctrl_c().await?;
//!     service.stop().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   run_loop()   ┌──────────────────┐   handlers   ┌──────────────┐
//! │  EmsService  │───────────────►│  BusController   │─────────────►│ BoilerState  │
//! └──────────────┘                └──────────────────┘              │ EnergyMetrics│
//!                                   ▲ process_frame │ transmit     └──────────────┘
//!                                   │               ▼
//! ┌──────────────┐  relay / polls ┌──────────────────┐
//! │  Forwarder   │◄──────────────►│  BusTransport    │◄──── BusPort (UART)
//! └──────────────┘                └──────────────────┘
//! ```

/// Error type and result alias
pub mod error;

/// Telegram model, CRC and wire codec
pub mod protocol;

/// Typed views over known boiler telegrams
pub mod views;

/// Break-framed serial transport
pub mod transport;

/// Second bus segment bridge
pub mod forwarder;

/// Poll-driven protocol state machine
pub mod controller;

/// Last-known boiler values
pub mod boiler_state;

/// Energy accounting
pub mod metrics;

/// YAML configuration
pub mod config;

/// Service lifecycle
pub mod service;

/// Utility functions
pub mod utils;

/// Callback logging
pub mod logging;

pub use boiler_state::{BoilerParams, BoilerParamsSnapshot, BoilerState, BoilerStateSnapshot};
pub use config::EmsConfig;
pub use controller::{BusController, ControllerConfig, ControllerStats, SendQueue, TelegramHandler};
pub use error::{EmsError, EmsResult};
pub use forwarder::{ForwardHook, ForwardQueues, Forwarder};
pub use logging::{CallbackLogger, Direction, LogCallback, LogLevel, LoggingMode};
pub use metrics::{EnergyMetrics, EnergyReport};
pub use protocol::{DeviceId, FrameKind, Operation, Telegram, TypeId};
pub use service::{BusService, EmsService, ServiceStats, ServiceStatus};
pub use transport::{
    BusLink, BusPort, BusTransport, FrameHandler, PortEvent, SerialBusPort, TransportCommand, TransportConfig,
    TransportHandle, TransportStats,
};
pub use utils::PeriodicTimer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("ems_bus v{} - EMS heating-bus protocol stack", VERSION)
}
