//! YAML configuration for the gateway
//!
//! Every field has a default, so an empty document is a valid configuration.
//!
//! ```yaml
//! enabled: true
//! bus:
//!   port: /dev/ttyUSB0
//!   packet_logging: false
//! forwarder:
//!   enabled: true
//!   port: /dev/ttyUSB1
//! controller:
//!   device_id: 0x19
//!   loop_interval_ms: 100
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controller::{ControllerConfig, DEFAULT_MAX_UNCONFIRMED, DEFAULT_SEND_QUEUE_CAPACITY};
use crate::error::{EmsError, EmsResult};
use crate::forwarder::FORWARD_QUEUE_CAPACITY;
use crate::protocol::ADDRESS_MASK;
use crate::transport::TransportConfig;
use crate::utils::validation::validate_device_id;

/// Primary bus serial settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BusSection {
    pub port: String,
    pub packet_logging: bool,
    /// Resync after this long without a frame
    pub rx_timeout_ms: u64,
    pub break_marker: bool,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            packet_logging: false,
            rx_timeout_ms: 5000,
            break_marker: true,
        }
    }
}

/// Secondary segment bridge
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwarderSection {
    pub enabled: bool,
    pub port: String,
    pub queue_capacity: usize,
    pub packet_logging: bool,
}

impl Default for ForwarderSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: "/dev/ttyUSB1".to_string(),
            queue_capacity: FORWARD_QUEUE_CAPACITY,
            packet_logging: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ControllerSection {
    pub device_id: u8,
    pub boiler_id: u8,
    pub address_mask: u8,
    pub send_queue_capacity: usize,
    pub max_unconfirmed: usize,
    pub parameters_interval_secs: u64,
    pub details_interval_secs: u64,
    pub loop_interval_ms: u64,
    pub startup_requests: bool,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            device_id: 0x19,
            boiler_id: 0x08,
            address_mask: ADDRESS_MASK,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            max_unconfirmed: DEFAULT_MAX_UNCONFIRMED,
            parameters_interval_secs: 119,
            details_interval_secs: 179,
            loop_interval_ms: 100,
            startup_requests: true,
        }
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EmsConfig {
    /// Master switch for the controller
    pub enabled: bool,
    pub bus: BusSection,
    pub forwarder: ForwarderSection,
    pub controller: ControllerSection,
}

impl Default for EmsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bus: BusSection::default(),
            forwarder: ForwarderSection::default(),
            controller: ControllerSection::default(),
        }
    }
}

impl EmsConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> EmsResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> EmsResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EmsError::configuration(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> EmsResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> EmsResult<()> {
        let c = &self.controller;
        validate_device_id(c.device_id)
            .map_err(|e| EmsError::configuration(format!("controller.device_id: {}", e)))?;
        validate_device_id(c.boiler_id)
            .map_err(|e| EmsError::configuration(format!("controller.boiler_id: {}", e)))?;
        if c.device_id == c.boiler_id {
            return Err(EmsError::configuration("controller.device_id equals controller.boiler_id"));
        }
        if c.send_queue_capacity == 0 {
            return Err(EmsError::configuration("controller.send_queue_capacity must be positive"));
        }
        if c.loop_interval_ms == 0 {
            return Err(EmsError::configuration("controller.loop_interval_ms must be positive"));
        }
        if c.parameters_interval_secs == 0 || c.details_interval_secs == 0 {
            return Err(EmsError::configuration("periodic request intervals must be positive"));
        }
        if self.bus.port.is_empty() {
            return Err(EmsError::configuration("bus.port is empty"));
        }
        if self.forwarder.enabled {
            if self.forwarder.port.is_empty() {
                return Err(EmsError::configuration("forwarder.port is empty"));
            }
            if self.forwarder.port == self.bus.port {
                return Err(EmsError::configuration("forwarder.port equals bus.port"));
            }
            if self.forwarder.queue_capacity == 0 {
                return Err(EmsError::configuration("forwarder.queue_capacity must be positive"));
            }
        }
        Ok(())
    }

    /// Primary transport settings; `rx_timeout_ms: 0` disables the timeout
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            name: "ems".to_string(),
            rx_timeout: (self.bus.rx_timeout_ms > 0).then(|| Duration::from_millis(self.bus.rx_timeout_ms)),
            break_marker: self.bus.break_marker,
            packet_logging: self.bus.packet_logging,
            ..TransportConfig::new(self.bus.port.clone())
        }
    }

    /// The secondary segment waits for frames without a timeout
    pub fn forwarder_transport_config(&self) -> TransportConfig {
        TransportConfig {
            name: "forwarder".to_string(),
            rx_timeout: None,
            break_marker: self.bus.break_marker,
            packet_logging: self.forwarder.packet_logging,
            ..TransportConfig::new(self.forwarder.port.clone())
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        let c = &self.controller;
        ControllerConfig {
            device_id: c.device_id,
            boiler_id: c.boiler_id,
            address_mask: c.address_mask,
            send_queue_capacity: c.send_queue_capacity,
            max_unconfirmed: c.max_unconfirmed,
            parameters_interval: Duration::from_secs(c.parameters_interval_secs),
            details_interval: Duration::from_secs(c.details_interval_secs),
            startup_requests: c.startup_requests,
            enabled: self.enabled,
        }
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.controller.loop_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EmsConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, EmsConfig::default());
        assert!(config.enabled);
        assert!(!config.forwarder.enabled);
        assert_eq!(config.controller.send_queue_capacity, 59);
        assert_eq!(config.transport_config().rx_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.forwarder_transport_config().rx_timeout, None);
    }

    #[test]
    fn test_partial_document() {
        let yaml = "
enabled: false
bus:
  port: /dev/ttyS3
  packet_logging: true
forwarder:
  enabled: true
  port: /dev/ttyS4
controller:
  device_id: 0x18
  loop_interval_ms: 250
";
        let config = EmsConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.bus.port, "/dev/ttyS3");
        assert_eq!(config.bus.rx_timeout_ms, 5000);
        assert_eq!(config.forwarder.queue_capacity, 10);
        assert_eq!(config.loop_interval(), Duration::from_millis(250));

        let controller = config.controller_config();
        assert_eq!(controller.device_id, 0x18);
        assert_eq!(controller.boiler_id, 0x08);
        assert!(!controller.enabled);

        let transport = config.transport_config();
        assert!(transport.packet_logging);
        assert_eq!(transport.port, "/dev/ttyS3");
    }

    #[test]
    fn test_validation_errors() {
        let mut config = EmsConfig::default();
        config.controller.device_id = 0x08;
        assert!(config.validate().is_err());

        let mut config = EmsConfig::default();
        config.controller.device_id = 0x80;
        assert!(config.validate().is_err());

        let mut config = EmsConfig::default();
        config.forwarder.enabled = true;
        config.forwarder.port = config.bus.port.clone();
        assert!(config.validate().is_err());

        assert!(EmsConfig::from_yaml_str("controller: [1, 2]").is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = EmsConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(EmsConfig::from_yaml_str(&yaml).unwrap(), config);
    }
}
