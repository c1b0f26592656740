//! Utility functions and helpers for EMS operations
//!
//! This module contains hex formatting, the interval timer driving periodic
//! bus requests, input validation and test logging setup.

use std::time::{Duration, Instant};
use log::debug;
use crate::error::{EmsError, EmsResult};

/// Fires at most once per interval, the very first check always fires
#[derive(Debug, Clone)]
pub struct PeriodicTimer {
    interval: Duration,
    last_fired: Option<Instant>,
}

impl PeriodicTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: None,
        }
    }

    /// Returns true and re-arms when the interval has elapsed
    pub fn duration_passed(&mut self) -> bool {
        self.duration_passed_at(Instant::now())
    }

    fn duration_passed_at(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_fired {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_fired = Some(now);
        true
    }
}

/// Data validation utilities
pub mod validation {
    use super::*;
    use crate::protocol::{DeviceId, MAX_TELEGRAM_SIZE};

    /// Validate a 7-bit bus address (1-127)
    pub fn validate_device_id(device_id: DeviceId) -> EmsResult<()> {
        if device_id == 0 || device_id > 0x7F {
            return Err(EmsError::invalid_data(format!(
                "Invalid device ID: 0x{:02X} (must be 0x01-0x7F)",
                device_id
            )));
        }
        Ok(())
    }

    /// Validate a frame length for transmission
    pub fn validate_frame_len(len: usize) -> EmsResult<()> {
        if len == 0 || len > MAX_TELEGRAM_SIZE {
            return Err(EmsError::transmit(format!(
                "frame of {} bytes (must be 1-{})",
                len, MAX_TELEGRAM_SIZE
            )));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Parse hex text such as `"88 00 D1 00 00 39 77"`; whitespace and `:` are ignored
    pub fn parse_hex(text: &str) -> EmsResult<Vec<u8>> {
        let compact: String = text
            .chars()
            .filter(|c| !c.is_whitespace() && *c != ':')
            .collect();
        hex::decode(&compact).map_err(|e| EmsError::invalid_data(format!("Invalid hex '{}': {}", text, e)))
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }
}

/// Logging utilities
pub mod logging {
    use super::*;

    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
        debug!("test logger ready");
    }
}
