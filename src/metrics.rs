//! Gas energy accounting
//!
//! [`EnergyMetrics`] integrates the burner modulation reported in
//! `MonitorFastPlus` over time. Each sample closes the interval opened by the
//! previous one, weighted with the *previous* power percentage, and books the
//! result into the bucket that was active during that interval.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::controller::BusController;
use crate::error::EmsResult;
use crate::views::{Factory, MonitorFastPlus};

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Energy booked since the last [`EnergyMetrics::take_energy`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EnergyReport {
    #[serde(rename = "totalEnergyUsedKwh")]
    pub total_kwh: f64,
    #[serde(rename = "heatingEnergyUsedKwh")]
    pub heating_kwh: f64,
    #[serde(rename = "warmWaterEnergyUsedKwh")]
    pub warm_water_kwh: f64,
}

#[derive(Debug, Default)]
struct Accumulator {
    last_sample: Option<(u8, Instant)>,
    heating_active: bool,
    warm_water_active: bool,
    report: EnergyReport,
}

impl Accumulator {
    fn integrate_until(&mut self, now: Instant, nominal_kw: u8) {
        let Some((percent, since)) = self.last_sample else {
            return;
        };
        let elapsed_ms = now.saturating_duration_since(since).as_secs_f64() * 1000.0;
        let kwh = f64::from(nominal_kw) * f64::from(percent) / 100.0 * elapsed_ms / MS_PER_HOUR;

        self.report.total_kwh += kwh;
        if self.heating_active {
            self.report.heating_kwh += kwh;
        }
        if self.warm_water_active {
            self.report.warm_water_kwh += kwh;
        }
        self.last_sample = Some((percent, now));
    }
}

/// Burner energy accumulator fed by controller handlers
#[derive(Debug, Default)]
pub struct EnergyMetrics {
    nominal_power_kw: AtomicU8,
    inner: Mutex<Accumulator>,
}

impl EnergyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the `0x00E4` and `0x0004` handlers on `controller`
    pub fn subscribe(self: &Arc<Self>, controller: &BusController) {
        let metrics = self.clone();
        controller.register_handler(MonitorFastPlus::TYPE_ID, move |t| {
            metrics.on_fast_plus(&MonitorFastPlus::new(t))
        });
        let metrics = self.clone();
        controller.register_handler(Factory::TYPE_ID, move |t| metrics.on_factory(&Factory::new(t)));
    }

    fn lock(&self) -> MutexGuard<'_, Accumulator> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn nominal_power_kw(&self) -> u8 {
        self.nominal_power_kw.load(Ordering::Relaxed)
    }

    pub fn set_nominal_power_kw(&self, kw: u8) {
        self.nominal_power_kw.store(kw, Ordering::Relaxed);
    }

    pub fn on_factory(&self, view: &Factory<'_>) {
        let kw = view.nominal_power().unwrap_or(0);
        debug!(target: "ems::controller", "boiler nominal power {} kW", kw);
        self.set_nominal_power_kw(kw);
    }

    pub fn on_fast_plus(&self, view: &MonitorFastPlus<'_>) {
        self.on_fast_plus_at(view, Instant::now());
    }

    /// Telegrams without a burner power value leave the accumulator untouched
    pub fn on_fast_plus_at(&self, view: &MonitorFastPlus<'_>, now: Instant) {
        let Some(percent) = view.current_burner_power() else {
            return;
        };
        let nominal = self.nominal_power_kw();
        let mut acc = self.lock();
        acc.integrate_until(now, nominal);
        acc.last_sample = Some((percent, now));

        if let Some(heating) = view.heating_active() {
            acc.heating_active = heating;
        }
        if let Some(warm_water) = view.warm_water_active() {
            acc.warm_water_active = warm_water;
        }
    }

    /// Energy used since the previous call; the buckets start over at zero
    pub fn take_energy(&self) -> EnergyReport {
        self.take_energy_at(Instant::now())
    }

    pub fn take_energy_at(&self, now: Instant) -> EnergyReport {
        let nominal = self.nominal_power_kw();
        let mut acc = self.lock();
        acc.integrate_until(now, nominal);
        std::mem::take(&mut acc.report)
    }

    /// Drains the buckets like [`EnergyMetrics::take_energy`]
    pub fn to_json(&self) -> EmsResult<String> {
        Ok(serde_json::to_string(&self.take_energy())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Operation, Telegram};
    use std::time::Duration;

    fn fast_plus(power: u8, heating: bool, warm_water: bool) -> Telegram {
        let mut data = vec![0u8; 27];
        data[10] = power;
        // bit 0 gas, bit 1 pump, bit 2 three-way valve on warm water
        data[11] = match (heating, warm_water) {
            (true, _) => 0b011,
            (false, true) => 0b101,
            (false, false) => 0,
        };
        Telegram::new(Operation::Broadcast, 0x08, 0x00, 0, 0x00E4, data)
    }

    #[test]
    fn test_integrates_with_previous_power() {
        let metrics = EnergyMetrics::new();
        metrics.set_nominal_power_kw(24);
        let start = Instant::now();

        let half = fast_plus(50, true, false);
        metrics.on_fast_plus_at(&MonitorFastPlus::new(&half), start);
        let off = fast_plus(0, false, false);
        metrics.on_fast_plus_at(&MonitorFastPlus::new(&off), start + Duration::from_secs(3600));

        let report = metrics.take_energy_at(start + Duration::from_secs(7200));
        assert!((report.total_kwh - 12.0).abs() < 1e-9);
        assert!((report.heating_kwh - 12.0).abs() < 1e-9);
        assert_eq!(report.warm_water_kwh, 0.0);

        // buckets were reset
        let again = metrics.take_energy_at(start + Duration::from_secs(7200));
        assert_eq!(again, EnergyReport::default());
    }

    #[test]
    fn test_take_energy_closes_open_interval() {
        let metrics = EnergyMetrics::new();
        metrics.set_nominal_power_kw(20);
        let start = Instant::now();

        let telegram = fast_plus(100, false, true);
        metrics.on_fast_plus_at(&MonitorFastPlus::new(&telegram), start);
        let report = metrics.take_energy_at(start + Duration::from_secs(1800));
        assert!((report.total_kwh - 10.0).abs() < 1e-9);
        assert!((report.warm_water_kwh - 10.0).abs() < 1e-9);
        assert_eq!(report.heating_kwh, 0.0);
    }

    #[test]
    fn test_factory_sets_nominal_power() {
        let metrics = EnergyMetrics::new();
        let telegram = Telegram::new(Operation::Write, 0x08, 0x19, 0, 0x0004, vec![0, 0, 0, 0, 24, 30, 100]);
        metrics.on_factory(&Factory::new(&telegram));
        assert_eq!(metrics.nominal_power_kw(), 24);

        let short = Telegram::new(Operation::Write, 0x08, 0x19, 0, 0x0004, vec![0, 0]);
        metrics.on_factory(&Factory::new(&short));
        assert_eq!(metrics.nominal_power_kw(), 0);
    }

    #[test]
    fn test_json_keys() {
        let metrics = EnergyMetrics::new();
        let json = metrics.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"totalEnergyUsedKwh":0.0,"heatingEnergyUsedKwh":0.0,"warmWaterEnergyUsedKwh":0.0}"#
        );
    }
}
