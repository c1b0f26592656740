//! Last-known boiler values
//!
//! [`BoilerState`] and [`BoilerParams`] each guard one aggregate with their own
//! lock. Handlers update them from typed views; readers take a snapshot. A
//! field is `None` until a telegram carrying it has been decoded, and the JSON
//! export omits absent fields.

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use crate::error::EmsResult;
use crate::views::{
    MonitorFastPlus, MonitorSlowPlus, MonitorSlowPlus2, MonitorWWPlus, OutdoorTemp, ParametersPlus,
    ParametersWWPlus, ProtocolVersion,
};

/// Copy of the boiler state at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoilerStateSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warm_water_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_warm_water_temperature: Option<u8>,
    /// Tenths of a degree
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outdoor_temperature: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heating_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_flow_temperature: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_flow_temperature: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burning_gas: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pump_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_burner_power: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pump_venting: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filling_siphon: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warm_water_flow: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_warm_water_temperature: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heating_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warm_water_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u8>,
}

/// Overwrite `field` only when the telegram carried a value
fn update<T>(field: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *field = value;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared boiler state, updated by the controller's telegram handlers
#[derive(Debug, Default)]
pub struct BoilerState {
    inner: Mutex<BoilerStateSnapshot>,
}

impl BoilerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BoilerStateSnapshot {
        lock(&self.inner).clone()
    }

    /// JSON object with every field observed so far
    pub fn to_json(&self) -> EmsResult<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    /// Forget every value
    pub fn clear(&self) {
        *lock(&self.inner) = BoilerStateSnapshot::default();
    }

    pub fn apply_monitor_fast_plus(&self, view: &MonitorFastPlus<'_>) {
        let mut s = lock(&self.inner);
        update(&mut s.selected_flow_temperature, view.selected_flow_temperature());
        update(&mut s.current_flow_temperature, view.current_flow_temperature());
        update(&mut s.burning_gas, view.burning_gas());
        update(&mut s.pump_enabled, view.pump_enabled());
        update(&mut s.pressure, view.pressure());
        update(&mut s.current_burner_power, view.current_burner_power());
        update(&mut s.heating_active, view.heating_active());
        update(&mut s.warm_water_active, view.warm_water_active());
        update(&mut s.filling_siphon, view.siphon_filling());
        update(&mut s.service_code, view.service_code());
        update(&mut s.display_code, view.display_code());
    }

    pub fn apply_monitor_slow_plus(&self, view: &MonitorSlowPlus<'_>) {
        update(&mut lock(&self.inner).fan_enabled, view.fan_working());
    }

    pub fn apply_monitor_slow_plus_2(&self, view: &MonitorSlowPlus2<'_>) {
        update(&mut lock(&self.inner).pump_venting, view.pump_venting().map(|v| v != 0));
    }

    pub fn apply_parameters_ww_plus(&self, view: &ParametersWWPlus<'_>) {
        let mut s = lock(&self.inner);
        update(&mut s.warm_water_enabled, view.warm_water_enabled().map(|v| v != 0));
        update(&mut s.selected_warm_water_temperature, view.selected_temperature());
    }

    pub fn apply_parameters_plus(&self, view: &ParametersPlus<'_>) {
        update(&mut lock(&self.inner).heating_enabled, view.heating_enabled().map(|v| v != 0));
    }

    /// Stored in tenths of a degree; a "not connected" reading clears the value
    pub fn apply_outdoor_temp(&self, view: &OutdoorTemp<'_>) {
        if view.telegram().i16_at(0).is_none() {
            return;
        }
        lock(&self.inner).outdoor_temperature = view.outdoor_temperature().map(|t| t.saturating_mul(10));
    }

    pub fn apply_monitor_ww_plus(&self, view: &MonitorWWPlus<'_>) {
        let mut s = lock(&self.inner);
        update(&mut s.warm_water_flow, view.flow());
        update(&mut s.current_warm_water_temperature, view.current_temperature());
    }

    pub fn apply_protocol_version(&self, view: &ProtocolVersion<'_>) {
        update(&mut lock(&self.inner).protocol_version, view.version());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoilerParamsSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_heating_temperature: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heating_temperature: Option<u8>,
}

/// Boiler parameters read back from the boiler
#[derive(Debug, Default)]
pub struct BoilerParams {
    inner: Mutex<BoilerParamsSnapshot>,
}

impl BoilerParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BoilerParamsSnapshot {
        lock(&self.inner).clone()
    }

    pub fn heating_temperature(&self) -> Option<u8> {
        lock(&self.inner).heating_temperature
    }

    pub fn to_json(&self) -> EmsResult<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    pub fn clear(&self) {
        *lock(&self.inner) = BoilerParamsSnapshot::default();
    }

    pub fn apply_parameters_plus(&self, view: &ParametersPlus<'_>) {
        let mut p = lock(&self.inner);
        update(&mut p.maximum_heating_temperature, view.maximum_heating_temperature());
        update(&mut p.heating_temperature, view.heating_temperature());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Operation, Telegram};
    use crate::views::types;

    fn broadcast(type_id: u16, offset: u8, data: &[u8]) -> Telegram {
        Telegram::new(Operation::Broadcast, 0x08, 0x00, offset, type_id, data.to_vec())
    }

    #[test]
    fn test_empty_state_exports_empty_object() {
        let state = BoilerState::new();
        assert_eq!(state.to_json().unwrap(), "{}");
        assert_eq!(BoilerParams::new().to_json().unwrap(), "{}");
    }

    #[test]
    fn test_partial_update_keeps_other_fields() {
        let state = BoilerState::new();
        let full = broadcast(
            types::MONITOR_FAST_PLUS,
            0,
            &[
                0x00, 0x2D, 0x2D, 0x00, 0x00, 0xC8, 0x3D, 0x02, 0x6C, 0x64, 0x29, 0x03, 0x00, 0x02,
                0x48, 0x00, 0x00, 0x00, 0x00, 0x01, 0xED, 0x11, 0x00, 0x02, 0x6C, 0x00, 0x00,
            ],
        );
        state.apply_monitor_fast_plus(&MonitorFastPlus::new(&full));

        let partial = broadcast(types::MONITOR_FAST_PLUS, 10, &[0x00, 0x00]);
        state.apply_monitor_fast_plus(&MonitorFastPlus::new(&partial));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.current_burner_power, Some(0));
        assert_eq!(snapshot.burning_gas, Some(false));
        assert_eq!(snapshot.selected_flow_temperature, Some(0x3D));
        assert_eq!(snapshot.display_code.as_deref(), Some("--"));
        assert_eq!(snapshot.pressure, Some(0x11));
    }

    #[test]
    fn test_outdoor_temperature_scaling() {
        let state = BoilerState::new();
        let reading = broadcast(types::OUTDOOR_TEMP, 0, &[0x00, 0x39]);
        state.apply_outdoor_temp(&OutdoorTemp::new(&reading));
        assert_eq!(state.snapshot().outdoor_temperature, Some(570));

        let disconnected = broadcast(types::OUTDOOR_TEMP, 0, &[0x80, 0x00]);
        state.apply_outdoor_temp(&OutdoorTemp::new(&disconnected));
        assert_eq!(state.snapshot().outdoor_temperature, None);
    }

    #[test]
    fn test_json_export_and_clear() {
        let state = BoilerState::new();
        let params = BoilerParams::new();
        let telegram = broadcast(types::PARAMETERS_PLUS, 0, &[0x01, 0x2E, 0x00, 0x52]);
        state.apply_parameters_plus(&ParametersPlus::new(&telegram));
        params.apply_parameters_plus(&ParametersPlus::new(&telegram));

        assert_eq!(state.to_json().unwrap(), r#"{"heatingEnabled":true}"#);
        assert_eq!(
            params.to_json().unwrap(),
            r#"{"maximumHeatingTemperature":82,"heatingTemperature":46}"#
        );
        assert_eq!(params.heating_temperature(), Some(46));

        state.clear();
        params.clear();
        assert_eq!(state.snapshot(), BoilerStateSnapshot::default());
        assert_eq!(params.heating_temperature(), None);
    }
}
