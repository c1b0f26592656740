//! # Typed Telegram Views
//!
//! Read-only interpreters over a decoded [`Telegram`]. A view borrows the
//! telegram and resolves named fields at their fixed positions within the
//! logical message, so a partial telegram (non-zero offset, short data)
//! simply yields `None` for the fields it does not carry.
//!
//! ```rust
//! use ems_bus::{Operation, Telegram};
//! use ems_bus::views::OutdoorTemp;
//!
//! let telegram = Telegram::new(Operation::Broadcast, 0x08, 0x00, 0, OutdoorTemp::TYPE_ID, vec![0x00, 0x39]);
//! assert_eq!(OutdoorTemp::new(&telegram).outdoor_temperature(), Some(57));
//! ```

use tracing::debug;

use crate::protocol::{DeviceId, Telegram, TypeId, MAX_DATA_LENGTH};

/// Known type ids
///
/// Ids up to `0x00FF` are legacy-dialect types. The same message sent in the
/// extended dialect decodes to a different id: `FF 00 00 E4` carries type
/// `0x01E4`, not `MONITOR_FAST_PLUS`, so a handler registered here only
/// sees the legacy form. Ids above `0x00FF` are always extended.
pub mod types {
    use crate::protocol::TypeId;

    pub const DEVICE_VERSION: TypeId = 0x0002;
    pub const FACTORY: TypeId = 0x0004;
    pub const PARAMETERS: TypeId = 0x0016;
    pub const INTERNAL_WEATHER_COMPENSATED: TypeId = 0x0028;
    pub const OUTDOOR_TEMP: TypeId = 0x00D1;
    pub const MONITOR_SLOW_PLUS_2: TypeId = 0x00E3;
    /// Legacy id; the extended broadcast of the same monitor is `0x01E4`
    pub const MONITOR_FAST_PLUS: TypeId = 0x00E4;
    pub const MONITOR_SLOW_PLUS: TypeId = 0x00E5;
    pub const PARAMETERS_PLUS: TypeId = 0x00E6;
    /// Written by an external controller to announce itself
    pub const EXTERNAL_CONTROLLER: TypeId = 0x00E7;
    pub const MONITOR_WW_PLUS: TypeId = 0x00E9;
    pub const PARAMETERS_WW_PLUS: TypeId = 0x00EA;
    pub const PROTOCOL_VERSION: TypeId = 0x00EF;
    /// Start/stop heating command
    pub const HEATING_STATE: TypeId = 0x02E0;
}

/// Human readable name of a type id, used in interpreted log lines
pub fn type_name(type_id: TypeId) -> &'static str {
    match type_id {
        types::DEVICE_VERSION => "DeviceVersion",
        types::FACTORY => "Factory",
        types::PARAMETERS => "Parameters",
        types::INTERNAL_WEATHER_COMPENSATED => "InternalWeatherCompensatedMode",
        types::OUTDOOR_TEMP => "OutdoorTemp",
        types::MONITOR_SLOW_PLUS_2 => "MonitorSlowPlus2",
        types::MONITOR_FAST_PLUS => "MonitorFastPlus",
        types::MONITOR_SLOW_PLUS => "MonitorSlowPlus",
        types::PARAMETERS_PLUS => "ParametersPlus",
        types::EXTERNAL_CONTROLLER => "ExternalController",
        types::MONITOR_WW_PLUS => "MonitorWWPlus",
        types::PARAMETERS_WW_PLUS => "ParametersWWPlus",
        types::PROTOCOL_VERSION => "ProtocolVersion",
        types::HEATING_STATE => "HeatingState",
        _ => "Unknown",
    }
}

macro_rules! telegram_view {
    ($(#[$meta:meta])* $name:ident, $type_id:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name<'a> {
            telegram: &'a Telegram,
        }

        impl<'a> $name<'a> {
            pub const TYPE_ID: TypeId = $type_id;

            pub fn new(telegram: &'a Telegram) -> Self {
                Self { telegram }
            }

            pub fn telegram(&self) -> &'a Telegram {
                self.telegram
            }
        }
    };
}

/// Log every `Some` field as `"<view> <label> <value>"`
macro_rules! log_fields {
    ($view:expr, $($label:expr => $value:expr),+ $(,)?) => {
        $(
            if let Some(value) = $value {
                debug!(target: "ems::views", "{} {} {}", $view, $label, value);
            }
        )+
    };
}

telegram_view!(
    /// Fast-changing burner monitor (0x00E4)
    MonitorFastPlus,
    types::MONITOR_FAST_PLUS
);

impl<'a> MonitorFastPlus<'a> {
    /// Two-character display code, only carried by a telegram starting at offset 0
    pub fn display_code(&self) -> Option<String> {
        let data = self.telegram.data();
        if self.telegram.offset() != 0 || data.len() < 3 {
            return None;
        }
        Some(data[1..3].iter().map(|&b| b as char).collect())
    }

    pub fn service_code(&self) -> Option<u16> {
        self.telegram.u16_at(4)
    }

    pub fn selected_flow_temperature(&self) -> Option<u8> {
        self.telegram.u8_at(6)
    }

    pub fn current_flow_temperature(&self) -> Option<u16> {
        self.telegram.u16_at(7)
    }

    /// Burner power in percent
    pub fn current_burner_power(&self) -> Option<u8> {
        self.telegram.u8_at(10)
    }

    pub fn burning_gas(&self) -> Option<bool> {
        self.telegram.bit_at(11, 0)
    }

    pub fn pump_enabled(&self) -> Option<bool> {
        self.telegram.bit_at(11, 1)
    }

    pub fn three_way_valve(&self) -> Option<bool> {
        self.telegram.bit_at(11, 2)
    }

    pub fn siphon_filling(&self) -> Option<bool> {
        self.telegram.bit_at(11, 6)
    }

    pub fn return_temperature(&self) -> Option<u16> {
        self.telegram.u16_at(17)
    }

    pub fn pressure(&self) -> Option<u8> {
        self.telegram.u8_at(21)
    }

    /// Heating circuit active: pump running with the 3-way valve on the heating side
    pub fn heating_active(&self) -> Option<bool> {
        self.burning_gas()?;
        Some(!self.three_way_valve()? && self.pump_enabled()?)
    }

    /// Burner running with the 3-way valve on the warm water side
    pub fn warm_water_active(&self) -> Option<bool> {
        let gas = self.burning_gas()?;
        Some(gas && self.three_way_valve()?)
    }

    pub fn log_data(&self) {
        log_fields!("MonitorFastPlus",
            "display code" => self.display_code(),
            "service code" => self.service_code(),
            "selFlowTemp" => self.selected_flow_temperature(),
            "curFlowTemp" => self.current_flow_temperature(),
            "currentBurnPower" => self.current_burner_power(),
            "burning gas" => self.burning_gas(),
            "pump enabled" => self.pump_enabled(),
            "3way valve on" => self.three_way_valve(),
            "siphon filling" => self.siphon_filling(),
            "heating active" => self.heating_active(),
            "warm water active" => self.warm_water_active(),
            "return temperature" => self.return_temperature(),
            "pressure" => self.pressure(),
        );
    }
}

telegram_view!(
    /// Slow-changing burner monitor (0x00E5)
    MonitorSlowPlus,
    types::MONITOR_SLOW_PLUS
);

impl<'a> MonitorSlowPlus<'a> {
    pub fn fan_working(&self) -> Option<bool> {
        self.telegram.bit_at(2, 2)
    }

    pub fn ignition(&self) -> Option<bool> {
        self.telegram.bit_at(2, 3)
    }

    pub fn pump_enabled(&self) -> Option<bool> {
        self.telegram.bit_at(2, 5)
    }

    pub fn exhaust_temperature(&self) -> Option<u16> {
        self.telegram.u16_at(6)
    }

    pub fn burner_starts(&self) -> Option<u32> {
        self.telegram.u24_at(10)
    }

    /// Burner working time in minutes
    pub fn burner_minutes(&self) -> Option<u32> {
        self.telegram.u24_at(13)
    }

    pub fn log_data(&self) {
        log_fields!("MonitorSlowPlus",
            "fan working" => self.fan_working(),
            "ignition" => self.ignition(),
            "pump enabled" => self.pump_enabled(),
            "exhaust temperature" => self.exhaust_temperature(),
            "burn starts" => self.burner_starts(),
            "burn working min" => self.burner_minutes(),
        );
    }
}

telegram_view!(MonitorSlowPlus2, types::MONITOR_SLOW_PLUS_2);

impl<'a> MonitorSlowPlus2<'a> {
    pub fn pump_venting(&self) -> Option<u8> {
        self.telegram.u8_at(6)
    }

    pub fn warm_water_active(&self) -> Option<u8> {
        self.telegram.u8_at(5)
    }

    pub fn log_data(&self) {
        log_fields!("MonitorSlowPlus2",
            "warm water active" => self.warm_water_active(),
            "pump venting" => self.pump_venting(),
        );
    }
}

telegram_view!(
    /// Warm water monitor (0x00E9)
    MonitorWWPlus,
    types::MONITOR_WW_PLUS
);

impl<'a> MonitorWWPlus<'a> {
    pub fn set_temperature(&self) -> Option<u8> {
        self.telegram.u8_at(0)
    }

    pub fn current_temperature(&self) -> Option<u16> {
        self.telegram.u16_at(1)
    }

    /// Flow in l/min
    pub fn flow(&self) -> Option<u8> {
        self.telegram.u8_at(11)
    }

    pub fn log_data(&self) {
        log_fields!("MonitorWWPlus",
            "set temperature" => self.set_temperature(),
            "current temperature" => self.current_temperature(),
            "ww flow l/min" => self.flow(),
        );
    }
}

telegram_view!(
    /// Outdoor sensor reading (0x00D1), tenths of a degree
    OutdoorTemp,
    types::OUTDOOR_TEMP
);

impl<'a> OutdoorTemp<'a> {
    /// `None` also when the sensor reports one of the "not connected" sentinels
    pub fn outdoor_temperature(&self) -> Option<i16> {
        match self.telegram.i16_at(0)? {
            i16::MAX | i16::MIN => None,
            value => Some(value),
        }
    }

    pub fn request(source: DeviceId, destination: DeviceId) -> Telegram {
        Telegram::read(source, destination, Self::TYPE_ID, 2)
    }

    pub fn log_data(&self) {
        log_fields!("OutdoorTemp", "temp" => self.telegram.i16_at(0));
    }
}

telegram_view!(
    /// Heating parameters (0x00E6)
    ParametersPlus,
    types::PARAMETERS_PLUS
);

impl<'a> ParametersPlus<'a> {
    pub fn heating_enabled(&self) -> Option<u8> {
        self.telegram.u8_at(0)
    }

    pub fn heating_temperature(&self) -> Option<u8> {
        self.telegram.u8_at(1)
    }

    pub fn maximum_heating_temperature(&self) -> Option<u8> {
        self.telegram.u8_at(3)
    }

    pub fn request(source: DeviceId, destination: DeviceId) -> Telegram {
        Telegram::read(source, destination, Self::TYPE_ID, MAX_DATA_LENGTH as u8)
    }

    /// Write of the heating flow temperature at offset 1
    pub fn set_heating_temperature(source: DeviceId, destination: DeviceId, temperature: u8) -> Telegram {
        Telegram::write(source, destination, 1, Self::TYPE_ID, vec![temperature])
    }

    pub fn log_data(&self) {
        log_fields!("ParametersPlus",
            "heating enabled" => self.heating_enabled(),
            "heating temp" => self.heating_temperature(),
            "maximum heating temp" => self.maximum_heating_temperature(),
            "burn max power" => self.telegram.u8_at(4),
            "burn min power" => self.telegram.u8_at(5),
            "hysteresis on" => self.telegram.i8_at(8),
            "hysteresis off" => self.telegram.i8_at(9),
        );
    }
}

telegram_view!(
    /// Warm water parameters (0x00EA)
    ParametersWWPlus,
    types::PARAMETERS_WW_PLUS
);

impl<'a> ParametersWWPlus<'a> {
    pub fn warm_water_enabled(&self) -> Option<u8> {
        self.telegram.u8_at(5)
    }

    pub fn selected_temperature(&self) -> Option<u8> {
        self.telegram.u8_at(6)
    }

    pub fn eco(&self) -> Option<u8> {
        self.telegram.u8_at(26)
    }

    pub fn request(source: DeviceId, destination: DeviceId) -> Telegram {
        Telegram::read(source, destination, Self::TYPE_ID, MAX_DATA_LENGTH as u8)
    }

    pub fn log_data(&self) {
        log_fields!("ParametersWWPlus",
            "enabled" => self.warm_water_enabled(),
            "temp set" => self.selected_temperature(),
            "hysteresis on" => self.telegram.i8_at(7),
            "hysteresis off" => self.telegram.i8_at(8),
            "ECO" => self.eco(),
        );
    }
}

telegram_view!(Parameters, types::PARAMETERS);

impl<'a> Parameters<'a> {
    pub fn heating_enabled(&self) -> Option<u8> {
        self.telegram.u8_at(0)
    }

    pub fn heating_temperature(&self) -> Option<u8> {
        self.telegram.u8_at(1)
    }

    pub fn log_data(&self) {
        log_fields!("Parameters",
            "heating enabled" => self.heating_enabled(),
            "heating temp" => self.heating_temperature(),
            "burn max power" => self.telegram.u8_at(2),
            "burn min power" => self.telegram.u8_at(3),
            "pump delay" => self.telegram.u8_at(8),
        );
    }
}

telegram_view!(ProtocolVersion, types::PROTOCOL_VERSION);

impl<'a> ProtocolVersion<'a> {
    pub fn version(&self) -> Option<u8> {
        self.telegram.u8_at(0)
    }

    pub fn request(source: DeviceId, destination: DeviceId) -> Telegram {
        Telegram::read(source, destination, Self::TYPE_ID, MAX_DATA_LENGTH as u8)
    }

    pub fn log_data(&self) {
        log_fields!("ProtocolVersion", "EMS version" => self.version());
    }
}

telegram_view!(
    /// Device identification (0x0002)
    ///
    /// Some devices prefix the descriptor with three zero bytes; product and
    /// version are then read three positions further in.
    DeviceVersion,
    types::DEVICE_VERSION
);

impl<'a> DeviceVersion<'a> {
    /// Canned descriptor we answer read requests with: product 99, v1.1, vendor 99
    pub const OWN_DESCRIPTOR: [u8; 10] = [99, 1, 1, 0, 0, 0, 0, 0, 0, 99];

    fn descriptor_offset(&self) -> Option<u8> {
        let data = self.telegram.data();
        match *data.first()? {
            0 if data.get(3).map_or(false, |&b| b != 0) => Some(3),
            0 => None,
            _ => Some(0),
        }
    }

    fn descriptor_byte(&self, position: u8) -> Option<u8> {
        let shift = self.descriptor_offset()?;
        self.telegram.u8_at(position + shift)
    }

    pub fn vendor_id(&self) -> Option<u8> {
        self.telegram.u8_at(9)
    }

    pub fn product_id(&self) -> Option<u8> {
        self.descriptor_byte(0)
    }

    pub fn major(&self) -> Option<u8> {
        self.descriptor_byte(1)
    }

    pub fn minor(&self) -> Option<u8> {
        self.descriptor_byte(2)
    }

    pub fn request(source: DeviceId, destination: DeviceId) -> Telegram {
        Telegram::read(source, destination, Self::TYPE_ID, MAX_DATA_LENGTH as u8)
    }

    /// Write carrying the requested window of [`DeviceVersion::OWN_DESCRIPTOR`] back to `requester`
    ///
    /// The reply sits at the requested offset and is empty when the offset
    /// lies past the end of the descriptor.
    pub fn reply(source: DeviceId, requester: DeviceId, offset: u8, len: u8) -> Telegram {
        let start = (offset as usize).min(Self::OWN_DESCRIPTOR.len());
        let end = (start + len as usize).min(Self::OWN_DESCRIPTOR.len());
        Telegram::write(source, requester, offset, Self::TYPE_ID, &Self::OWN_DESCRIPTOR[start..end])
    }

    pub fn log_data(&self) {
        log_fields!("Version",
            "vendorId" => self.vendor_id(),
            "productId" => self.product_id(),
            "major" => self.major(),
            "minor" => self.minor(),
        );
    }
}

telegram_view!(
    /// Boiler factory data (0x0004)
    Factory,
    types::FACTORY
);

impl<'a> Factory<'a> {
    /// Nominal power in kW
    pub fn nominal_power(&self) -> Option<u8> {
        self.telegram.u8_at(4)
    }

    pub fn burner_min_power(&self) -> Option<u8> {
        self.telegram.u8_at(5)
    }

    pub fn burner_max_power(&self) -> Option<u8> {
        self.telegram.u8_at(6)
    }

    pub fn request(source: DeviceId, destination: DeviceId) -> Telegram {
        Telegram::read(source, destination, Self::TYPE_ID, MAX_DATA_LENGTH as u8)
    }

    pub fn log_data(&self) {
        log_fields!("Factory",
            "nominal power kW" => self.nominal_power(),
            "burn min power" => self.burner_min_power(),
            "burn max power" => self.burner_max_power(),
        );
    }
}

telegram_view!(InternalWeatherCompensatedMode, types::INTERNAL_WEATHER_COMPENSATED);

impl<'a> InternalWeatherCompensatedMode<'a> {
    pub fn enabled(&self) -> Option<u8> {
        self.telegram.u8_at(0)
    }

    pub fn temperature_max(&self) -> Option<u8> {
        self.telegram.u8_at(1)
    }

    pub fn temperature_min(&self) -> Option<u8> {
        self.telegram.u8_at(2)
    }

    pub fn log_data(&self) {
        log_fields!("InternalWeatherCompensatedMode",
            "enabled" => self.enabled(),
            "tempMax" => self.temperature_max(),
            "tempMin" => self.temperature_min(),
        );
    }
}

/// Write announcing an external controller to the boiler (0x00E7)
pub fn external_controller_request(source: DeviceId, destination: DeviceId) -> Telegram {
    Telegram::write(source, destination, 0, types::EXTERNAL_CONTROLLER, vec![0x00, 0x02, 0x00])
}

/// Start (`Some(temperature)`) or stop (`None`) heating (0x02E0)
pub fn heating_state_request(source: DeviceId, destination: DeviceId, temperature: Option<u8>) -> Telegram {
    let data = match temperature {
        Some(temperature) => vec![0x01, temperature, 0x64, 0x00, 0x01],
        None => vec![0x01, 0x00, 0x00, 0x00, 0x01],
    };
    Telegram::write(source, destination, 0, types::HEATING_STATE, data)
}
