//! Decode EMS telegrams given as hex on the command line
//!
//! ```text
//! $ ems_decode "88 00 D1 00 00 39 <crc>"
//! ```
//!
//! Each argument is one frame without the break marker. Set `RUST_LOG=debug`
//! to see the typed field breakdown of known telegrams.

use ems_bus::protocol::{classify_frame, FrameKind, Telegram};
use ems_bus::utils::format::{bytes_to_hex, parse_hex};
use ems_bus::views::{self, type_name, types};

fn log_fields(telegram: &Telegram) {
    match telegram.type_id() {
        types::MONITOR_FAST_PLUS => views::MonitorFastPlus::new(telegram).log_data(),
        types::MONITOR_SLOW_PLUS => views::MonitorSlowPlus::new(telegram).log_data(),
        types::MONITOR_SLOW_PLUS_2 => views::MonitorSlowPlus2::new(telegram).log_data(),
        types::MONITOR_WW_PLUS => views::MonitorWWPlus::new(telegram).log_data(),
        types::OUTDOOR_TEMP => views::OutdoorTemp::new(telegram).log_data(),
        types::PARAMETERS_PLUS => views::ParametersPlus::new(telegram).log_data(),
        types::PARAMETERS_WW_PLUS => views::ParametersWWPlus::new(telegram).log_data(),
        types::PARAMETERS => views::Parameters::new(telegram).log_data(),
        types::PROTOCOL_VERSION => views::ProtocolVersion::new(telegram).log_data(),
        types::DEVICE_VERSION => views::DeviceVersion::new(telegram).log_data(),
        types::FACTORY => views::Factory::new(telegram).log_data(),
        types::INTERNAL_WEATHER_COMPENSATED => views::InternalWeatherCompensatedMode::new(telegram).log_data(),
        _ => {}
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .without_time()
        .init();

    let frames: Vec<String> = std::env::args().skip(1).collect();
    if frames.is_empty() {
        anyhow::bail!("usage: ems_decode <hex frame>...");
    }

    for arg in frames {
        let raw = parse_hex(&arg)?;
        match classify_frame(&raw) {
            FrameKind::Poll(id) => println!("poll for 0x{:02X}", id),
            FrameKind::Runt => println!("{}: too short for a telegram", bytes_to_hex(&raw)),
            FrameKind::Telegram => match Telegram::decode(&raw) {
                Ok(telegram) => {
                    println!("[{}] {}", type_name(telegram.type_id()), telegram);
                    log_fields(&telegram);
                }
                Err(e) => println!("{}: {}", bytes_to_hex(&raw), e),
            },
        }
    }
    Ok(())
}
