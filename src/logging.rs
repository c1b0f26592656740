use std::str::FromStr;
use std::sync::Arc;

use crate::error::EmsError;

use crate::protocol::Telegram;
use crate::utils::format::bytes_to_hex;
use crate::views::type_name;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Logging mode for telegram display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Wire bytes only
    Raw,
    /// Classic telegram line with the type name
    Interpreted,
    /// Interpreted at the requested level, raw bytes at debug
    Both,
}

impl FromStr for LoggingMode {
    type Err = EmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(LoggingMode::Raw),
            "interpreted" => Ok(LoggingMode::Interpreted),
            "both" => Ok(LoggingMode::Both),
            other => Err(EmsError::configuration(format!(
                "unknown telegram logging mode '{}' (raw, interpreted or both)",
                other
            ))),
        }
    }
}

/// Which way a telegram travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Received,
    Sent,
}

impl Direction {
    fn arrow(self) -> &'static str {
        match self {
            Direction::Received => "<-",
            Direction::Sent => "->",
        }
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger handing formatted telegram lines to a user callback
///
/// The controller owns one of these (disabled by default) so an application
/// can mirror bus traffic into its own sink without installing a global
/// subscriber.
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Logger writing timestamped lines to stdout/stderr
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => eprintln!("[{}] {}: {}", timestamp, level.as_str(), message),
                LogLevel::Info | LogLevel::Debug => println!("[{}] {}: {}", timestamp, level.as_str(), message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Hex dump of a raw frame
    pub fn log_frame(&self, level: LogLevel, direction: Direction, raw: &[u8]) {
        if !self.should_log(level) {
            return;
        }
        let message = format!("EMS {} frame ({} bytes): {}", direction.arrow(), raw.len(), bytes_to_hex(raw));
        self.log(level, &message);
    }

    /// Log a decoded or outgoing telegram according to the current mode
    pub fn log_telegram(&self, direction: Direction, telegram: &Telegram) {
        if !self.is_enabled() {
            return;
        }
        match self.mode {
            LoggingMode::Raw => self.info(&Self::raw_line(direction, telegram)),
            LoggingMode::Interpreted => self.info(&Self::interpreted_line(direction, telegram)),
            LoggingMode::Both => {
                self.info(&Self::interpreted_line(direction, telegram));
                self.debug(&Self::raw_line(direction, telegram));
            }
        }
    }

    fn raw_line(direction: Direction, telegram: &Telegram) -> String {
        format!("EMS {} Raw: {}", direction.arrow(), bytes_to_hex(&telegram.encode()))
    }

    fn interpreted_line(direction: Direction, telegram: &Telegram) -> String {
        format!("EMS {} [{}] {}", direction.arrow(), type_name(telegram.type_id()), telegram)
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("enabled", &self.is_enabled())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn capturing(level: LogLevel, mode: LoggingMode) -> (CallbackLogger, Arc<Mutex<Vec<(LogLevel, String)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().unwrap().push((level, message.to_string()));
        });
        (CallbackLogger::with_mode(Some(callback), level, mode), lines)
    }

    #[test]
    fn test_level_filtering() {
        let (logger, lines) = capturing(LogLevel::Warn, LoggingMode::Interpreted);
        logger.error("e");
        logger.warn("w");
        logger.info("i");
        logger.debug("d");
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, LogLevel::Error);
        assert_eq!(lines[1].0, LogLevel::Warn);
    }

    #[test]
    fn test_telegram_modes() {
        let telegram = Telegram::write(0x19, 0x08, 0, 0x00E7, vec![0x00, 0x02, 0x00]);

        let (logger, lines) = capturing(LogLevel::Debug, LoggingMode::Interpreted);
        logger.log_telegram(Direction::Sent, &telegram);
        assert_eq!(
            lines.lock().unwrap()[0].1,
            "EMS -> [ExternalController] (0x19) -W-> (0x08), type: 0x00E7, offset: 0, dataLen: 3 data: 00 02 00"
        );

        let (logger, lines) = capturing(LogLevel::Debug, LoggingMode::Raw);
        logger.log_telegram(Direction::Received, &telegram);
        assert_eq!(lines.lock().unwrap()[0].1, "EMS <- Raw: 99 08 E7 00 00 02 00 EE");

        let (logger, lines) = capturing(LogLevel::Info, LoggingMode::Both);
        logger.log_telegram(Direction::Sent, &telegram);
        // raw line is debug and filtered out
        assert_eq!(lines.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_mode_from_name_and_switch() {
        assert_eq!("raw".parse::<LoggingMode>().unwrap(), LoggingMode::Raw);
        assert_eq!("Interpreted".parse::<LoggingMode>().unwrap(), LoggingMode::Interpreted);
        assert_eq!("BOTH".parse::<LoggingMode>().unwrap(), LoggingMode::Both);
        assert!(matches!(
            "verbose".parse::<LoggingMode>(),
            Err(EmsError::Configuration { .. })
        ));

        let telegram = Telegram::write(0x19, 0x08, 0, 0x00E7, vec![0x00, 0x02, 0x00]);
        let (mut logger, lines) = capturing(LogLevel::Info, LoggingMode::Interpreted);
        logger.set_mode(LoggingMode::Raw);
        logger.log_telegram(Direction::Sent, &telegram);
        assert_eq!(lines.lock().unwrap()[0].1, "EMS -> Raw: 99 08 E7 00 00 02 00 EE");

        let console = CallbackLogger::console();
        assert!(console.is_enabled());
        assert_eq!(console.min_level, LogLevel::Info);
    }

    #[test]
    fn test_frame_and_disabled() {
        let (logger, lines) = capturing(LogLevel::Debug, LoggingMode::Raw);
        logger.log_frame(LogLevel::Debug, Direction::Received, &[0x19]);
        assert_eq!(lines.lock().unwrap()[0].1, "EMS <- frame (1 bytes): 19");

        let disabled = CallbackLogger::default();
        assert!(!disabled.is_enabled());
        disabled.log_telegram(Direction::Sent, &Telegram::read(0x19, 0x08, 0x02, 27));
    }
}
