//! Configuration System using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. `config/colosseum.toml` (or a path given to [`Config::load_from`])
//! 3. Environment variables (prefixed with `COLOSSEUM_`)
//!
//! # Environment Variable Overrides
//!
//! Sections and keys are separated by a double underscore:
//!
//! ```text
//! COLOSSEUM_APPLICATION__LOG_LEVEL=debug
//! COLOSSEUM_SERIAL__PORT=/dev/ttyACM0
//! COLOSSEUM_DEVICE__TIMEOUT_MS=2000
//! ```
//!
//! # Example
//!
//! ```no_run
//! use colosseum::config::Config;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     println!("Log level: {}", config.application.log_level);
//!     println!("Baud rate: {}", config.serial.baud_rate);
//!     Ok(())
//! }
//! ```

use crate::error::{SessionError, SessionResult};
use crate::protocol::{self, AngleTable, MotorMask};
use crate::session::SessionSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/colosseum.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be read or deserialized
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value is out of range
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link settings
    pub serial: SerialConfig,
    /// Collector protocol settings
    pub device: DeviceConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Colosseum".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Parity setting for the serial link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Flow control setting for the serial link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

/// Serial link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port (e.g., "/dev/ttyACM0"); discovered by vendor id when unset
    pub port: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Stop bits (1-2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
    /// Appended to every command
    pub line_terminator: String,
    /// USB vendor id used for port discovery
    pub usb_vendor_id: u16,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
            line_terminator: "\n".to_string(),
            usb_vendor_id: default_usb_vendor_id(),
        }
    }
}

/// Collector protocol configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Motor mask used in the setup commands
    pub device_id: String,
    /// Banner the firmware prints once the port opens
    pub handshake: String,
    /// Bound on connect and on each command exchange, in milliseconds
    pub timeout_ms: u64,
    /// Motor acceleration sent during setup
    pub acceleration: f64,
    /// Motor speed sent during setup
    pub speed: f64,
    /// Angle table file; the built-in table is used when unset
    pub angle_table: Option<PathBuf>,
    /// Echo commands instead of opening a port
    pub dry: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: MotorMask::ALL.to_string(),
            handshake: protocol::HANDSHAKE_BANNER.to_string(),
            timeout_ms: default_timeout_ms(),
            acceleration: protocol::DEFAULT_ACCELERATION,
            speed: protocol::DEFAULT_SPEED,
            angle_table: None,
            dry: false,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_baud_rate() -> u32 {
    115_200
}

fn default_usb_vendor_id() -> u16 {
    0x2341
}

fn default_timeout_ms() -> u64 {
    5000
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Config {
    /// Load configuration from `config/colosseum.toml` and environment variables
    ///
    /// A missing file is not an error; defaults and environment variables
    /// still apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("COLOSSEUM_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let serial = &self.serial;
        if serial.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "serial.baud_rate must be greater than 0".to_string(),
            ));
        }
        if !(5..=8).contains(&serial.data_bits) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid serial.data_bits {}. Must be 5-8",
                serial.data_bits
            )));
        }
        if !(1..=2).contains(&serial.stop_bits) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid serial.stop_bits {}. Must be 1 or 2",
                serial.stop_bits
            )));
        }
        if matches!(&serial.port, Some(port) if port.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "serial.port must not be empty when set".to_string(),
            ));
        }

        let device = &self.device;
        if device.device_id.parse::<MotorMask>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid device.device_id '{}'. Must be three binary digits",
                device.device_id
            )));
        }
        if device.handshake.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "device.handshake must not be empty".to_string(),
            ));
        }
        if device.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "device.timeout_ms must be greater than 0".to_string(),
            ));
        }
        for (name, value) in [("acceleration", device.acceleration), ("speed", device.speed)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid device.{} {}. Must be a positive number",
                    name, value
                )));
            }
        }

        Ok(())
    }

    /// Exchange timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.device.timeout_ms)
    }

    /// Angle table from `device.angle_table`, or the built-in one
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the file cannot be read or parsed.
    pub fn angle_table(&self) -> SessionResult<AngleTable> {
        match &self.device.angle_table {
            Some(path) => AngleTable::from_file(path),
            None => Ok(AngleTable::builtin()),
        }
    }

    /// Session parameters described by the `[device]` section
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the angle table or motor mask is invalid.
    pub fn session_settings(&self) -> SessionResult<SessionSettings> {
        let motors: MotorMask = self
            .device
            .device_id
            .parse()
            .map_err(SessionError::Configuration)?;
        let setup_commands = protocol::setup_commands(self.device.acceleration, self.device.speed)
            .into_iter()
            .map(|command| command.with_motors(motors))
            .collect();

        Ok(SessionSettings {
            timeout: self.timeout(),
            handshake: self.device.handshake.clone(),
            setup_commands,
            angles: self.angle_table()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_validation_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.serial.usb_vendor_id, 0x2341);
        assert_eq!(config.device.timeout_ms, 5000);
        assert_eq!(config.device.device_id, "111");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.application.log_level = "loud".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_invalid_serial_settings() {
        let mut config = Config::default();
        config.serial.data_bits = 9;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.serial.stop_bits = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.serial.baud_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_device_settings() {
        let mut config = Config::default();
        config.device.device_id = "121".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.device.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.device.speed = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = write_config(
            r#"
            [application]
            log_level = "debug"

            [serial]
            port = "/dev/ttyACM1"
            parity = "even"

            [device]
            timeout_ms = 250
            dry = true
            "#,
        );

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(config.serial.parity, SerialParity::Even);
        // Untouched keys keep their defaults
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert!(config.device.dry);
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = Config::load_from("/nonexistent/colosseum.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    #[serial]
    fn test_invalid_file_is_rejected() {
        let file = write_config("[device]\ntimeout_ms = 0\n");
        assert!(matches!(
            Config::load_from(file.path()),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[device]\ntimeout_ms = 250\n");
        std::env::set_var("COLOSSEUM_DEVICE__TIMEOUT_MS", "750");
        std::env::set_var("COLOSSEUM_SERIAL__BAUD_RATE", "2000000");
        let result = Config::load_from(file.path());
        std::env::remove_var("COLOSSEUM_DEVICE__TIMEOUT_MS");
        std::env::remove_var("COLOSSEUM_SERIAL__BAUD_RATE");

        let config = result.unwrap();
        assert_eq!(config.device.timeout_ms, 750);
        assert_eq!(config.serial.baud_rate, 2_000_000);
    }

    #[test]
    fn test_session_settings_use_device_section() {
        let mut config = Config::default();
        config.device.acceleration = 500.0;
        config.device.timeout_ms = 1200;

        let settings = config.session_settings().unwrap();
        assert_eq!(settings.timeout, Duration::from_millis(1200));
        assert_eq!(
            settings.setup_commands[0].to_string(),
            "<SET_ACCEL,111,500.0,500.0,500.0>"
        );
        assert_eq!(settings.angles, AngleTable::builtin());
    }

    #[test]
    fn test_angle_table_from_file() {
        let file = write_config("# custom rack\n30\n\n45.5\n");
        let mut config = Config::default();
        config.device.angle_table = Some(file.path().to_path_buf());

        let table = config.angle_table().unwrap();
        assert_eq!(table.as_slice(), &[30.0, 45.5]);
    }
}
