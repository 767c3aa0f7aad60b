//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `IEB_`, `__` separating levels)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! IEB_APPLICATION__LOG_LEVEL=debug
//! IEB_TIMEOUTS__TRANSIT_MS=6000
//! IEB_UNITS__SP1__FIELDBUS__HOST=10.7.45.28
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rust_ieb::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load_from("config/ieb.example.toml")?;
//!     println!("Units: {:?}", settings.units.keys().collect::<Vec<_>>());
//!     Ok(())
//! }
//! ```

use crate::hardware::{MotorTimeouts, DEFAULT_TRANSDUCER_ID};
use crate::error::IebError;
use crate::error_recovery::RetryPolicy;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File missing, unparsable, or of the wrong shape.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Well-formed but semantically invalid.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for IebError {
    fn from(err: ConfigError) -> Self {
        IebError::Configuration(err.to_string())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Network deadlines
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Caller-side retry for scalar reads
    #[serde(default)]
    pub retry: RetryConfig,
    /// Spectrograph units keyed by id (e.g. `sp1`)
    #[serde(default)]
    pub units: BTreeMap<String, UnitConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Network deadlines, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// TCP connect to any device
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    /// Motor status/init/home/auxiliary reply
    #[serde(default = "default_command_ms")]
    pub command_ms: u64,
    /// Motor open/close reply
    #[serde(default = "default_transit_ms")]
    pub transit_ms: u64,
    /// Fieldbus request
    #[serde(default = "default_fieldbus_ms")]
    pub fieldbus_ms: u64,
    /// Pause between a relay write and its confirming read
    #[serde(default = "default_relay_settle_ms")]
    pub relay_settle_ms: u64,
    /// Transducer reply
    #[serde(default = "default_transducer_ms")]
    pub transducer_ms: u64,
    /// Depth gauge reply
    #[serde(default = "default_depth_ms")]
    pub depth_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            command_ms: default_command_ms(),
            transit_ms: default_transit_ms(),
            fieldbus_ms: default_fieldbus_ms(),
            relay_settle_ms: default_relay_settle_ms(),
            transducer_ms: default_transducer_ms(),
            depth_ms: default_depth_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Motor link deadlines.
    pub fn motor(&self) -> MotorTimeouts {
        MotorTimeouts {
            connect: Duration::from_millis(self.connect_ms),
            command: Duration::from_millis(self.command_ms),
            transit: Duration::from_millis(self.transit_ms),
        }
    }

    /// TCP connect deadline.
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }
}

/// Caller-side retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause between attempts
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Equivalent retry policy.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_delay: Duration::from_millis(self.backoff_ms),
        }
    }
}

/// A TCP endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl EndpointConfig {
    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Motor controller endpoints of one unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MotorsConfig {
    /// Exposure shutter
    #[serde(default)]
    pub shutter: Option<EndpointConfig>,
    /// Left Hartmann door
    #[serde(default)]
    pub hartmann_left: Option<EndpointConfig>,
    /// Right Hartmann door
    #[serde(default)]
    pub hartmann_right: Option<EndpointConfig>,
}

/// Fieldbus backplane of one unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldbusConfig {
    /// Host name or address
    pub host: String,
    /// Modbus/TCP port
    #[serde(default = "default_fieldbus_port")]
    pub port: u16,
    /// Modbus unit id
    #[serde(default = "default_slave")]
    pub slave: u8,
}

/// Pressure/temperature transducer of one camera
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransducerConfig {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Transducer address
    #[serde(default = "default_transducer_id")]
    pub id: u16,
}

/// Depth gauge of one unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthConfig {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Camera the gauge is mounted on
    #[serde(default)]
    pub camera: Option<String>,
    /// Channels to read
    #[serde(default = "default_depth_channels")]
    pub channels: Vec<String>,
}

/// One spectrograph unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Motor controllers
    #[serde(default)]
    pub motors: MotorsConfig,
    /// Relay/sensor backplane
    #[serde(default)]
    pub fieldbus: Option<FieldbusConfig>,
    /// Transducers keyed by camera (e.g. `r1`, `b1`, `z1`)
    #[serde(default)]
    pub transducers: BTreeMap<String, TransducerConfig>,
    /// Depth gauge
    #[serde(default)]
    pub depth: Option<DepthConfig>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_ms() -> u64 {
    5000
}

fn default_command_ms() -> u64 {
    1000
}

fn default_transit_ms() -> u64 {
    4000
}

fn default_fieldbus_ms() -> u64 {
    2000
}

fn default_relay_settle_ms() -> u64 {
    100
}

fn default_transducer_ms() -> u64 {
    3000
}

fn default_depth_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    100
}

fn default_fieldbus_port() -> u16 {
    502
}

fn default_slave() -> u8 {
    1
}

fn default_transducer_id() -> u16 {
    DEFAULT_TRANSDUCER_ID
}

fn default_depth_channels() -> Vec<String> {
    vec!["A".to_string(), "B".to_string(), "C".to_string()]
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from a TOML file and `IEB_` environment variables
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Load configuration from TOML text plus environment overrides.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::new().merge(Toml::string(text)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Self = figment
            .merge(Env::prefixed("IEB_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Every timeout is positive, and transit exceeds command
    /// - At least one attempt is configured
    /// - At least one unit is configured
    /// - Every endpoint has a host and a non-zero port
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

        let t = &self.timeouts;
        for (name, value) in [
            ("connect_ms", t.connect_ms),
            ("command_ms", t.command_ms),
            ("transit_ms", t.transit_ms),
            ("fieldbus_ms", t.fieldbus_ms),
            ("transducer_ms", t.transducer_ms),
            ("depth_ms", t.depth_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid timeout '{name}': must be > 0"
                )));
            }
        }
        if t.transit_ms <= t.command_ms {
            return Err(ConfigError::ValidationError(format!(
                "Invalid timeout 'transit_ms' ({}): must exceed command_ms ({})",
                t.transit_ms, t.command_ms
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "Invalid retry 'max_attempts': must be >= 1".to_string(),
            ));
        }

        if self.units.is_empty() {
            return Err(ConfigError::ValidationError(
                "No units configured".to_string(),
            ));
        }

        for (id, unit) in &self.units {
            self.validate_unit(id, unit)?;
        }

        Ok(())
    }

    /// Validate a specific unit's endpoints
    fn validate_unit(&self, id: &str, unit: &UnitConfig) -> Result<(), ConfigError> {
        let motors = [
            ("motors.shutter", &unit.motors.shutter),
            ("motors.hartmann_left", &unit.motors.hartmann_left),
            ("motors.hartmann_right", &unit.motors.hartmann_right),
        ];
        for (name, endpoint) in motors {
            if let Some(endpoint) = endpoint {
                check_endpoint(id, name, &endpoint.host, endpoint.port)?;
            }
        }

        if let Some(fieldbus) = &unit.fieldbus {
            check_endpoint(id, "fieldbus", &fieldbus.host, fieldbus.port)?;
        }

        for (camera, transducer) in &unit.transducers {
            check_endpoint(
                id,
                &format!("transducers.{camera}"),
                &transducer.host,
                transducer.port,
            )?;
        }

        if let Some(depth) = &unit.depth {
            check_endpoint(id, "depth", &depth.host, depth.port)?;
            if depth.channels.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Unit '{id}': 'depth.channels' cannot be empty"
                )));
            }
        }

        Ok(())
    }
}

fn check_endpoint(unit: &str, name: &str, host: &str, port: u16) -> Result<(), ConfigError> {
    if host.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Unit '{unit}': '{name}.host' cannot be empty"
        )));
    }
    if port == 0 {
        return Err(ConfigError::ValidationError(format!(
            "Unit '{unit}': '{name}.port' must be > 0"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [units.sp1.motors.shutter]
        host = "10.7.45.27"
        port = 7776
    "#;

    #[test]
    fn test_defaults_apply() {
        let settings = Settings::from_toml_str(MINIMAL).unwrap();
        assert_eq!(settings.application.log_level, "info");
        assert_eq!(settings.timeouts.command_ms, 1000);
        assert_eq!(settings.timeouts.transit_ms, 4000);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.timeouts.motor().transit, Duration::from_secs(4));
    }

    #[test]
    fn test_full_unit() {
        let settings = Settings::from_toml_str(
            r#"
            [units.sp1.fieldbus]
            host = "10.7.45.28"

            [units.sp1.transducers.r1]
            host = "10.7.45.30"
            port = 1112

            [units.sp1.depth]
            host = "10.7.45.31"
            port = 1113
            camera = "b1"
            "#,
        )
        .unwrap();

        let unit = &settings.units["sp1"];
        let fieldbus = unit.fieldbus.as_ref().unwrap();
        assert_eq!((fieldbus.port, fieldbus.slave), (502, 1));
        assert_eq!(unit.transducers["r1"].id, 253);
        assert_eq!(unit.depth.as_ref().unwrap().channels, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_invalid_log_level() {
        let result = Settings::from_toml_str(&format!(
            "[application]\nlog_level = \"loud\"\n{MINIMAL}"
        ));
        assert!(result.unwrap_err().to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_transit_must_exceed_command() {
        let result = Settings::from_toml_str(&format!(
            "[timeouts]\ncommand_ms = 2000\ntransit_ms = 2000\n{MINIMAL}"
        ));
        assert!(result.unwrap_err().to_string().contains("transit_ms"));
    }

    #[test]
    fn test_no_units() {
        let result = Settings::from_toml_str("[application]\nlog_level = \"info\"\n");
        assert!(result.unwrap_err().to_string().contains("No units configured"));
    }

    #[test]
    fn test_empty_host_rejected() {
        let result = Settings::from_toml_str(
            "[units.sp2.motors.hartmann_left]\nhost = \"\"\nport = 7776\n",
        );
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("'motors.hartmann_left.host' cannot be empty"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert!(settings.units.contains_key("sp1"));
    }

    #[test]
    fn test_missing_file_has_no_units() {
        let result = Settings::load_from("/nonexistent/ieb.toml");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
