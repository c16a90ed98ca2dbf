//! Service configuration
//!
//! Loaded with figment: the file (format picked by extension) first, then `MBSRV_`
//! environment variables on top, nested keys separated by `__`
//! (e.g. `MBSRV_INGEST__QUEUE_CAPACITY=8`).
//!
//! ```yaml
//! service:
//!   name: mbsrv
//!   log:
//!     level: info
//! ingest:
//!   queue_capacity: 1
//! tcp:
//!   - address: "0.0.0.0:502"
//!     read_timeout_ms: 5000
//! serial:
//!   - device: /dev/ttyUSB0
//!     baud_rate: 9600
//!     boundary: length_aware
//! ```

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dispatch::DEFAULT_QUEUE_CAPACITY;
use crate::error::{MbsrvError, Result};
use crate::transport::{SerialPortConfig, TcpListenerConfig};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "MBSRV_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MbsrvConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub tcp: Vec<TcpListenerConfig>,
    #[serde(default)]
    pub serial: Vec<SerialPortConfig>,
}

/// Service identity and logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub log: LogConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "mbsrv".to_string(),
            log: LogConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    pub level: String,
    /// Directory for daily log files; console only when unset
    pub dir: Option<PathBuf>,
    /// Keep logging to the console when a directory is set
    pub console: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            console: true,
        }
    }
}

/// Dispatch settings shared by every transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Requests that may wait for the consumer before producers block
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl MbsrvConfig {
    /// Load configuration from a file, with environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| MbsrvError::config("Invalid file extension"))?;

        let figment = match extension {
            "json" => Figment::new().merge(Json::file(path)),
            "toml" => Figment::new().merge(Toml::file(path)),
            "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
            _ => {
                return Err(MbsrvError::config(format!(
                    "Unsupported config format: {}",
                    extension
                )))
            },
        };

        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self> {
        Self::extract(
            Figment::from(figment::providers::Serialized::defaults(Self::default()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    fn extract(figment: Figment) -> Result<Self> {
        Ok(figment.extract()?)
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        if self.service.name.is_empty() {
            return Err(MbsrvError::config("Service name cannot be empty"));
        }

        parse_level(&self.service.log.level)?;

        if self.ingest.queue_capacity == 0 {
            return Err(MbsrvError::config(
                "queue_capacity must be greater than zero",
            ));
        }

        for listener in &self.tcp {
            listener.validate()?;
        }

        let mut devices = std::collections::HashSet::new();
        for port in &self.serial {
            port.validate()?;
            if !devices.insert(port.device.as_str()) {
                return Err(MbsrvError::config(format!(
                    "Duplicate serial device: {}",
                    port.device
                )));
            }
        }

        Ok(())
    }
}

/// Parse a log level name
pub fn parse_level(level: &str) -> Result<tracing::Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(tracing::Level::TRACE),
        "debug" => Ok(tracing::Level::DEBUG),
        "info" => Ok(tracing::Level::INFO),
        "warn" | "warning" => Ok(tracing::Level::WARN),
        "error" => Ok(tracing::Level::ERROR),
        _ => Err(MbsrvError::config(format!("Unknown log level: {}", level))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::BoundaryPolicy;
    use std::io::Write;

    fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_yaml_config() {
        let file = write_config(
            ".yaml",
            r#"
service:
  name: line-3
  log:
    level: debug
ingest:
  queue_capacity: 4
tcp:
  - address: "127.0.0.1:1502"
    read_timeout_ms: 5000
serial:
  - device: /dev/ttyUSB1
    baud_rate: 19200
    parity: Even
    boundary: fixed_threshold
"#,
        );

        let config = MbsrvConfig::from_file(file.path()).unwrap();
        assert_eq!(config.service.name, "line-3");
        assert_eq!(config.ingest.queue_capacity, 4);
        assert_eq!(config.tcp.len(), 1);
        assert_eq!(
            config.tcp[0].read_timeout(),
            Some(std::time::Duration::from_secs(5))
        );
        assert_eq!(config.tcp[0].buffer_size, 512);
        assert_eq!(config.serial[0].baud_rate, 19200);
        assert_eq!(config.serial[0].data_bits, 8);
        assert_eq!(config.serial[0].boundary, BoundaryPolicy::FixedThreshold);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_config() {
        let file = write_config(
            ".toml",
            r#"
[[tcp]]
address = "0.0.0.0:502"
"#,
        );

        let config = MbsrvConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tcp[0].address, "0.0.0.0:502");
        assert_eq!(config.tcp[0].read_timeout_ms, None);
        assert_eq!(config.ingest, IngestConfig::default());
    }

    #[test]
    fn test_serialized_defaults_round_trip() {
        let mut config = MbsrvConfig::default();
        config.serial.push(SerialPortConfig::new("/dev/ttyS0"));
        let yaml = serde_yaml::to_string(&config).unwrap();
        let file = write_config(".yml", &yaml);

        assert_eq!(MbsrvConfig::from_file(file.path()).unwrap(), config);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = write_config(".ini", "tcp = []");
        let err = MbsrvConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported config format"));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = MbsrvConfig::default();
        config.ingest.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = MbsrvConfig::default();
        config.service.log.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = MbsrvConfig::default();
        config.serial.push(SerialPortConfig::new("/dev/ttyS0"));
        config.serial.push(SerialPortConfig::new("/dev/ttyS0"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARN").unwrap(), tracing::Level::WARN);
        assert!(parse_level("verbose").is_err());
    }
}
