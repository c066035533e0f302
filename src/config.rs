//! Configuration management.
//!
//! Settings are loaded from a TOML file under `config/` (or an explicit
//! path). Every field has a default, so an empty file yields a working
//! configuration for a stage on an auto-discovered port.
//!
//! # Example TOML
//!
//! ```toml
//! log_level = "debug"
//!
//! [stage]
//! port = "auto"          # or an explicit path like "/dev/ttyUSB0"
//! reference = "near"     # which limit switch defines position zero
//! com_timeout = "200ms"
//! poll_interval = "100ms"
//! wait_deadline = "2m"   # omit for no overall movement deadline
//! default_speed = 4000
//! ```

use config::Config;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::StageResult;
use crate::protocol::{ReferencePoint, REFERENCE_SEEK_SPEED};

/// Top-level application settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    /// Log filter passed to the logger at startup.
    pub log_level: String,
    /// Stage connection and polling parameters.
    pub stage: StageSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            stage: StageSettings::default(),
        }
    }
}

/// Stage connection and polling parameters.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StageSettings {
    /// Serial port path, or `"auto"` for descriptor-based discovery.
    pub port: String,

    /// Which limit switch defines position zero.
    pub reference: ReferencePoint,

    /// Read/write timeout of a single serial exchange.
    ///
    /// Default: 200 ms.
    #[serde(with = "humantime_serde")]
    pub com_timeout: Duration,

    /// Interval between status fetches while waiting for motion to finish.
    ///
    /// Default: 100 ms.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Overall deadline for `wait_movement`.
    ///
    /// Default: none, i.e. wait until the controller reports a terminal
    /// status. A full-travel reference seek takes on the order of seconds,
    /// so a deadline of a couple of minutes is generous.
    #[serde(default, with = "humantime_serde")]
    pub wait_deadline: Option<Duration>,

    /// Speed in steps/s used when the caller does not pass one.
    pub default_speed: u32,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            port: "auto".to_string(),
            reference: ReferencePoint::Near,
            com_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(100),
            wait_deadline: None,
            default_speed: REFERENCE_SEEK_SPEED,
        }
    }
}

impl Settings {
    /// Load `config/<name>.toml` (default name: `default`).
    pub fn new(config_name: Option<&str>) -> StageResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()?;
        Ok(s.try_deserialize()?)
    }

    /// Load settings from an explicit file path.
    pub fn from_path(path: &Path) -> StageResult<Self> {
        let s = Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        Ok(s.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sensible() {
        let settings = Settings::default();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.stage.port, "auto");
        assert_eq!(settings.stage.reference, ReferencePoint::Near);
        assert_eq!(settings.stage.com_timeout, Duration::from_millis(200));
        assert_eq!(settings.stage.poll_interval, Duration::from_millis(100));
        assert_eq!(settings.stage.wait_deadline, None);
        assert_eq!(settings.stage.default_speed, 4000);
    }

    #[test]
    fn loads_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[stage]
port = "/dev/ttyUSB3"
reference = "far"
com_timeout = "500ms"
wait_deadline = "2m"
"#
        )
        .unwrap();

        let settings = Settings::from_path(&path).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.stage.port, "/dev/ttyUSB3");
        assert_eq!(settings.stage.reference, ReferencePoint::Far);
        assert_eq!(settings.stage.com_timeout, Duration::from_millis(500));
        assert_eq!(settings.stage.wait_deadline, Some(Duration::from_secs(120)));
        // Unset fields fall back to their defaults.
        assert_eq!(settings.stage.poll_interval, Duration::from_millis(100));
        assert_eq!(settings.stage.default_speed, 4000);
    }

    #[test]
    fn bad_reference_value_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage.toml");
        std::fs::write(&path, "[stage]\nreference = \"middle\"\n").unwrap();
        assert!(Settings::from_path(&path).is_err());
    }
}
