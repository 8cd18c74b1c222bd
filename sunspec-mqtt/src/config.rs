use serde::Deserialize;
use std::{path::Path, time::Duration};

use crate::Error;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// One of `ERROR`, `WARNING`, `INFO` or `DEBUG`. Anything else logs warnings.
    #[serde(default)]
    pub logging: Option<String>,

    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,

    /// How long to wait before exiting on a fatal error, so a supervisor restarts us slowly.
    #[serde(with = "humantime_serde", default = "default_restart_delay")]
    pub restart_delay: Duration,

    pub device: DeviceConfig,

    pub inverter: InverterConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceConfig {
    #[serde(alias = "ipaddr")]
    pub host: String,

    #[serde(alias = "ipport", default = "default_modbus_port")]
    pub port: u16,

    #[serde(alias = "slave", alias = "slave_addr")]
    pub unit: u8,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Skip the SunSpec base register scan and look only here.
    #[serde(default, alias = "base_addr")]
    pub base_address: Option<u16>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InverterConfig {
    pub instance: u32,

    pub name: String,

    #[serde(default)]
    pub position: u8,

    #[serde(default, alias = "max")]
    pub max_power: u32,

    #[serde(default)]
    pub product_name: Option<String>,
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

/// How long to wait before exiting after a fatal error, unless configured otherwise.
pub fn default_restart_delay() -> Duration {
    Duration::from_secs(60)
}

pub(crate) fn default_modbus_port() -> u16 {
    502
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Config> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("{}: {}", path.display(), err)))?;
        contents.parse()
    }

    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: &str| Err(Error::Config(msg.to_owned()));

        if self.device.host.trim().is_empty() {
            return invalid("device.host must not be empty");
        }
        if self.device.port == 0 {
            return invalid("device.port must not be 0");
        }
        if self.device.timeout.is_zero() {
            return invalid("device.timeout must be positive");
        }
        if self.interval.is_zero() {
            return invalid("interval must be positive");
        }
        if self.inverter.name.trim().is_empty() {
            return invalid("inverter.name must not be empty");
        }
        if self.inverter.position > 2 {
            return invalid("inverter.position must be 0, 1 or 2");
        }
        Ok(())
    }

    pub fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.logging.as_deref().map(str::to_uppercase).as_deref() {
            Some("DEBUG") => Level::DEBUG,
            Some("INFO") => Level::INFO,
            Some("ERROR") => Level::ERROR,
            _ => Level::WARN,
        }
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Config> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn parse_minimal_config() {
    let config: Config = r#"
        [device]
        host = "192.168.1.50"
        unit = 2
        timeout = "2s"

        [inverter]
        instance = 20
        name = "Roof"
    "#
    .parse()
    .unwrap();

    assert_eq!(config.device.port, 502);
    assert_eq!(config.device.base_address, None);
    assert_eq!(config.interval, Duration::from_secs(1));
    assert_eq!(config.restart_delay, Duration::from_secs(60));
    assert_eq!(config.restart_delay, default_restart_delay());
    assert_eq!(config.inverter.position, 0);
    assert_eq!(config.log_level(), tracing::Level::WARN);
}

#[test]
fn parse_full_config_with_legacy_names() {
    let config: Config = r#"
        logging = "debug"
        interval = "500ms"
        restart_delay = "10s"

        [device]
        ipaddr = "inverter.local"
        ipport = 1502
        slave_addr = 126
        timeout = "1s 500ms"
        base_addr = 50000

        [inverter]
        instance = 21
        name = "Garage"
        position = 1
        max = 8500
        product_name = "ABB-TRIO PV"
    "#
    .parse()
    .unwrap();

    assert_eq!(config.device.host, "inverter.local");
    assert_eq!(config.device.port, 1502);
    assert_eq!(config.device.unit, 126);
    assert_eq!(config.device.timeout, Duration::from_millis(1500));
    assert_eq!(config.device.base_address, Some(50000));
    assert_eq!(config.inverter.max_power, 8500);
    assert_eq!(config.interval, Duration::from_millis(500));
    assert_eq!(config.log_level(), tracing::Level::DEBUG);
}

#[test]
fn missing_required_setting_is_toml_error() {
    let result = r#"
        [device]
        host = "192.168.1.50"
        timeout = "2s"

        [inverter]
        instance = 20
        name = "Roof"
    "#
    .parse::<Config>();

    assert!(matches!(result, Err(Error::TOMLError(ref err)) if err.message().contains("unit")));
}

#[test]
fn invalid_position_is_rejected() {
    let result = r#"
        [device]
        host = "192.168.1.50"
        unit = 2
        timeout = "2s"

        [inverter]
        instance = 20
        name = "Roof"
        position = 3
    "#
    .parse::<Config>();

    assert!(matches!(result, Err(Error::Config(_))));
}
