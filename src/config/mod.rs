use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read the config on {0}")]
    Read(String, #[source] std::io::Error),
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("No config file found, tried {0:?}")]
    NotFound(Vec<PathBuf>),
    #[error("Missing setting '{0}'")]
    Missing(&'static str),
    #[error("Invalid value '{value}' for setting '{key}'")]
    Invalid { key: String, value: String },
    #[error("Invalid transport address '{0}'")]
    Transport(String),
}

fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_client_name_default() -> String { return "metersync".to_string() }
fn mqtt_base_topic_default() -> String { return "metersync".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default="mqtt_base_topic_default")]
    pub base_topic: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub enum RegisterKind {
    Holding,
    Input,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RegisterFormat {
    U16,
    I16,
    U32,
    I32,
    F32,
}

impl RegisterFormat {
    /// Number of 16 bit registers the format occupies
    pub fn words(&self) -> u16 {
        match self {
            RegisterFormat::U16 | RegisterFormat::I16 => 1,
            RegisterFormat::U32 | RegisterFormat::I32 | RegisterFormat::F32 => 2,
        }
    }
}

fn register_kind_default() -> RegisterKind { RegisterKind::Holding }
fn register_scaler_default() -> f64 { 1.0 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct RegisterConfig {
    pub name: String,
    pub register: u16,
    #[serde(default="register_kind_default")]
    pub input_type: RegisterKind,
    pub format: RegisterFormat,
    #[serde(default="register_scaler_default")]
    pub scaler: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

fn device_enabled_default() -> bool { true }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DeviceConfig {
    pub name: String,
    pub protocol: String,
    #[serde(default="device_enabled_default")]
    pub enabled: bool,
    /// Flat key/value settings, see [`PollConfig::from_settings`]
    #[serde(default)]
    pub settings: HashMap<String, serde_yml::Value>,
    #[serde(default)]
    pub registers: Vec<RegisterConfig>,
}

impl DeviceConfig {
    /// Settings as plain strings, YAML numbers and booleans are stringified
    pub fn flat_settings(&self) -> Result<HashMap<String, String>, ConfigError> {
        let mut flat = HashMap::new();
        for (key, value) in &self.settings {
            let v = match value {
                serde_yml::Value::String(s) => s.clone(),
                serde_yml::Value::Number(n) => n.to_string(),
                serde_yml::Value::Bool(b) => b.to_string(),
                other => {
                    return Err(ConfigError::Invalid {
                        key: key.clone(),
                        value: format!("{:?}", other),
                    })
                }
            };
            flat.insert(key.clone(), v);
        }
        Ok(flat)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        let config = Self::from_yaml(&contents)?;
        info!("Loaded {} device(s) from {}", config.devices.len(), path.display());
        Ok(config)
    }

    /// Find the config file: `METERSYNC_CONFIG`, then config/metersync.yaml, then metersync.yaml
    pub fn locate() -> Result<PathBuf, ConfigError> {
        let mut candidates = Vec::new();
        if let Ok(p) = std::env::var("METERSYNC_CONFIG") {
            candidates.push(PathBuf::from(p));
        }
        candidates.push(PathBuf::from("config/metersync.yaml"));
        candidates.push(PathBuf::from("metersync.yaml"));

        for candidate in candidates.iter() {
            debug!("Looking for config at {}", candidate.display());
            if candidate.is_file() {
                return Ok(candidate.clone());
            }
        }
        Err(ConfigError::NotFound(candidates))
    }
}

/// Where and how a device is reached
#[derive(Debug, Clone, PartialEq)]
pub enum TransportAddress {
    Tcp { host: String, port: u16 },
    Serial { path: String },
    Modbus { host: String, port: u16 },
}

impl TransportAddress {
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::Transport(address.to_string());
        let (scheme, rest) = address.split_once("://").ok_or_else(invalid)?;

        let host_port = |rest: &str, default_port: Option<u16>| -> Result<(String, u16), ConfigError> {
            match rest.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() => {
                    let port = port.parse::<u16>().map_err(|_| invalid())?;
                    Ok((host.to_string(), port))
                }
                None if !rest.is_empty() => match default_port {
                    Some(p) => Ok((rest.to_string(), p)),
                    None => Err(invalid()),
                },
                _ => Err(invalid()),
            }
        };

        match scheme {
            "tcp" => {
                let (host, port) = host_port(rest, None)?;
                Ok(TransportAddress::Tcp { host, port })
            }
            "modbus" => {
                let (host, port) = host_port(rest, Some(502))?;
                Ok(TransportAddress::Modbus { host, port })
            }
            "serial" if !rest.is_empty() => Ok(TransportAddress::Serial { path: rest.to_string() }),
            _ => Err(invalid()),
        }
    }
}

impl std::fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportAddress::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            TransportAddress::Serial { path } => write!(f, "serial://{}", path),
            TransportAddress::Modbus { host, port } => write!(f, "modbus://{}:{}", host, port),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

/// How often a poll may fail in a row and how long to wait in between
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per poll cycle before the failure turns fatal
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicy { max_attempts, backoff: Backoff::Fixed(delay) }
    }

    /// Wait before retrying after the `failures`-th failed attempt (1-based)
    pub fn delay(&self, failures: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { base, max } => {
                let exp = failures.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << exp).min(*max)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::fixed(3, Duration::from_secs(1))
    }
}

/// Everything the scheduler needs to poll one device
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub transport: TransportAddress,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub baud_rate: u32,
    pub unit_id: u8,
}

fn setting<T: std::str::FromStr>(settings: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError> {
    match settings.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
        }),
    }
}

impl PollConfig {
    /// Build from the flat settings map.
    ///
    /// Known keys: `transport` (required), `poll_interval` and `timeout` in
    /// seconds, `retries`, `backoff` (`fixed`|`exponential`), `backoff_ms`,
    /// `backoff_max_ms`, `baud_rate`, `unit_id`.
    pub fn from_settings(settings: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let transport = settings.get("transport").ok_or(ConfigError::Missing("transport"))?;
        let transport = TransportAddress::parse(transport.trim())?;

        let poll_interval: u64 = setting(settings, "poll_interval", 10)?;
        let timeout: u64 = setting(settings, "timeout", 5)?;
        let retries: u32 = setting(settings, "retries", 3)?;
        let backoff_ms: u64 = setting(settings, "backoff_ms", 1000)?;
        let backoff_max_ms: u64 = setting(settings, "backoff_max_ms", 30_000)?;

        for (key, v) in [("poll_interval", poll_interval), ("timeout", timeout), ("retries", retries as u64)] {
            if v == 0 {
                return Err(ConfigError::Invalid { key: key.to_string(), value: "0".to_string() });
            }
        }

        let base = Duration::from_millis(backoff_ms);
        let backoff = match settings.get("backoff").map(|s| s.trim().to_lowercase()).as_deref() {
            None | Some("fixed") => Backoff::Fixed(base),
            Some("exponential") => Backoff::Exponential { base, max: Duration::from_millis(backoff_max_ms) },
            Some(other) => {
                return Err(ConfigError::Invalid { key: "backoff".to_string(), value: other.to_string() })
            }
        };

        Ok(PollConfig {
            transport,
            poll_interval: Duration::from_secs(poll_interval),
            timeout: Duration::from_secs(timeout),
            retry: RetryPolicy { max_attempts: retries, backoff },
            baud_rate: setting(settings, "baud_rate", 9600)?,
            unit_id: setting(settings, "unit_id", 1)?,
        })
    }
}
