use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::lifecycle::{LifecycleSettings, DEFAULT_GRACE_PERIOD, DEFAULT_METADATA_TIMEOUT};
use crate::serial::{PortOptions, DEFAULT_BAUD_RATE};

/// Runtime configuration, read from `MCX_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Device used when the user asks for a port and none is listed.
    pub serial_port: Option<PathBuf>,
    pub baud_rate: u32,
    pub grace_period: Duration,
    pub metadata_timeout: Duration,
    /// Open `serial_port` at startup instead of waiting for the user.
    pub serial_autoconnect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            grace_period: DEFAULT_GRACE_PERIOD,
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
            serial_autoconnect: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let serial_port = get("MCX_SERIAL_PORT").map(PathBuf::from);
        if let Some(path) = &serial_port {
            log::info!("Using serial device: {}", path.display());
        }

        let baud_rate = parse_or(get("MCX_BAUD_RATE"), "MCX_BAUD_RATE", defaults.baud_rate)?;
        let grace_ms = parse_or(
            get("MCX_GRACE_MS"),
            "MCX_GRACE_MS",
            defaults.grace_period.as_millis() as u64,
        )?;
        let metadata_ms = parse_or(
            get("MCX_METADATA_TIMEOUT_MS"),
            "MCX_METADATA_TIMEOUT_MS",
            defaults.metadata_timeout.as_millis() as u64,
        )?;
        let serial_autoconnect = match get("MCX_SERIAL_AUTOCONNECT") {
            Some(value) => parse_flag(&value)
                .with_context(|| format!("MCX_SERIAL_AUTOCONNECT: not a boolean: {}", value))?,
            None => defaults.serial_autoconnect,
        };

        if baud_rate == 0 {
            anyhow::bail!("MCX_BAUD_RATE must be positive");
        }

        Ok(Self {
            serial_port,
            baud_rate,
            grace_period: Duration::from_millis(grace_ms),
            metadata_timeout: Duration::from_millis(metadata_ms),
            serial_autoconnect,
        })
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            grace_period: self.grace_period,
            metadata_timeout: self.metadata_timeout,
            port_options: PortOptions {
                baud_rate: self.baud_rate,
            },
        }
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{}: invalid value {:?}", key, raw)),
        None => Ok(default),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
