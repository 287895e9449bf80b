//! Program configuration.
//!
//! The process-wide settings are loaded once from a TOML file and stay
//! immutable except through [`ProgramConfig::change`], which coerces a string
//! value into the typed field it addresses. Runtime-only fields
//! (`time_offset`, `control_active`) never round-trip to disk.

pub mod device;

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use device::{ControlParam, DeviceConfig, Dtype, DtypeSpec, ParamKind, ParamValue};

fn default_hdf_loop_delay() -> f64 {
    0.1
}

fn default_monitoring_dt() -> f64 {
    5.0
}

fn default_debug_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralSettings {
    pub run_name: String,
    /// Delay between HDF writer iterations, in seconds.
    #[serde(default = "default_hdf_loop_delay")]
    pub hdf_loop_delay: f64,
    /// Slow cadence for time-series publication, in seconds.
    #[serde(default = "default_monitoring_dt")]
    pub monitoring_dt: f64,
    #[serde(default = "default_debug_level")]
    pub debug_level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileSettings {
    /// Directory holding the per-device configuration files.
    pub config_dir: PathBuf,
    pub hdf_dir: PathBuf,
    pub hdf_fname: String,
    #[serde(default)]
    pub sequence_fname: Option<PathBuf>,
}

impl FileSettings {
    pub fn hdf_path(&self) -> PathBuf {
        self.hdf_dir.join(&self.hdf_fname)
    }
}

fn default_workers() -> usize {
    2
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkingSettings {
    #[serde(default)]
    pub enabled: bool,
    pub port_control: u16,
    pub port_readout: u16,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Comma-separated list of client names admitted by the broker.
    #[serde(default)]
    pub allowed: String,
    /// Instance name used as the topic prefix on the readout socket.
    pub name: String,
    /// Directory holding the preshared key files.
    pub key_dir: PathBuf,
}

impl NetworkingSettings {
    pub fn allowed_clients(&self) -> Vec<String> {
        self.allowed
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InfluxSettings {
    #[serde(default)]
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub bucket: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProgramConfig {
    pub general: GeneralSettings,
    pub files: FileSettings,
    pub networking: NetworkingSettings,
    pub influxdb: InfluxSettings,
    /// Arbitrary attributes copied verbatim onto the run group.
    #[serde(default)]
    pub run_attributes: BTreeMap<String, String>,

    /// Absolute wall-clock time the current run started at; every queued
    /// timestamp is relative to this.
    #[serde(skip)]
    pub time_offset: f64,
    #[serde(skip)]
    pub control_active: bool,
}

impl ProgramConfig {
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| DaqError::Settings {
            path: path.display().to_string(),
            source: e.into(),
        })?;
        toml::from_str(&text).map_err(|e| DaqError::Settings {
            path: path.display().to_string(),
            source: e.into(),
        })
    }

    /// Replace one scalar setting, coercing `value` into the field's type.
    /// Invalid values are rejected with a `Config` error and leave the
    /// previous value in place.
    pub fn change(&mut self, section: &str, key: &str, value: &str) -> AppResult<()> {
        fn parse<T: std::str::FromStr>(section: &str, key: &str, value: &str) -> AppResult<T> {
            value.trim().parse().map_err(|_| {
                DaqError::Config(format!("invalid value for {section}.{key}: {value:?}"))
            })
        }

        match (section, key) {
            ("general", "run_name") => self.general.run_name = value.to_string(),
            ("general", "hdf_loop_delay") => {
                self.general.hdf_loop_delay = parse(section, key, value)?
            }
            ("general", "monitoring_dt") => self.general.monitoring_dt = parse(section, key, value)?,
            ("general", "debug_level") => self.general.debug_level = value.to_string(),
            ("files", "config_dir") => self.files.config_dir = PathBuf::from(value),
            ("files", "hdf_dir") => self.files.hdf_dir = PathBuf::from(value),
            ("files", "hdf_fname") => self.files.hdf_fname = value.to_string(),
            ("files", "sequence_fname") => {
                self.files.sequence_fname = Some(PathBuf::from(value))
            }
            ("networking", "enabled") => self.networking.enabled = parse(section, key, value)?,
            ("networking", "port_control") => {
                self.networking.port_control = parse(section, key, value)?
            }
            ("networking", "port_readout") => {
                self.networking.port_readout = parse(section, key, value)?
            }
            ("networking", "workers") => self.networking.workers = parse(section, key, value)?,
            ("networking", "allowed") => self.networking.allowed = value.to_string(),
            ("networking", "name") => self.networking.name = value.to_string(),
            ("influxdb", "enabled") => self.influxdb.enabled = parse(section, key, value)?,
            ("influxdb", "host") => self.influxdb.host = value.to_string(),
            ("influxdb", "port") => self.influxdb.port = parse(section, key, value)?,
            ("influxdb", "org") => self.influxdb.org = value.to_string(),
            ("influxdb", "token") => self.influxdb.token = value.to_string(),
            ("influxdb", "bucket") => self.influxdb.bucket = value.to_string(),
            ("run_attributes", key) => {
                self.run_attributes
                    .insert(key.to_string(), value.to_string());
            }
            _ => {
                return Err(DaqError::Config(format!(
                    "key {section}.{key} not permitted"
                )))
            }
        }
        Ok(())
    }
}
