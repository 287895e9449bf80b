//! Per-device static configuration.
//!
//! One TOML file per instrument describes the device header (name, driver,
//! storage schema) and its control-parameter descriptors. The structure is
//! immutable after device construction except for parameter values mutated
//! through [`DeviceConfig::change_param`].

use crate::error::{AppResult, DaqError};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Scalar storage type of one slow-data column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    Float,
    Int,
    Bool,
    Str,
}

impl Dtype {
    /// Accepts both the short numpy-style codes the original device files
    /// used ("f8", "i4", "S", "b") and spelled-out names.
    pub fn parse(text: &str) -> AppResult<Self> {
        let t = text.trim();
        let lowered = t.to_ascii_lowercase();
        if lowered.starts_with('f') || lowered == "float" || lowered == "float64" {
            Ok(Dtype::Float)
        } else if lowered.starts_with('i') || lowered == "int" || lowered == "int64" {
            Ok(Dtype::Int)
        } else if lowered.starts_with('b') && lowered != "bytes" {
            Ok(Dtype::Bool)
        } else if t.starts_with('S') || t.starts_with('U') || lowered == "str" || lowered == "string"
        {
            Ok(Dtype::Str)
        } else {
            Err(DaqError::Config(format!("unknown dtype: {text:?}")))
        }
    }
}

/// Either one scalar dtype broadcast over all columns, or one per column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DtypeSpec {
    Scalar(Dtype),
    PerColumn(Vec<Dtype>),
}

impl DtypeSpec {
    /// Resolve to one dtype per column name.
    pub fn columns(&self, n: usize) -> Vec<Dtype> {
        match self {
            DtypeSpec::Scalar(d) => vec![*d; n],
            DtypeSpec::PerColumn(v) => v.clone(),
        }
    }
}

impl Default for DtypeSpec {
    fn default() -> Self {
        DtypeSpec::Scalar(Dtype::Float)
    }
}

/// Kind tag of a user-facing control parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Checkbox { tristate: bool },
    Line,
    Button,
    Combo,
    Row,
    Table,
    Indicator,
    IndicatorButton,
    IndicatorLine,
    Dummy,
    Hidden,
}

impl ParamKind {
    pub fn parse(tag: &str) -> AppResult<Self> {
        Ok(match tag.trim() {
            "checkbox" => ParamKind::Checkbox { tristate: false },
            "tristate" => ParamKind::Checkbox { tristate: true },
            "line" => ParamKind::Line,
            "button" => ParamKind::Button,
            "combo" => ParamKind::Combo,
            "row" => ParamKind::Row,
            "table" => ParamKind::Table,
            "indicator" => ParamKind::Indicator,
            "indicator_button" => ParamKind::IndicatorButton,
            "indicator_line" => ParamKind::IndicatorLine,
            "dummy" => ParamKind::Dummy,
            "hidden" => ParamKind::Hidden,
            other => {
                return Err(DaqError::Config(format!(
                    "control type not supported: {other:?}"
                )))
            }
        })
    }

    pub fn is_indicator(&self) -> bool {
        matches!(
            self,
            ParamKind::Indicator | ParamKind::IndicatorButton | ParamKind::IndicatorLine
        )
    }
}

/// Runtime value of a control parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    /// Tri-level enable: 0 frozen, 1 command-eligible, 2 polled.
    Level(u8),
    Flag(bool),
    /// `ControlsRow`: one value per named sub-control.
    Row(BTreeMap<String, String>),
    /// `ControlsTable`: one value column per named table column.
    Table(BTreeMap<String, Vec<String>>),
}

impl ParamValue {
    pub fn as_level(&self) -> u8 {
        match self {
            ParamValue::Level(l) => *l,
            ParamValue::Flag(true) => 2,
            ParamValue::Flag(false) => 0,
            ParamValue::Text(t) => match t.trim() {
                "2" | "True" | "true" => 2,
                "1" => 1,
                _ => 0,
            },
            _ => 0,
        }
    }

    pub fn as_flag(&self) -> bool {
        self.as_level() >= 1
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Text(t) => t.trim().parse().ok(),
            ParamValue::Level(l) => Some(f64::from(*l)),
            ParamValue::Flag(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            ParamValue::Text(t) => t.clone(),
            ParamValue::Level(l) => l.to_string(),
            ParamValue::Flag(b) => b.to_string(),
            ParamValue::Row(m) => m
                .values()
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
            ParamValue::Table(_) => String::new(),
        }
    }
}

/// One user-facing control parameter descriptor.
#[derive(Debug, Clone)]
pub struct ControlParam {
    pub kind: ParamKind,
    pub label: Option<String>,
    pub value: ParamValue,
    /// Command issued on activation (buttons, combos, line enter).
    pub command: Option<String>,
    pub options: Vec<String>,
    /// Indicator kinds: command the monitor issues periodically.
    pub monitoring_command: Option<String>,
    /// Indicator kinds: recognised return values, matched positionally
    /// against `texts`/`states`/`checked`.
    pub return_values: Vec<String>,
    pub texts: Vec<String>,
    pub states: Vec<String>,
    pub checked: Vec<bool>,
}

impl ControlParam {
    pub fn new(kind: ParamKind, value: ParamValue) -> Self {
        Self {
            kind,
            label: None,
            value,
            command: None,
            options: Vec::new(),
            monitoring_command: None,
            return_values: Vec::new(),
            texts: Vec::new(),
            states: Vec::new(),
            checked: Vec::new(),
        }
    }
}

/// Static description of one instrument.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub label: String,
    /// HDF group path the device's datasets live under.
    pub path: String,
    /// Driver name resolved through the driver registry.
    pub driver: String,
    /// Control-parameter names whose values are passed to the constructor.
    pub constr_params: Vec<String>,
    pub correct_response: String,
    pub slow_data: bool,
    pub meta_device: bool,
    /// Devices that mirror a remote instance; their readings are not
    /// re-broadcast on the readout socket.
    pub remote_client: bool,
    pub plots_queue_maxlen: usize,
    pub max_nan_count: u64,
    pub shape: Vec<usize>,
    pub dtype: DtypeSpec,
    /// HDF attributes; `column_names` and `units` are comma-separated lists
    /// whose arity must match the shape's last axis.
    pub attributes: BTreeMap<String, String>,
    pub control_params: BTreeMap<String, ControlParam>,
}

fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl DeviceConfig {
    /// Minimal config used by drivers' and components' unit tests.
    pub fn bare(name: &str, driver: &str, slow_data: bool) -> Self {
        let mut cfg = Self {
            name: name.to_string(),
            label: name.to_string(),
            path: "devices".to_string(),
            driver: driver.to_string(),
            constr_params: Vec::new(),
            correct_response: String::new(),
            slow_data,
            meta_device: false,
            remote_client: false,
            plots_queue_maxlen: 100,
            max_nan_count: 10,
            shape: Vec::new(),
            dtype: DtypeSpec::default(),
            attributes: BTreeMap::new(),
            control_params: BTreeMap::new(),
        };
        cfg.insert_reserved_params();
        cfg
    }

    pub fn from_file(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DaqError::Config(format!("cannot read device file {}: {e}", path.display()))
        })?;
        let value: toml::Value = toml::from_str(&text).map_err(|e| {
            DaqError::Config(format!("cannot parse device file {}: {e}", path.display()))
        })?;
        Self::from_toml(&value)
            .map_err(|e| DaqError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(value: &toml::Value) -> AppResult<Self> {
        let device = value
            .get("device")
            .and_then(|v| v.as_table())
            .ok_or_else(|| DaqError::Config("missing [device] section".into()))?;

        let get_str = |key: &str| -> Option<String> {
            device.get(key).and_then(|v| v.as_str()).map(String::from)
        };
        let name = get_str("name").ok_or_else(|| DaqError::Config("device.name missing".into()))?;

        let dtype = match device.get("dtype") {
            None => DtypeSpec::default(),
            Some(toml::Value::String(s)) => DtypeSpec::Scalar(Dtype::parse(s)?),
            Some(toml::Value::Array(arr)) => DtypeSpec::PerColumn(
                arr.iter()
                    .map(|v| {
                        v.as_str()
                            .ok_or_else(|| DaqError::Config("dtype entries must be strings".into()))
                            .and_then(Dtype::parse)
                    })
                    .collect::<AppResult<Vec<_>>>()?,
            ),
            Some(other) => {
                return Err(DaqError::Config(format!("invalid dtype: {other}")));
            }
        };

        let shape = device
            .get("shape")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_integer())
                    .map(|i| i.max(0) as usize)
                    .collect()
            })
            .unwrap_or_default();

        let attributes: BTreeMap<String, String> = value
            .get("attributes")
            .and_then(|v| v.as_table())
            .map(|t| {
                t.iter()
                    .map(|(k, v)| {
                        let text = match v {
                            toml::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), text)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut cfg = Self {
            label: get_str("label").unwrap_or_else(|| name.clone()),
            path: get_str("path").unwrap_or_else(|| "devices".into()),
            driver: get_str("driver")
                .ok_or_else(|| DaqError::Config("device.driver missing".into()))?,
            constr_params: device
                .get("constr_params")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            correct_response: get_str("correct_response").unwrap_or_default(),
            slow_data: device
                .get("slow_data")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            meta_device: device
                .get("meta_device")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            remote_client: device
                .get("remote_client")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            plots_queue_maxlen: device
                .get("plots_queue_maxlen")
                .and_then(|v| v.as_integer())
                .map(|i| i.max(1) as usize)
                .unwrap_or(100),
            max_nan_count: device
                .get("max_nan_count")
                .and_then(|v| v.as_integer())
                .map(|i| i.max(0) as u64)
                .unwrap_or(10),
            shape,
            dtype,
            attributes,
            control_params: BTreeMap::new(),
            name,
        };

        if let Some(params) = value.get("control_params").and_then(|v| v.as_table()) {
            for (pname, ptoml) in params {
                match parse_control_param(ptoml) {
                    Ok(param) => {
                        cfg.control_params.insert(pname.clone(), param);
                    }
                    Err(e) => warn!(param = %pname, error = %e, "skipping control parameter"),
                }
            }
        }
        cfg.insert_reserved_params();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Ensure the reserved parameter set exists on every device.
    fn insert_reserved_params(&mut self) {
        self.control_params
            .entry("enabled".into())
            .or_insert_with(|| {
                ControlParam::new(ParamKind::Checkbox { tristate: true }, ParamValue::Level(0))
            });
        self.control_params
            .entry("dt".into())
            .or_insert_with(|| ControlParam::new(ParamKind::Line, ParamValue::Text("0.1".into())));
        self.control_params
            .entry("HDF_enabled".into())
            .or_insert_with(|| {
                ControlParam::new(ParamKind::Checkbox { tristate: false }, ParamValue::Flag(true))
            });
        self.control_params
            .entry("InfluxDB_enabled".into())
            .or_insert_with(|| ControlParam::new(ParamKind::Dummy, ParamValue::Flag(true)));
    }

    fn validate(&self) -> AppResult<()> {
        if self.slow_data {
            let cols = self.column_names();
            if cols.is_empty() {
                return Err(DaqError::Config(format!(
                    "slow device {} has no column_names attribute",
                    self.name
                )));
            }
            if let DtypeSpec::PerColumn(d) = &self.dtype {
                if d.len() != cols.len() {
                    return Err(DaqError::Config(format!(
                        "device {}: {} dtypes for {} columns",
                        self.name,
                        d.len(),
                        cols.len()
                    )));
                }
            }
            let units = self.units();
            if !units.is_empty() && units.len() != cols.len() {
                return Err(DaqError::Config(format!(
                    "device {}: {} units for {} columns",
                    self.name,
                    units.len(),
                    cols.len()
                )));
            }
            if let Some(last) = self.shape.last() {
                if *last != cols.len() {
                    return Err(DaqError::Config(format!(
                        "device {}: shape last axis {} does not match {} columns",
                        self.name,
                        last,
                        cols.len()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn column_names(&self) -> Vec<String> {
        self.attributes
            .get("column_names")
            .map(|s| split_list(s))
            .unwrap_or_default()
    }

    pub fn units(&self) -> Vec<String> {
        self.attributes
            .get("units")
            .map(|s| split_list(s))
            .unwrap_or_default()
    }

    /// Per-column dtypes resolved against the column names.
    pub fn column_dtypes(&self) -> Vec<Dtype> {
        self.dtype.columns(self.column_names().len())
    }

    /// Tri-level enable state: 0 frozen, 1 command-eligible, 2 polled.
    pub fn enabled(&self) -> u8 {
        self.control_params
            .get("enabled")
            .map(|p| p.value.as_level())
            .unwrap_or(0)
    }

    pub fn hdf_enabled(&self) -> bool {
        self.control_params
            .get("HDF_enabled")
            .map(|p| p.value.as_flag())
            .unwrap_or(false)
    }

    pub fn influx_enabled(&self) -> bool {
        self.control_params
            .get("InfluxDB_enabled")
            .map(|p| p.value.as_flag())
            .unwrap_or(false)
    }

    /// Poll period in seconds. Values below 2 ms and unparseable values
    /// both fall back to 100 ms.
    pub fn dt(&self) -> f64 {
        let raw = self
            .control_params
            .get("dt")
            .and_then(|p| p.value.as_f64());
        match raw {
            Some(dt) if dt >= 0.002 => dt,
            Some(dt) => {
                warn!(dt, "device dt too small, using 0.1 s");
                0.1
            }
            None => 0.1,
        }
    }

    /// Mutate one control-parameter value (everything else is fixed).
    pub fn change_param(&mut self, key: &str, value: ParamValue) {
        match self.control_params.get_mut(key) {
            Some(param) => param.value = value,
            None => warn!(device = %self.name, param = %key, "no such control parameter"),
        }
    }
}

fn parse_control_param(value: &toml::Value) -> AppResult<ControlParam> {
    let table = value
        .as_table()
        .ok_or_else(|| DaqError::Config("control parameter must be a table".into()))?;
    let kind_tag = table
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DaqError::Config("control parameter missing type".into()))?;
    let kind = ParamKind::parse(kind_tag)?;

    let get_str = |key: &str| table.get(key).and_then(|v| v.as_str()).map(String::from);
    let get_list = |key: &str| {
        table
            .get(key)
            .and_then(|v| v.as_str())
            .map(split_list)
            .unwrap_or_default()
    };

    let value = match (kind, table.get("value")) {
        (ParamKind::Checkbox { tristate: true }, Some(v)) => {
            let level = match v {
                toml::Value::Integer(i) => (*i).clamp(0, 2) as u8,
                toml::Value::Boolean(true) => 2,
                toml::Value::Boolean(false) => 0,
                toml::Value::String(s) => ParamValue::Text(s.clone()).as_level(),
                _ => 0,
            };
            ParamValue::Level(level)
        }
        (ParamKind::Checkbox { tristate: false }, Some(v)) => ParamValue::Flag(match v {
            toml::Value::Boolean(b) => *b,
            toml::Value::Integer(i) => *i != 0,
            toml::Value::String(s) => matches!(s.trim(), "1" | "True" | "true"),
            _ => false,
        }),
        (ParamKind::Row, Some(toml::Value::Table(t))) => ParamValue::Row(
            t.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect(),
        ),
        (ParamKind::Table, Some(toml::Value::Table(t))) => ParamValue::Table(
            t.iter()
                .map(|(k, v)| {
                    let col = v
                        .as_array()
                        .map(|arr| {
                            arr.iter()
                                .map(|x| x.as_str().unwrap_or_default().to_string())
                                .collect()
                        })
                        .unwrap_or_default();
                    (k.clone(), col)
                })
                .collect(),
        ),
        (_, Some(toml::Value::String(s))) => ParamValue::Text(s.clone()),
        (_, Some(other)) => ParamValue::Text(other.to_string()),
        (_, None) => ParamValue::Text(String::new()),
    };

    let mut param = ControlParam::new(kind, value);
    param.label = get_str("label");
    param.command = get_str("command");
    param.options = get_list("options");
    param.monitoring_command = get_str("monitoring_command");
    param.return_values = get_list("return_values");
    param.texts = get_list("texts");
    param.states = get_list("states");
    param.checked = get_list("checked")
        .iter()
        .map(|s| matches!(s.as_str(), "1" | "True" | "true"))
        .collect();
    Ok(param)
}
