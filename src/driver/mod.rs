//! The driver contract.
//!
//! A driver owns the conversation with one physical (or simulated)
//! instrument. The supervisor thread talks to it exclusively through the
//! [`Driver`] trait: one probe at construction, a `read_value` per poll
//! tick, `get_warnings` alongside, and `call` for everything the command
//! queues deliver. A driver is owned by exactly one supervisor thread and
//! is dropped (closing the connection) when that thread winds down.

pub mod command;
pub mod mock;

use crate::config::DeviceConfig;
use crate::error::{AppResult, DaqError};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A scalar argument or slow-data cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(String),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Float(f) => *f,
            Value::Int(i) => *i as f64,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Str(s) => s.trim().parse().unwrap_or(f64::NAN),
        }
    }

    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Float(f) if f.is_nan())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // `{:?}` keeps a trailing ".0" on round floats, which the
            // event log format relies on.
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
        }
    }
}

/// One waveform acquisition: channels x samples, plus its HDF attributes.
#[derive(Debug, Clone)]
pub struct Waveform {
    pub data: Array2<f64>,
    pub attrs: BTreeMap<String, String>,
}

/// A batch of waveform acquisitions returned by one fast-device poll.
#[derive(Debug, Clone, Default)]
pub struct FastRecord {
    pub records: Vec<Waveform>,
}

/// What one `read_value` call produced.
#[derive(Debug, Clone)]
pub enum Reading {
    /// One row of slow data; the first cell is the relative timestamp.
    Slow(Vec<Value>),
    /// Zero or more waveform acquisitions.
    Fast(FastRecord),
    /// A bare number: a return value, never queued as data. NaN here is
    /// the no-data sentinel.
    Scalar(f64),
    /// Nothing available this tick.
    Empty,
}

impl Reading {
    /// The NaN sentinel test applied by the supervisor's data-quality
    /// accounting. Only a bare NaN float is a sentinel; a row with a NaN
    /// cell is an ordinary sample with a dead column.
    pub fn is_nan(&self) -> bool {
        matches!(self, Reading::Scalar(f) if f.is_nan())
    }
}

/// Result of a queued command, JSON-encodable for the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Row(Vec<f64>),
    Error(ErrorRepr),
}

/// Wrapper so an error string survives the untagged encoding distinctly
/// from an ordinary string result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRepr {
    pub error: String,
}

impl RetValue {
    pub fn error(message: impl Into<String>) -> Self {
        RetValue::Error(ErrorRepr {
            error: message.into(),
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RetValue::Error(_))
    }
}

impl fmt::Display for RetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetValue::None => write!(f, "None"),
            RetValue::Bool(b) => write!(f, "{b}"),
            RetValue::Int(i) => write!(f, "{i}"),
            RetValue::Float(v) => write!(f, "{v:?}"),
            RetValue::Str(s) => write!(f, "{s}"),
            RetValue::Row(row) => {
                write!(f, "[")?;
                for (i, v) in row.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v:?}")?;
                }
                write!(f, "]")
            }
            RetValue::Error(e) => write!(f, "error: {}", e.error),
        }
    }
}

/// A warning raised inside a driver, timestamped by the driver itself.
#[derive(Debug, Clone)]
pub struct DeviceWarning {
    pub time: f64,
    pub message: String,
}

/// Read access to sibling devices, for meta devices that derive their
/// rows from other instruments' latest samples.
pub trait PeerData: Send + Sync {
    /// Most recent slow-data row of `device`, if it has produced one.
    fn latest_row(&self, device: &str) -> Option<Vec<Value>>;
}

/// Everything a driver constructor gets to see.
pub struct DriverContext {
    /// Wall-clock seconds the current run started at.
    pub time_offset: f64,
    /// Values of the configured constructor parameters, in order.
    pub constr_params: Vec<String>,
    /// Present only for meta devices.
    pub peers: Option<Arc<dyn PeerData>>,
}

impl DriverContext {
    pub fn new(time_offset: f64, constr_params: Vec<String>) -> Self {
        Self {
            time_offset,
            constr_params,
            peers: None,
        }
    }

    /// Elapsed seconds since the run started.
    pub fn elapsed(&self) -> f64 {
        crate::util::now_secs() - self.time_offset
    }
}

/// The contract every instrument driver implements.
pub trait Driver: Send {
    /// Identification string compared against the configured
    /// `correct_response` before the device is allowed to start.
    fn verification_string(&mut self) -> String;

    /// One data acquisition.
    fn read_value(&mut self) -> AppResult<Reading>;

    /// Warnings accumulated since the previous call.
    fn get_warnings(&mut self) -> Vec<DeviceWarning> {
        Vec::new()
    }

    /// Fast devices: attributes discovered at runtime that must be added
    /// to the device's HDF group.
    fn new_attributes(&mut self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Invoke a named method with parsed arguments.
    fn call(&mut self, method: &str, args: &[Value]) -> AppResult<RetValue>;
}

impl std::fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Driver")
    }
}

pub type DriverFactory =
    Arc<dyn Fn(&DeviceConfig, DriverContext) -> AppResult<Box<dyn Driver>> + Send + Sync>;

/// Name-to-constructor table; the device layer instantiates drivers by
/// the name given in the device file.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in simulated drivers.
    pub fn with_builtin() -> Self {
        let mut reg = Self::new();
        reg.register("mock_slow", |cfg, ctx| {
            Ok(Box::new(mock::MockSlow::new(cfg, ctx)) as Box<dyn Driver>)
        });
        reg.register("mock_fast", |cfg, ctx| {
            Ok(Box::new(mock::MockFast::new(cfg, ctx)) as Box<dyn Driver>)
        });
        reg.register("mock_failing", |cfg, ctx| {
            Ok(Box::new(mock::MockFailing::new(cfg, ctx)) as Box<dyn Driver>)
        });
        reg
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DeviceConfig, DriverContext) -> AppResult<Box<dyn Driver>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn build(
        &self,
        config: &DeviceConfig,
        ctx: DriverContext,
    ) -> AppResult<Box<dyn Driver>> {
        let factory = self
            .factories
            .get(&config.driver)
            .ok_or_else(|| DaqError::UnknownDriver(config.driver.clone()))?;
        factory(config, ctx)
    }

    pub fn factory(&self, name: &str) -> AppResult<DriverFactory> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| DaqError::UnknownDriver(name.to_string()))
    }
}
