//! Simulated instruments.
//!
//! These drivers stand in for real hardware in the integration tests and
//! when bringing the system up on a bench with nothing attached. They
//! exercise every part of the driver contract, including warning
//! emission and deliberate NaN production.

use super::{
    DeviceWarning, Driver, DriverContext, FastRecord, Reading, RetValue, Value, Waveform,
};
use crate::config::DeviceConfig;
use crate::error::{AppResult, DaqError};
use ndarray::Array2;
use rand::Rng;
use std::collections::BTreeMap;

/// Slow synthetic source: a sine with noise per data column, plus a
/// settable offset. `EmitNaN(n)` replaces the next `n` readings with the
/// bare NaN sentinel.
pub struct MockSlow {
    ctx: DriverContext,
    /// Data columns beyond the timestamp.
    columns: usize,
    offset: f64,
    nan_budget: u64,
    warnings: Vec<DeviceWarning>,
    last_row: Vec<Value>,
}

impl MockSlow {
    pub fn new(cfg: &DeviceConfig, ctx: DriverContext) -> Self {
        let columns = cfg.column_names().len().saturating_sub(1).max(1);
        Self {
            ctx,
            columns,
            offset: 0.0,
            nan_budget: 0,
            warnings: Vec::new(),
            last_row: Vec::new(),
        }
    }
}

impl Driver for MockSlow {
    fn verification_string(&mut self) -> String {
        "mock_slow".into()
    }

    fn read_value(&mut self) -> AppResult<Reading> {
        if self.nan_budget > 0 {
            self.nan_budget -= 1;
            return Ok(Reading::Scalar(f64::NAN));
        }
        let t = self.ctx.elapsed();
        let mut row = Vec::with_capacity(self.columns + 1);
        row.push(Value::Float(t));
        let mut rng = rand::thread_rng();
        for i in 0..self.columns {
            let phase = t + i as f64;
            row.push(Value::Float(
                self.offset + phase.sin() + rng.gen_range(-0.01..0.01),
            ));
        }
        self.last_row = row.clone();
        Ok(Reading::Slow(row))
    }

    fn get_warnings(&mut self) -> Vec<DeviceWarning> {
        std::mem::take(&mut self.warnings)
    }

    fn call(&mut self, method: &str, args: &[Value]) -> AppResult<RetValue> {
        match (method, args) {
            ("ReadValue", []) => Ok(RetValue::Row(
                self.last_row.iter().map(Value::as_f64).collect(),
            )),
            ("SetOffset", [v]) => {
                self.offset = v.as_f64();
                Ok(RetValue::None)
            }
            ("GetOffset", []) => Ok(RetValue::Float(self.offset)),
            // setpoint echo used by scripted scans
            ("SetV", [v]) => {
                self.offset = v.as_f64();
                Ok(RetValue::Float(self.offset + 1.0))
            }
            ("EmitNaN", [n]) => {
                self.nan_budget = v_as_count(n)?;
                Ok(RetValue::None)
            }
            ("RaiseWarning", [Value::Str(msg)]) => {
                self.warnings.push(DeviceWarning {
                    time: crate::util::now_secs(),
                    message: msg.clone(),
                });
                Ok(RetValue::None)
            }
            _ => Err(DaqError::Driver(format!(
                "mock_slow has no method {method}({} args)",
                args.len()
            ))),
        }
    }
}

fn v_as_count(v: &Value) -> AppResult<u64> {
    match v {
        Value::Int(i) if *i >= 0 => Ok(*i as u64),
        other => Err(DaqError::Driver(format!("expected a count, got {other}"))),
    }
}

/// Fast synthetic source producing one waveform batch per poll.
pub struct MockFast {
    ctx: DriverContext,
    channels: usize,
    samples: usize,
    acquisitions: u64,
    pending_attrs: Vec<(String, String)>,
}

impl MockFast {
    pub fn new(cfg: &DeviceConfig, ctx: DriverContext) -> Self {
        let (channels, samples) = match cfg.shape.as_slice() {
            [c, s, ..] => (*c, *s),
            [s] => (1, *s),
            [] => (2, 64),
        };
        Self {
            ctx,
            channels: channels.max(1),
            samples: samples.max(1),
            acquisitions: 0,
            // Discovered once the instrument is armed; drained by the
            // supervisor on its first tick.
            pending_attrs: vec![("sample_rate".into(), "250e6".into())],
        }
    }
}

impl Driver for MockFast {
    fn verification_string(&mut self) -> String {
        "mock_fast".into()
    }

    fn read_value(&mut self) -> AppResult<Reading> {
        let t0 = self.ctx.elapsed();
        let mut rng = rand::thread_rng();
        let data = Array2::from_shape_fn((self.channels, self.samples), |(ch, i)| {
            let phase = t0 + i as f64 / self.samples as f64 + ch as f64;
            phase.sin() + rng.gen_range(-0.05..0.05)
        });
        self.acquisitions += 1;
        let mut attrs = BTreeMap::new();
        attrs.insert("ch0 : timestamp".into(), format!("{t0:?}"));
        attrs.insert("acquisition".into(), self.acquisitions.to_string());
        Ok(Reading::Fast(FastRecord {
            records: vec![Waveform { data, attrs }],
        }))
    }

    fn new_attributes(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.pending_attrs)
    }

    fn call(&mut self, method: &str, args: &[Value]) -> AppResult<RetValue> {
        match (method, args) {
            ("AcquisitionCount", []) => Ok(RetValue::Int(self.acquisitions as i64)),
            ("Arm", []) => Ok(RetValue::None),
            _ => Err(DaqError::Driver(format!(
                "mock_fast has no method {method}({} args)",
                args.len()
            ))),
        }
    }
}

/// A driver whose instrument is absent: the probe answers with the wrong
/// identity and every operation errors out.
pub struct MockFailing;

impl MockFailing {
    pub fn new(_cfg: &DeviceConfig, _ctx: DriverContext) -> Self {
        Self
    }
}

impl Driver for MockFailing {
    fn verification_string(&mut self) -> String {
        "no instrument present".into()
    }

    fn read_value(&mut self) -> AppResult<Reading> {
        Err(DaqError::Driver("connection lost".into()))
    }

    fn call(&mut self, method: &str, _args: &[Value]) -> AppResult<RetValue> {
        Err(DaqError::Driver(format!("{method}: connection lost")))
    }
}
