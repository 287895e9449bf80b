//! Run health monitoring.
//!
//! One thread at a 500 ms cadence: disk space, writer liveness, device
//! warnings, queue lengths, indicator reconciliation, the slow
//! time-series publication and the stale-read restart. Everything
//! user-visible leaves through the signal bus.

pub mod influx;

use crate::device::DeviceMap;
use crate::driver::Reading;
use crate::signals::{IndicatorState, Signal, SignalBus};
use crate::util::now_secs;
use crate::writer::{RunLocator, WriterShared};
use influx::Tsdb;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

const TICK: Duration = Duration::from_millis(500);
/// Writer silence beyond this is flagged as an error.
const HDF_STALE_SECS: f64 = 5.0;
/// A polled device silent this long is restarted.
const READ_STALE_SECS: f64 = 30.0;

/// Everything the monitor observes, handed over at start.
pub struct MonitorHandles {
    pub devices: DeviceMap,
    pub writer: Option<Arc<WriterShared>>,
    pub locator: Option<RunLocator>,
    pub tsdb: Option<Arc<dyn Tsdb>>,
    pub bus: SignalBus,
    pub run_name: String,
    pub monitoring_dt: f64,
    pub time_offset: f64,
    /// Volume whose free space is reported.
    pub hdf_dir: PathBuf,
}

/// Per-cycle bookkeeping that survives between ticks.
#[derive(Default)]
pub struct MonitorState {
    last_publication: HashMap<String, f64>,
}

pub struct Monitor {
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

fn indicator_signal(
    device: &str,
    param_name: &str,
    param: &crate::config::ControlParam,
    repr: &str,
) -> Signal {
    let matched = param.return_values.iter().position(|rv| rv == repr);
    // no match falls back to the second-to-last entry, reserved for
    // "invalid reading"
    let i = matched.unwrap_or_else(|| param.texts.len().saturating_sub(2));
    Signal::Indicator {
        device: device.to_string(),
        param: param_name.to_string(),
        text: param.texts.get(i).cloned().unwrap_or_else(|| repr.to_string()),
        state: param
            .states
            .get(i)
            .cloned()
            .unwrap_or_else(|| "error".to_string()),
        checked: param.checked.get(i).copied(),
    }
}

fn format_sample(columns: &[String], row: &[crate::driver::Value]) -> String {
    columns
        .iter()
        .zip(row.iter())
        .map(|(c, v)| format!("{c} = {v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One monitoring pass over everything. Split out of the thread loop so
/// tests can drive it synchronously.
pub fn cycle(h: &MonitorHandles, state: &mut MonitorState) {
    let now = now_secs();

    match fs2::free_space(&h.hdf_dir) {
        Ok(bytes) => h.bus.send(Signal::FreeDiskSpace { bytes }),
        Err(e) => warn!("free-space query failed: {e}"),
    }

    if let Some(writer) = &h.writer {
        let signal = if !writer.active.load(Ordering::SeqCst) {
            Signal::HdfStatus {
                text: "writer stopped".into(),
                state: IndicatorState::Disabled,
            }
        } else {
            let age = now - *writer.time_last_write.lock();
            let state = if age > HDF_STALE_SECS {
                IndicatorState::Error
            } else {
                IndicatorState::Enabled
            };
            Signal::HdfStatus {
                text: format!("last write {age:.1} s ago"),
                state,
            }
        };
        h.bus.send(signal);
    }

    let mut to_restart = Vec::new();
    {
        let devices = h.devices.read();
        for (name, device) in devices.iter() {
            let dev = &device.shared;
            if !dev.control_started.load(Ordering::SeqCst) {
                continue;
            }
            let config = dev.config.read().clone();
            if config.enabled() != 2 {
                continue;
            }

            for w in dev.take_warnings() {
                h.bus.send(Signal::Warning {
                    device: Some(name.clone()),
                    text: w.message.clone(),
                });
                if config.influx_enabled() {
                    if let Some(tsdb) = &h.tsdb {
                        if let Err(e) = tsdb.write_warning(name, &h.run_name, &w.message) {
                            warn!(device = %name, "warning forward failed: {e}");
                        }
                    }
                }
            }

            h.bus.send(Signal::QueueLength {
                device: name.clone(),
                len: dev.data_queue_len(),
            });

            if let Some(latest) = dev.plots.latest() {
                if let Reading::Slow(row) = latest.as_ref() {
                    h.bus.send(Signal::MonitoredData {
                        device: name.clone(),
                        text: format_sample(&config.column_names(), row),
                    });
                }
            }

            // last event: in-memory queue when storage is off, the file
            // otherwise
            if !config.hdf_enabled() {
                let last = dev.events_rx.try_iter().last();
                // keep data from piling up on write-disabled devices
                for _ in dev.data_rx.try_iter() {}
                if let Some(e) = last {
                    h.bus.send(Signal::LastEvent {
                        device: name.clone(),
                        text: format!("{:.3}: {} -> {}", e.time, e.command, e.result),
                    });
                }
            } else if let Some(locator) = &h.locator {
                if let Some(row) = locator.last_event(&config.path, name) {
                    h.bus.send(Signal::LastEvent {
                        device: name.clone(),
                        text: row.join(" "),
                    });
                }
            }

            // indicator round trip: register commands, reconcile results
            for param in config.control_params.values() {
                if param.kind.is_indicator() {
                    if let Some(cmd) = &param.monitoring_command {
                        dev.register_monitoring(cmd.clone());
                    }
                }
            }
            for event in dev.monitoring_events_rx.try_iter() {
                let repr = event.result.to_string();
                let matched = config.control_params.iter().find(|(_, p)| {
                    p.monitoring_command.as_deref() == Some(event.command.as_str())
                });
                if let Some((pname, param)) = matched {
                    h.bus.send(indicator_signal(name, pname, param, &repr));
                }
            }

            // slow publication to the time-series sink
            let due = now
                - state
                    .last_publication
                    .get(name)
                    .copied()
                    .unwrap_or(f64::NEG_INFINITY)
                >= h.monitoring_dt;
            if due && config.slow_data && config.hdf_enabled() && config.influx_enabled() {
                if let Some(tsdb) = &h.tsdb {
                    if let Some(latest) = dev.plots.latest() {
                        if let Reading::Slow(row) = latest.as_ref() {
                            let columns = config.column_names();
                            let t = row.first().map(|v| v.as_f64()).unwrap_or(f64::NAN);
                            let fields: Vec<(String, f64)> = columns
                                .iter()
                                .zip(row.iter())
                                .skip(1)
                                .map(|(c, v)| (c.clone(), v.as_f64()))
                                .filter(|(_, v)| !v.is_nan())
                                .collect();
                            if t.is_finite() && !fields.is_empty() {
                                let ts = ((t + h.time_offset) * 1e9) as i64;
                                if let Err(e) = tsdb.write_sample(
                                    &config.driver,
                                    name,
                                    &h.run_name,
                                    ts,
                                    &fields,
                                ) {
                                    warn!(device = %name, "time-series write failed: {e}");
                                }
                            }
                            state.last_publication.insert(name.clone(), now);
                        }
                    }
                }
            }

            if now - *dev.time_last_read.lock() > READ_STALE_SECS {
                warn!(device = %name, "no reading for over {READ_STALE_SECS} s, restarting");
                to_restart.push(name.clone());
            }
        }
    }

    if !to_restart.is_empty() {
        let mut devices = h.devices.write();
        for name in to_restart {
            if let Some(device) = devices.get_mut(&name) {
                if let Err(e) = device.restart() {
                    warn!(device = %name, "restart failed: {e}");
                    h.bus.send(Signal::DeviceError {
                        device: name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

impl Monitor {
    pub fn start(handles: MonitorHandles) -> std::io::Result<Self> {
        let active = Arc::new(AtomicBool::new(true));
        let thread_active = Arc::clone(&active);
        let handle = std::thread::Builder::new()
            .name("monitor".into())
            .spawn(move || {
                let mut state = MonitorState::default();
                while thread_active.load(Ordering::SeqCst) {
                    cycle(&handles, &mut state);
                    std::thread::sleep(TICK);
                }
                info!("monitor stopped");
            })?;
        Ok(Self {
            active,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("monitor thread panicked");
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControlParam, DeviceConfig, ParamKind, ParamValue};
    use crate::device::queues::MonitoringEvent;
    use crate::device::Device;
    use crate::driver::{DriverRegistry, RetValue, Value};
    use crate::error::AppResult;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct CapturingTsdb {
        samples: Mutex<Vec<(String, String, i64, Vec<(String, f64)>)>>,
        warnings: Mutex<Vec<(String, String)>>,
    }

    impl Tsdb for CapturingTsdb {
        fn write_sample(
            &self,
            driver: &str,
            device: &str,
            _run_name: &str,
            timestamp_ns: i64,
            fields: &[(String, f64)],
        ) -> AppResult<()> {
            self.samples.lock().push((
                driver.to_string(),
                device.to_string(),
                timestamp_ns,
                fields.to_vec(),
            ));
            Ok(())
        }

        fn write_warning(&self, device: &str, _run_name: &str, message: &str) -> AppResult<()> {
            self.warnings
                .lock()
                .push((device.to_string(), message.to_string()));
            Ok(())
        }
    }

    fn slow_device(name: &str) -> Device {
        let mut cfg = DeviceConfig::bare(name, "mock_slow", true);
        cfg.attributes
            .insert("column_names".into(), "t, value".into());
        let reg = DriverRegistry::with_builtin();
        let dev = Device::new(cfg, reg.factory("mock_slow").unwrap());
        dev.shared
            .config
            .write()
            .change_param("enabled", ParamValue::Level(2));
        dev.shared.control_started.store(true, Ordering::SeqCst);
        *dev.shared.time_last_read.lock() = now_secs();
        dev
    }

    fn handles(devices: DeviceMap, tsdb: Option<Arc<dyn Tsdb>>) -> MonitorHandles {
        MonitorHandles {
            devices,
            writer: None,
            locator: None,
            tsdb,
            bus: SignalBus::new(),
            run_name: "test".into(),
            monitoring_dt: 0.0,
            time_offset: 1000.0,
            hdf_dir: std::env::temp_dir(),
        }
    }

    fn map_of(devices: Vec<Device>) -> DeviceMap {
        Arc::new(parking_lot::RwLock::new(
            devices
                .into_iter()
                .map(|d| (d.shared.name(), d))
                .collect::<BTreeMap<_, _>>(),
        ))
    }

    #[test]
    fn publishes_latest_sample_without_nan_fields() {
        let dev = slow_device("thermo");
        dev.shared.plots.push(Arc::new(Reading::Slow(vec![
            Value::Float(2.0),
            Value::Float(f64::NAN),
        ])));
        dev.shared.plots.push(Arc::new(Reading::Slow(vec![
            Value::Float(3.0),
            Value::Float(21.5),
        ])));
        let tsdb = Arc::new(CapturingTsdb::default());
        let h = handles(map_of(vec![dev]), Some(tsdb.clone() as Arc<dyn Tsdb>));
        let mut state = MonitorState::default();
        cycle(&h, &mut state);

        let samples = tsdb.samples.lock();
        assert_eq!(samples.len(), 1);
        let (driver, device, ts, fields) = &samples[0];
        // points are keyed by driver so one dashboard covers every instance
        assert_eq!(driver, "mock_slow");
        assert_eq!(device, "thermo");
        assert_eq!(*ts, (1003.0f64 * 1e9) as i64);
        assert_eq!(fields, &vec![("value".to_string(), 21.5)]);
    }

    #[test]
    fn nan_only_sample_is_omitted_entirely() {
        let dev = slow_device("thermo");
        dev.shared.plots.push(Arc::new(Reading::Slow(vec![
            Value::Float(2.0),
            Value::Float(f64::NAN),
        ])));
        let tsdb = Arc::new(CapturingTsdb::default());
        let h = handles(map_of(vec![dev]), Some(tsdb.clone() as Arc<dyn Tsdb>));
        cycle(&h, &mut MonitorState::default());
        assert!(tsdb.samples.lock().is_empty());
    }

    #[test]
    fn warnings_are_forwarded_and_surfaced() {
        let dev = slow_device("thermo");
        dev.shared.push_warning("over temperature");
        let tsdb = Arc::new(CapturingTsdb::default());
        let h = handles(map_of(vec![dev]), Some(tsdb.clone() as Arc<dyn Tsdb>));
        cycle(&h, &mut MonitorState::default());

        assert_eq!(tsdb.warnings.lock().len(), 1);
        let drained = h.bus.drain();
        assert!(drained.iter().any(|s| matches!(
            s,
            Signal::Warning { device: Some(d), text } if d == "thermo" && text == "over temperature"
        )));
        assert!(drained
            .iter()
            .any(|s| matches!(s, Signal::QueueLength { device, .. } if device == "thermo")));
    }

    #[test]
    fn indicator_reconciliation_with_fallback() {
        let dev = slow_device("thermo");
        let mut param = ControlParam::new(ParamKind::Indicator, ParamValue::Text(String::new()));
        param.monitoring_command = Some("HeaterState()".into());
        param.return_values = vec!["on".into(), "off".into()];
        param.texts = vec!["heating".into(), "idle".into(), "invalid".into(), "waiting".into()];
        param.states = vec!["error".into(), "enabled".into(), "error".into(), "disabled".into()];
        dev.shared
            .config
            .write()
            .control_params
            .insert("heater".into(), param);

        let h = handles(map_of(vec![dev]), None);
        {
            let devices = h.devices.read();
            let shared = &devices.get("thermo").unwrap().shared;
            shared.monitoring_events_tx.send(MonitoringEvent {
                time: 0.0,
                command: "HeaterState()".into(),
                result: RetValue::Str("off".into()),
            }).unwrap();
            shared.monitoring_events_tx.send(MonitoringEvent {
                time: 0.1,
                command: "HeaterState()".into(),
                result: RetValue::Str("garbled".into()),
            }).unwrap();
        }
        cycle(&h, &mut MonitorState::default());

        let indicators: Vec<(String, String)> = h
            .bus
            .drain()
            .into_iter()
            .filter_map(|s| match s {
                Signal::Indicator { text, state, .. } => Some((text, state)),
                _ => None,
            })
            .collect();
        assert_eq!(indicators[0], ("idle".to_string(), "enabled".to_string()));
        // unrecognised return value resolves to the second-to-last slot
        assert_eq!(indicators[1], ("invalid".to_string(), "error".to_string()));

        // the command was re-registered for the next supervisor tick
        let devices = h.devices.read();
        let shared = &devices.get("thermo").unwrap().shared;
        assert!(shared.data_queue_len() == 0);
    }

    #[test]
    fn stale_read_triggers_restart() {
        let dev = slow_device("thermo");
        *dev.shared.time_last_read.lock() = now_secs() - 60.0;
        let h = handles(map_of(vec![dev]), None);
        let before = Arc::clone(&h.devices.read().get("thermo").unwrap().shared);
        cycle(&h, &mut MonitorState::default());
        let after = Arc::clone(&h.devices.read().get("thermo").unwrap().shared);
        assert!(!Arc::ptr_eq(&before, &after), "device was not restarted");
        // wind the restarted supervisor down
        h.devices.write().get_mut("thermo").unwrap().stop();
    }

    #[test]
    fn hdf_disabled_devices_get_drained() {
        let dev = slow_device("thermo");
        dev.shared
            .config
            .write()
            .change_param("HDF_enabled", ParamValue::Flag(false));
        for i in 0..10 {
            dev.shared
                .data_tx
                .send(Arc::new(Reading::Slow(vec![Value::Float(i as f64)])))
                .unwrap();
        }
        dev.shared.events_tx.send(crate::device::queues::Event {
            time: 1.0,
            command: "SetOffset(2)".into(),
            result: String::new(),
        }).unwrap();
        let h = handles(map_of(vec![dev]), None);
        cycle(&h, &mut MonitorState::default());

        let devices = h.devices.read();
        let shared = &devices.get("thermo").unwrap().shared;
        assert_eq!(shared.data_queue_len(), 0);
        assert_eq!(shared.events_rx.len(), 0);
        drop(devices);
        assert!(h.bus.drain().iter().any(|s| matches!(
            s,
            Signal::LastEvent { text, .. } if text.contains("SetOffset(2)")
        )));
    }
}
