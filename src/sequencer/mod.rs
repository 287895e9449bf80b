//! Scripted measurement sequences.
//!
//! A sequence is a tree of rows loaded from JSON. The tree is flattened
//! into a linear list of timed steps, then an executor thread feeds the
//! steps into the devices' sequencer mailboxes, optionally blocking on
//! each result.

pub mod params;

use crate::device::DeviceMap;
use crate::error::{AppResult, DaqError};
use crate::signals::{Signal, SignalBus};
use crate::util::{now_ns, now_secs};
use params::{expand, substitute, Ancestor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

fn default_repeat() -> u64 {
    1
}

fn default_enabled() -> bool {
    true
}

/// One row of the sequence tree, as stored in the sequence file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SeqNode {
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub parameters: String,
    /// Seconds to sleep after issuing the step.
    #[serde(default)]
    pub dt: f64,
    /// Block until the device reports the step's result.
    #[serde(default)]
    pub wait: bool,
    #[serde(default = "default_repeat")]
    pub repeat: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub children: Vec<SeqNode>,
}

/// One executable step after flattening.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatStep {
    /// Empty device means a pure delay.
    pub device: String,
    pub function: String,
    pub parameter: String,
    pub dt: f64,
    pub wait: bool,
}

impl FlatStep {
    pub fn command(&self) -> String {
        format!("{}({})", self.function, self.parameter)
    }
}

pub fn load_tree(path: &Path) -> AppResult<Vec<SeqNode>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| DaqError::Sequencer(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| DaqError::Sequencer(format!("cannot parse {}: {e}", path.display())))
}

fn flatten_node(
    node: &SeqNode,
    known: &BTreeSet<String>,
    ancestors: &[Ancestor],
    parent_info: &[String],
    out: &mut Vec<FlatStep>,
    warnings: &mut Vec<String>,
) -> AppResult<()> {
    if !node.enabled {
        return Ok(());
    }
    let substituted = substitute(&node.parameters, ancestors);
    let values = expand(&substituted, parent_info)?;
    let is_delay = node.device.is_empty() || node.function.is_empty();
    let known_device = known.contains(&node.device);
    if !is_delay && !known_device {
        warnings.push(format!("unknown device in sequence: {}", node.device));
    }

    for _ in 0..node.repeat.max(1) {
        for value in &values {
            if is_delay {
                out.push(FlatStep {
                    device: String::new(),
                    function: String::new(),
                    parameter: String::new(),
                    dt: node.dt.max(0.0),
                    wait: false,
                });
            } else if known_device {
                out.push(FlatStep {
                    device: node.device.clone(),
                    function: node.function.clone(),
                    parameter: value.clone(),
                    dt: node.dt.max(0.0),
                    wait: node.wait,
                });
            }

            if node.children.is_empty() {
                continue;
            }
            let mut chain = ancestors.to_vec();
            chain.push(Ancestor {
                device: node.device.clone(),
                function: node.function.clone(),
                parameter: value.clone(),
            });
            let mut info = parent_info.to_vec();
            if !is_delay {
                info.push(format!("{}.{}({})", node.device, node.function, value));
            }
            for child in &node.children {
                flatten_node(child, known, &chain, &info, out, warnings)?;
            }
        }
    }
    Ok(())
}

/// Flatten a tree into the executable step list. Disabled subtrees are
/// pruned; steps for unknown devices are dropped with a warning.
pub fn flatten(
    nodes: &[SeqNode],
    known: &BTreeSet<String>,
) -> AppResult<(Vec<FlatStep>, Vec<String>)> {
    let mut out = Vec::new();
    let mut warnings = Vec::new();
    for node in nodes {
        flatten_node(node, known, &[], &[], &mut out, &mut warnings)?;
    }
    Ok((out, warnings))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqState {
    Idle,
    Running,
    Paused,
    Finished,
    Aborted,
}

pub struct SequencerShared {
    state: Mutex<SeqState>,
    active: AtomicBool,
    paused: AtomicBool,
}

impl SequencerShared {
    pub fn state(&self) -> SeqState {
        *self.state.lock()
    }
}

pub struct Sequencer {
    pub shared: Arc<SequencerShared>,
    handle: Option<JoinHandle<()>>,
}

/// `HH:MM:SS` remaining-time text for the progress display.
pub fn eta_text(secs: f64) -> String {
    let total = if secs.is_finite() && secs > 0.0 {
        secs.round() as u64
    } else {
        0
    };
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Sleep `secs` in short slices so abort stays responsive.
fn responsive_sleep(secs: f64, active: &AtomicBool) {
    let deadline = now_secs() + secs.max(0.0);
    while active.load(Ordering::SeqCst) && now_secs() < deadline {
        let left = deadline - now_secs();
        std::thread::sleep(Duration::from_secs_f64(left.min(0.05).max(0.0)));
    }
}

struct Executor {
    shared: Arc<SequencerShared>,
    devices: DeviceMap,
    bus: SignalBus,
}

impl Executor {
    fn active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    fn pause_point(&self, step: &FlatStep) {
        // fast-digitizer reads keep the acquisition alive through a pause
        let exempt = step.function == "ReadValue" && {
            let devices = self.devices.read();
            devices
                .get(&step.device)
                .map(|d| !d.shared.slow_data())
                .unwrap_or(false)
        };
        if exempt {
            return;
        }
        while self.shared.paused.load(Ordering::SeqCst) && self.active() {
            *self.shared.state.lock() = SeqState::Paused;
            std::thread::sleep(Duration::from_millis(100));
        }
        if self.active() {
            *self.shared.state.lock() = SeqState::Running;
        }
    }

    /// An error raised by any device pauses the sequence, even when the
    /// step that just ran addressed a different device or none at all.
    fn drain_errors(&self) {
        let devices = self.devices.read();
        for (name, device) in devices.iter() {
            for (id, message) in device.shared.sequencer_errors_rx.try_iter() {
                warn!(device = %name, id, "sequence step failed: {message}");
                self.shared.paused.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Returns false when execution should stop.
    fn run_step(&self, step: &FlatStep) -> bool {
        self.pause_point(step);
        if !self.active() {
            return false;
        }
        if step.device.is_empty() {
            responsive_sleep(step.dt, &self.shared.active);
            self.drain_errors();
            return self.active();
        }

        let dev = {
            let devices = self.devices.read();
            match devices.get(&step.device) {
                Some(d) => Arc::clone(&d.shared),
                None => {
                    warn!(device = %step.device, "device disappeared mid-sequence");
                    return self.active();
                }
            }
        };

        let id = now_ns();
        dev.enqueue_sequencer(id, step.command());
        responsive_sleep(step.dt, &self.shared.active);
        self.drain_errors();

        if step.wait {
            loop {
                if !self.active() {
                    return false;
                }
                let mut done = false;
                for event in dev.sequencer_events_rx.try_iter() {
                    if event.id != id {
                        continue;
                    }
                    if event.result.is_error() {
                        warn!(
                            device = %step.device,
                            command = %event.command,
                            "waited step returned an error, pausing"
                        );
                        self.shared.paused.store(true, Ordering::SeqCst);
                    }
                    done = true;
                }
                if done {
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
        true
    }

    fn run(&self, steps: Vec<FlatStep>, n_repeats: u64, infinite: bool) {
        *self.shared.state.lock() = SeqState::Running;
        let total = steps.len() as u64 * n_repeats.max(1);
        let started = now_secs();
        let mut completed = 0u64;

        'outer: loop {
            for _ in 0..n_repeats.max(1) {
                for step in &steps {
                    if !self.run_step(step) {
                        break 'outer;
                    }
                    completed += 1;
                    let shown = completed.min(total);
                    let remaining = if infinite {
                        f64::INFINITY
                    } else {
                        let elapsed = now_secs() - started;
                        elapsed / completed as f64 * total.saturating_sub(shown) as f64
                    };
                    self.bus.send(Signal::SequencerProgress {
                        step: shown as usize,
                        total: total as usize,
                        remaining_secs: remaining,
                    });
                }
            }
            if !infinite {
                break;
            }
        }

        let final_state = if self.active() {
            SeqState::Finished
        } else {
            SeqState::Aborted
        };
        *self.shared.state.lock() = final_state;
        self.shared.active.store(false, Ordering::SeqCst);
        self.bus.send(Signal::SequencerFinished);
        info!(?final_state, completed, "sequence done");
    }
}

impl Sequencer {
    pub fn start(
        steps: Vec<FlatStep>,
        devices: DeviceMap,
        bus: SignalBus,
        n_repeats: u64,
        infinite: bool,
    ) -> AppResult<Self> {
        let shared = Arc::new(SequencerShared {
            state: Mutex::new(SeqState::Idle),
            active: AtomicBool::new(true),
            paused: AtomicBool::new(false),
        });
        let executor = Executor {
            shared: Arc::clone(&shared),
            devices,
            bus,
        };
        let handle = std::thread::Builder::new()
            .name("sequencer".into())
            .spawn(move || executor.run(steps, n_repeats, infinite))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    pub fn state(&self) -> SeqState {
        self.shared.state()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state(), SeqState::Finished | SeqState::Aborted)
    }

    /// Abort and join; a paused sequence aborts too.
    pub fn abort(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("sequencer thread panicked");
            }
        }
    }

    /// Wait for natural completion.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("sequencer thread panicked");
            }
        }
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, ParamValue};
    use crate::device::Device;
    use crate::driver::DriverRegistry;
    use serial_test::serial;
    use std::collections::BTreeMap;

    fn known(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn node(device: &str, function: &str, parameters: &str) -> SeqNode {
        SeqNode {
            device: device.into(),
            function: function.into(),
            parameters: parameters.into(),
            dt: 0.0,
            wait: false,
            repeat: 1,
            enabled: true,
            children: Vec::new(),
        }
    }

    #[test]
    fn flatten_expands_scan_with_nested_reads() {
        let mut scan = node("laser", "SetPower", "linspace(0, 1, 3)");
        scan.children.push(node("probe", "ReadValue", ""));
        let (steps, warnings) = flatten(&[scan], &known(&["laser", "probe"])).unwrap();
        assert!(warnings.is_empty());
        let commands: Vec<String> = steps.iter().map(|s| s.command()).collect();
        assert_eq!(
            commands,
            vec![
                "SetPower(0.0)",
                "ReadValue()",
                "SetPower(0.5)",
                "ReadValue()",
                "SetPower(1.0)",
                "ReadValue()",
            ]
        );
    }

    #[test]
    fn flatten_prunes_disabled_and_warns_unknown() {
        let mut disabled = node("laser", "SetPower", "1");
        disabled.enabled = false;
        disabled.children.push(node("probe", "ReadValue", ""));
        let unknown = node("ghost", "Fire", "1");
        let (steps, warnings) =
            flatten(&[disabled, unknown], &known(&["laser", "probe"])).unwrap();
        assert!(steps.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("ghost"));
    }

    #[test]
    fn flatten_repeat_and_delays() {
        let mut delay = node("", "", "");
        delay.dt = 0.5;
        delay.repeat = 3;
        let (steps, _) = flatten(&[delay], &known(&[])).unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|s| s.device.is_empty() && s.dt == 0.5));
    }

    #[test]
    fn flatten_substitutes_ancestor_parameters() {
        let mut outer = node("laser", "SetPower", "2, 4");
        outer
            .children
            .push(node("logger", "Note", "args: 'power=$1'"));
        let (steps, _) = flatten(&[outer], &known(&["laser", "logger"])).unwrap();
        let commands: Vec<String> = steps.iter().map(|s| s.command()).collect();
        assert_eq!(
            commands,
            vec![
                "SetPower(2)",
                "Note('power=2')",
                "SetPower(4)",
                "Note('power=4')",
            ]
        );
    }

    #[test]
    fn eta_formats_hms() {
        assert_eq!(eta_text(0.0), "00:00:00");
        assert_eq!(eta_text(61.0), "00:01:01");
        assert_eq!(eta_text(3725.0), "01:02:05");
        assert_eq!(eta_text(f64::NAN), "00:00:00");
    }

    fn live_device(name: &str) -> Device {
        let mut cfg = DeviceConfig::bare(name, "mock_slow", true);
        cfg.correct_response = "mock_slow".into();
        cfg.attributes
            .insert("column_names".into(), "t, value".into());
        let reg = DriverRegistry::with_builtin();
        let mut dev = Device::new(cfg, reg.factory("mock_slow").unwrap());
        dev.shared
            .config
            .write()
            .change_param("enabled", ParamValue::Level(2));
        dev.start(now_secs()).unwrap();
        dev
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
    #[serial]
    fn executes_steps_in_order_with_wait() {
        let dev = live_device("laser");
        let shared = Arc::clone(&dev.shared);
        let devices = map_of(vec![dev]);
        let bus = SignalBus::new();

        let steps = vec![
            FlatStep {
                device: "laser".into(),
                function: "SetOffset".into(),
                parameter: "2".into(),
                dt: 0.0,
                wait: true,
            },
            FlatStep {
                device: "laser".into(),
                function: "GetOffset".into(),
                parameter: "".into(),
                dt: 0.0,
                wait: true,
            },
        ];
        let mut seq = Sequencer::start(steps, Arc::clone(&devices), bus.clone(), 1, false).unwrap();
        seq.join();
        assert_eq!(seq.state(), SeqState::Finished);

        let events: Vec<_> = shared.events_rx.try_iter().collect();
        assert_eq!(events[0].command, "SetOffset(2)");
        assert_eq!(events[1].command, "GetOffset()");
        assert_eq!(events[1].result, "2.0");

        let progress: Vec<_> = bus
            .drain()
            .into_iter()
            .filter(|s| matches!(s, Signal::SequencerProgress { .. }))
            .collect();
        assert_eq!(progress.len(), 2);
        devices.write().get_mut("laser").unwrap().stop();
    }

    #[test]
    #[serial]
    fn error_from_another_device_pauses_the_sequence() {
        let laser = live_device("laser");
        // a bystander device with nothing addressed to it; its supervisor
        // raises an error while a pure delay step is sleeping
        let cfg = DeviceConfig::bare("shutter", "mock_slow", true);
        let reg = DriverRegistry::with_builtin();
        let bystander = Device::new(cfg, reg.factory("mock_slow").unwrap());
        bystander
            .shared
            .sequencer_errors_tx
            .send((7, "boom".into()))
            .unwrap();
        let devices = map_of(vec![laser, bystander]);

        let steps = vec![
            FlatStep {
                device: String::new(),
                function: String::new(),
                parameter: String::new(),
                dt: 0.05,
                wait: false,
            },
            FlatStep {
                device: "laser".into(),
                function: "GetOffset".into(),
                parameter: "".into(),
                dt: 0.0,
                wait: true,
            },
        ];
        let mut seq =
            Sequencer::start(steps, Arc::clone(&devices), SignalBus::new(), 1, false).unwrap();
        for _ in 0..100 {
            if seq.state() == SeqState::Paused {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seq.state(), SeqState::Paused);
        seq.abort();
        devices.write().get_mut("laser").unwrap().stop();
    }

    #[test]
    #[serial]
    fn waited_error_pauses_the_sequence() {
        let dev = live_device("laser");
        let devices = map_of(vec![dev]);
        let steps = vec![
            FlatStep {
                device: "laser".into(),
                function: "NoSuchMethod".into(),
                parameter: "".into(),
                dt: 0.0,
                wait: true,
            },
            FlatStep {
                device: "laser".into(),
                function: "GetOffset".into(),
                parameter: "".into(),
                dt: 0.0,
                wait: true,
            },
        ];
        let mut seq =
            Sequencer::start(steps, Arc::clone(&devices), SignalBus::new(), 1, false).unwrap();
        for _ in 0..100 {
            if seq.state() == SeqState::Paused {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seq.state(), SeqState::Paused);
        seq.abort();
        assert_eq!(seq.state(), SeqState::Aborted);
        devices.write().get_mut("laser").unwrap().stop();
    }
}
