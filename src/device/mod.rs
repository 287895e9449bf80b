//! Device supervision.
//!
//! Every instrument gets one supervisor thread that owns its driver
//! outright. All other components talk to the device through the shared
//! mailboxes on [`DeviceShared`]; the supervisor drains them in a fixed
//! class order each tick and polls the driver on the configured cadence.

pub mod queues;

use crate::config::DeviceConfig;
use crate::driver::command::Command;
use crate::driver::{
    DeviceWarning, Driver, DriverContext, DriverFactory, PeerData, Reading, RetValue, Value,
};
use crate::error::{AppResult, DaqError};
use crate::util::now_secs;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

pub use queues::{Event, MonitoringEvent, PlotsQueue, SequencerEvent};

/// Supervisor tick; command latency is bounded by this.
const TICK: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Everything about one device that outlives its supervisor thread.
pub struct DeviceShared {
    pub config: RwLock<DeviceConfig>,
    /// Cleared to wind the supervisor down.
    pub active: AtomicBool,
    /// True once the supervisor passed verification and entered its loop.
    pub control_started: AtomicBool,
    /// False after a failed verification probe.
    pub operational: AtomicBool,
    state: Mutex<DeviceState>,

    // command inboxes, one per producer class
    commands: Mutex<Vec<String>>,
    sequencer_commands: Mutex<Vec<(u64, String)>>,
    monitoring_commands: Mutex<BTreeSet<String>>,
    networking_commands: Mutex<Vec<(u64, String)>>,

    // outbound queues, each drained by exactly one consumer
    pub data_tx: Sender<Arc<Reading>>,
    pub data_rx: Receiver<Arc<Reading>>,
    pub events_tx: Sender<Event>,
    pub events_rx: Receiver<Event>,
    pub monitoring_events_tx: Sender<MonitoringEvent>,
    pub monitoring_events_rx: Receiver<MonitoringEvent>,
    pub sequencer_events_tx: Sender<SequencerEvent>,
    pub sequencer_events_rx: Receiver<SequencerEvent>,
    pub sequencer_errors_tx: Sender<(u64, String)>,
    pub sequencer_errors_rx: Receiver<(u64, String)>,
    networking_events: Mutex<HashMap<u64, RetValue>>,

    pub plots: PlotsQueue,
    warnings: Mutex<Vec<DeviceWarning>>,
    last_event: Mutex<Option<Event>>,
    /// HDF attributes discovered by the driver at runtime, pending pickup
    /// by the writer.
    pub new_attributes: Mutex<Vec<(String, String)>>,

    pub nan_count: AtomicU64,
    pub sequential_nan_count: AtomicU64,

    pub time_offset: Mutex<f64>,
    pub time_last_read: Mutex<f64>,
}

impl DeviceShared {
    pub fn new(config: DeviceConfig) -> Arc<Self> {
        let plots_maxlen = config.plots_queue_maxlen;
        let (data_tx, data_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let (monitoring_events_tx, monitoring_events_rx) = unbounded();
        let (sequencer_events_tx, sequencer_events_rx) = unbounded();
        let (sequencer_errors_tx, sequencer_errors_rx) = unbounded();
        Arc::new(Self {
            config: RwLock::new(config),
            active: AtomicBool::new(false),
            control_started: AtomicBool::new(false),
            operational: AtomicBool::new(true),
            state: Mutex::new(DeviceState::Stopped),
            commands: Mutex::new(Vec::new()),
            sequencer_commands: Mutex::new(Vec::new()),
            monitoring_commands: Mutex::new(BTreeSet::new()),
            networking_commands: Mutex::new(Vec::new()),
            data_tx,
            data_rx,
            events_tx,
            events_rx,
            monitoring_events_tx,
            monitoring_events_rx,
            sequencer_events_tx,
            sequencer_events_rx,
            sequencer_errors_tx,
            sequencer_errors_rx,
            networking_events: Mutex::new(HashMap::new()),
            plots: PlotsQueue::new(plots_maxlen),
            warnings: Mutex::new(Vec::new()),
            last_event: Mutex::new(None),
            new_attributes: Mutex::new(Vec::new()),
            nan_count: AtomicU64::new(0),
            sequential_nan_count: AtomicU64::new(0),
            time_offset: Mutex::new(0.0),
            time_last_read: Mutex::new(0.0),
        })
    }

    pub fn name(&self) -> String {
        self.config.read().name.clone()
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    fn set_state(&self, state: DeviceState) {
        *self.state.lock() = state;
    }

    pub fn enabled(&self) -> u8 {
        self.config.read().enabled()
    }

    pub fn slow_data(&self) -> bool {
        self.config.read().slow_data
    }

    pub fn hdf_enabled(&self) -> bool {
        self.config.read().hdf_enabled()
    }

    /// Interactive command, highest drain priority.
    pub fn enqueue_command(&self, text: impl Into<String>) {
        self.commands.lock().push(text.into());
    }

    pub fn enqueue_sequencer(&self, id: u64, text: impl Into<String>) {
        self.sequencer_commands.lock().push((id, text.into()));
    }

    /// Register a periodic monitoring command; duplicates collapse.
    pub fn register_monitoring(&self, text: impl Into<String>) {
        self.monitoring_commands.lock().insert(text.into());
    }

    pub fn enqueue_networking(&self, uid: u64, text: impl Into<String>) {
        self.networking_commands.lock().push((uid, text.into()));
    }

    /// Remove and return the reply for `uid`, if the supervisor has
    /// produced one.
    pub fn take_reply(&self, uid: u64) -> Option<RetValue> {
        self.networking_events.lock().remove(&uid)
    }

    pub fn push_warning(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(device = %self.name(), "{message}");
        self.warnings.lock().push(DeviceWarning {
            time: now_secs(),
            message,
        });
    }

    pub fn take_warnings(&self) -> Vec<DeviceWarning> {
        std::mem::take(&mut *self.warnings.lock())
    }

    pub fn last_event(&self) -> Option<Event> {
        self.last_event.lock().clone()
    }

    pub fn data_queue_len(&self) -> usize {
        self.data_rx.len()
    }

    fn record_event(&self, event: Event) {
        *self.last_event.lock() = Some(event.clone());
        let _ = self.events_tx.send(event);
    }

    fn elapsed(&self) -> f64 {
        now_secs() - *self.time_offset.lock()
    }
}

/// Only structured readings are data. Bare floats are return values
/// (the NaN sentinel among them) and never reach the data queues.
fn pushable(reading: &Reading) -> bool {
    match reading {
        Reading::Slow(row) => !row.is_empty(),
        Reading::Fast(rec) => !rec.records.is_empty(),
        Reading::Scalar(_) | Reading::Empty => false,
    }
}

fn reading_ret(reading: &Reading) -> RetValue {
    match reading {
        Reading::Slow(row) => RetValue::Row(row.iter().map(Value::as_f64).collect()),
        Reading::Scalar(v) => RetValue::Float(*v),
        Reading::Fast(_) | Reading::Empty => RetValue::None,
    }
}

/// A device: shared mailbox state plus the supervisor thread handle.
pub struct Device {
    pub shared: Arc<DeviceShared>,
    factory: DriverFactory,
    peers: Option<Arc<dyn PeerData>>,
    handle: Option<JoinHandle<()>>,
}

impl Device {
    pub fn new(config: DeviceConfig, factory: DriverFactory) -> Self {
        Self {
            shared: DeviceShared::new(config),
            factory,
            peers: None,
            handle: None,
        }
    }

    pub fn set_peers(&mut self, peers: Arc<dyn PeerData>) {
        self.peers = Some(peers);
    }

    fn driver_context(&self, time_offset: f64) -> DriverContext {
        let config = self.shared.config.read();
        let constr_params = config
            .constr_params
            .iter()
            .map(|name| {
                config
                    .control_params
                    .get(name)
                    .map(|p| p.value.as_text())
                    .unwrap_or_default()
            })
            .collect();
        let mut ctx = DriverContext::new(time_offset, constr_params);
        if config.meta_device {
            ctx.peers = self.peers.clone();
        }
        ctx
    }

    fn build_driver(&self, time_offset: f64) -> AppResult<Box<dyn Driver>> {
        let config = self.shared.config.read().clone();
        (self.factory)(&config, self.driver_context(time_offset))
    }

    /// Construct a driver and check its identity against the configured
    /// `correct_response`. The driver is dropped again; the supervisor
    /// builds its own.
    pub fn probe(&self, time_offset: f64) -> AppResult<()> {
        let (name, expected) = {
            let config = self.shared.config.read();
            (config.name.clone(), config.correct_response.clone())
        };
        let mut driver = self.build_driver(time_offset).map_err(|e| {
            self.shared.operational.store(false, Ordering::SeqCst);
            DaqError::Verification {
                device: name.clone(),
                message: e.to_string(),
            }
        })?;
        let response = driver.verification_string();
        if !expected.is_empty() && response.trim() != expected.trim() {
            self.shared.operational.store(false, Ordering::SeqCst);
            return Err(DaqError::Verification {
                device: name,
                message: format!("got {response:?}, expected {expected:?}"),
            });
        }
        self.shared.operational.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Spawn the supervisor thread. The caller must have set
    /// `time_offset` intent via the argument; queues start empty only on
    /// a fresh `DeviceShared`.
    pub fn start(&mut self, time_offset: f64) -> AppResult<()> {
        if self.handle.is_some() {
            return Err(DaqError::Config(format!(
                "device {} already started",
                self.shared.name()
            )));
        }
        *self.shared.time_offset.lock() = time_offset;
        *self.shared.time_last_read.lock() = now_secs();
        self.shared.active.store(true, Ordering::SeqCst);
        self.shared.set_state(DeviceState::Starting);

        let shared = Arc::clone(&self.shared);
        let driver = self.build_driver(time_offset);
        let name = self.shared.name();
        let handle = std::thread::Builder::new()
            .name(format!("dev-{name}"))
            .spawn(move || match driver {
                Ok(driver) => supervise(shared, driver),
                Err(e) => {
                    shared.push_warning(format!("driver construction failed: {e}"));
                    shared.operational.store(false, Ordering::SeqCst);
                    shared.active.store(false, Ordering::SeqCst);
                    shared.set_state(DeviceState::Stopped);
                }
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Clear the active flag and join the supervisor.
    pub fn stop(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(device = %self.shared.name(), "supervisor thread panicked");
            }
        }
    }

    /// Stop, discard all queued state, and start again with a fresh
    /// driver. The configuration (including runtime parameter changes)
    /// carries over; nothing else does.
    pub fn restart(&mut self) -> AppResult<()> {
        info!(device = %self.shared.name(), "restarting device");
        self.stop();
        let config = self.shared.config.read().clone();
        let time_offset = *self.shared.time_offset.lock();
        self.shared = DeviceShared::new(config);
        self.start(time_offset)
    }

    pub fn is_running(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst) && self.handle.is_some()
    }
}

/// Map of live devices, shared with the monitor, sequencer and broker.
pub type DeviceMap = Arc<RwLock<BTreeMap<String, Device>>>;

/// Peer access for meta devices, backed by the live device map. Holds a
/// weak reference so the map's devices can hold it without a cycle.
pub struct MapPeers {
    devices: Weak<RwLock<BTreeMap<String, Device>>>,
}

impl MapPeers {
    pub fn new(devices: &DeviceMap) -> Arc<Self> {
        Arc::new(Self {
            devices: Arc::downgrade(devices),
        })
    }
}

impl PeerData for MapPeers {
    fn latest_row(&self, device: &str) -> Option<Vec<Value>> {
        let devices = self.devices.upgrade()?;
        let devices = devices.read();
        let shared = &devices.get(device)?.shared;
        match shared.plots.latest()?.as_ref() {
            Reading::Slow(row) => Some(row.clone()),
            _ => None,
        }
    }
}

/// Evaluate one command string against the driver. Returns the result
/// and, for `ReadValue()`, the raw reading for the data queues.
fn execute(driver: &mut Box<dyn Driver>, text: &str) -> (RetValue, Option<Reading>) {
    let command = match Command::parse(text) {
        Ok(c) => c,
        Err(e) => return (RetValue::error(e.to_string()), None),
    };
    if command.method == "ReadValue" && command.args.is_empty() {
        return match driver.read_value() {
            Ok(reading) => (reading_ret(&reading), Some(reading)),
            Err(e) => (RetValue::error(e.to_string()), None),
        };
    }
    match driver.call(&command.method, &command.args) {
        Ok(ret) => (ret, None),
        Err(e) => (RetValue::error(e.to_string()), None),
    }
}

fn push_data(shared: &DeviceShared, reading: Reading) {
    let reading = Arc::new(reading);
    let _ = shared.data_tx.send(Arc::clone(&reading));
    shared.plots.push(reading);
}

fn drain_commands(shared: &DeviceShared, driver: &mut Box<dyn Driver>) {
    // interactive first
    let interactive: Vec<String> = std::mem::take(&mut *shared.commands.lock());
    for text in interactive {
        let (ret, reading) = execute(driver, &text);
        if let Some(reading) = reading {
            if pushable(&reading) {
                push_data(shared, reading);
            }
        }
        shared.record_event(Event::new(shared.elapsed(), text, &ret));
    }

    let sequenced: Vec<(u64, String)> = std::mem::take(&mut *shared.sequencer_commands.lock());
    for (id, text) in sequenced {
        let (ret, reading) = execute(driver, &text);
        if let Some(reading) = reading {
            if pushable(&reading) {
                push_data(shared, reading);
            }
        }
        if let RetValue::Error(e) = &ret {
            let _ = shared.sequencer_errors_tx.send((id, e.error.clone()));
        }
        shared.record_event(Event::new(shared.elapsed(), text.clone(), &ret));
        let _ = shared.sequencer_events_tx.send(SequencerEvent {
            id,
            time: crate::util::now_ns(),
            command: text,
            result: ret,
        });
    }

    // snapshot, then clear; the monitor re-registers every cycle
    let monitoring: Vec<String> = {
        let mut set = shared.monitoring_commands.lock();
        let snapshot = set.iter().cloned().collect();
        set.clear();
        snapshot
    };
    for text in monitoring {
        let (ret, _) = execute(driver, &text);
        let _ = shared.monitoring_events_tx.send(MonitoringEvent {
            time: shared.elapsed(),
            command: text,
            result: ret,
        });
    }

    let networked: Vec<(u64, String)> = std::mem::take(&mut *shared.networking_commands.lock());
    for (uid, text) in networked {
        let (ret, reading) = execute(driver, &text);
        if let Some(reading) = reading {
            if pushable(&reading) {
                push_data(shared, reading);
            }
        }
        shared.record_event(Event::new(shared.elapsed(), text, &ret));
        shared.networking_events.lock().insert(uid, ret);
    }
}

fn polled_read(shared: &DeviceShared, driver: &mut Box<dyn Driver>) {
    // one attempt per dt, whether or not it succeeds
    *shared.time_last_read.lock() = now_secs();
    match driver.read_value() {
        Ok(reading) => {
            if reading.is_nan() {
                shared.nan_count.fetch_add(1, Ordering::SeqCst);
                let streak = shared.sequential_nan_count.fetch_add(1, Ordering::SeqCst) + 1;
                let max = shared.config.read().max_nan_count;
                if streak > max {
                    shared.push_warning(format!("{streak} sequential NaN readings"));
                }
            } else {
                shared.sequential_nan_count.store(0, Ordering::SeqCst);
                if pushable(&reading) {
                    push_data(shared, reading);
                }
            }
        }
        Err(e) => {
            shared.push_warning(format!("ReadValue failed: {e}"));
        }
    }
}

fn supervise(shared: Arc<DeviceShared>, mut driver: Box<dyn Driver>) {
    let expected = shared.config.read().correct_response.clone();
    let response = driver.verification_string();
    if !expected.is_empty() && response.trim() != expected.trim() {
        shared.push_warning(format!(
            "verification failed: got {response:?}, expected {expected:?}"
        ));
        shared.operational.store(false, Ordering::SeqCst);
        shared.active.store(false, Ordering::SeqCst);
        shared.set_state(DeviceState::Stopped);
        return;
    }
    shared.operational.store(true, Ordering::SeqCst);
    shared.control_started.store(true, Ordering::SeqCst);
    shared.set_state(DeviceState::Running);
    info!(device = %shared.name(), "supervisor running");

    while shared.active.load(Ordering::SeqCst) {
        std::thread::sleep(TICK);
        if shared.enabled() < 1 {
            continue;
        }

        for w in driver.get_warnings() {
            warn!(device = %shared.name(), "{}", w.message);
            shared.warnings.lock().push(w);
        }
        let discovered = driver.new_attributes();
        if !discovered.is_empty() {
            shared.new_attributes.lock().extend(discovered);
        }

        drain_commands(&shared, &mut driver);

        if shared.enabled() == 2 {
            let dt = shared.config.read().dt();
            let due = now_secs() - *shared.time_last_read.lock() >= dt;
            if due {
                polled_read(&shared, &mut driver);
            }
        }
    }

    shared.set_state(DeviceState::Stopping);
    shared.control_started.store(false, Ordering::SeqCst);
    shared.set_state(DeviceState::Stopped);
    info!(device = %shared.name(), "supervisor stopped");
}
