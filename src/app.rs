//! Application shell.
//!
//! `App` owns the configuration, the device map and every background
//! component. `start_control` and `stop_control` bracket one run; the
//! sequencer can be started and stopped independently while a run is
//! going.

use crate::config::{DeviceConfig, ProgramConfig};
use crate::device::{Device, DeviceMap, MapPeers};
use crate::driver::DriverRegistry;
use crate::error::{AppResult, DaqError};
use crate::monitor::influx::{InfluxSink, Tsdb};
use crate::monitor::{Monitor, MonitorHandles};
use crate::net::Networking;
use crate::sequencer::{flatten, load_tree, Sequencer};
use crate::signals::SignalBus;
use crate::util::now_secs;
use crate::writer::HdfWriter;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct App {
    pub config: ProgramConfig,
    pub devices: DeviceMap,
    pub bus: SignalBus,
    pub registry: DriverRegistry,
    writer: Option<HdfWriter>,
    monitor: Option<Monitor>,
    networking: Option<Networking>,
    sequencer: Option<Sequencer>,
}

impl App {
    pub fn new(config: ProgramConfig) -> Self {
        Self {
            config,
            devices: Arc::new(RwLock::new(BTreeMap::new())),
            bus: SignalBus::new(),
            registry: DriverRegistry::with_builtin(),
            writer: None,
            monitor: None,
            networking: None,
            sequencer: None,
        }
    }

    /// Load every device file in `files.config_dir`. A malformed file is
    /// logged and skipped; the remaining devices still load.
    pub fn load_devices(&mut self) -> AppResult<usize> {
        let dir = &self.config.files.config_dir;
        let entries = std::fs::read_dir(dir).map_err(|e| {
            DaqError::Config(format!("cannot read device dir {}: {e}", dir.display()))
        })?;
        let peers = MapPeers::new(&self.devices);
        let mut loaded = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let config = match DeviceConfig::from_file(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(file = %path.display(), "skipping device file: {e}");
                    continue;
                }
            };
            let factory = self.registry.factory(&config.driver)?;
            let name = config.name.clone();
            let mut device = Device::new(config, factory);
            device.set_peers(peers.clone());
            self.devices.write().insert(name, device);
            loaded += 1;
        }
        info!(loaded, dir = %dir.display(), "device files loaded");
        Ok(loaded)
    }

    fn enabled_names(&self) -> Vec<String> {
        self.devices
            .read()
            .iter()
            .filter(|(_, d)| d.shared.enabled() >= 1)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Probe and start everything. Every enabled device is probed even
    /// after a failure so the operator sees all problems at once; any
    /// failure aborts the start with the offending devices named.
    pub fn start_control(&mut self) -> AppResult<()> {
        if self.config.control_active {
            return Err(DaqError::Config("control already active".into()));
        }
        self.config.time_offset = now_secs();
        let time_offset = self.config.time_offset;

        let enabled = self.enabled_names();
        let mut failures = Vec::new();
        {
            let devices = self.devices.read();
            for name in &enabled {
                if let Some(device) = devices.get(name) {
                    if let Err(e) = device.probe(time_offset) {
                        warn!("{e}");
                        failures.push(e.to_string());
                    }
                }
            }
        }
        if !failures.is_empty() {
            return Err(DaqError::Verification {
                device: format!("{} device(s)", failures.len()),
                message: failures.join("; "),
            });
        }

        {
            let mut devices = self.devices.write();
            for name in &enabled {
                if let Some(device) = devices.get_mut(name) {
                    device.start(time_offset)?;
                }
            }
        }

        let writer = HdfWriter::start(&self.config, Arc::clone(&self.devices))?;
        let tsdb: Option<Arc<dyn Tsdb>> = if self.config.influxdb.enabled {
            match InfluxSink::new(&self.config.influxdb) {
                Ok(sink) => Some(Arc::new(sink)),
                Err(e) => {
                    warn!("time-series sink unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };
        let monitor = Monitor::start(MonitorHandles {
            devices: Arc::clone(&self.devices),
            writer: Some(Arc::clone(&writer.shared)),
            locator: Some(writer.locator()),
            tsdb,
            bus: self.bus.clone(),
            run_name: self.config.general.run_name.clone(),
            monitoring_dt: self.config.general.monitoring_dt,
            time_offset,
            hdf_dir: self.config.files.hdf_dir.clone(),
        })?;
        self.writer = Some(writer);
        self.monitor = Some(monitor);

        if self.config.networking.enabled {
            self.networking = Some(Networking::start(
                self.config.networking.clone(),
                Arc::clone(&self.devices),
            )?);
        }

        self.config.control_active = true;
        info!("control started");
        Ok(())
    }

    /// Wind everything down: sequencer and networking first, the monitor
    /// before the devices (so it cannot restart one mid-teardown), the
    /// writer last so its final drain sees everything the supervisors
    /// queued.
    pub fn stop_control(&mut self) {
        if let Some(mut seq) = self.sequencer.take() {
            seq.abort();
        }
        if let Some(mut net) = self.networking.take() {
            net.stop();
        }
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
        {
            let mut devices = self.devices.write();
            for device in devices.values_mut() {
                device.stop();
            }
        }
        if let Some(mut writer) = self.writer.take() {
            writer.stop();
        }
        self.config.control_active = false;
        info!("control stopped");
    }

    /// Flatten the configured sequence file and start executing it.
    pub fn start_sequencer(&mut self, n_repeats: u64, infinite: bool) -> AppResult<()> {
        let path = self
            .config
            .files
            .sequence_fname
            .clone()
            .ok_or_else(|| DaqError::Sequencer("no sequence file configured".into()))?;
        let tree = load_tree(&path)?;
        let known = self.devices.read().keys().cloned().collect();
        let (steps, warnings) = flatten(&tree, &known)?;
        for w in warnings {
            warn!("{w}");
            self.bus.send(crate::signals::Signal::Warning {
                device: None,
                text: w,
            });
        }
        info!(steps = steps.len(), "sequence starting");
        self.sequencer = Some(Sequencer::start(
            steps,
            Arc::clone(&self.devices),
            self.bus.clone(),
            n_repeats,
            infinite,
        )?);
        Ok(())
    }

    pub fn sequencer(&self) -> Option<&Sequencer> {
        self.sequencer.as_ref()
    }

    pub fn abort_sequencer(&mut self) {
        if let Some(mut seq) = self.sequencer.take() {
            seq.abort();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if self.config.control_active {
            self.stop_control();
        }
    }
}
