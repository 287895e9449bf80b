//! HDF5 persistence.
//!
//! One writer thread owns the file. Each run gets a top-level group named
//! `<ISO timestamp> <run_name>`; under it every storage-enabled device
//! gets its datasets beneath the group path from its configuration. The
//! file is opened and closed every iteration so external readers see
//! flushed data between ticks.

use crate::config::{Dtype, ProgramConfig};
use crate::device::queues::Event;
use crate::device::{DeviceMap, DeviceShared};
use crate::driver::{Reading, Value};
use crate::error::{AppResult, DaqError};
use crate::util::now_secs;
use hdf5::types::VarLenUnicode;
use hdf5::{Extent, File, Group};
use ndarray::{s, Array1, Array2};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

fn vlu(text: &str) -> VarLenUnicode {
    // interior NULs are the only way the parse can fail
    text.replace('\0', "")
        .parse()
        .expect("Parse VarLenUnicode")
}

/// State shared between the writer thread and the monitor.
pub struct WriterShared {
    pub active: AtomicBool,
    /// Wall-clock stamp taken at the top of every iteration; the monitor
    /// treats a stale value as a hung writer.
    pub time_last_write: Mutex<f64>,
    path: PathBuf,
    run_group: String,
    loop_delay: f64,
    devices: DeviceMap,
}

pub struct HdfWriter {
    pub shared: Arc<WriterShared>,
    handle: Option<JoinHandle<()>>,
}

/// Read-side handle to one run in the file.
#[derive(Debug, Clone)]
pub struct RunLocator {
    pub path: PathBuf,
    pub run_group: String,
}

impl RunLocator {
    /// Latest event row of a device, read back from disk. Returns `None`
    /// when the file is busy or nothing was recorded yet.
    pub fn last_event(&self, device_path: &str, device_name: &str) -> Option<Vec<String>> {
        let file = open_file(&self.path).ok()?;
        let run = file.group(&self.run_group).ok()?;
        let parent = run.group(device_path).ok()?;
        let ds = parent.dataset(&format!("{device_name}_events")).ok()?;
        let n = ds.shape()[0];
        if n == 0 {
            return None;
        }
        let row = ds.read_slice_1d::<VarLenUnicode, _>(s![n - 1, ..]).ok()?;
        Some(row.iter().map(|v| v.to_string()).collect())
    }
}

/// Open the file in append mode, creating it on first use.
fn open_file(path: &Path) -> hdf5::Result<File> {
    if path.exists() {
        File::open_rw(path)
    } else {
        File::create(path)
    }
}

/// Concurrent readers hold the SWMR lock briefly; those opens are
/// retried next tick without noise.
fn is_busy(err: &hdf5::Error) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("lock") || text.contains("temporarily unavailable")
}

/// Walk `path` below `root`, creating the missing segments.
fn ensure_group(root: &Group, path: &str) -> hdf5::Result<Group> {
    let mut group = root.clone();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        group = if group.link_exists(segment) {
            group.group(segment)?
        } else {
            group.create_group(segment)?
        };
    }
    Ok(group)
}

fn write_str_attr(group: &Group, name: &str, value: &str) -> hdf5::Result<()> {
    if group.attr(name).is_ok() {
        group.attr(name)?.write_scalar(&vlu(value))
    } else {
        group
            .new_attr::<VarLenUnicode>()
            .create(name)?
            .write_scalar(&vlu(value))
    }
}

/// Typed cell after coercion to its column dtype.
enum Cell {
    F(f64),
    I(i64),
    B(bool),
    S(String),
}

fn coerce(value: &Value, dtype: Dtype) -> Option<Cell> {
    match dtype {
        Dtype::Float => match value {
            Value::Float(f) => Some(Cell::F(*f)),
            Value::Int(i) => Some(Cell::F(*i as f64)),
            Value::Bool(b) => Some(Cell::F(if *b { 1.0 } else { 0.0 })),
            Value::Str(s) => s.trim().parse().ok().map(Cell::F),
        },
        Dtype::Int => match value {
            Value::Int(i) => Some(Cell::I(*i)),
            Value::Bool(b) => Some(Cell::I(i64::from(*b))),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(Cell::I(*f as i64)),
            Value::Str(s) => s.trim().parse().ok().map(Cell::I),
            _ => None,
        },
        Dtype::Bool => match value {
            Value::Bool(b) => Some(Cell::B(*b)),
            Value::Int(i) => Some(Cell::B(*i != 0)),
            Value::Str(s) => match s.trim() {
                "true" | "True" | "1" => Some(Cell::B(true)),
                "false" | "False" | "0" => Some(Cell::B(false)),
                _ => None,
            },
            _ => None,
        },
        Dtype::Str => Some(Cell::S(value.to_string())),
    }
}

/// Append `rows[..][col]` to the per-column dataset `name` in `group`.
fn append_column(group: &Group, name: &str, dtype: Dtype, cells: &[Cell]) -> hdf5::Result<()> {
    let ds = group.dataset(name)?;
    let n = ds.shape()[0];
    let k = cells.len();
    ds.resize([n + k])?;
    match dtype {
        Dtype::Float => {
            let arr = Array1::from_iter(cells.iter().map(|c| match c {
                Cell::F(v) => *v,
                _ => f64::NAN,
            }));
            ds.write_slice(&arr, s![n..n + k])
        }
        Dtype::Int => {
            let arr = Array1::from_iter(cells.iter().map(|c| match c {
                Cell::I(v) => *v,
                _ => 0,
            }));
            ds.write_slice(&arr, s![n..n + k])
        }
        Dtype::Bool => {
            let arr = Array1::from_iter(cells.iter().map(|c| matches!(c, Cell::B(true))));
            ds.write_slice(&arr, s![n..n + k])
        }
        Dtype::Str => {
            let arr = Array1::from_iter(cells.iter().map(|c| match c {
                Cell::S(v) => vlu(v),
                _ => vlu(""),
            }));
            ds.write_slice(&arr, s![n..n + k])
        }
    }
}

/// Append rows to the `(∞, 3)` events dataset.
fn append_events(group: &Group, name: &str, events: &[Event]) -> hdf5::Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let ds = group.dataset(name)?;
    let n = ds.shape()[0];
    let k = events.len();
    ds.resize([n + k, 3])?;
    let mut cells = Vec::with_capacity(k * 3);
    for e in events {
        cells.push(vlu(&format!("{:?}", e.time)));
        cells.push(vlu(&e.command));
        cells.push(vlu(&e.result));
    }
    let arr = Array2::from_shape_vec((k, 3), cells)
        .map_err(|e| hdf5::Error::Internal(e.to_string()))?;
    ds.write_slice(&arr, s![n..n + k, ..])
}

/// Create a device's datasets below the run group at run start.
fn create_device_layout(run: &Group, shared: &DeviceShared) -> AppResult<()> {
    let config = shared.config.read().clone();
    let parent = ensure_group(run, &config.path)?;

    let grp = if parent.link_exists(&config.name) {
        parent.group(&config.name)?
    } else {
        parent.create_group(&config.name)?
    };
    for (key, value) in &config.attributes {
        write_str_attr(&grp, key, value)?;
    }

    if config.slow_data {
        let columns = config.column_names();
        let dtypes = config.column_dtypes();
        for (col, dtype) in columns.iter().zip(dtypes) {
            if grp.link_exists(col) {
                continue;
            }
            match dtype {
                Dtype::Float => {
                    grp.new_dataset::<f64>()
                        .shape([Extent::from(0..)])
                        .create(col.as_str())?;
                }
                Dtype::Int => {
                    grp.new_dataset::<i64>()
                        .shape([Extent::from(0..)])
                        .create(col.as_str())?;
                }
                Dtype::Bool => {
                    grp.new_dataset::<bool>()
                        .shape([Extent::from(0..)])
                        .create(col.as_str())?;
                }
                Dtype::Str => {
                    grp.new_dataset::<VarLenUnicode>()
                        .shape([Extent::from(0..)])
                        .create(col.as_str())?;
                }
            }
        }
    }

    let events_name = format!("{}_events", config.name);
    if !parent.link_exists(&events_name) {
        parent
            .new_dataset::<VarLenUnicode>()
            .shape([Extent::from(0..), Extent::from(3)])
            .create(events_name.as_str())?;
    }
    Ok(())
}

/// Drain one device's queues into the file.
fn flush_device(run: &Group, shared: &DeviceShared) -> AppResult<()> {
    let config = shared.config.read().clone();
    let parent = ensure_group(run, &config.path)?;
    let grp = parent.group(&config.name)?;

    let discovered: Vec<(String, String)> = std::mem::take(&mut *shared.new_attributes.lock());
    for (key, value) in discovered {
        write_str_attr(&grp, &key, &value)?;
    }

    let events: Vec<Event> = shared.events_rx.try_iter().collect();
    append_events(&parent, &format!("{}_events", config.name), &events)?;

    let readings: Vec<Arc<Reading>> = shared.data_rx.try_iter().collect();
    if readings.is_empty() {
        return Ok(());
    }

    if config.slow_data {
        let columns = config.column_names();
        let dtypes = config.column_dtypes();
        let mut rows: Vec<Vec<Cell>> = Vec::with_capacity(readings.len());
        for reading in &readings {
            let Reading::Slow(row) = reading.as_ref() else {
                warn!(device = %config.name, "non-row payload on a slow data queue, skipped");
                continue;
            };
            if row.len() != columns.len() {
                warn!(
                    device = %config.name,
                    got = row.len(),
                    want = columns.len(),
                    "malformed row skipped"
                );
                continue;
            }
            let coerced: Option<Vec<Cell>> = row
                .iter()
                .zip(dtypes.iter())
                .map(|(v, d)| coerce(v, *d))
                .collect();
            match coerced {
                Some(cells) => rows.push(cells),
                None => warn!(device = %config.name, "uncoercible row skipped"),
            }
        }
        if !rows.is_empty() {
            for (i, (col, dtype)) in columns.iter().zip(dtypes.iter()).enumerate() {
                let cells: Vec<Cell> = rows
                    .iter_mut()
                    .map(|row| std::mem::replace(&mut row[i], Cell::F(f64::NAN)))
                    .collect();
                append_column(&grp, col, *dtype, &cells)?;
            }
        }
    } else {
        for reading in &readings {
            match reading.as_ref() {
                Reading::Fast(record) => {
                    for waveform in &record.records {
                        let index = grp.len();
                        let name = format!("{}_{}", config.name, index);
                        let view = waveform.data.t();
                        let transposed = view.as_standard_layout();
                        let ds = grp
                            .new_dataset_builder()
                            .with_data(transposed.view())
                            .create(name.as_str())?;
                        for (key, value) in &waveform.attrs {
                            if ds.attr(key).is_err() {
                                ds.new_attr::<VarLenUnicode>()
                                    .create(key.as_str())?
                                    .write_scalar(&vlu(value))?;
                            }
                        }
                    }
                }
                // NaN sentinel entries carry no payload
                Reading::Scalar(v) if v.is_nan() => {}
                other => {
                    warn!(device = %config.name, ?other, "unexpected payload on a fast data queue");
                }
            }
        }
    }
    Ok(())
}

fn flush_all(shared: &WriterShared) {
    let file = match open_file(&shared.path) {
        Ok(f) => f,
        Err(e) => {
            if is_busy(&e) {
                debug!("HDF file busy, retrying next iteration");
            } else {
                warn!("cannot open HDF file: {e}");
            }
            return;
        }
    };
    let run = match file.group(&shared.run_group) {
        Ok(g) => g,
        Err(e) => {
            warn!("run group missing: {e}");
            return;
        }
    };
    let devices = shared.devices.read();
    for device in devices.values() {
        let dev = &device.shared;
        if !dev.hdf_enabled() {
            continue;
        }
        // a stopped supervisor can still leave a backlog for the final drain
        let started = dev.control_started.load(Ordering::SeqCst);
        if !started && dev.data_queue_len() == 0 && dev.events_rx.is_empty() {
            continue;
        }
        if let Err(e) = flush_device(&run, dev) {
            // data stays queued and is retried next iteration
            warn!(device = %dev.name(), "flush failed: {e}");
        }
    }
}

fn writer_loop(shared: Arc<WriterShared>) {
    let delay = Duration::from_secs_f64(shared.loop_delay);
    while shared.active.load(Ordering::SeqCst) {
        *shared.time_last_write.lock() = now_secs();
        flush_all(&shared);
        std::thread::sleep(delay);
    }
    // one final drain so nothing queued at shutdown is lost
    *shared.time_last_write.lock() = now_secs();
    flush_all(&shared);
    info!("HDF writer stopped");
}

fn sanitise_delay(delay: f64) -> f64 {
    if !delay.is_finite() || delay <= 0.0 {
        0.1
    } else {
        delay.max(0.002)
    }
}

impl HdfWriter {
    /// Create the run group and every enabled device's layout, then start
    /// the writer thread.
    pub fn start(config: &ProgramConfig, devices: DeviceMap) -> AppResult<Self> {
        let path = config.files.hdf_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let run_group = format!(
            "{} {}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
            config.general.run_name
        );

        {
            let file = open_file(&path).map_err(DaqError::Hdf5)?;
            let run = file.create_group(&run_group)?;
            run.new_attr::<f64>()
                .create("time_offset")?
                .write_scalar(&config.time_offset)?;
            for (key, value) in &config.run_attributes {
                write_str_attr(&run, key, value)?;
            }
            let map = devices.read();
            for device in map.values() {
                let dev = &device.shared;
                if dev.enabled() >= 1 && dev.hdf_enabled() {
                    create_device_layout(&run, dev)?;
                }
            }
        }
        info!(group = %run_group, file = %path.display(), "run group created");

        let shared = Arc::new(WriterShared {
            active: AtomicBool::new(true),
            time_last_write: Mutex::new(now_secs()),
            path,
            run_group,
            loop_delay: sanitise_delay(config.general.hdf_loop_delay),
            devices,
        });
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("hdf-writer".into())
            .spawn(move || writer_loop(thread_shared))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn run_group(&self) -> &str {
        &self.shared.run_group
    }

    /// Handle for reading the current run back, independent of the
    /// writer's lifetime.
    pub fn locator(&self) -> RunLocator {
        RunLocator {
            path: self.shared.path.clone(),
            run_group: self.shared.run_group.clone(),
        }
    }

    /// Stop the thread; the loop does a final drain before returning.
    pub fn stop(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("writer thread panicked");
            }
        }
    }
}

impl Drop for HdfWriter {
    fn drop(&mut self) {
        self.stop();
    }
}
