//! End-to-end scenarios across subsystems: a full run through the
//! application shell, scripted scans, remote control and shutdown
//! draining.

use hdf5::types::VarLenUnicode;
use labdaq::config::{DeviceConfig, ParamValue};
use labdaq::device::{Device, DeviceMap};
use labdaq::driver::DriverRegistry;
use labdaq::sequencer::{flatten, load_tree, Sequencer};
use labdaq::signals::{Signal, SignalBus};
use labdaq::{App, ProgramConfig};
use ndarray::s;
use serial_test::serial;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn write_settings(dir: &Path) -> std::path::PathBuf {
    let text = format!(
        r#"
[general]
run_name = "scenario"
hdf_loop_delay = 0.05
monitoring_dt = 1.0

[files]
config_dir = "{dir}/devices"
hdf_dir = "{dir}"
hdf_fname = "data.hdf"

[networking]
enabled = false
port_control = 38721
port_readout = 38722
name = "rig1"
key_dir = "{dir}/auth"

[influxdb]
enabled = false
host = "http://localhost"
port = 8086

[run_attributes]
operator = "integration"
"#,
        dir = dir.display()
    );
    let path = dir.join("settings.toml");
    std::fs::write(&path, text).unwrap();
    path
}

fn write_device_file(dir: &Path, name: &str, driver: &str, response: &str, dt: &str) {
    let devices = dir.join("devices");
    std::fs::create_dir_all(&devices).unwrap();
    let text = format!(
        r#"
[device]
name = "{name}"
driver = "{driver}"
path = "readout"
correct_response = "{response}"
slow_data = true
dtype = "f8"

[attributes]
column_names = "t, value"
units = "s, V"

[control_params.enabled]
type = "tristate"
value = 2

[control_params.dt]
type = "line"
value = "{dt}"
"#
    );
    std::fs::write(devices.join(format!("{name}.toml")), text).unwrap();
}

fn live_device(name: &str) -> Device {
    let mut cfg = DeviceConfig::bare(name, "mock_slow", true);
    cfg.correct_response = "mock_slow".into();
    cfg.path = "readout".into();
    cfg.attributes
        .insert("column_names".into(), "t, value".into());
    let reg = DriverRegistry::with_builtin();
    let mut dev = Device::new(cfg, reg.factory("mock_slow").unwrap());
    dev.shared
        .config
        .write()
        .change_param("enabled", ParamValue::Level(2));
    dev.start(labdaq::util::now_secs()).unwrap();
    for _ in 0..100 {
        if dev.shared.control_started.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
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

/// A healthy polled device fills its dataset with ordered rows while a
/// failing one leaves its datasets empty, warns, and keeps the NaN
/// counter untouched.
#[test]
#[serial]
fn full_run_through_the_app_shell() {
    let dir = tempfile::tempdir().unwrap();
    let settings = write_settings(dir.path());
    write_device_file(dir.path(), "thermo", "mock_slow", "mock_slow", "0.1");
    write_device_file(dir.path(), "ghost", "mock_failing", "", "0.1");

    let config = ProgramConfig::load(&settings).unwrap();
    let mut app = App::new(config);
    assert_eq!(app.load_devices().unwrap(), 2);
    app.start_control().unwrap();
    std::thread::sleep(Duration::from_millis(1200));

    let warned = app
        .bus
        .drain()
        .iter()
        .any(|s| matches!(s, Signal::Warning { device: Some(d), .. } if d == "ghost"));

    let ghost_nans = app
        .devices
        .read()
        .get("ghost")
        .unwrap()
        .shared
        .nan_count
        .load(Ordering::SeqCst);
    app.stop_control();

    let file = hdf5::File::open(dir.path().join("data.hdf")).unwrap();
    let run_name = file.member_names().unwrap().pop().unwrap();
    let run = file.group(&run_name).unwrap();

    let thermo = run.group("readout/thermo").unwrap();
    let t = thermo.dataset("t").unwrap().read_1d::<f64>().unwrap();
    assert!(t.len() >= 5, "only {} rows after 1.2 s", t.len());
    assert!(t.windows(2).into_iter().all(|w| w[0] < w[1]), "t not strictly increasing");

    // the failing device wrote nothing and raised no NaN counts
    let ghost = run.group("readout/ghost").unwrap();
    assert_eq!(ghost.dataset("t").unwrap().shape(), vec![0]);
    assert_eq!(
        run.group("readout").unwrap().dataset("ghost_events").unwrap().shape(),
        vec![0, 3]
    );
    assert_eq!(ghost_nans, 0);
    assert!(warned, "no warning surfaced for the failing device");

    // run attributes landed on the run group
    let operator = run
        .attr("operator")
        .unwrap()
        .read_scalar::<VarLenUnicode>()
        .unwrap();
    assert_eq!(operator.as_str(), "integration");
    assert!(run.attr("time_offset").unwrap().read_scalar::<f64>().unwrap() > 0.0);
}

/// A waited linspace scan leaves the scanned returns in the device's
/// event log, in order.
#[test]
#[serial]
fn scripted_scan_records_ordered_returns() {
    let dir = tempfile::tempdir().unwrap();
    let sequence = dir.path().join("scan.json");
    let mut f = std::fs::File::create(&sequence).unwrap();
    write!(
        f,
        r#"[{{
            "device": "devA",
            "function": "SetV",
            "parameters": "linspace(0, 10, 3)",
            "dt": 0.05,
            "wait": true
        }}]"#
    )
    .unwrap();

    let dev = live_device("devA");
    let shared = Arc::clone(&dev.shared);
    let devices = map_of(vec![dev]);

    let tree = load_tree(&sequence).unwrap();
    let known = devices.read().keys().cloned().collect();
    let (steps, warnings) = flatten(&tree, &known).unwrap();
    assert!(warnings.is_empty());
    assert_eq!(steps.len(), 3);

    let mut seq =
        Sequencer::start(steps, Arc::clone(&devices), SignalBus::new(), 1, false).unwrap();
    seq.join();

    let results: Vec<(String, String)> = shared
        .events_rx
        .try_iter()
        .map(|e| (e.command, e.result))
        .collect();
    assert_eq!(
        results,
        vec![
            ("SetV(0.0)".to_string(), "1.0".to_string()),
            ("SetV(5.0)".to_string(), "6.0".to_string()),
            ("SetV(10.0)".to_string(), "11.0".to_string()),
        ]
    );
    devices.write().get_mut("devA").unwrap().stop();
}

/// `ReadValue()` over the wire answers with the current row for an
/// enabled slow device and is refused once the device drops to
/// command-only enablement.
#[test]
#[serial]
fn remote_read_value_honours_enablement() {
    use labdaq::net::{digest_hex, Networking};
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream;

    let keys = tempfile::tempdir().unwrap();
    std::fs::write(keys.path().join("ops.key"), "sesame").unwrap();
    let settings = labdaq::config::NetworkingSettings {
        enabled: true,
        port_control: 38723,
        port_readout: 38724,
        workers: 2,
        allowed: "ops".into(),
        name: "rig1".into(),
        key_dir: keys.path().to_path_buf(),
    };

    let dev = live_device("devX");
    let devices = map_of(vec![dev]);
    let mut net = Networking::start(settings, Arc::clone(&devices)).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let stream = TcpStream::connect(("127.0.0.1", 38723)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut conn = BufReader::new(stream);
    let mut line = String::new();
    conn.read_line(&mut line).unwrap();
    let challenge: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    let nonce = challenge["challenge"].as_str().unwrap();
    let auth = serde_json::json!({ "name": "ops", "digest": digest_hex(nonce, "sesame") });
    conn.get_mut()
        .write_all(format!("{auth}\n").as_bytes())
        .unwrap();
    line.clear();
    conn.read_line(&mut line).unwrap();
    assert!(line.contains("OK"));

    let mut request = |device: &str, command: &str| -> (String, serde_json::Value) {
        let req = serde_json::to_string(&(device, command)).unwrap();
        conn.get_mut()
            .write_all(format!("{req}\n").as_bytes())
            .unwrap();
        let mut reply = String::new();
        conn.read_line(&mut reply).unwrap();
        serde_json::from_str(reply.trim()).unwrap()
    };

    let (status, payload) = request("devX", "ReadValue()");
    assert_eq!(status, "OK");
    let row = payload.as_array().unwrap();
    assert_eq!(row.len(), 2);

    devices
        .read()
        .get("devX")
        .unwrap()
        .shared
        .config
        .write()
        .change_param("enabled", ParamValue::Level(1));
    let (status, reason) = request("devX", "ReadValue()");
    assert_eq!(status, "ERROR");
    assert_eq!(reason.as_str().unwrap(), "device not enabled");

    net.stop();
    for (_, mut dev) in std::mem::take(&mut *devices.write()) {
        dev.stop();
    }
}

/// Rows queued at shutdown still reach the file, and the supervisor has
/// joined by the time `stop_control` returns.
#[test]
#[serial]
fn stop_control_drains_queued_rows() {
    let dir = tempfile::tempdir().unwrap();
    let settings = write_settings(dir.path());
    write_device_file(dir.path(), "thermo", "mock_slow", "mock_slow", "0.1");

    let config = ProgramConfig::load(&settings).unwrap();
    let mut app = App::new(config);
    app.load_devices().unwrap();
    // command-eligible but not polled, so only our rows land in the file
    app.devices
        .read()
        .get("thermo")
        .unwrap()
        .shared
        .config
        .write()
        .change_param("enabled", ParamValue::Level(1));
    app.start_control().unwrap();

    {
        let devices = app.devices.read();
        let shared = &devices.get("thermo").unwrap().shared;
        for _ in 0..50 {
            if shared.control_started.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        for i in 0..500 {
            shared
                .data_tx
                .send(Arc::new(labdaq::driver::Reading::Slow(vec![
                    labdaq::driver::Value::Float(i as f64),
                    labdaq::driver::Value::Float(i as f64 * 2.0),
                ])))
                .unwrap();
        }
    }
    app.stop_control();
    assert!(!app.devices.read().get("thermo").unwrap().is_running());

    let file = hdf5::File::open(dir.path().join("data.hdf")).unwrap();
    let run_name = file.member_names().unwrap().pop().unwrap();
    let grp = file
        .group(&run_name)
        .unwrap()
        .group("readout/thermo")
        .unwrap();
    let t = grp.dataset("t").unwrap().read_1d::<f64>().unwrap();
    assert_eq!(t.len(), 500);
    assert_eq!(t[0], 0.0);
    assert_eq!(t[499], 499.0);
    let v = grp
        .dataset("value")
        .unwrap()
        .read_slice_1d::<f64, _>(s![498..500])
        .unwrap();
    assert_eq!(v.to_vec(), vec![996.0, 998.0]);
}

/// Typed slow columns survive the write/read cycle bit-exactly.
#[test]
#[serial]
fn typed_columns_round_trip() {
    use labdaq::driver::{Reading, Value};
    use labdaq::writer::HdfWriter;

    let dir = tempfile::tempdir().unwrap();
    let settings = write_settings(dir.path());
    std::fs::create_dir_all(dir.path().join("devices")).unwrap();
    let config = {
        let mut c = ProgramConfig::load(&settings).unwrap();
        c.time_offset = labdaq::util::now_secs();
        c
    };

    let mut cfg = DeviceConfig::bare("logger", "mock_slow", true);
    cfg.path = "readout".into();
    cfg.attributes
        .insert("column_names".into(), "t, count, ok, note".into());
    cfg.dtype = labdaq::config::DtypeSpec::PerColumn(vec![
        labdaq::config::Dtype::Float,
        labdaq::config::Dtype::Int,
        labdaq::config::Dtype::Bool,
        labdaq::config::Dtype::Str,
    ]);
    let reg = DriverRegistry::with_builtin();
    let dev = Device::new(cfg, reg.factory("mock_slow").unwrap());
    dev.shared
        .config
        .write()
        .change_param("enabled", ParamValue::Level(2));
    dev.shared.control_started.store(true, Ordering::SeqCst);
    dev.shared
        .data_tx
        .send(Arc::new(Reading::Slow(vec![
            Value::Float(0.125),
            Value::Int(-7),
            Value::Bool(true),
            Value::Str("calibration".into()),
        ])))
        .unwrap();
    let devices = map_of(vec![dev]);

    let mut writer = HdfWriter::start(&config, Arc::clone(&devices)).unwrap();
    std::thread::sleep(Duration::from_millis(150));
    let run_group = writer.run_group().to_string();
    writer.stop();

    let file = hdf5::File::open(dir.path().join("data.hdf")).unwrap();
    let grp = file
        .group(&run_group)
        .unwrap()
        .group("readout/logger")
        .unwrap();
    assert_eq!(grp.dataset("t").unwrap().read_1d::<f64>().unwrap()[0], 0.125);
    assert_eq!(grp.dataset("count").unwrap().read_1d::<i64>().unwrap()[0], -7);
    assert!(grp.dataset("ok").unwrap().read_1d::<bool>().unwrap()[0]);
    assert_eq!(
        grp.dataset("note")
            .unwrap()
            .read_1d::<VarLenUnicode>()
            .unwrap()[0]
            .as_str(),
        "calibration"
    );
}
