//! Remote control and readout.
//!
//! One networking thread owns a tokio runtime. Inside it live the
//! authenticated control listener, a fixed pool of worker tasks that
//! dispatch requests into the device mailboxes, and the readout
//! publisher. The wire format is newline-delimited JSON: requests are
//! `[device, command]`, responses `[status, payload]` with status `OK`
//! or `ERROR`.

use crate::config::NetworkingSettings;
use crate::device::{DeviceMap, DeviceShared};
use crate::driver::RetValue;
use crate::error::{AppResult, DaqError};
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// How long a worker waits for the supervisor to answer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const REPLY_POLL: Duration = Duration::from_millis(10);
/// Readout publication scan cadence.
const PUBLISH_TICK: Duration = Duration::from_millis(100);

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn digest_hex(nonce: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(key.as_bytes());
    to_hex(&hasher.finalize())
}

/// Preshared-key verification against the key directory and allow-list.
#[derive(Clone)]
struct Auth {
    key_dir: PathBuf,
    allowed: Vec<String>,
}

impl Auth {
    fn verify(&self, name: &str, nonce: &str, digest: &str) -> bool {
        if !self.allowed.iter().any(|a| a == name) {
            debug!(client = %name, "client not on the allow-list");
            return false;
        }
        let key = match std::fs::read_to_string(self.key_dir.join(format!("{name}.key"))) {
            Ok(k) => k.trim().to_string(),
            Err(e) => {
                debug!(client = %name, "no key on file: {e}");
                return false;
            }
        };
        digest_hex(nonce, &key) == digest
    }
}

#[derive(Deserialize)]
struct HandshakeReply {
    name: String,
    digest: String,
}

struct Request {
    device: String,
    command: String,
    reply: oneshot::Sender<(String, serde_json::Value)>,
}

fn mint_uid() -> u64 {
    let id = uuid::Uuid::new_v4();
    let bytes = id.as_bytes();
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

fn error_response(reason: &str) -> (String, serde_json::Value) {
    ("ERROR".to_string(), json!(reason))
}

/// The ordered dispatch checks, then the mailbox round trip. The refusal
/// strings are part of the wire protocol; clients match them verbatim.
async fn dispatch(devices: &DeviceMap, device: &str, command: &str) -> (String, serde_json::Value) {
    let shared: Arc<DeviceShared> = {
        let map = devices.read();
        match map.get(device) {
            Some(d) => Arc::clone(&d.shared),
            None => return error_response("device not present"),
        }
    };
    if !shared.control_started.load(Ordering::SeqCst) {
        return error_response("device not started");
    }
    if shared.enabled() != 2 {
        return error_response("device not enabled");
    }
    if command.trim() == "ReadValue()" && !shared.slow_data() {
        return error_response("device does not support slow data");
    }

    let uid = mint_uid();
    shared.enqueue_networking(uid, command.to_string());
    let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;
    loop {
        if let Some(ret) = shared.take_reply(uid) {
            let payload = serde_json::to_value(&ret).unwrap_or(serde_json::Value::Null);
            return match ret {
                RetValue::Error(e) => error_response(&e.error),
                _ => ("OK".to_string(), payload),
            };
        }
        if tokio::time::Instant::now() >= deadline {
            return error_response("timed out waiting for the device");
        }
        tokio::time::sleep(REPLY_POLL).await;
    }
}

async fn worker(
    uid: uuid::Uuid,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Request>>>,
    devices: DeviceMap,
) {
    debug!(worker = %uid, "control worker up");
    loop {
        let request = { rx.lock().await.recv().await };
        let Some(request) = request else { break };
        let response = dispatch(&devices, &request.device, &request.command).await;
        let _ = request.reply.send(response);
    }
    debug!(worker = %uid, "control worker down");
}

async fn handshake(stream: &mut BufReader<TcpStream>, auth: &Auth) -> AppResult<String> {
    let mut nonce_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = to_hex(&nonce_bytes);
    let challenge = serde_json::to_string(&json!({ "challenge": nonce }))
        .map_err(|e| DaqError::Net(e.to_string()))?;
    stream
        .get_mut()
        .write_all(format!("{challenge}\n").as_bytes())
        .await?;

    let mut line = String::new();
    stream.read_line(&mut line).await?;
    let reply: HandshakeReply =
        serde_json::from_str(line.trim()).map_err(|e| DaqError::Net(e.to_string()))?;
    if !auth.verify(&reply.name, &nonce, &reply.digest) {
        return Err(DaqError::Net(format!(
            "authentication failed for {:?}",
            reply.name
        )));
    }
    stream
        .get_mut()
        .write_all(b"{\"status\":\"OK\"}\n")
        .await?;
    Ok(reply.name)
}

async fn handle_control(stream: TcpStream, auth: Auth, req_tx: mpsc::Sender<Request>) {
    let mut stream = BufReader::new(stream);
    let client = match handshake(&mut stream, &auth).await {
        Ok(name) => name,
        Err(e) => {
            warn!("{e}");
            return;
        }
    };
    info!(client = %client, "control client connected");

    let mut line = String::new();
    loop {
        line.clear();
        match stream.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let parsed: Result<(String, String), _> = serde_json::from_str(line.trim());
        let response = match parsed {
            Err(e) => error_response(&format!("malformed request: {e}")),
            Ok((device, command)) => {
                let (tx, rx) = oneshot::channel();
                let sent = req_tx
                    .send(Request {
                        device,
                        command,
                        reply: tx,
                    })
                    .await;
                if sent.is_err() {
                    break;
                }
                match rx.await {
                    Ok(r) => r,
                    Err(_) => error_response("worker dropped the request"),
                }
            }
        };
        let Ok(text) = serde_json::to_string(&(response.0, response.1)) else {
            break;
        };
        if stream
            .get_mut()
            .write_all(format!("{text}\n").as_bytes())
            .await
            .is_err()
        {
            break;
        }
    }
    info!(client = %client, "control client disconnected");
}

/// Scan devices for fresh slow samples and broadcast them as
/// `"<instance>-<device> [t+offset, v1, …]"` topic lines.
async fn publisher_loop(
    devices: DeviceMap,
    instance: String,
    pub_tx: broadcast::Sender<String>,
) {
    let mut last_sent: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
    loop {
        tokio::time::sleep(PUBLISH_TICK).await;
        let lines: Vec<String> = {
            let map = devices.read();
            map.iter()
                .filter_map(|(name, device)| {
                    let dev = &device.shared;
                    let config = dev.config.read();
                    if !config.slow_data
                        || config.remote_client
                        || config.enabled() != 2
                        || !dev.control_started.load(Ordering::SeqCst)
                    {
                        return None;
                    }
                    let latest = dev.plots.latest()?;
                    let crate::driver::Reading::Slow(row) = latest.as_ref() else {
                        return None;
                    };
                    let t = row.first()?.as_f64();
                    if last_sent.get(name) == Some(&t) {
                        return None;
                    }
                    last_sent.insert(name.clone(), t);
                    let offset = *dev.time_offset.lock();
                    let mut values: Vec<f64> =
                        row.iter().map(crate::driver::Value::as_f64).collect();
                    if let Some(first) = values.first_mut() {
                        *first += offset;
                    }
                    let payload = serde_json::to_string(&values).ok()?;
                    Some(format!("{instance}-{name} {payload}"))
                })
                .collect()
        };
        for line in lines {
            // no subscribers is fine
            let _ = pub_tx.send(line);
        }
    }
}

async fn serve(
    settings: NetworkingSettings,
    devices: DeviceMap,
    active: Arc<AtomicBool>,
) -> AppResult<()> {
    let auth = Auth {
        key_dir: settings.key_dir.clone(),
        allowed: settings.allowed_clients(),
    };
    let control = TcpListener::bind(("0.0.0.0", settings.port_control)).await?;
    let readout = TcpListener::bind(("0.0.0.0", settings.port_readout)).await?;
    info!(
        control = settings.port_control,
        readout = settings.port_readout,
        "networking listening"
    );

    let (req_tx, req_rx) = mpsc::channel::<Request>(64);
    let req_rx = Arc::new(tokio::sync::Mutex::new(req_rx));
    for _ in 0..settings.workers.max(1) {
        tokio::spawn(worker(
            uuid::Uuid::new_v4(),
            Arc::clone(&req_rx),
            Arc::clone(&devices),
        ));
    }

    let (pub_tx, _) = broadcast::channel::<String>(256);
    tokio::spawn(publisher_loop(
        Arc::clone(&devices),
        settings.name.clone(),
        pub_tx.clone(),
    ));

    let control_auth = auth.clone();
    let control_tx = req_tx.clone();
    tokio::spawn(async move {
        loop {
            match control.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(handle_control(
                        stream,
                        control_auth.clone(),
                        control_tx.clone(),
                    ));
                }
                Err(e) => {
                    warn!("control accept failed: {e}");
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match readout.accept().await {
                Ok((mut stream, _)) => {
                    let mut rx = pub_tx.subscribe();
                    tokio::spawn(async move {
                        while let Ok(line) = rx.recv().await {
                            if stream.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                                break;
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("readout accept failed: {e}");
                    break;
                }
            }
        }
    });

    // returning tears the runtime down with every task on it
    while active.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

/// The networking thread handle.
pub struct Networking {
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Networking {
    pub fn start(settings: NetworkingSettings, devices: DeviceMap) -> AppResult<Self> {
        let active = Arc::new(AtomicBool::new(true));
        let thread_active = Arc::clone(&active);
        let handle = std::thread::Builder::new()
            .name("networking".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!("cannot build networking runtime: {e}");
                        return;
                    }
                };
                if let Err(e) = runtime.block_on(serve(settings, devices, thread_active)) {
                    warn!("networking failed: {e}");
                }
                // dropping the runtime aborts the listeners and workers
                info!("networking stopped");
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
                warn!("networking thread panicked");
            }
        }
    }
}

impl Drop for Networking {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, ParamValue};
    use crate::device::Device;
    use crate::driver::DriverRegistry;
    use crate::util::now_secs;
    use parking_lot::RwLock;
    use serial_test::serial;
    use std::collections::BTreeMap;
    use std::io::{BufRead, BufReader as StdBufReader, Write};
    use std::net::TcpStream as StdTcpStream;

    fn settings(key_dir: &std::path::Path, control: u16, readout: u16) -> NetworkingSettings {
        NetworkingSettings {
            enabled: true,
            port_control: control,
            port_readout: readout,
            workers: 2,
            allowed: "bench_client".into(),
            name: "rig1".into(),
            key_dir: key_dir.to_path_buf(),
        }
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

    fn live_fast_device(name: &str) -> Device {
        let mut cfg = DeviceConfig::bare(name, "mock_fast", false);
        cfg.correct_response = "mock_fast".into();
        cfg.shape = vec![2, 8];
        let reg = DriverRegistry::with_builtin();
        let mut dev = Device::new(cfg, reg.factory("mock_fast").unwrap());
        dev.shared
            .config
            .write()
            .change_param("enabled", ParamValue::Level(2));
        dev.start(now_secs()).unwrap();
        dev
    }

    fn map_of(devices: Vec<Device>) -> DeviceMap {
        Arc::new(RwLock::new(
            devices
                .into_iter()
                .map(|d| (d.shared.name(), d))
                .collect::<BTreeMap<_, _>>(),
        ))
    }

    fn connect_authed(port: u16, key: &str) -> StdBufReader<StdTcpStream> {
        let stream = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reader = StdBufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let challenge: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        let nonce = challenge["challenge"].as_str().unwrap();
        let reply = json!({
            "name": "bench_client",
            "digest": digest_hex(nonce, key),
        });
        reader
            .get_mut()
            .write_all(format!("{reply}\n").as_bytes())
            .unwrap();
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert!(line.contains("OK"), "handshake rejected: {line}");
        reader
    }

    fn roundtrip(reader: &mut StdBufReader<StdTcpStream>, device: &str, command: &str) -> (String, serde_json::Value) {
        let request = serde_json::to_string(&(device, command)).unwrap();
        reader
            .get_mut()
            .write_all(format!("{request}\n").as_bytes())
            .unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    #[test]
    #[serial]
    fn authenticated_control_round_trip() {
        let keys = tempfile::tempdir().unwrap();
        std::fs::write(keys.path().join("bench_client.key"), "sesame\n").unwrap();
        let devices = map_of(vec![live_device("laser"), live_fast_device("scope")]);
        let mut net = Networking::start(settings(keys.path(), 38711, 38712), Arc::clone(&devices)).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let mut conn = connect_authed(38711, "sesame");
        let (status, payload) = roundtrip(&mut conn, "laser", "GetOffset()");
        assert_eq!(status, "OK");
        assert_eq!(payload, json!(0.0));

        let (status, _) = roundtrip(&mut conn, "laser", "SetOffset(2.5)");
        assert_eq!(status, "OK");
        let (status, payload) = roundtrip(&mut conn, "laser", "GetOffset()");
        assert_eq!(status, "OK");
        assert_eq!(payload, json!(2.5));

        // dispatch refusals carry the exact protocol strings
        let (status, reason) = roundtrip(&mut conn, "ghost", "GetOffset()");
        assert_eq!(status, "ERROR");
        assert_eq!(reason, json!("device not present"));
        let (status, reason) = roundtrip(&mut conn, "scope", "ReadValue()");
        assert_eq!(status, "ERROR");
        assert_eq!(reason, json!("device does not support slow data"));
        let (status, _) = roundtrip(&mut conn, "laser", "NoSuchMethod()");
        assert_eq!(status, "ERROR");

        net.stop();
        for (_, mut dev) in std::mem::take(&mut *devices.write()) {
            dev.stop();
        }
    }

    #[test]
    #[serial]
    fn wrong_key_is_dropped_before_dispatch() {
        let keys = tempfile::tempdir().unwrap();
        std::fs::write(keys.path().join("bench_client.key"), "sesame").unwrap();
        let devices = map_of(vec![]);
        let mut net = Networking::start(settings(keys.path(), 38713, 38714), devices).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let stream = StdTcpStream::connect(("127.0.0.1", 38713)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut reader = StdBufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let challenge: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        let nonce = challenge["challenge"].as_str().unwrap();
        let reply = json!({ "name": "bench_client", "digest": digest_hex(nonce, "wrong") });
        reader
            .get_mut()
            .write_all(format!("{reply}\n").as_bytes())
            .unwrap();
        line.clear();
        // connection closes without an OK
        let n = reader.read_line(&mut line).unwrap_or(0);
        assert_eq!(n, 0, "expected a dropped connection, got {line:?}");
        net.stop();
    }

    #[test]
    #[serial]
    fn readout_publishes_fresh_samples_once() {
        let keys = tempfile::tempdir().unwrap();
        let dev = live_device("laser");
        let offset = *dev.shared.time_offset.lock();
        let devices = map_of(vec![dev]);
        let mut net = Networking::start(settings(keys.path(), 38715, 38716), Arc::clone(&devices)).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let stream = StdTcpStream::connect(("127.0.0.1", 38716)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reader = StdBufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let (topic, payload) = line.trim().split_once(' ').unwrap();
        assert_eq!(topic, "rig1-laser");
        let values: Vec<f64> = serde_json::from_str(payload).unwrap();
        assert_eq!(values.len(), 2);
        // timestamps go out as absolute wall-clock seconds
        assert!(values[0] > offset);

        net.stop();
        for (_, mut dev) in std::mem::take(&mut *devices.write()) {
            dev.stop();
        }
    }
}
