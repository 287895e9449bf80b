//! Time-series sink.
//!
//! A thin line-protocol POST to an InfluxDB v2 write endpoint; nothing of
//! the client API beyond that. The trait exists so tests can capture the
//! points instead of needing a server.

use crate::config::InfluxSettings;
use crate::error::{AppResult, DaqError};
use std::time::Duration;

/// Sink for monitoring samples and device warnings.
///
/// Points are keyed by driver: the measurement is the driver name, and
/// the device instance goes into the `name` tag next to `run_name`, so
/// dashboards can overlay every instance of one instrument type.
pub trait Tsdb: Send + Sync {
    /// One point per device sample; `fields` are already NaN-free.
    fn write_sample(
        &self,
        driver: &str,
        device: &str,
        run_name: &str,
        timestamp_ns: i64,
        fields: &[(String, f64)],
    ) -> AppResult<()>;

    fn write_warning(&self, device: &str, run_name: &str, message: &str) -> AppResult<()>;
}

/// Escape measurement names and tag values per line protocol.
fn escape(text: &str) -> String {
    text.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}

fn escape_field_str(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

pub struct InfluxSink {
    client: reqwest::blocking::Client,
    url: String,
    token: String,
}

impl InfluxSink {
    pub fn new(settings: &InfluxSettings) -> AppResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| DaqError::Net(e.to_string()))?;
        Ok(Self {
            client,
            url: format!(
                "{}:{}/api/v2/write?org={}&bucket={}&precision=ns",
                settings.host, settings.port, settings.org, settings.bucket
            ),
            token: settings.token.clone(),
        })
    }

    fn post(&self, body: String) -> AppResult<()> {
        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .map_err(|e| DaqError::Net(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DaqError::Net(format!(
                "time-series write rejected: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

impl Tsdb for InfluxSink {
    fn write_sample(
        &self,
        driver: &str,
        device: &str,
        run_name: &str,
        timestamp_ns: i64,
        fields: &[(String, f64)],
    ) -> AppResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let fields = fields
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), v))
            .collect::<Vec<_>>()
            .join(",");
        self.post(format!(
            "{},run_name={},name={} {} {}",
            escape(driver),
            escape(run_name),
            escape(device),
            fields,
            timestamp_ns
        ))
    }

    fn write_warning(&self, device: &str, run_name: &str, message: &str) -> AppResult<()> {
        self.post(format!(
            "warnings,run_name={},name={} message=\"{}\" {}",
            escape(run_name),
            escape(device),
            escape_field_str(message),
            (crate::util::now_ns() as i64)
        ))
    }
}
