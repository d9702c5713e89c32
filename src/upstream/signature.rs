//! Request signing for the aggregator API.
//!
//! The token is the upper-cased last 8 hex digits of
//! `md5("{host}|{packed version}|{first 9 timestamp digits}|{encoded subject}")`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{debug, warn};

/// Number of leading timestamp digits that enter the payload.
const TIMESTAMP_DIGITS: usize = 9;

/// Number of trailing digest characters kept in the token.
const TOKEN_LEN: usize = 8;

/// Computes the `s` parameter expected by the upstream.
#[derive(Debug, Clone)]
pub struct SignatureEngine {
    host: String,
    packed_version: String,
}

impl SignatureEngine {
    /// Create an engine for a fixed host and a dotted client version (e.g. `2025.11.4`).
    pub fn new(host: impl Into<String>, version: &str) -> Self {
        Self {
            host: host.into(),
            packed_version: pack_version(version),
        }
    }

    /// Build the payload that gets digested.
    pub fn payload(&self, subject: &str, timestamp_ms: u64) -> String {
        let ts = timestamp_ms.to_string();
        let ts_prefix: String = ts.chars().take(TIMESTAMP_DIGITS).collect();
        format!(
            "{}|{}|{}|{}",
            self.host,
            self.packed_version,
            ts_prefix,
            encode_uri_component(subject)
        )
    }

    /// Sign a keyword (search) or an id (every other request type).
    pub fn sign(&self, subject: &str, timestamp_ms: u64) -> String {
        let digest = format!("{:x}", md5::compute(self.payload(subject, timestamp_ms)));
        digest[digest.len() - TOKEN_LEN..].to_uppercase()
    }
}

/// Percent-encode like JavaScript's `encodeURIComponent`, which leaves
/// `! ' ( ) *` literal where `urlencoding` escapes them.
pub(crate) fn encode_uri_component(subject: &str) -> String {
    urlencoding::encode(subject)
        .replace("%21", "!")
        .replace("%27", "'")
        .replace("%28", "(")
        .replace("%29", ")")
        .replace("%2A", "*")
}

/// Pack a dotted version into zero-padded two digit groups: `2025.5.29` -> `20250529`.
pub fn pack_version(version: &str) -> String {
    version
        .split('.')
        .map(|part| format!("{:0>2}", part.trim()))
        .collect()
}

/// Best-effort source of the upstream's notion of "now".
///
/// The upstream rejects signatures whose timestamp drifts too far from its
/// own clock, so the time is fetched from a remote endpoint, falling back to
/// the local clock on any failure.
pub struct ServerClock {
    client: Client,
    time_url: Option<String>,
}

impl ServerClock {
    pub fn new(client: Client, time_url: Option<String>) -> Self {
        Self { client, time_url }
    }

    /// A clock that always reads the local time.
    pub fn local() -> Self {
        Self::new(Client::new(), None)
    }

    /// Current time in milliseconds since the Unix epoch.
    pub async fn now_ms(&self) -> u64 {
        let Some(url) = &self.time_url else {
            return local_now_ms();
        };

        match self.fetch_remote(url).await {
            Some(ms) => {
                debug!("Server time endpoint returned {}", ms);
                ms
            }
            None => {
                warn!("Server time lookup failed, using local clock");
                local_now_ms()
            }
        }
    }

    async fn fetch_remote(&self, url: &str) -> Option<u64> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .ok()?;

        let date_header = response
            .headers()
            .get(reqwest::header::DATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.text().await.unwrap_or_default();
        parse_server_time(&body).or_else(|| date_header.as_deref().and_then(parse_http_date))
    }
}

fn local_now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Interpret a server time body: a bare number, or an object with a numeric time field.
pub(crate) fn parse_server_time(body: &str) -> Option<u64> {
    let trimmed = body.trim();
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    let raw = match &value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        serde_json::Value::Object(map) => ["time", "timestamp", "t", "now", "data"]
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(|v| match v {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }),
        _ => None,
    }?;
    normalize_epoch(raw)
}

/// Seconds-resolution epochs are scaled to milliseconds.
fn normalize_epoch(raw: f64) -> Option<u64> {
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    if raw < 1e11 {
        Some((raw * 1000.0) as u64)
    } else {
        Some(raw as u64)
    }
}

fn parse_http_date(value: &str) -> Option<u64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis().max(0) as u64)
}
