//! Headless Chromium cookie source driven over the DevTools protocol.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::cookie::{CookieError, CookieSource};

const DEVTOOLS_BANNER: &str = "DevTools listening on ";

/// Settings for the browser session that harvests cookies.
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    /// Chromium/Chrome executable
    pub executable: String,
    /// Extra launch arguments (e.g. `--no-sandbox`)
    pub launch_args: Vec<String>,
    /// Page that triggers the bot-check
    pub portal_url: String,
    /// Optional second page on the API origin to warm its cookies
    pub warmup_url: Option<String>,
    /// Delay after navigation so challenge scripts can finish
    pub settle_delay: Duration,
    /// Upper bound on browser startup and each protocol call
    pub step_timeout: Duration,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            executable: "chromium".to_string(),
            launch_args: vec!["--no-sandbox".to_string(), "--disable-gpu".to_string()],
            portal_url: "https://music.gdstudio.xyz/".to_string(),
            warmup_url: None,
            settle_delay: Duration::from_secs(5),
            step_timeout: Duration::from_secs(30),
        }
    }
}

/// Kills the browser process however the session ends.
struct BrowserGuard {
    child: Option<Child>,
}

impl BrowserGuard {
    async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to stop browser process: {}", e);
            }
        }
    }
}

impl Drop for BrowserGuard {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Cookie source that launches a fresh headless browser per refresh.
pub struct ChromiumCookieSource {
    settings: BrowserSettings,
}

impl ChromiumCookieSource {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }

    async fn launch(&self) -> Result<(BrowserGuard, String), CookieError> {
        let mut command = Command::new(&self.settings.executable);
        command
            .arg("--headless=new")
            .arg("--remote-debugging-port=0")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .args(&self.settings.launch_args)
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| CookieError::Launch(format!("{}: {}", self.settings.executable, e)))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CookieError::Launch("browser stderr not captured".to_string()))?;
        let guard = BrowserGuard { child: Some(child) };

        let mut lines = BufReader::new(stderr).lines();
        let ws_url = tokio::time::timeout(self.settings.step_timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(url) = line.split(DEVTOOLS_BANNER).nth(1) {
                    return Some(url.trim().to_string());
                }
            }
            None
        })
        .await
        .map_err(|_| CookieError::Launch("timed out waiting for DevTools endpoint".to_string()))?
        .ok_or_else(|| CookieError::Launch("browser exited before DevTools was ready".to_string()))?;

        debug!("Browser DevTools endpoint: {}", ws_url);
        Ok((guard, ws_url))
    }

    async fn collect_cookies(&self, ws_url: &str) -> Result<String, CookieError> {
        let mut session = DevToolsSession::connect(ws_url, self.settings.step_timeout).await?;

        session
            .call("Target.createTarget", json!({ "url": self.settings.portal_url }))
            .await?;
        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        if let Some(warmup) = &self.settings.warmup_url {
            session
                .call("Target.createTarget", json!({ "url": warmup }))
                .await?;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let result = session.call("Storage.getCookies", json!({})).await?;
        let header = cookie_header_from(&result);
        if header.is_empty() {
            return Err(CookieError::Empty(self.settings.portal_url.clone()));
        }
        Ok(header)
    }
}

#[async_trait]
impl CookieSource for ChromiumCookieSource {
    async fn acquire(&self) -> Result<String, CookieError> {
        info!("Opening browser session at {}", self.settings.portal_url);
        let (mut guard, ws_url) = self.launch().await?;
        let result = self.collect_cookies(&ws_url).await;
        guard.shutdown().await;

        if let Ok(header) = &result {
            info!("Collected {} session cookies", header.split("; ").count());
        }
        result
    }
}

/// Minimal request/response client for the browser-level DevTools target.
struct DevToolsSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    timeout: Duration,
}

impl DevToolsSession {
    async fn connect(ws_url: &str, timeout: Duration) -> Result<Self, CookieError> {
        let (stream, _) = tokio::time::timeout(timeout, connect_async(ws_url))
            .await
            .map_err(|_| CookieError::Session("DevTools connection timed out".to_string()))?
            .map_err(|e| CookieError::Session(format!("DevTools connection failed: {}", e)))?;
        Ok(Self {
            stream,
            next_id: 0,
            timeout,
        })
    }

    async fn call(&mut self, method: &str, params: Value) -> Result<Value, CookieError> {
        self.next_id += 1;
        let id = self.next_id;
        let request = json!({ "id": id, "method": method, "params": params });

        self.stream
            .send(Message::Text(request.to_string().into()))
            .await
            .map_err(|e| CookieError::Session(format!("{} send failed: {}", method, e)))?;

        let timeout = self.timeout;
        let response = tokio::time::timeout(timeout, async {
            while let Some(message) = self.stream.next().await {
                let message = message
                    .map_err(|e| CookieError::Session(format!("{} failed: {}", method, e)))?;
                let Message::Text(text) = message else {
                    continue;
                };
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                // Events carry no id; only our reply matters.
                if value.get("id").and_then(Value::as_u64) == Some(id) {
                    return Ok::<Value, CookieError>(value);
                }
            }
            Err(CookieError::Session(format!("{}: connection closed", method)))
        })
        .await
        .map_err(|_| CookieError::Session(format!("{} timed out", method)))??;

        if let Some(error) = response.get("error") {
            return Err(CookieError::Session(format!("{}: {}", method, error)));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Join `{"cookies": [{"name", "value"}, ..]}` into a single header value.
fn cookie_header_from(result: &Value) -> String {
    result
        .get("cookies")
        .and_then(Value::as_array)
        .map(|cookies| {
            cookies
                .iter()
                .filter_map(|c| {
                    let name = c.get("name")?.as_str()?;
                    let value = c.get("value")?.as_str()?;
                    (!name.is_empty()).then(|| format!("{}={}", name, value))
                })
                .collect::<Vec<_>>()
                .join("; ")
        })
        .unwrap_or_default()
}
