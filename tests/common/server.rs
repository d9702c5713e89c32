//! Mock aggregator and CDN
//!
//! Serves the signed form endpoints plus static files on a random port.
//! Responses are registered per (endpoint, types, source, subject) and every hit is counted.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Default)]
struct MockState {
    responses: Mutex<HashMap<String, (u16, String)>>,
    hits: Mutex<HashMap<String, usize>>,
    forms: Mutex<Vec<HashMap<String, String>>>,
    files: Mutex<HashMap<String, (u16, String, Vec<u8>)>>,
    lyrics: Mutex<HashMap<String, String>>,
}

const API: &str = "api";
const DOWNLOAD: &str = "download";

fn key(endpoint: &str, types: &str, source: &str, subject: &str) -> String {
    format!("{}|{}|{}|{}", endpoint, types, source, subject)
}

/// Mock upstream instance. Shuts down when dropped.
pub struct MockUpstream {
    pub base_url: String,
    state: Arc<MockState>,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/api.php", post(api_handler))
            .route("/download.php", post(download_handler))
            .route("/files/{name}", get(file_handler))
            .route("/lrclib/get", get(lrclib_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock upstream");
        let addr: SocketAddr = listener.local_addr().expect("Failed to get local address");
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Mock upstream failed");
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            _shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn api_url(&self) -> String {
        format!("{}/api.php", self.base_url)
    }

    pub fn download_url(&self) -> String {
        format!("{}/download.php", self.base_url)
    }

    pub fn file_url(&self, name: &str) -> String {
        format!("{}/files/{}", self.base_url, name)
    }

    /// Register the reply for a request. Unregistered requests get `200 []`.
    pub fn respond(&self, types: &str, source: &str, subject: &str, status: u16, body: impl Into<String>) {
        self.state
            .responses
            .lock()
            .unwrap()
            .insert(key(API, types, source, subject), (status, body.into()));
    }

    /// Same as [`respond`](Self::respond) for the download endpoint.
    pub fn respond_download(
        &self,
        types: &str,
        source: &str,
        subject: &str,
        status: u16,
        body: impl Into<String>,
    ) {
        self.state
            .responses
            .lock()
            .unwrap()
            .insert(key(DOWNLOAD, types, source, subject), (status, body.into()));
    }

    pub fn serve_file(&self, name: &str, content_type: &str, bytes: &[u8]) {
        self.state.files.lock().unwrap().insert(
            name.to_string(),
            (200, content_type.to_string(), bytes.to_vec()),
        );
    }

    /// Answer requests for `name` with a bare status code.
    pub fn refuse_file(&self, name: &str, status: u16) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(name.to_string(), (status, "text/plain".to_string(), Vec::new()));
    }

    pub fn lrclib_url(&self) -> String {
        format!("{}/lrclib", self.base_url)
    }

    /// Register an LRCLIB record. Unknown lookups get 404.
    pub fn serve_lrclib(&self, title: &str, artist: &str, synced: &str) {
        let body = serde_json::json!({ "syncedLyrics": synced, "plainLyrics": null }).to_string();
        self.state
            .lyrics
            .lock()
            .unwrap()
            .insert(format!("{}|{}", title, artist), body);
    }

    pub fn hits(&self, types: &str, source: &str, subject: &str) -> usize {
        self.count(&key(API, types, source, subject))
    }

    pub fn download_hits(&self, types: &str, source: &str, subject: &str) -> usize {
        self.count(&key(DOWNLOAD, types, source, subject))
    }

    fn count(&self, key: &str) -> usize {
        self.state.hits.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Every form received by either endpoint, in arrival order.
    pub fn forms(&self) -> Vec<HashMap<String, String>> {
        self.state.forms.lock().unwrap().clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn api_handler(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    reply(&state, API, form)
}

async fn download_handler(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    reply(&state, DOWNLOAD, form)
}

fn reply(state: &MockState, endpoint: &str, form: HashMap<String, String>) -> Response {
    let types = form.get("types").cloned().unwrap_or_default();
    let source = form.get("source").cloned().unwrap_or_default();
    let subject = form
        .get("name")
        .or_else(|| form.get("id"))
        .cloned()
        .unwrap_or_default();
    let key = key(endpoint, &types, &source, &subject);

    *state.hits.lock().unwrap().entry(key.clone()).or_insert(0) += 1;
    state.forms.lock().unwrap().push(form);

    let (status, body) = state
        .responses
        .lock()
        .unwrap()
        .get(&key)
        .cloned()
        .unwrap_or((200, "[]".to_string()));
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, body).into_response()
}

async fn file_handler(State(state): State<Arc<MockState>>, Path(name): Path<String>) -> Response {
    match state.files.lock().unwrap().get(&name).cloned() {
        Some((status, content_type, bytes)) => Response::builder()
            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(bytes))
            .unwrap(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn lrclib_handler(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let title = params.get("track_name").cloned().unwrap_or_default();
    let artist = params.get("artist_name").cloned().unwrap_or_default();
    match state.lyrics.lock().unwrap().get(&format!("{}|{}", title, artist)).cloned() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
