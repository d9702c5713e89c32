//! Signed, rate limited client for the aggregator endpoint.
//!
//! Every attempt consumes a limiter slot, reads the server clock, signs the
//! subject and attaches the session cookie before posting the form. Only
//! transient failures are retried, each retry with a fresh signature.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{COOKIE, REFERER, USER_AGENT};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::cookie::SessionCookieProvider;
use super::error::{UpstreamError, UpstreamResult};
use super::lrclib::LrcLibClient;
use super::models::{Lyrics, MatchCandidate, Playlist, ResolvedTrackUrl};
use super::payload::UpstreamPayload;
use super::rate_limiter::RateLimiter;
use super::signature::{ServerClock, SignatureEngine};

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Markers of an edge challenge page served instead of the API response.
const CHALLENGE_MARKERS: &[&str] = &["Just a moment", "cf-chl", "challenge-platform", "cf_chl_opt"];

/// The `types` parameter of the aggregator API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Search,
    Url,
    Pic,
    Lyric,
    Playlist,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Search => "search",
            RequestType::Url => "url",
            RequestType::Pic => "pic",
            RequestType::Lyric => "lyric",
            RequestType::Playlist => "playlist",
        }
    }

    /// Searches are keyed by `name`, everything else by `id`.
    fn subject_param(&self) -> &'static str {
        match self {
            RequestType::Search => "name",
            _ => "id",
        }
    }
}

/// One logical request. The signature and timestamp are added per attempt.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub kind: RequestType,
    pub source: String,
    /// Keyword for searches, id otherwise. This is what gets signed.
    pub subject: String,
    pub count: Option<usize>,
    pub pages: Option<u32>,
    pub bitrate: Option<u32>,
    pub size: Option<u32>,
}

impl UpstreamRequest {
    pub fn new(kind: RequestType, source: &str, subject: &str) -> Self {
        Self {
            kind,
            source: source.to_string(),
            subject: subject.to_string(),
            count: None,
            pages: None,
            bitrate: None,
            size: None,
        }
    }

    fn form(&self, signature: String, timestamp_ms: u64) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("types", self.kind.as_str().to_string()),
            ("source", self.source.clone()),
            (self.kind.subject_param(), self.subject.clone()),
        ];
        if let Some(count) = self.count {
            form.push(("count", count.to_string()));
        }
        if let Some(pages) = self.pages {
            form.push(("pages", pages.to_string()));
        }
        if let Some(bitrate) = self.bitrate {
            form.push(("br", bitrate.to_string()));
        }
        if let Some(size) = self.size {
            form.push(("size", size.to_string()));
        }
        form.push(("s", signature));
        form.push(("_", timestamp_ms.to_string()));
        form
    }
}

/// The catalog operations the matchers, downloader and reconciler rely on.
#[async_trait]
pub trait MusicCatalog: Send + Sync {
    async fn search(
        &self,
        query: &str,
        source: &str,
        count: usize,
    ) -> UpstreamResult<Vec<MatchCandidate>>;

    async fn resolve_track_url(
        &self,
        id: &str,
        source: &str,
        bitrate: u32,
    ) -> UpstreamResult<ResolvedTrackUrl>;

    /// Returns the cover URL, or `None` when the source has no picture.
    async fn resolve_cover(
        &self,
        pic_id: &str,
        source: &str,
        size: u32,
    ) -> UpstreamResult<Option<String>>;

    /// Lyrics as served by the source itself.
    async fn lyrics_from_source(&self, id: &str, source: &str) -> UpstreamResult<Option<Lyrics>>;

    /// Lyrics from a service outside the aggregator.
    async fn external_lyrics(
        &self,
        _title: &str,
        _artist: &str,
        _album: &str,
    ) -> UpstreamResult<Option<String>> {
        Ok(None)
    }

    async fn fetch_playlist(&self, id: &str, source: &str) -> UpstreamResult<Playlist>;

    /// Source lyrics first, then the external lookup.
    ///
    /// An error from the source is only surfaced when the external lookup
    /// finds nothing either.
    async fn resolve_lyrics(
        &self,
        id: &str,
        source: &str,
        title: &str,
        artist: &str,
        album: &str,
    ) -> UpstreamResult<Option<Lyrics>> {
        let source_error = match self.lyrics_from_source(id, source).await {
            Ok(Some(lyrics)) if !lyrics.is_empty() => return Ok(Some(lyrics)),
            Ok(_) => None,
            Err(e) => {
                warn!("Lyrics lookup on {} failed for {}: {}", source, id, e);
                Some(e)
            }
        };

        match self.external_lyrics(title, artist, album).await {
            Ok(Some(text)) => Ok(Some(Lyrics {
                lyric: text,
                translated: None,
            })),
            Ok(None) => match source_error {
                Some(e) => Err(e),
                None => Ok(None),
            },
            Err(e) => Err(source_error.unwrap_or(e)),
        }
    }
}

/// Connection settings for [`UpstreamClient`].
#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub api_url: String,
    /// Bitrate-parameterized endpoint tried first for non-primary sources
    pub download_url: Option<String>,
    pub primary_source: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub signature_host: String,
    pub signature_version: String,
    pub server_time_url: Option<String>,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            api_url: "https://music-api.gdstudio.xyz/api.php".to_string(),
            download_url: None,
            primary_source: "netease".to_string(),
            timeout: Duration::from_secs(15),
            max_attempts: 3,
            retry_delay: Duration::from_millis(1000),
            signature_host: "music.gdstudio.xyz".to_string(),
            signature_version: "2025.11.4".to_string(),
            server_time_url: None,
        }
    }
}

/// HTTP client for the aggregator API.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    config: UpstreamClientConfig,
    rate_limiter: Arc<RateLimiter>,
    clock: Arc<ServerClock>,
    signer: SignatureEngine,
    cookies: Arc<SessionCookieProvider>,
    lrclib: Option<Arc<LrcLibClient>>,
}

impl UpstreamClient {
    pub fn new(
        config: UpstreamClientConfig,
        rate_limiter: Arc<RateLimiter>,
        cookies: Arc<SessionCookieProvider>,
    ) -> UpstreamResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(UpstreamError::from_reqwest)?;

        let clock = ServerClock::new(client.clone(), config.server_time_url.clone());
        let signer = SignatureEngine::new(config.signature_host.clone(), &config.signature_version);
        info!(
            "Upstream client for {} (session cookies {})",
            config.api_url,
            if cookies.is_enabled() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            client,
            config: UpstreamClientConfig {
                max_attempts: config.max_attempts.max(1),
                ..config
            },
            rate_limiter,
            clock: Arc::new(clock),
            signer,
            cookies,
            lrclib: None,
        })
    }

    /// Attach the external lyrics service used when a source has no lyrics.
    pub fn with_lrclib(mut self, lrclib: LrcLibClient) -> Self {
        self.lrclib = Some(Arc::new(lrclib));
        self
    }

    pub fn primary_source(&self) -> &str {
        &self.config.primary_source
    }

    /// Issue a request against the aggregator endpoint with bounded retries.
    pub async fn request(&self, request: &UpstreamRequest) -> UpstreamResult<UpstreamPayload> {
        self.request_at(&self.config.api_url, request).await
    }

    async fn request_at(
        &self,
        endpoint: &str,
        request: &UpstreamRequest,
    ) -> UpstreamResult<UpstreamPayload> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(endpoint, request).await {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let window = self.rate_limiter.stats().await;
                    warn!(
                        "{} request for {} failed (attempt {}/{}, {}/{} calls in window): {}",
                        request.kind.as_str(),
                        request.subject,
                        attempt,
                        self.config.max_attempts,
                        window.admitted_in_window,
                        window.limit,
                        e
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    if matches!(e, UpstreamError::Blocked(_)) {
                        warn!("Upstream blocked the request, dropping session cookie");
                        self.cookies.invalidate();
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(
        &self,
        endpoint: &str,
        request: &UpstreamRequest,
    ) -> UpstreamResult<UpstreamPayload> {
        self.rate_limiter.consume().await;

        let timestamp_ms = self.clock.now_ms().await;
        let signature = self.signer.sign(&request.subject, timestamp_ms);
        let cookie = self.cookies.cookie_header().await?;

        debug!(
            "POST {} types={} source={} subject={}",
            endpoint,
            request.kind.as_str(),
            request.source,
            request.subject
        );

        let mut builder = self
            .client
            .post(endpoint)
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .header(REFERER, format!("https://{}/", self.config.signature_host))
            .form(&request.form(signature, timestamp_ms));
        if !cookie.is_empty() {
            builder = builder.header(COOKIE, cookie);
        }

        let response = builder.send().await.map_err(UpstreamError::from_reqwest)?;
        let status = response.status();
        let body = response.text().await.map_err(UpstreamError::from_reqwest)?;

        if is_challenge_page(&body) {
            return Err(UpstreamError::Blocked("edge challenge page".to_string()));
        }
        if !status.is_success() {
            let preview: String = body.chars().take(120).collect();
            return Err(UpstreamError::from_status(status.as_u16(), preview));
        }

        UpstreamPayload::parse(&body)
    }

    async fn resolve_via_download_endpoint(
        &self,
        endpoint: &str,
        request: &UpstreamRequest,
    ) -> Option<ResolvedTrackUrl> {
        match self.request_at(endpoint, request).await {
            Ok(payload) => resolved_url_from(&payload),
            Err(e) => {
                debug!("Download endpoint failed for {}: {}", request.subject, e);
                None
            }
        }
    }
}

#[async_trait]
impl MusicCatalog for UpstreamClient {
    async fn search(
        &self,
        query: &str,
        source: &str,
        count: usize,
    ) -> UpstreamResult<Vec<MatchCandidate>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = UpstreamRequest::new(RequestType::Search, source, query);
        request.count = Some(count);
        request.pages = Some(1);

        let payload = self.request(&request).await?;
        let candidates: Vec<MatchCandidate> = payload
            .entries()
            .iter()
            .filter_map(|entry| candidate_from_value(entry, source))
            .take(count)
            .collect();

        debug!("Search {:?} on {} returned {} hits", query, source, candidates.len());
        Ok(candidates)
    }

    async fn resolve_track_url(
        &self,
        id: &str,
        source: &str,
        bitrate: u32,
    ) -> UpstreamResult<ResolvedTrackUrl> {
        let mut request = UpstreamRequest::new(RequestType::Url, source, id);
        request.bitrate = Some(bitrate);

        if source != self.config.primary_source {
            if let Some(endpoint) = &self.config.download_url {
                if let Some(resolved) = self.resolve_via_download_endpoint(endpoint, &request).await {
                    return Ok(resolved);
                }
                info!("Download endpoint had no URL for {}:{}, using resolver", source, id);
            }
        }

        let payload = self.request(&request).await?;
        resolved_url_from(&payload)
            .ok_or_else(|| UpstreamError::NotFound(format!("no audio URL for {}:{}", source, id)))
    }

    async fn resolve_cover(
        &self,
        pic_id: &str,
        source: &str,
        size: u32,
    ) -> UpstreamResult<Option<String>> {
        if pic_id.trim().is_empty() {
            return Ok(None);
        }
        let mut request = UpstreamRequest::new(RequestType::Pic, source, pic_id);
        request.size = Some(size);
        let payload = self.request(&request).await?;
        Ok(payload.first_url())
    }

    async fn lyrics_from_source(&self, id: &str, source: &str) -> UpstreamResult<Option<Lyrics>> {
        if id.trim().is_empty() {
            return Ok(None);
        }
        let request = UpstreamRequest::new(RequestType::Lyric, source, id);
        let payload = self.request(&request).await?;

        let lyrics = Lyrics {
            lyric: payload.first_text_field("lyric").unwrap_or_default(),
            translated: payload.first_text_field("tlyric"),
        };
        Ok((!lyrics.is_empty()).then_some(lyrics))
    }

    async fn external_lyrics(
        &self,
        title: &str,
        artist: &str,
        album: &str,
    ) -> UpstreamResult<Option<String>> {
        match &self.lrclib {
            Some(lrclib) => lrclib.get_lyrics(title, artist, album).await,
            None => Ok(None),
        }
    }

    async fn fetch_playlist(&self, id: &str, source: &str) -> UpstreamResult<Playlist> {
        let request = UpstreamRequest::new(RequestType::Playlist, source, id);
        let payload = self.request(&request).await?;
        let value = payload.to_value();

        let tracks: Vec<MatchCandidate> = find_track_array(&value)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| candidate_from_value(item, source))
                    .collect()
            })
            .unwrap_or_default();

        if tracks.is_empty() {
            return Err(UpstreamError::NotFound(format!("playlist {} has no tracks", id)));
        }

        Ok(Playlist {
            id: id.to_string(),
            name: playlist_name(&value).unwrap_or_else(|| format!("Playlist {}", id)),
            tracks,
        })
    }
}

fn is_challenge_page(body: &str) -> bool {
    let head: String = body.chars().take(4096).collect();
    CHALLENGE_MARKERS.iter().any(|marker| head.contains(marker))
}

fn resolved_url_from(payload: &UpstreamPayload) -> Option<ResolvedTrackUrl> {
    let url = payload.first_url()?;
    let value = payload.to_value();
    let field = |key: &str| find_number(&value, key);
    Some(ResolvedTrackUrl {
        url,
        bitrate: field("br").map(|br| br as u32),
        size: field("size"),
    })
}

/// Numbers arrive as JSON numbers or numeric strings.
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.max(0.0) as u64),
        _ => None,
    }
}

fn find_number(value: &Value, key: &str) -> Option<u64> {
    match value {
        Value::Object(map) => map
            .get(key)
            .and_then(as_u64)
            .or_else(|| map.values().find_map(|v| find_number(v, key))),
        Value::Array(items) => items.iter().find_map(|v| find_number(v, key)),
        _ => None,
    }
}

/// An id can be a string or a number.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn name_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Object(map) => map.get("name").and_then(Value::as_str).map(|s| s.trim().to_string()),
        _ => None,
    }
}

/// Artists come as `"a / b"`, `["a", "b"]` or `[{"name": "a"}, ..]`.
fn artists_of(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(name_of)
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Object(_) => name_of(value).into_iter().filter(|s| !s.is_empty()).collect(),
        _ => Vec::new(),
    }
}

/// Project a search or playlist entry onto a [`MatchCandidate`].
pub(crate) fn candidate_from_value(value: &Value, default_source: &str) -> Option<MatchCandidate> {
    let map = value.as_object()?;
    let id = map.get("id").and_then(id_string)?;
    let title = map
        .get("name")
        .or_else(|| map.get("title"))
        .and_then(Value::as_str)?
        .trim()
        .to_string();
    if title.is_empty() {
        return None;
    }

    let artists = map
        .get("artist")
        .or_else(|| map.get("ar"))
        .or_else(|| map.get("artists"))
        .map(artists_of)
        .unwrap_or_default();
    let album_value = map.get("album").or_else(|| map.get("al"));
    let album = album_value.and_then(name_of).unwrap_or_default();

    let pic_id = map
        .get("pic_id")
        .and_then(id_string)
        .or_else(|| album_value.and_then(|a| a.get("pic_str").or_else(|| a.get("pic"))).and_then(id_string));
    let lyric_id = map
        .get("lyric_id")
        .and_then(id_string)
        .or_else(|| Some(id.clone()));
    let source = map
        .get("source")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(default_source)
        .to_string();

    Some(MatchCandidate {
        id,
        title,
        artists,
        album,
        pic_id,
        lyric_id,
        source,
    })
}

fn is_track_like(value: &Value) -> bool {
    value.get("id").is_some_and(|id| id_string(id).is_some())
        && (value.get("name").is_some_and(Value::is_string)
            || value.get("title").is_some_and(Value::is_string))
}

/// Depth-first search for the first non-empty array of track-like objects.
fn find_track_array(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items) if !items.is_empty() && items.iter().all(is_track_like) => Some(items),
        Value::Array(items) => items.iter().find_map(find_track_array),
        Value::Object(map) => {
            // Conventional keys first so a nested "creator" array does not win.
            for key in ["tracks", "songs", "list", "data"] {
                if let Some(found) = map.get(key).and_then(find_track_array) {
                    return Some(found);
                }
            }
            map.values().find_map(find_track_array)
        }
        _ => None,
    }
}

fn playlist_name(value: &Value) -> Option<String> {
    let candidates = [
        value.pointer("/playlist/name"),
        value.pointer("/data/playlist/name"),
        value.pointer("/data/name"),
        value.pointer("/name"),
    ];
    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_form_uses_name_for_search_and_id_otherwise() {
        let mut search = UpstreamRequest::new(RequestType::Search, "netease", "hello");
        search.count = Some(20);
        let form = search.form("ABCDEF12".to_string(), 1_760_000_000_123);
        assert!(form.contains(&("types", "search".to_string())));
        assert!(form.contains(&("name", "hello".to_string())));
        assert!(form.contains(&("count", "20".to_string())));
        assert!(form.contains(&("s", "ABCDEF12".to_string())));
        assert!(form.contains(&("_", "1760000000123".to_string())));

        let url = UpstreamRequest::new(RequestType::Url, "kuwo", "42");
        let form = url.form(String::new(), 0);
        assert!(form.contains(&("id", "42".to_string())));
        assert!(!form.iter().any(|(k, _)| *k == "name"));
    }

    #[test]
    fn test_candidate_from_aggregator_shape() {
        let entry = json!({
            "id": 1974443814,
            "name": "Song",
            "artist": ["Artist", "Guest"],
            "album": "Album",
            "pic_id": "109951168",
            "lyric_id": 1974443814,
            "source": "netease"
        });
        let candidate = candidate_from_value(&entry, "kuwo").unwrap();
        assert_eq!(candidate.id, "1974443814");
        assert_eq!(candidate.artists, vec!["Artist", "Guest"]);
        assert_eq!(candidate.artist_line(), "Artist / Guest");
        assert_eq!(candidate.album, "Album");
        assert_eq!(candidate.pic_id.as_deref(), Some("109951168"));
        assert_eq!(candidate.source, "netease");
    }

    #[test]
    fn test_candidate_from_nested_shape() {
        let entry = json!({
            "id": "7",
            "title": "Other",
            "ar": [{"name": "A"}, {"name": "B"}],
            "al": {"name": "LP", "pic_str": "555"}
        });
        let candidate = candidate_from_value(&entry, "joox").unwrap();
        assert_eq!(candidate.artists, vec!["A", "B"]);
        assert_eq!(candidate.album, "LP");
        assert_eq!(candidate.pic_id.as_deref(), Some("555"));
        assert_eq!(candidate.lyric_id.as_deref(), Some("7"));
        assert_eq!(candidate.source, "joox");
    }

    #[test]
    fn test_candidate_requires_id_and_title() {
        assert!(candidate_from_value(&json!({"name": "x"}), "s").is_none());
        assert!(candidate_from_value(&json!({"id": 1, "name": "  "}), "s").is_none());
        assert!(candidate_from_value(&json!("x"), "s").is_none());
    }

    #[test]
    fn test_challenge_detection() {
        assert!(is_challenge_page(
            "<!DOCTYPE html><title>Just a moment...</title>"
        ));
        assert!(!is_challenge_page(r#"jQuery1({"url":"https://a"})"#));
    }

    #[test]
    fn test_resolved_url_reads_bitrate_and_size() {
        let payload = UpstreamPayload::from(json!({"url": "https://cdn/a.mp3", "br": 320, "size": "1024"}));
        let resolved = resolved_url_from(&payload).unwrap();
        assert_eq!(resolved.url, "https://cdn/a.mp3");
        assert_eq!(resolved.bitrate, Some(320));
        assert_eq!(resolved.size, Some(1024));
    }

    #[test]
    fn test_find_track_array_and_name() {
        let value = json!({
            "playlist": {
                "name": "Road Trip",
                "creator": [{"id": 9, "nickname": "me"}],
                "tracks": [
                    {"id": 1, "name": "One", "ar": [{"name": "A"}]},
                    {"id": 2, "name": "Two", "ar": [{"name": "B"}]}
                ]
            }
        });
        assert_eq!(find_track_array(&value).map(Vec::len), Some(2));
        assert_eq!(playlist_name(&value).as_deref(), Some("Road Trip"));
    }
}
