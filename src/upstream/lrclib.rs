//! LRCLIB lookup used when the aggregator has no lyrics for a track.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::error::{UpstreamError, UpstreamResult};
use super::rate_limiter::RateLimiter;

pub const LRCLIB_BASE_URL: &str = "https://lrclib.net/api";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LrcLibResponse {
    synced_lyrics: Option<String>,
    plain_lyrics: Option<String>,
}

/// Client for the LRCLIB `get` endpoint.
pub struct LrcLibClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
}

impl LrcLibClient {
    pub fn new(base_url: String, timeout: Duration, rate_limiter: Arc<RateLimiter>) -> UpstreamResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(UpstreamError::from_reqwest)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter,
        })
    }

    /// Fetch lyrics by title, artist and album.
    ///
    /// Synced lyrics are preferred over plain text. Returns `None` on 404.
    pub async fn get_lyrics(
        &self,
        title: &str,
        artist: &str,
        album: &str,
    ) -> UpstreamResult<Option<String>> {
        if title.trim().is_empty() {
            return Ok(None);
        }

        let mut url = format!(
            "{}/get?track_name={}&artist_name={}",
            self.base_url,
            urlencoding::encode(title),
            urlencoding::encode(artist)
        );
        if !album.trim().is_empty() {
            url.push_str(&format!("&album_name={}", urlencoding::encode(album)));
        }

        debug!("Fetching lyrics: {}", url);
        self.rate_limiter.consume().await;

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;

        match response.status() {
            StatusCode::OK => {
                let body: LrcLibResponse = response
                    .json()
                    .await
                    .map_err(|e| UpstreamError::Parse(e.to_string()))?;
                Ok(body
                    .synced_lyrics
                    .filter(|s| !s.trim().is_empty())
                    .or(body.plain_lyrics.filter(|s| !s.trim().is_empty())))
            }
            StatusCode::NOT_FOUND => {
                debug!("Lyrics not found for: {} - {}", artist, title);
                Ok(None)
            }
            status => Err(UpstreamError::from_status(
                status.as_u16(),
                "unexpected LRCLIB status".to_string(),
            )),
        }
    }
}
