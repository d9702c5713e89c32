//! In-memory catalog used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::client::MusicCatalog;
use super::error::{UpstreamError, UpstreamResult};
use super::models::{Lyrics, MatchCandidate, Playlist, ResolvedTrackUrl};

#[derive(Default)]
pub(crate) struct FakeCatalog {
    /// (source, query) -> hits
    pub searches: HashMap<(String, String), Vec<MatchCandidate>>,
    /// (source, pic_id) -> url
    pub covers: HashMap<(String, String), String>,
    /// (source, id) -> lyrics
    pub lyrics: HashMap<(String, String), Lyrics>,
    /// (source, id) -> url
    pub track_urls: HashMap<(String, String), String>,
    pub external_lyrics: Option<String>,
    pub failing_sources: HashSet<String>,
    pub search_log: Mutex<Vec<(String, String)>>,
}

impl FakeCatalog {
    pub fn candidate(id: &str, title: &str, artist: &str, album: &str, source: &str) -> MatchCandidate {
        MatchCandidate {
            id: id.to_string(),
            title: title.to_string(),
            artists: vec![artist.to_string()],
            album: album.to_string(),
            pic_id: Some(format!("pic-{}", id)),
            lyric_id: Some(id.to_string()),
            source: source.to_string(),
        }
    }

    pub fn with_search(mut self, source: &str, query: &str, hits: Vec<MatchCandidate>) -> Self {
        self.searches.insert((source.to_string(), query.to_string()), hits);
        self
    }

    pub fn with_cover(mut self, source: &str, pic_id: &str, url: &str) -> Self {
        self.covers.insert((source.to_string(), pic_id.to_string()), url.to_string());
        self
    }

    pub fn with_lyrics(mut self, source: &str, id: &str, text: &str) -> Self {
        self.lyrics.insert(
            (source.to_string(), id.to_string()),
            Lyrics {
                lyric: text.to_string(),
                translated: None,
            },
        );
        self
    }

    pub fn with_track_url(mut self, source: &str, id: &str, url: &str) -> Self {
        self.track_urls.insert((source.to_string(), id.to_string()), url.to_string());
        self
    }

    pub fn failing(mut self, source: &str) -> Self {
        self.failing_sources.insert(source.to_string());
        self
    }

    pub fn searches_made(&self) -> Vec<(String, String)> {
        self.search_log.lock().unwrap().clone()
    }

    fn check(&self, source: &str) -> UpstreamResult<()> {
        if self.failing_sources.contains(source) {
            return Err(UpstreamError::Transient(format!("{} unavailable", source)));
        }
        Ok(())
    }
}

#[async_trait]
impl MusicCatalog for FakeCatalog {
    async fn search(
        &self,
        query: &str,
        source: &str,
        count: usize,
    ) -> UpstreamResult<Vec<MatchCandidate>> {
        self.search_log
            .lock()
            .unwrap()
            .push((source.to_string(), query.to_string()));
        self.check(source)?;
        Ok(self
            .searches
            .get(&(source.to_string(), query.to_string()))
            .map(|hits| hits.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn resolve_track_url(
        &self,
        id: &str,
        source: &str,
        _bitrate: u32,
    ) -> UpstreamResult<ResolvedTrackUrl> {
        self.check(source)?;
        self.track_urls
            .get(&(source.to_string(), id.to_string()))
            .map(|url| ResolvedTrackUrl {
                url: url.clone(),
                bitrate: None,
                size: None,
            })
            .ok_or_else(|| UpstreamError::NotFound(format!("{}:{}", source, id)))
    }

    async fn resolve_cover(
        &self,
        pic_id: &str,
        source: &str,
        _size: u32,
    ) -> UpstreamResult<Option<String>> {
        self.check(source)?;
        Ok(self.covers.get(&(source.to_string(), pic_id.to_string())).cloned())
    }

    async fn lyrics_from_source(&self, id: &str, source: &str) -> UpstreamResult<Option<Lyrics>> {
        self.check(source)?;
        Ok(self.lyrics.get(&(source.to_string(), id.to_string())).cloned())
    }

    async fn external_lyrics(
        &self,
        _title: &str,
        _artist: &str,
        _album: &str,
    ) -> UpstreamResult<Option<String>> {
        Ok(self.external_lyrics.clone())
    }

    async fn fetch_playlist(&self, id: &str, source: &str) -> UpstreamResult<Playlist> {
        self.check(source)?;
        Err(UpstreamError::NotFound(format!("playlist {}", id)))
    }
}
