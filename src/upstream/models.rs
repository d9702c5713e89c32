//! Normalized projections of aggregator responses.

use serde::{Deserialize, Serialize};

/// A search hit, reduced to what the matchers score on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCandidate {
    /// Track id within `source`
    pub id: String,
    pub title: String,
    /// Artists in the order the source lists them
    pub artists: Vec<String>,
    pub album: String,
    /// Picture reference used by the `pic` endpoint
    pub pic_id: Option<String>,
    /// Lyric reference used by the `lyric` endpoint (defaults to `id`)
    pub lyric_id: Option<String>,
    pub source: String,
}

impl MatchCandidate {
    /// Artists joined with a separator suitable for display and substring checks.
    pub fn artist_line(&self) -> String {
        self.artists.join(" / ")
    }

    /// Convert into the metadata carried by downloads and library records.
    pub fn to_metadata(&self) -> TrackMetadata {
        TrackMetadata {
            title: self.title.clone(),
            artist: self.artist_line(),
            album: self.album.clone(),
            source: self.source.clone(),
            source_track_id: self.id.clone(),
            pic_id: self.pic_id.clone(),
        }
    }
}

/// Track metadata as it flows into the download manager and the track store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub source: String,
    pub source_track_id: String,
    pub pic_id: Option<String>,
}

/// A resolved, directly fetchable audio URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTrackUrl {
    pub url: String,
    /// Bitrate reported by the upstream, in kbps
    pub bitrate: Option<u32>,
    /// Size in bytes reported by the upstream
    pub size: Option<u64>,
}

/// Lyrics text, original and optional translation, both in LRC format when available.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lyrics {
    pub lyric: String,
    pub translated: Option<String>,
}

impl Lyrics {
    pub fn is_empty(&self) -> bool {
        self.lyric.trim().is_empty()
    }
}

/// A remote playlist with its tracks projected to candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub tracks: Vec<MatchCandidate>,
}
