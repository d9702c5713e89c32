//! Cover and lyrics lookup on alternate sources.
//!
//! Sources are walked in order, each with progressively less specific
//! queries. The first adequate candidate whose asset resolves wins; results
//! are never merged across sources.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::upstream::{Lyrics, MatchCandidate, MusicCatalog, TrackMetadata};

use super::scoring::{best_plan_a, SAME_SONG_SCORE};

/// Lyrics must come from the same song.
const LYRICS_MIN_SCORE: u32 = SAME_SONG_SCORE;
/// Any cover by the right artist is acceptable.
const COVER_MIN_SCORE: u32 = 1;

/// An asset found on an alternate source, with the candidate it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackHit<T> {
    pub asset: T,
    pub candidate: MatchCandidate,
    pub score: u32,
}

enum AssetKind {
    Cover,
    Lyrics,
}

pub struct FallbackResolver {
    catalog: Arc<dyn MusicCatalog>,
    sources: Vec<String>,
    search_count: usize,
    cover_size: u32,
}

impl FallbackResolver {
    pub fn new(
        catalog: Arc<dyn MusicCatalog>,
        sources: Vec<String>,
        search_count: usize,
        cover_size: u32,
    ) -> Self {
        Self {
            catalog,
            sources,
            search_count,
            cover_size,
        }
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn cover_size(&self) -> u32 {
        self.cover_size
    }

    /// The target's own cover, falling back to alternate sources.
    pub async fn cover_with_fallback(&self, target: &TrackMetadata) -> Option<String> {
        if let Some(pic_id) = target.pic_id.as_deref().filter(|p| !p.is_empty()) {
            match self
                .catalog
                .resolve_cover(pic_id, &target.source, self.cover_size)
                .await
            {
                Ok(Some(url)) => return Some(url),
                Ok(None) => debug!("{} has no cover for {}", target.source, pic_id),
                Err(e) => warn!("Cover lookup on {} failed: {}", target.source, e),
            }
        }
        self.resolve_cover(target).await.map(|hit| hit.asset)
    }

    /// The target's own lyrics (with the external lookup), falling back to alternate sources.
    pub async fn lyrics_with_fallback(&self, target: &TrackMetadata, lyric_id: &str) -> Option<Lyrics> {
        if !lyric_id.is_empty() && !target.source.is_empty() {
            match self
                .catalog
                .resolve_lyrics(
                    lyric_id,
                    &target.source,
                    &target.title,
                    primary_artist(&target.artist),
                    &target.album,
                )
                .await
            {
                Ok(Some(lyrics)) if !lyrics.is_empty() => return Some(lyrics),
                Ok(_) => debug!("{} has no lyrics for {}", target.source, lyric_id),
                Err(e) => warn!("Lyrics lookup on {} failed: {}", target.source, e),
            }
        }
        self.resolve_lyrics(target).await.map(|hit| hit.asset)
    }

    pub async fn resolve_cover(&self, target: &TrackMetadata) -> Option<FallbackHit<String>> {
        let mut walk = CandidateWalk::new(self, target, AssetKind::Cover);
        while let Some((candidate, score)) = walk.next().await {
            let Some(pic_id) = candidate.pic_id.as_deref() else {
                continue;
            };
            match self
                .catalog
                .resolve_cover(pic_id, &candidate.source, self.cover_size)
                .await
            {
                Ok(Some(url)) => {
                    info!(
                        "Fallback cover for {} - {} found on {}",
                        target.artist, target.title, candidate.source
                    );
                    return Some(FallbackHit {
                        asset: url,
                        candidate,
                        score,
                    });
                }
                Ok(None) => debug!("No cover on {} for {}", candidate.source, candidate.id),
                Err(e) => warn!("Cover lookup on {} failed: {}", candidate.source, e),
            }
        }
        None
    }

    pub async fn resolve_lyrics(&self, target: &TrackMetadata) -> Option<FallbackHit<Lyrics>> {
        let mut walk = CandidateWalk::new(self, target, AssetKind::Lyrics);
        while let Some((candidate, score)) = walk.next().await {
            let lyric_id = candidate.lyric_id.as_deref().unwrap_or(&candidate.id);
            match self
                .catalog
                .lyrics_from_source(lyric_id, &candidate.source)
                .await
            {
                Ok(Some(lyrics)) if !lyrics.is_empty() => {
                    info!(
                        "Fallback lyrics for {} - {} found on {}",
                        target.artist, target.title, candidate.source
                    );
                    return Some(FallbackHit {
                        asset: lyrics,
                        candidate,
                        score,
                    });
                }
                Ok(_) => debug!("No lyrics on {} for {}", candidate.source, candidate.id),
                Err(e) => warn!("Lyrics lookup on {} failed: {}", candidate.source, e),
            }
        }
        None
    }
}

/// Searches (source, query) pairs on demand, yielding the best adequate hit of each.
struct CandidateWalk<'a> {
    resolver: &'a FallbackResolver,
    title: String,
    artist: String,
    pairs: std::vec::IntoIter<(String, String)>,
    min_score: u32,
}

impl<'a> CandidateWalk<'a> {
    fn new(resolver: &'a FallbackResolver, target: &TrackMetadata, kind: AssetKind) -> Self {
        let artist = primary_artist(&target.artist).to_string();
        let queries = fallback_queries(&target.title, &artist, &target.album);
        let pairs: Vec<(String, String)> = resolver
            .sources
            .iter()
            .filter(|source| **source != target.source)
            .flat_map(|source| queries.iter().map(move |q| (source.clone(), q.clone())))
            .collect();
        Self {
            resolver,
            title: target.title.clone(),
            artist,
            pairs: pairs.into_iter(),
            min_score: match kind {
                AssetKind::Cover => COVER_MIN_SCORE,
                AssetKind::Lyrics => LYRICS_MIN_SCORE,
            },
        }
    }

    async fn next(&mut self) -> Option<(MatchCandidate, u32)> {
        for (source, query) in self.pairs.by_ref() {
            let hits = match self
                .resolver
                .catalog
                .search(&query, &source, self.resolver.search_count)
                .await
            {
                Ok(hits) => hits,
                Err(e) => {
                    warn!("Fallback search {:?} on {} failed: {}", query, source, e);
                    continue;
                }
            };
            if let Some((best, score)) = best_plan_a(&hits, &self.title, &self.artist) {
                if score >= self.min_score {
                    return Some((best.clone(), score));
                }
            }
            debug!("No adequate match for {:?} on {}", query, source);
        }
        None
    }
}

/// First artist of a `A / B` artist line.
pub(crate) fn primary_artist(artist: &str) -> &str {
    artist.split('/').next().map(str::trim).unwrap_or("")
}

/// `artist title`, `title`, `artist album`, skipping empty and repeated queries.
pub(crate) fn fallback_queries(title: &str, artist: &str, album: &str) -> Vec<String> {
    let mut queries: Vec<String> = Vec::new();
    let candidates = [
        join_query(&[artist, title]),
        join_query(&[title]),
        join_query(&[artist, album]),
    ];
    for query in candidates {
        if !query.is_empty() && !queries.contains(&query) {
            queries.push(query);
        }
    }
    queries
}

pub(crate) fn join_query(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
