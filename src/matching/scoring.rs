//! Candidate scoring for the two reconciliation plans.
//!
//! Plan A trusts embedded tags and grades agreement on a 0-2 scale. Plan B
//! only has a filename and grades substring overlap against it.

use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;

use crate::upstream::MatchCandidate;

lazy_static! {
    static ref BRACKETED: Regex = Regex::new(r"\[[^\]]*\]|【[^】]*】").unwrap();
    static ref TRACK_NUMBER: Regex = Regex::new(r"^\d{1,3}\s*[-._)]\s*").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

// =============================================================================
// Normalization
// =============================================================================

/// Lowercase, drop punctuation and collapse whitespace.
///
/// Letters and digits of every script are kept, so CJK titles compare as-is.
pub fn normalize(text: &str) -> String {
    let mapped: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase();
    WHITESPACE.replace_all(mapped.trim(), " ").into_owned()
}

fn artist_matches(candidate: &MatchCandidate, artist: &str) -> bool {
    let artist = normalize(artist);
    if artist.is_empty() {
        return false;
    }
    normalize(&candidate.artist_line()).contains(&artist)
}

// =============================================================================
// Plan A
// =============================================================================

/// Lowest score, on either plan, at which the candidate is the same song
/// rather than just the same artist. Lyrics are only taken from such matches.
pub const SAME_SONG_SCORE: u32 = 2;

/// Plan A confidence: 2 for title and artist agreement, 1 for artist only, else 0.
pub fn plan_a_score(candidate: &MatchCandidate, title: &str, artist: &str) -> u32 {
    if !artist_matches(candidate, artist) {
        return 0;
    }
    let title = normalize(title);
    if !title.is_empty() && normalize(&candidate.title) == title {
        2
    } else {
        1
    }
}

/// The highest Plan A scorer. Ties keep the earlier candidate.
pub fn best_plan_a<'a>(
    candidates: impl IntoIterator<Item = &'a MatchCandidate>,
    title: &str,
    artist: &str,
) -> Option<(&'a MatchCandidate, u32)> {
    best_by(candidates, |c| plan_a_score(c, title, artist))
}

// =============================================================================
// Plan B
// =============================================================================

/// A search query derived from a file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameQuery {
    /// Normalized text sent to the search endpoint
    pub query: String,
    /// The part after `Artist - `, or the whole name
    pub title_hint: String,
    /// The part before ` - `, when present
    pub artist_hint: Option<String>,
}

impl FilenameQuery {
    pub fn from_path(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?;
        Self::from_stem(stem)
    }

    /// Strip bracketed tags and track numbers, then split `Artist - Title`.
    pub fn from_stem(stem: &str) -> Option<Self> {
        let cleaned = stem.replace('_', " ");
        let cleaned = BRACKETED.replace_all(&cleaned, " ");
        let cleaned = TRACK_NUMBER.replace(cleaned.trim(), "");

        let (artist_hint, title_part) = match cleaned.split_once(" - ") {
            Some((artist, title)) if !normalize(artist).is_empty() && !normalize(title).is_empty() => {
                (Some(normalize(artist)), title.to_string())
            }
            _ => (None, cleaned.to_string()),
        };

        let title_hint = normalize(&title_part);
        if title_hint.is_empty() {
            return None;
        }
        let query = match &artist_hint {
            Some(artist) => format!("{} {}", artist, title_hint),
            None => title_hint.clone(),
        };

        Some(Self {
            query,
            title_hint,
            artist_hint,
        })
    }
}

/// Plan B score: 5 exact title, 3 query contains title, 2 title contains
/// query, plus 1 when the query also names the artist.
///
/// A candidate titled like the whole file name (`Artist - Song` uploads)
/// counts as an exact title too.
pub fn plan_b_score(candidate: &MatchCandidate, query: &FilenameQuery) -> u32 {
    let title = normalize(&candidate.title);
    if title.is_empty() {
        return 0;
    }

    let mut score = if title == query.title_hint || title == query.query {
        5
    } else if query.title_hint.contains(&title) {
        3
    } else if title.contains(&query.title_hint) {
        2
    } else {
        0
    };

    let artist_named = candidate.artists.iter().any(|artist| {
        let artist = normalize(artist);
        !artist.is_empty() && query.query.contains(&artist)
    });
    if artist_named {
        score += 1;
    }
    score
}

/// The top Plan B scorer, when it reaches `floor`.
pub fn best_plan_b<'a>(
    candidates: impl IntoIterator<Item = &'a MatchCandidate>,
    query: &FilenameQuery,
    floor: u32,
) -> Option<(&'a MatchCandidate, u32)> {
    best_by(candidates, |c| plan_b_score(c, query)).filter(|(_, score)| *score >= floor)
}

fn best_by<'a>(
    candidates: impl IntoIterator<Item = &'a MatchCandidate>,
    score: impl Fn(&MatchCandidate) -> u32,
) -> Option<(&'a MatchCandidate, u32)> {
    let mut best: Option<(&MatchCandidate, u32)> = None;
    for candidate in candidates {
        let s = score(candidate);
        if best.map_or(true, |(_, top)| s > top) {
            best = Some((candidate, s));
        }
    }
    best
}
