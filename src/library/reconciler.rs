//! Matches files in a local library against the remote catalog.
//!
//! Messy files (at the library root) are matched from their tags (Plan A)
//! or, failing that, from their file name (Plan B), and may be moved into
//! `artist/album/title.ext`. Organized files only get missing sidecars
//! backfilled and are never moved.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use thiserror::Error;
use tracing::{info, warn};

use crate::download_manager::{existing_cover, fetch_cover, lyrics_sidecar, track_path};
use crate::matching::{
    best_plan_a, best_plan_b, join_query, FallbackResolver, FilenameQuery, SAME_SONG_SCORE,
};
use crate::upstream::{MatchCandidate, MusicCatalog, TrackMetadata};

use super::scanner::{scan_library, FileKind};
use super::store::TrackStore;
use super::tags::{read_tags_blocking, TrackTags};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("a library scan is already running")]
    AlreadyScanning,

    #[error("library root does not exist: {0:?}")]
    MissingRoot(PathBuf),

    #[error("library scan failed: {0}")]
    Scan(String),
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub library_root: PathBuf,
    pub primary_source: String,
    pub secondary_source: String,
    /// Whether matched messy files may be moved
    pub allow_reorganize: bool,
    /// Plan A confidence required before moving
    pub plan_a_min_confidence: u32,
    /// Plan B score required to accept a match at all
    pub plan_b_floor: u32,
    /// Plan B score required before moving
    pub plan_b_relocate_threshold: u32,
    /// Plan B keeps this many hits from each source
    pub candidates_per_source: usize,
    pub search_count: usize,
    pub max_log_lines: usize,
}

impl ReconcilerConfig {
    pub fn new(library_root: PathBuf) -> Self {
        Self {
            library_root,
            primary_source: "netease".to_string(),
            secondary_source: "kuwo".to_string(),
            allow_reorganize: false,
            plan_a_min_confidence: 2,
            plan_b_floor: 2,
            plan_b_relocate_threshold: 4,
            candidates_per_source: 5,
            search_count: 20,
            max_log_lines: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPlan {
    /// Driven by embedded tags, scored 0-2
    A,
    /// Driven by the file name, scored by substring overlap
    B,
}

/// Reconciliation result for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportDecision {
    pub candidate: Option<MatchCandidate>,
    pub plan: MatchPlan,
    pub score: u32,
    pub relocate: bool,
}

/// What happened to one scanned file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Imported {
        decision: ImportDecision,
        final_path: PathBuf,
        lyrics_path: Option<PathBuf>,
        cover_path: Option<PathBuf>,
    },
    Backfilled {
        candidate: MatchCandidate,
        lyrics_path: Option<PathBuf>,
        cover_path: Option<PathBuf>,
    },
    /// Organized file that already has both sidecars
    Skipped,
    NoMatch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub files_seen: usize,
    pub imported: usize,
    pub relocated: usize,
    pub backfilled: usize,
    pub skipped: usize,
    pub unmatched: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStatus {
    pub is_scanning: bool,
    /// Oldest first
    pub logs: Vec<String>,
}

struct Sidecars {
    lyrics_path: Option<PathBuf>,
    cover_path: Option<PathBuf>,
}

/// Clears the scanning flag however the scan ends.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct LibraryReconciler {
    catalog: Arc<dyn MusicCatalog>,
    fallback: Arc<FallbackResolver>,
    store: Arc<dyn TrackStore>,
    http: Client,
    config: ReconcilerConfig,
    scanning: AtomicBool,
    logs: Mutex<VecDeque<String>>,
}

impl LibraryReconciler {
    pub fn new(
        catalog: Arc<dyn MusicCatalog>,
        fallback: Arc<FallbackResolver>,
        store: Arc<dyn TrackStore>,
        config: ReconcilerConfig,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build cover HTTP client")?;
        Ok(Self {
            catalog,
            fallback,
            store,
            http,
            config,
            scanning: AtomicBool::new(false),
            logs: Mutex::new(VecDeque::new()),
        })
    }

    pub fn status(&self) -> ScanStatus {
        ScanStatus {
            is_scanning: self.scanning.load(Ordering::SeqCst),
            logs: self
                .logs
                .lock()
                .map(|logs| logs.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    fn log(&self, line: String) {
        info!("{}", line);
        let stamped = format!("[{}] {}", chrono::Utc::now().format("%H:%M:%S"), line);
        if let Ok(mut logs) = self.logs.lock() {
            logs.push_back(stamped);
            while logs.len() > self.config.max_log_lines.max(1) {
                logs.pop_front();
            }
        }
    }

    fn display_name(&self, path: &Path) -> String {
        path.strip_prefix(&self.config.library_root)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    /// Scan the library once. Files are processed one at a time and a failing
    /// file never aborts the scan.
    pub async fn run_scan(&self) -> Result<ScanSummary, ReconcileError> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ReconcileError::AlreadyScanning);
        }
        let _guard = ScanGuard(&self.scanning);

        let root = self.config.library_root.clone();
        if !root.is_dir() {
            return Err(ReconcileError::MissingRoot(root));
        }

        if let Ok(mut logs) = self.logs.lock() {
            logs.clear();
        }
        self.log(format!("Scanning {}", root.display()));

        let files = tokio::task::spawn_blocking(move || scan_library(&root))
            .await
            .map_err(|e| ReconcileError::Scan(e.to_string()))?;

        let mut summary = ScanSummary {
            files_seen: files.len(),
            ..Default::default()
        };

        for file in files {
            let name = self.display_name(&file.path);
            let result = match file.kind {
                FileKind::Messy => self.process_messy(&file.path).await,
                FileKind::Organized => self.process_organized(&file.path).await,
            };
            match result {
                Ok(FileOutcome::Imported { decision, .. }) => {
                    summary.imported += 1;
                    if decision.relocate {
                        summary.relocated += 1;
                    }
                }
                Ok(FileOutcome::Backfilled { .. }) => summary.backfilled += 1,
                Ok(FileOutcome::Skipped) => summary.skipped += 1,
                Ok(FileOutcome::NoMatch) => summary.unmatched += 1,
                Err(e) => {
                    summary.failed += 1;
                    self.log(format!("Failed {}: {:#}", name, e));
                }
            }
        }

        self.log(format!(
            "Scan finished: {} files, {} imported ({} moved), {} backfilled, {} skipped, {} unmatched, {} failed",
            summary.files_seen,
            summary.imported,
            summary.relocated,
            summary.backfilled,
            summary.skipped,
            summary.unmatched,
            summary.failed
        ));
        Ok(summary)
    }

    // =========================================================================
    // Messy files
    // =========================================================================

    pub async fn process_messy(&self, path: &Path) -> Result<FileOutcome> {
        let name = self.display_name(path);
        let tags = read_tags_blocking(path.to_path_buf()).await;

        let decision = self.decide(path, &tags).await;
        let Some((mut decision, candidate)) =
            decision.and_then(|d| d.candidate.clone().map(|c| (d, c)))
        else {
            self.log(format!("No match for {}", name));
            return Ok(FileOutcome::NoMatch);
        };
        let metadata = candidate.to_metadata();

        self.log(format!(
            "Matched {} to {} - {} on {} (plan {:?}, score {})",
            name,
            metadata.artist,
            metadata.title,
            candidate.source,
            decision.plan,
            decision.score
        ));

        let final_path = if decision.relocate {
            match self.relocate(path, &metadata).await? {
                Some(moved) => moved,
                None => {
                    decision.relocate = false;
                    path.to_path_buf()
                }
            }
        } else {
            path.to_path_buf()
        };

        let lyric_id = lyrics_source(&candidate, decision.score);
        let sidecars = self.backfill_sidecars(&final_path, &metadata, lyric_id).await;

        self.store
            .upsert_track(&metadata, &final_path, sidecars.lyrics_path.as_deref())
            .with_context(|| format!("Failed to record {}", final_path.display()))?;

        Ok(FileOutcome::Imported {
            decision,
            final_path,
            lyrics_path: sidecars.lyrics_path,
            cover_path: sidecars.cover_path,
        })
    }

    /// Plan A when tags allow it, else Plan B.
    pub async fn decide(&self, path: &Path, tags: &TrackTags) -> Option<ImportDecision> {
        if let (Some(title), Some(artist)) = (&tags.title, &tags.artist) {
            if let Some((candidate, score)) = self.plan_a(title, artist).await {
                return Some(ImportDecision {
                    relocate: self.config.allow_reorganize
                        && score >= self.config.plan_a_min_confidence,
                    candidate: Some(candidate),
                    plan: MatchPlan::A,
                    score,
                });
            }
        }

        let query = FilenameQuery::from_path(path)?;
        let (candidate, score) = self.plan_b(&query).await?;
        Some(ImportDecision {
            relocate: self.config.allow_reorganize
                && score >= self.config.plan_b_relocate_threshold,
            candidate: Some(candidate),
            plan: MatchPlan::B,
            score,
        })
    }

    async fn plan_a(&self, title: &str, artist: &str) -> Option<(MatchCandidate, u32)> {
        let hits = self.search_both(title, self.config.search_count).await;
        best_plan_a(&hits, title, artist)
            .filter(|(_, score)| *score >= 1)
            .map(|(candidate, score)| (candidate.clone(), score))
    }

    async fn plan_b(&self, query: &FilenameQuery) -> Option<(MatchCandidate, u32)> {
        let hits = self
            .search_both(&query.query, self.config.candidates_per_source)
            .await;
        best_plan_b(&hits, query, self.config.plan_b_floor)
            .map(|(candidate, score)| (candidate.clone(), score))
    }

    /// Search primary and secondary concurrently; primary hits come first.
    async fn search_both(&self, query: &str, per_source: usize) -> Vec<MatchCandidate> {
        let primary = self.config.primary_source.as_str();
        let secondary = self.config.secondary_source.as_str();

        let (first, second) = if secondary.is_empty() || secondary == primary {
            (self.search_logged(query, primary, per_source).await, Vec::new())
        } else {
            tokio::join!(
                self.search_logged(query, primary, per_source),
                self.search_logged(query, secondary, per_source)
            )
        };

        first
            .into_iter()
            .take(per_source)
            .chain(second.into_iter().take(per_source))
            .collect()
    }

    async fn search_logged(&self, query: &str, source: &str, count: usize) -> Vec<MatchCandidate> {
        match self.catalog.search(query, source, count).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Search {:?} on {} failed: {}", query, source, e);
                Vec::new()
            }
        }
    }

    /// Move a file into the canonical layout. `None` when the target is taken.
    async fn relocate(&self, path: &Path, metadata: &TrackMetadata) -> Result<Option<PathBuf>> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "mp3".to_string());
        let target = track_path(&self.config.library_root, metadata, &extension);

        if tokio::fs::try_exists(&target).await.unwrap_or(true) {
            self.log(format!(
                "Not moving {}: {} already exists",
                self.display_name(path),
                self.display_name(&target)
            ));
            return Ok(None);
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::rename(path, &target)
            .await
            .with_context(|| format!("Failed to move {} to {}", path.display(), target.display()))?;

        // Carry sidecars that were sitting next to the messy file.
        let mut carried = vec![(lyrics_sidecar(path), lyrics_sidecar(&target))];
        if let Some(cover) = existing_cover(path) {
            let ext = cover.extension().map(|e| e.to_owned()).unwrap_or_default();
            carried.push((cover, target.with_extension(ext)));
        }
        for (from, to) in carried {
            if from.is_file() && !to.exists() {
                if let Err(e) = tokio::fs::rename(&from, &to).await {
                    warn!("Failed to move sidecar {:?}: {}", from, e);
                }
            }
        }

        self.log(format!(
            "Moved {} to {}",
            self.display_name(path),
            self.display_name(&target)
        ));
        Ok(Some(target))
    }

    // =========================================================================
    // Organized files
    // =========================================================================

    pub async fn process_organized(&self, path: &Path) -> Result<FileOutcome> {
        let has_lyrics = lyrics_sidecar(path).is_file();
        let has_cover = existing_cover(path).is_some();
        if has_lyrics && has_cover {
            return Ok(FileOutcome::Skipped);
        }

        let name = self.display_name(path);
        let tags = read_tags_blocking(path.to_path_buf()).await;
        let (title, artist, album) = self.organized_identity(path, &tags);
        if title.is_empty() {
            self.log(format!("No title for {}", name));
            return Ok(FileOutcome::NoMatch);
        }

        let queries = organized_queries(&title, &artist, &album);
        let mut matched = None;
        for query in &queries {
            let hits = self.search_both(query, self.config.search_count).await;
            if let Some((candidate, score)) =
                best_plan_a(&hits, &title, &artist).filter(|(_, score)| *score >= 1)
            {
                matched = Some((candidate.clone(), score));
                break;
            }
        }

        let Some((candidate, score)) = matched else {
            self.log(format!("No match for {}", name));
            return Ok(FileOutcome::NoMatch);
        };
        self.log(format!(
            "Backfilling {} from {} on {} (score {})",
            name, candidate.id, candidate.source, score
        ));

        let metadata = candidate.to_metadata();
        let lyric_id = lyrics_source(&candidate, score);
        let sidecars = self.backfill_sidecars(path, &metadata, lyric_id).await;

        self.store
            .upsert_track(&metadata, path, sidecars.lyrics_path.as_deref())
            .with_context(|| format!("Failed to record {}", path.display()))?;

        Ok(FileOutcome::Backfilled {
            candidate,
            lyrics_path: sidecars.lyrics_path,
            cover_path: sidecars.cover_path,
        })
    }

    /// Title, artist and album from tags, else from the file and folder names.
    fn organized_identity(&self, path: &Path, tags: &TrackTags) -> (String, String, String) {
        let relative = path.strip_prefix(&self.config.library_root).unwrap_or(path);
        let dirs: Vec<String> = relative
            .parent()
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();

        // root/artist/file or root/.../artist/album/file
        let (dir_artist, dir_album) = match dirs.as_slice() {
            [] => (String::new(), String::new()),
            [artist] => (artist.clone(), String::new()),
            [.., artist, album] => (artist.clone(), album.clone()),
        };

        let title = tags.title.clone().unwrap_or_else(|| {
            FilenameQuery::from_path(path)
                .map(|q| q.title_hint)
                .unwrap_or_default()
        });
        let artist = tags.artist.clone().unwrap_or(dir_artist);
        let album = tags.album.clone().unwrap_or(dir_album);
        (title, artist, album)
    }

    // =========================================================================
    // Sidecars
    // =========================================================================

    /// Write whichever of lyrics and cover is missing next to `audio`.
    ///
    /// Without a `lyric_id` the match is only trusted for the artist, so no
    /// lyrics are looked up at all.
    async fn backfill_sidecars(
        &self,
        audio: &Path,
        metadata: &TrackMetadata,
        lyric_id: Option<&str>,
    ) -> Sidecars {
        let lyrics_file = lyrics_sidecar(audio);
        let lyrics_path = if lyrics_file.is_file() {
            Some(lyrics_file)
        } else if let Some(lyric_id) = lyric_id {
            match self.fallback.lyrics_with_fallback(metadata, lyric_id).await {
                Some(lyrics) => match tokio::fs::write(&lyrics_file, &lyrics.lyric).await {
                    Ok(()) => {
                        self.log(format!("Wrote lyrics {}", self.display_name(&lyrics_file)));
                        Some(lyrics_file)
                    }
                    Err(e) => {
                        warn!("Failed to write lyrics {:?}: {}", lyrics_file, e);
                        None
                    }
                },
                None => None,
            }
        } else {
            self.log(format!(
                "Not fetching lyrics for {}: matched on artist only",
                self.display_name(audio)
            ));
            None
        };

        let cover_path = match existing_cover(audio) {
            Some(existing) => Some(existing),
            None => match self.fallback.cover_with_fallback(metadata).await {
                Some(url) => match fetch_cover(&self.http, audio, &url).await {
                    Ok(path) => {
                        self.log(format!("Wrote cover {}", self.display_name(&path)));
                        Some(path)
                    }
                    Err(e) => {
                        warn!("Failed to fetch cover {}: {}", url, e);
                        None
                    }
                },
                None => None,
            },
        };

        Sidecars {
            lyrics_path,
            cover_path,
        }
    }
}

/// The id to fetch lyrics by, when the match is close enough to be the same song.
fn lyrics_source(candidate: &MatchCandidate, score: u32) -> Option<&str> {
    (score >= SAME_SONG_SCORE).then(|| candidate.lyric_id.as_deref().unwrap_or(&candidate.id))
}

/// `artist title`, `artist album title`, `title`, without empty or repeated entries.
fn organized_queries(title: &str, artist: &str, album: &str) -> Vec<String> {
    let mut queries = Vec::new();
    for query in [
        join_query(&[artist, title]),
        join_query(&[artist, album, title]),
        join_query(&[title]),
    ] {
        if !query.is_empty() && !queries.contains(&query) {
            queries.push(query);
        }
    }
    queries
}
