//! Turns a track request into a queued download.
//!
//! Checks the library for a duplicate, resolves the audio URL and the
//! optional cover and lyrics, then hands the job to the [`DownloadManager`].

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::library::{StoredTrack, TrackStore};
use crate::matching::FallbackResolver;
use crate::upstream::{MusicCatalog, TrackMetadata};

use super::manager::DownloadManager;
use super::models::{DownloadErrorType, DownloadTask, ResolvedAssets};

#[derive(Debug, Clone)]
pub enum RequestOutcome {
    /// The track is already in the library
    AlreadyInLibrary(StoredTrack),
    Queued(DownloadTask),
    /// Resolution failed; the task carries the error
    Failed(DownloadTask),
}

pub struct DownloadService {
    catalog: Arc<dyn MusicCatalog>,
    fallback: Arc<FallbackResolver>,
    manager: Arc<DownloadManager>,
    store: Option<Arc<dyn TrackStore>>,
    default_bitrate: u32,
}

impl DownloadService {
    pub fn new(
        catalog: Arc<dyn MusicCatalog>,
        fallback: Arc<FallbackResolver>,
        manager: Arc<DownloadManager>,
        store: Option<Arc<dyn TrackStore>>,
        default_bitrate: u32,
    ) -> Self {
        Self {
            catalog,
            fallback,
            manager,
            store,
            default_bitrate,
        }
    }

    pub fn manager(&self) -> &Arc<DownloadManager> {
        &self.manager
    }

    pub async fn request_track(
        &self,
        metadata: TrackMetadata,
        bitrate: Option<u32>,
    ) -> Result<RequestOutcome> {
        if let Some(store) = &self.store {
            if let Some(existing) =
                store.get_track_by_source_track(&metadata.source_track_id, &metadata.source)?
            {
                if existing.file_path.is_file() {
                    info!(
                        "{}:{} already in library at {:?}",
                        metadata.source, metadata.source_track_id, existing.file_path
                    );
                    return Ok(RequestOutcome::AlreadyInLibrary(existing));
                }
                warn!(
                    "Library entry for {}:{} points at a missing file, downloading again",
                    metadata.source, metadata.source_track_id
                );
            }
        }

        let task = self.manager.create_task(&metadata).await;
        let bitrate = bitrate.unwrap_or(self.default_bitrate);

        let resolved = match self
            .catalog
            .resolve_track_url(&metadata.source_track_id, &metadata.source, bitrate)
            .await
        {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(
                    "Could not resolve audio for {}:{}: {}",
                    metadata.source, metadata.source_track_id, e
                );
                self.manager
                    .fail_task(&task.id, DownloadErrorType::from(&e), &e.to_string())
                    .await;
                let failed = self.manager.get_task(&task.id).await.unwrap_or(task);
                return Ok(RequestOutcome::Failed(failed));
            }
        };

        // Partial assets never block the audio download.
        let cover_url = self.fallback.cover_with_fallback(&metadata).await;
        let lyrics = self
            .fallback
            .lyrics_with_fallback(&metadata, &metadata.source_track_id)
            .await;

        let assets = ResolvedAssets {
            audio_url: resolved.url,
            cover_url,
            lyrics,
        };
        self.manager.enqueue(&task.id, assets, metadata).await?;

        let queued = self.manager.get_task(&task.id).await.unwrap_or(task);
        Ok(RequestOutcome::Queued(queued))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download_manager::{DownloadManagerConfig, TaskStatus};
    use crate::library::SqliteTrackStore;
    use crate::upstream::fake::FakeCatalog;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn metadata() -> TrackMetadata {
        TrackMetadata {
            title: "Song".to_string(),
            artist: "Artist".to_string(),
            album: "Album".to_string(),
            source: "kuwo".to_string(),
            source_track_id: "7".to_string(),
            pic_id: None,
        }
    }

    fn service(dir: &Path, catalog: FakeCatalog, store: Arc<SqliteTrackStore>) -> DownloadService {
        let catalog: Arc<dyn MusicCatalog> = Arc::new(catalog);
        let fallback = Arc::new(FallbackResolver::new(catalog.clone(), Vec::new(), 5, 300));
        let manager = DownloadManager::start(
            DownloadManagerConfig {
                download_dir: dir.to_path_buf(),
                ..Default::default()
            },
            Some(store.clone()),
            CancellationToken::new(),
        )
        .unwrap();
        DownloadService::new(catalog, fallback, manager, Some(store), 320)
    }

    #[tokio::test]
    async fn test_unresolvable_track_creates_failed_task() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteTrackStore::in_memory().unwrap());
        let service = service(dir.path(), FakeCatalog::default(), store);

        let outcome = service.request_track(metadata(), None).await.unwrap();
        let RequestOutcome::Failed(task) = outcome else {
            panic!("expected a failed task, got {:?}", outcome);
        };
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_type, Some(DownloadErrorType::NotFound));
        assert!(task.error.unwrap().contains("kuwo:7"));
    }

    #[tokio::test]
    async fn test_existing_library_track_is_not_downloaded_again() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("Song.mp3");
        std::fs::write(&file, b"ID3").unwrap();
        let store = Arc::new(SqliteTrackStore::in_memory().unwrap());
        store.upsert_track(&metadata(), &file, None).unwrap();

        let service = service(dir.path(), FakeCatalog::default(), store);
        let outcome = service.request_track(metadata(), None).await.unwrap();
        assert!(matches!(outcome, RequestOutcome::AlreadyInLibrary(track) if track.file_path == file));
        assert!(service.manager().list_tasks().await.is_empty());
    }
}
