//! Single-worker FIFO download queue.
//!
//! Jobs are processed strictly one at a time. Task state lives in memory and
//! is never locked across network or disk I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderName, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::library::TrackStore;
use crate::upstream::TrackMetadata;

use super::extension::{resolve_audio_extension, resolve_image_extension};
use super::models::{
    DownloadError, DownloadErrorType, DownloadTask, ResolvedAssets, TaskEvent, TaskStatus,
};
use super::paths::{album_dir, cover_sidecar, lyrics_sidecar, track_path};

/// Emit a progress event at most once per this many bytes.
const PROGRESS_STEP_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone)]
pub struct DownloadManagerConfig {
    pub download_dir: PathBuf,
    /// Extension used when nothing identifies the container
    pub default_extension: String,
    /// Remove terminal tasks this long after they finished
    pub task_ttl: Option<Duration>,
    /// Upper bound on a single HTTP transfer
    pub request_timeout: Duration,
}

impl Default for DownloadManagerConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            default_extension: "mp3".to_string(),
            task_ttl: None,
            request_timeout: Duration::from_secs(600),
        }
    }
}

struct Job {
    task_id: String,
    assets: ResolvedAssets,
    metadata: TrackMetadata,
}

/// Files and directories a job created, removed again if it fails.
#[derive(Default)]
struct WrittenPaths {
    created_dir: Option<PathBuf>,
    files: Vec<PathBuf>,
}

impl WrittenPaths {
    async fn purge(&self) {
        if let Some(dir) = &self.created_dir {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                warn!("Failed to remove partial directory {:?}: {}", dir, e);
            }
            return;
        }
        for file in &self.files {
            if let Err(e) = tokio::fs::remove_file(file).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial file {:?}: {}", file, e);
                }
            }
        }
    }
}

struct JobOutput {
    file_path: PathBuf,
    lyrics_path: Option<PathBuf>,
    cover_path: Option<PathBuf>,
}

pub struct DownloadManager {
    tasks: RwLock<HashMap<String, DownloadTask>>,
    client: Client,
    config: DownloadManagerConfig,
    store: Option<Arc<dyn TrackStore>>,
    events: broadcast::Sender<TaskEvent>,
    queue: mpsc::UnboundedSender<Job>,
}

impl DownloadManager {
    /// Create the manager and spawn its worker (and cleanup timer, if a TTL is set).
    pub fn start(
        config: DownloadManagerConfig,
        store: Option<Arc<dyn TrackStore>>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, DownloadError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(DownloadError::from)?;

        let (queue, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let task_ttl = config.task_ttl;

        let manager = Arc::new(Self {
            tasks: RwLock::new(HashMap::new()),
            client,
            config,
            store,
            events,
            queue,
        });

        tokio::spawn(manager.clone().run_worker(receiver, shutdown.clone()));
        if let Some(ttl) = task_ttl {
            tokio::spawn(manager.clone().run_cleanup(ttl, shutdown));
        }

        info!(
            "Download manager started (dir={:?}, ttl={:?})",
            manager.config.download_dir, task_ttl
        );
        Ok(manager)
    }

    pub fn download_dir(&self) -> &Path {
        &self.config.download_dir
    }

    // =========================================================================
    // Task store
    // =========================================================================

    pub async fn create_task(&self, metadata: &TrackMetadata) -> DownloadTask {
        let task = DownloadTask::new(metadata);
        self.tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());
        task
    }

    pub async fn get_task(&self, task_id: &str) -> Option<DownloadTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// All tasks, oldest first.
    pub async fn list_tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Forget a task. A queued job whose task is gone is skipped.
    pub async fn remove_task(&self, task_id: &str) -> bool {
        self.tasks.write().await.remove(task_id).is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Append a job for an existing task to the queue.
    pub async fn enqueue(
        &self,
        task_id: &str,
        assets: ResolvedAssets,
        metadata: TrackMetadata,
    ) -> Result<(), DownloadError> {
        let updated = self
            .update_task(task_id, |task| {
                task.status = TaskStatus::Queued;
                task.audio_url = Some(assets.audio_url.clone());
                task.error = None;
                task.error_type = None;
            })
            .await;
        if !updated {
            return Err(DownloadError::new(
                DownloadErrorType::NotFound,
                format!("unknown task {}", task_id),
            ));
        }

        self.queue
            .send(Job {
                task_id: task_id.to_string(),
                assets,
                metadata,
            })
            .map_err(|_| DownloadError::new(DownloadErrorType::Unknown, "download worker stopped"))?;
        self.emit(TaskEvent::Queued {
            task_id: task_id.to_string(),
        });
        debug!("Enqueued download task {}", task_id);
        Ok(())
    }

    /// Mark a task failed without running it, e.g. when resolution failed.
    pub async fn fail_task(&self, task_id: &str, error_type: DownloadErrorType, message: &str) {
        self.update_task(task_id, |task| {
            task.status = TaskStatus::Failed;
            task.error = Some(message.to_string());
            task.error_type = Some(error_type);
            task.finished_at = Some(chrono::Utc::now().timestamp());
        })
        .await;
        self.emit(TaskEvent::Failed {
            task_id: task_id.to_string(),
            error: message.to_string(),
        });
    }

    /// Wait until the task reaches a terminal state, or the timeout elapses.
    pub async fn wait_for_task(&self, task_id: &str, timeout: Duration) -> Option<DownloadTask> {
        let mut events = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = self.get_task(task_id).await?;
            if task.status.is_terminal() {
                return Some(task);
            }
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    return self.get_task(task_id).await;
                }
            }
        }
    }

    /// Remove terminal tasks that finished at least `ttl_secs` before `now`.
    pub async fn cleanup_expired(&self, now: i64, ttl_secs: i64) -> usize {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, task| match (task.status.is_terminal(), task.finished_at) {
            (true, Some(finished)) => now - finished < ttl_secs,
            _ => true,
        });
        before - tasks.len()
    }

    async fn update_task(&self, task_id: &str, update: impl FnOnce(&mut DownloadTask)) -> bool {
        match self.tasks.write().await.get_mut(task_id) {
            Some(task) => {
                update(task);
                true
            }
            None => false,
        }
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Worker
    // =========================================================================

    async fn run_worker(
        self: Arc<Self>,
        mut receiver: mpsc::UnboundedReceiver<Job>,
        shutdown: CancellationToken,
    ) {
        info!("Download worker starting");
        loop {
            tokio::select! {
                job = receiver.recv() => {
                    match job {
                        Some(job) => self.process(job).await,
                        None => break,
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Download worker shutting down");
                    break;
                }
            }
        }
    }

    async fn run_cleanup(self: Arc<Self>, ttl: Duration, shutdown: CancellationToken) {
        let period = ttl.min(Duration::from_secs(60)).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = self
                        .cleanup_expired(chrono::Utc::now().timestamp(), ttl.as_secs() as i64)
                        .await;
                    if removed > 0 {
                        debug!("Removed {} expired download tasks", removed);
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }

    async fn process(&self, job: Job) {
        let started = self
            .update_task(&job.task_id, |task| {
                task.status = TaskStatus::Downloading;
                task.progress = 0.0;
                task.bytes_downloaded = 0;
            })
            .await;
        if !started {
            debug!("Skipping removed task {}", job.task_id);
            return;
        }

        info!(
            "Downloading {} - {} ({})",
            job.metadata.artist, job.metadata.title, job.task_id
        );

        let mut written = WrittenPaths::default();
        match self.run_job(&job, &mut written).await {
            Ok(output) => self.complete(&job, output).await,
            Err(e) => {
                error!(
                    "Download task {} failed ({}): {}",
                    job.task_id,
                    e.error_type.as_str(),
                    e
                );
                written.purge().await;
                self.update_task(&job.task_id, |task| {
                    task.status = TaskStatus::Failed;
                    task.error = Some(e.message.clone());
                    task.error_type = Some(e.error_type);
                    task.file_path = None;
                    task.finished_at = Some(chrono::Utc::now().timestamp());
                })
                .await;
                self.emit(TaskEvent::Failed {
                    task_id: job.task_id.clone(),
                    error: e.message,
                });
            }
        }
    }

    async fn complete(&self, job: &Job, output: JobOutput) {
        if let Some(store) = &self.store {
            if let Err(e) =
                store.upsert_track(&job.metadata, &output.file_path, output.lyrics_path.as_deref())
            {
                warn!("Failed to record {:?} in track store: {:#}", output.file_path, e);
            }
        }

        self.update_task(&job.task_id, |task| {
            task.status = TaskStatus::Completed;
            task.progress = 1.0;
            task.file_path = Some(output.file_path.clone());
            task.lyrics_path = output.lyrics_path.clone();
            task.cover_path = output.cover_path.clone();
            task.finished_at = Some(chrono::Utc::now().timestamp());
        })
        .await;

        info!("Download task {} completed: {:?}", job.task_id, output.file_path);
        self.emit(TaskEvent::Completed {
            task_id: job.task_id.clone(),
            file_path: output.file_path,
        });
    }

    async fn run_job(&self, job: &Job, written: &mut WrittenPaths) -> Result<JobOutput, DownloadError> {
        let response = self
            .client
            .get(&job.assets.audio_url)
            .send()
            .await?
            .error_for_status()?;

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE);
        let disposition = header(CONTENT_DISPOSITION);
        let total_bytes = response.content_length().filter(|len| *len > 0);

        let extension = resolve_audio_extension(
            content_type.as_deref(),
            disposition.as_deref(),
            &job.assets.audio_url,
            &self.config.default_extension,
        );
        let file_path = track_path(&self.config.download_dir, &job.metadata, &extension);

        let dir = album_dir(&self.config.download_dir, &job.metadata);
        written.created_dir = topmost_missing_dir(&self.config.download_dir, &dir);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DownloadError::storage("failed to create album directory", e))?;

        self.update_task(&job.task_id, |task| task.total_bytes = total_bytes)
            .await;
        self.emit(TaskEvent::Started {
            task_id: job.task_id.clone(),
            total_bytes,
        });

        let part_path = file_path.with_extension(format!("{}.part", extension));
        written.files.push(part_path.clone());
        let mut file = tokio::fs::File::create(&part_path)
            .await
            .map_err(|e| DownloadError::storage("failed to create audio file", e))?;

        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_reported: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::storage("failed to write audio file", e))?;
            downloaded += chunk.len() as u64;

            if downloaded - last_reported >= PROGRESS_STEP_BYTES {
                last_reported = downloaded;
                self.report_progress(&job.task_id, downloaded, total_bytes).await;
            }
        }
        file.flush()
            .await
            .map_err(|e| DownloadError::storage("failed to flush audio file", e))?;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::storage("failed to sync audio file", e))?;
        drop(file);

        if downloaded == 0 {
            return Err(DownloadError::new(
                DownloadErrorType::NotFound,
                "upstream returned an empty audio body",
            ));
        }
        self.report_progress(&job.task_id, downloaded, total_bytes).await;

        tokio::fs::rename(&part_path, &file_path)
            .await
            .map_err(|e| DownloadError::storage("failed to finalize audio file", e))?;
        written.files.push(file_path.clone());

        let lyrics_path = match &job.assets.lyrics {
            Some(lyrics) if !lyrics.is_empty() => self.write_lyrics(&file_path, &lyrics.lyric).await,
            _ => None,
        };
        let cover_path = match &job.assets.cover_url {
            Some(url) => self.download_cover(&file_path, url).await,
            None => None,
        };

        Ok(JobOutput {
            file_path,
            lyrics_path,
            cover_path,
        })
    }

    async fn report_progress(&self, task_id: &str, downloaded: u64, total_bytes: Option<u64>) {
        self.update_task(task_id, |task| {
            task.bytes_downloaded = downloaded;
            if let Some(total) = total_bytes {
                task.progress = (downloaded as f64 / total as f64).clamp(0.0, 1.0);
            }
        })
        .await;
        self.emit(TaskEvent::Progress {
            task_id: task_id.to_string(),
            bytes_downloaded: downloaded,
            total_bytes,
        });
    }

    async fn write_lyrics(&self, audio_path: &Path, text: &str) -> Option<PathBuf> {
        let path = lyrics_sidecar(audio_path);
        match tokio::fs::write(&path, text).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Failed to write lyrics {:?}: {}", path, e);
                None
            }
        }
    }

    async fn download_cover(&self, audio_path: &Path, url: &str) -> Option<PathBuf> {
        match fetch_cover(&self.client, audio_path, url).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Failed to download cover {}: {}", url, e);
                None
            }
        }
    }
}

/// Fetch a cover image and store it next to `audio_path`.
pub(crate) async fn fetch_cover(
    client: &Client,
    audio_path: &Path,
    url: &str,
) -> Result<PathBuf, DownloadError> {
    let response = client.get(url).send().await?.error_for_status()?;
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Err(DownloadError::new(DownloadErrorType::NotFound, "empty cover body"));
    }

    let extension = resolve_image_extension(content_type.as_deref(), &bytes);
    let path = cover_sidecar(audio_path, extension);
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| DownloadError::storage("failed to write cover", e))?;
    Ok(path)
}

/// The highest ancestor of `dir` below `root` that does not exist yet.
fn topmost_missing_dir(root: &Path, dir: &Path) -> Option<PathBuf> {
    let mut missing = None;
    let mut current = dir;
    while current != root && current.starts_with(root) {
        if current.exists() {
            break;
        }
        missing = Some(current.to_path_buf());
        current = current.parent()?;
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_topmost_missing_dir() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("Artist").join("Album");
        assert_eq!(
            topmost_missing_dir(root.path(), &dir),
            Some(root.path().join("Artist"))
        );

        std::fs::create_dir_all(root.path().join("Artist")).unwrap();
        assert_eq!(topmost_missing_dir(root.path(), &dir), Some(dir.clone()));

        std::fs::create_dir_all(&dir).unwrap();
        assert_eq!(topmost_missing_dir(root.path(), &dir), None);
    }

    fn metadata() -> TrackMetadata {
        TrackMetadata {
            title: "Song".to_string(),
            artist: "Artist".to_string(),
            album: "Album".to_string(),
            source: "netease".to_string(),
            source_track_id: "1".to_string(),
            pic_id: None,
        }
    }

    fn start(dir: &Path) -> Arc<DownloadManager> {
        DownloadManager::start(
            DownloadManagerConfig {
                download_dir: dir.to_path_buf(),
                ..Default::default()
            },
            None,
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_task_store_operations() {
        let dir = TempDir::new().unwrap();
        let manager = start(dir.path());

        let task = manager.create_task(&metadata()).await;
        assert_eq!(manager.get_task(&task.id).await.unwrap().status, TaskStatus::Queued);
        assert_eq!(manager.list_tasks().await.len(), 1);

        manager
            .fail_task(&task.id, DownloadErrorType::NotFound, "no audio URL")
            .await;
        let failed = manager.get_task(&task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("no audio URL"));
        assert_eq!(failed.error_type, Some(DownloadErrorType::NotFound));

        assert!(manager.remove_task(&task.id).await);
        assert!(!manager.remove_task(&task.id).await);
        assert!(manager.get_task(&task.id).await.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_unknown_task_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = start(dir.path());
        let result = manager
            .enqueue("missing", ResolvedAssets::default(), metadata())
            .await;
        assert!(matches!(
            result,
            Err(DownloadError {
                error_type: DownloadErrorType::NotFound,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cleanup_expired_removes_only_old_terminal_tasks() {
        let dir = TempDir::new().unwrap();
        let manager = start(dir.path());

        let done = manager.create_task(&metadata()).await;
        let queued = manager.create_task(&metadata()).await;
        manager
            .fail_task(&done.id, DownloadErrorType::Unknown, "boom")
            .await;

        let now = chrono::Utc::now().timestamp();
        assert_eq!(manager.cleanup_expired(now, 3600).await, 0);
        assert_eq!(manager.cleanup_expired(now + 3600, 3600).await, 1);
        assert!(manager.get_task(&done.id).await.is_none());
        assert!(manager.get_task(&queued.id).await.is_some());
    }

    #[tokio::test]
    async fn test_failed_connection_marks_task_failed() {
        let dir = TempDir::new().unwrap();
        let manager = start(dir.path());
        let task = manager.create_task(&metadata()).await;

        manager
            .enqueue(
                &task.id,
                ResolvedAssets {
                    // Port 9 (discard) on localhost refuses connections.
                    audio_url: "http://127.0.0.1:9/a.mp3".to_string(),
                    ..Default::default()
                },
                metadata(),
            )
            .await
            .unwrap();

        let finished = manager
            .wait_for_task(&task.id, Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(finished.status, TaskStatus::Failed);
        assert!(finished.error.is_some());
        assert_eq!(finished.error_type, Some(DownloadErrorType::Connection));
        assert!(!dir.path().join("Artist").exists());
    }
}
