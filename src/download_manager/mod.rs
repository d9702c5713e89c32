//! Download queue and the orchestration that feeds it.

mod extension;
mod manager;
mod models;
mod paths;
mod service;

pub use extension::{resolve_audio_extension, resolve_image_extension};
pub use manager::{DownloadManager, DownloadManagerConfig};
pub(crate) use manager::fetch_cover;
pub use models::{
    DownloadError, DownloadErrorType, DownloadTask, ResolvedAssets, TaskEvent, TaskStatus,
};
pub use paths::{
    album_dir, cover_sidecar, existing_cover, lyrics_sidecar, sanitize_segment, track_path,
};
pub use service::{DownloadService, RequestOutcome};
