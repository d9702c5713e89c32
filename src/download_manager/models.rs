//! Data models for the download manager.
//!
//! Defines tasks, statuses, events and the errors a job can end with.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::upstream::{Lyrics, TrackMetadata, UpstreamError};

/// Status of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Completed, // terminal
    Failed,    // terminal
}

impl TaskStatus {
    /// Returns true if this is a terminal state (Completed or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A single track download.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    /// Unique identifier (UUID)
    pub id: String,
    /// Track id within `source`
    pub track_id: String,
    pub source: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub status: TaskStatus,
    /// Fraction of bytes written, in [0, 1]. Stays 0 when the length is unknown.
    pub progress: f64,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub audio_url: Option<String>,
    pub file_path: Option<PathBuf>,
    pub lyrics_path: Option<PathBuf>,
    pub cover_path: Option<PathBuf>,
    pub error: Option<String>,
    /// Classification of `error`
    pub error_type: Option<DownloadErrorType>,
    /// Unix timestamp
    pub created_at: i64,
    /// When the task reached a terminal state
    pub finished_at: Option<i64>,
}

impl DownloadTask {
    pub fn new(metadata: &TrackMetadata) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            track_id: metadata.source_track_id.clone(),
            source: metadata.source.clone(),
            title: metadata.title.clone(),
            artist: metadata.artist.clone(),
            album: metadata.album.clone(),
            status: TaskStatus::Queued,
            progress: 0.0,
            bytes_downloaded: 0,
            total_bytes: None,
            audio_url: None,
            file_path: None,
            lyrics_path: None,
            cover_path: None,
            error: None,
            error_type: None,
            created_at: chrono::Utc::now().timestamp(),
            finished_at: None,
        }
    }
}

/// Everything a job needs besides the metadata.
#[derive(Debug, Clone, Default)]
pub struct ResolvedAssets {
    pub audio_url: String,
    pub cover_url: Option<String>,
    pub lyrics: Option<Lyrics>,
}

/// Lifecycle notifications broadcast by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Queued {
        task_id: String,
    },
    Started {
        task_id: String,
        total_bytes: Option<u64>,
    },
    Progress {
        task_id: String,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },
    Completed {
        task_id: String,
        file_path: PathBuf,
    },
    Failed {
        task_id: String,
        error: String,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Queued { task_id }
            | TaskEvent::Started { task_id, .. }
            | TaskEvent::Progress { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. } => task_id,
        }
    }
}

/// Type of error encountered during download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadErrorType {
    Connection, // Network error
    Timeout,    // Request timeout
    NotFound,   // Upstream had no audio
    Blocked,    // Edge block or rejected credentials
    Storage,    // File system error
    Unknown,
}

impl DownloadErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadErrorType::Connection => "connection",
            DownloadErrorType::Timeout => "timeout",
            DownloadErrorType::NotFound => "not_found",
            DownloadErrorType::Blocked => "blocked",
            DownloadErrorType::Storage => "storage",
            DownloadErrorType::Unknown => "unknown",
        }
    }
}

impl From<&UpstreamError> for DownloadErrorType {
    fn from(err: &UpstreamError) -> Self {
        match err {
            UpstreamError::Transient(_) => DownloadErrorType::Connection,
            UpstreamError::Blocked(_) | UpstreamError::Cookie(_) => DownloadErrorType::Blocked,
            UpstreamError::NotFound(_) => DownloadErrorType::NotFound,
            UpstreamError::Status { .. } | UpstreamError::Parse(_) => DownloadErrorType::Unknown,
        }
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct DownloadError {
    pub error_type: DownloadErrorType,
    pub message: String,
}

impl DownloadError {
    pub fn new(error_type: DownloadErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    pub fn storage(context: &str, err: std::io::Error) -> Self {
        Self::new(DownloadErrorType::Storage, format!("{}: {}", context, err))
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        let error_type = if err.is_timeout() {
            DownloadErrorType::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() {
            DownloadErrorType::Connection
        } else {
            match err.status().map(|s| s.as_u16()) {
                Some(401) | Some(403) => DownloadErrorType::Blocked,
                Some(404) | Some(410) => DownloadErrorType::NotFound,
                _ => DownloadErrorType::Unknown,
            }
        };
        Self::new(error_type, err.to_string())
    }
}
