//! Library directory walk.
//!
//! Audio files directly under the root are messy imports. Anything nested
//! deeper already lives in an `artist/album` layout.

use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "aac", "ogg", "opus", "wav", "ape"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Sitting at the library root
    Messy,
    /// Nested inside the library
    Organized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub kind: FileKind,
}

/// Returns true for supported audio extensions, case-insensitively.
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            AUDIO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Walk `root` and classify every audio file, in a stable order.
pub fn scan_library(root: &Path) -> Vec<ScannedFile> {
    WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || entry
                    .file_name()
                    .to_str()
                    .map(|name| !is_hidden(name))
                    .unwrap_or(true)
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable library entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_audio_file(entry.path()))
        .map(|entry| ScannedFile {
            kind: if entry.depth() == 1 {
                FileKind::Messy
            } else {
                FileKind::Organized
            },
            path: entry.into_path(),
        })
        .collect()
}
