//! Destination paths for downloaded tracks and their sidecars.

use std::path::{Path, PathBuf};

use crate::upstream::TrackMetadata;

const MAX_SEGMENT_CHARS: usize = 120;

/// Make a metadata value safe to use as a single path segment.
///
/// Separators and characters reserved on common filesystems become `_`,
/// leading/trailing dots and spaces are dropped and empty results fall back
/// to `fallback`.
pub fn sanitize_segment(value: &str, fallback: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = replaced.trim_matches(|c: char| c == '.' || c.is_whitespace());
    let truncated: String = trimmed.chars().take(MAX_SEGMENT_CHARS).collect();
    let truncated = truncated.trim_end_matches(|c: char| c == '.' || c.is_whitespace());

    if truncated.is_empty() {
        fallback.to_string()
    } else {
        truncated.to_string()
    }
}

/// `root/artist/album`
pub fn album_dir(root: &Path, metadata: &TrackMetadata) -> PathBuf {
    root.join(sanitize_segment(&metadata.artist, "Unknown Artist"))
        .join(sanitize_segment(&metadata.album, "Unknown Album"))
}

/// `root/artist/album/title.ext`
pub fn track_path(root: &Path, metadata: &TrackMetadata, extension: &str) -> PathBuf {
    album_dir(root, metadata).join(format!(
        "{}.{}",
        sanitize_segment(&metadata.title, "Unknown Title"),
        extension
    ))
}

/// The `.lrc` sidecar next to an audio file.
pub fn lyrics_sidecar(audio: &Path) -> PathBuf {
    audio.with_extension("lrc")
}

/// The cover sidecar next to an audio file.
pub fn cover_sidecar(audio: &Path, extension: &str) -> PathBuf {
    audio.with_extension(extension)
}

/// An existing cover sidecar for `audio`, whatever its image format.
pub fn existing_cover(audio: &Path) -> Option<PathBuf> {
    ["jpg", "jpeg", "png", "webp"]
        .iter()
        .map(|ext| audio.with_extension(ext))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("AC/DC", "x"), "AC_DC");
        assert_eq!(sanitize_segment("What?: <Live>", "x"), "What__ _Live_");
        assert_eq!(sanitize_segment("..", "Unknown"), "Unknown");
        assert_eq!(sanitize_segment("  ", "Unknown"), "Unknown");
        assert_eq!(sanitize_segment("Album...", "x"), "Album");
        assert_eq!(sanitize_segment("晴天", "x"), "晴天");
        assert_eq!(sanitize_segment(&"a".repeat(300), "x").chars().count(), MAX_SEGMENT_CHARS);
    }

    #[test]
    fn test_track_path_layout() {
        let metadata = TrackMetadata {
            title: "Song/Part 1".to_string(),
            artist: "Artist".to_string(),
            album: String::new(),
            ..Default::default()
        };
        assert_eq!(
            track_path(Path::new("/music"), &metadata, "flac"),
            PathBuf::from("/music/Artist/Unknown Album/Song_Part 1.flac")
        );
    }

    #[test]
    fn test_sidecar_names() {
        let audio = Path::new("/music/A/B/Song.mp3");
        assert_eq!(lyrics_sidecar(audio), PathBuf::from("/music/A/B/Song.lrc"));
        assert_eq!(cover_sidecar(audio, "png"), PathBuf::from("/music/A/B/Song.png"));
    }
}
