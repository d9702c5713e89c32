//! Container extension detection for downloaded audio and covers.
//!
//! Priority for audio: declared content type, `Content-Disposition`
//! filename, a per-source format code in the URL, the URL path extension
//! and finally the configured default.

use reqwest::Url;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "aac", "ogg", "opus", "wav", "ape"];

/// Resolve the extension (without dot) for a downloaded audio file.
pub fn resolve_audio_extension(
    content_type: Option<&str>,
    content_disposition: Option<&str>,
    url: &str,
    default: &str,
) -> String {
    content_type
        .and_then(extension_from_content_type)
        .or_else(|| content_disposition.and_then(extension_from_disposition))
        .or_else(|| extension_from_format_code(url))
        .or_else(|| extension_from_url_path(url))
        .map(str::to_string)
        .unwrap_or_else(|| default.trim_start_matches('.').to_lowercase())
}

fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    match mime.as_str() {
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "audio/mpeg" | "audio/mp3" | "audio/mpeg3" | "audio/x-mpeg" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/aac" | "audio/x-aac" => Some("aac"),
        "audio/ogg" | "application/ogg" => Some("ogg"),
        "audio/opus" => Some("opus"),
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
        "audio/ape" | "audio/x-ape" => Some("ape"),
        // octet-stream and friends say nothing about the container
        _ => None,
    }
}

fn known_audio_extension(name: &str) -> Option<&'static str> {
    let ext = name.trim().trim_matches('"').rsplit_once('.')?.1.to_ascii_lowercase();
    AUDIO_EXTENSIONS.iter().copied().find(|known| *known == ext)
}

fn extension_from_disposition(disposition: &str) -> Option<&'static str> {
    disposition
        .split(';')
        .filter_map(|part| part.split_once('='))
        .filter(|(key, _)| {
            let key = key.trim().to_ascii_lowercase();
            key == "filename" || key == "filename*"
        })
        .find_map(|(_, value)| {
            // filename*=UTF-8''name.m4a
            let value = value.rsplit("''").next().unwrap_or(value);
            let decoded = urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string());
            known_audio_extension(&decoded)
        })
}

fn extension_from_format_code(url: &str) -> Option<&'static str> {
    let parsed = Url::parse(url).ok()?;

    let by_query = parsed
        .query_pairs()
        .filter(|(key, _)| key == "fmt" || key == "format")
        .find_map(|(_, value)| match value.trim() {
            "6" | "7" | "27" => Some("flac"),
            "4" => Some("m4a"),
            "1" | "2" | "3" | "5" => Some("mp3"),
            _ => None,
        });
    if by_query.is_some() {
        return by_query;
    }

    // Tencent-style file names carry the quality in their prefix.
    let file = parsed.path_segments()?.next_back()?.to_ascii_uppercase();
    if file.starts_with("F000") {
        Some("flac")
    } else if file.starts_with("M800") || file.starts_with("M500") {
        Some("mp3")
    } else if file.starts_with("C400") {
        Some("m4a")
    } else {
        None
    }
}

fn extension_from_url_path(url: &str) -> Option<&'static str> {
    let parsed = Url::parse(url).ok()?;
    let file = parsed.path_segments()?.next_back()?;
    known_audio_extension(file)
}

/// Resolve the extension for a cover image from its declared type or its bytes.
pub fn resolve_image_extension(content_type: Option<&str>, bytes: &[u8]) -> &'static str {
    let declared = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());
    match declared.as_deref() {
        Some("image/png") => return "png",
        Some("image/webp") => return "webp",
        Some("image/jpeg") | Some("image/jpg") => return "jpg",
        _ => {}
    }
    match infer::get(bytes).map(|kind| kind.mime_type()) {
        Some("image/png") => "png",
        Some("image/webp") => "webp",
        _ => "jpg",
    }
}
