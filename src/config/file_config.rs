use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub download_dir: Option<String>,
    pub library_root: Option<String>,

    // Feature configs
    pub upstream: Option<UpstreamConfig>,
    pub cookies: Option<CookieConfig>,
    pub downloads: Option<DownloadConfig>,
    pub library: Option<LibraryConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    pub api_url: Option<String>,
    pub download_url: Option<String>,
    pub primary_source: Option<String>,
    pub secondary_source: Option<String>,
    pub fallback_sources: Option<Vec<String>>,
    pub default_bitrate: Option<u32>,
    pub search_count: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub signature_host: Option<String>,
    pub signature_version: Option<String>,
    pub server_time_url: Option<String>,
    pub lrclib_url: Option<String>,
    pub lrclib_enabled: Option<bool>,
    // Rate limit settings
    pub rate_limit: Option<usize>,
    pub rate_window_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CookieConfig {
    pub enabled: Option<bool>,
    pub ttl_secs: Option<u64>,
    pub browser_executable: Option<String>,
    pub browser_args: Option<Vec<String>>,
    pub portal_url: Option<String>,
    pub warmup_url: Option<String>,
    pub settle_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DownloadConfig {
    pub default_extension: Option<String>,
    pub task_ttl_secs: Option<u64>,
    pub cover_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct LibraryConfig {
    pub allow_reorganize: Option<bool>,
    pub plan_a_min_confidence: Option<u32>,
    pub plan_b_floor: Option<u32>,
    pub plan_b_relocate_threshold: Option<u32>,
    pub candidates_per_source: Option<usize>,
    pub max_log_lines: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
