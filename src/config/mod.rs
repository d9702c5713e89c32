mod file_config;

pub use file_config::{CookieConfig, DownloadConfig, FileConfig, LibraryConfig, UpstreamConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::upstream::{
    BrowserSettings, CookieProviderConfig, RateLimiterConfig, UpstreamClientConfig, LRCLIB_BASE_URL,
};

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub library_root: Option<PathBuf>,
    pub api_url: Option<String>,
    pub download_url: Option<String>,
    pub default_bitrate: Option<u32>,
    pub fallback_sources: Option<Vec<String>>,
    pub cookie_ttl_secs: Option<u64>,
    pub cookies_enabled: Option<bool>,
    pub browser_executable: Option<String>,
    pub browser_args: Option<Vec<String>>,
    pub allow_reorganize: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_path: PathBuf,
    pub download_dir: PathBuf,
    pub library_root: Option<PathBuf>,

    // Feature configs (with defaults)
    pub upstream: UpstreamSettings,
    pub cookies: CookieSettings,
    pub downloads: DownloadSettings,
    pub library: LibrarySettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let download_dir = file
            .download_dir
            .map(PathBuf::from)
            .or_else(|| cli.download_dir.clone())
            .unwrap_or_else(|| PathBuf::from("downloads"));

        if download_dir.exists() && !download_dir.is_dir() {
            bail!("download_dir is not a directory: {:?}", download_dir);
        }

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .unwrap_or_else(|| download_dir.join("tunevault.db"));

        let library_root = file
            .library_root
            .map(PathBuf::from)
            .or_else(|| cli.library_root.clone());

        if let Some(root) = &library_root {
            if !root.is_dir() {
                bail!("Library root does not exist or is not a directory: {:?}", root);
            }
        }

        // Upstream settings - merge file config with CLI and defaults
        let up_file = file.upstream.unwrap_or_default();
        let defaults = UpstreamSettings::default();
        let lrclib_enabled = up_file.lrclib_enabled.unwrap_or(true);
        let upstream = UpstreamSettings {
            api_url: up_file
                .api_url
                .or_else(|| cli.api_url.clone())
                .unwrap_or(defaults.api_url),
            download_url: up_file.download_url.or_else(|| cli.download_url.clone()),
            primary_source: up_file.primary_source.unwrap_or(defaults.primary_source),
            secondary_source: up_file.secondary_source.unwrap_or(defaults.secondary_source),
            fallback_sources: up_file
                .fallback_sources
                .or_else(|| cli.fallback_sources.clone())
                .unwrap_or(defaults.fallback_sources),
            default_bitrate: up_file
                .default_bitrate
                .or(cli.default_bitrate)
                .unwrap_or(defaults.default_bitrate),
            search_count: up_file.search_count.unwrap_or(defaults.search_count),
            timeout_secs: up_file.timeout_secs.unwrap_or(defaults.timeout_secs),
            max_attempts: up_file.max_attempts.unwrap_or(defaults.max_attempts),
            retry_delay_ms: up_file.retry_delay_ms.unwrap_or(defaults.retry_delay_ms),
            signature_host: up_file.signature_host.unwrap_or(defaults.signature_host),
            signature_version: up_file
                .signature_version
                .unwrap_or(defaults.signature_version),
            server_time_url: up_file.server_time_url.or(defaults.server_time_url),
            lrclib_url: if lrclib_enabled {
                up_file.lrclib_url.or(defaults.lrclib_url)
            } else {
                None
            },
            rate_limit: up_file.rate_limit.unwrap_or(defaults.rate_limit),
            rate_window_secs: up_file.rate_window_secs.unwrap_or(defaults.rate_window_secs),
        };

        if upstream.max_attempts == 0 {
            bail!("upstream.max_attempts must be at least 1");
        }

        let cookie_file = file.cookies.unwrap_or_default();
        let cookie_defaults = CookieSettings::default();
        let cookies = CookieSettings {
            enabled: cookie_file
                .enabled
                .or(cli.cookies_enabled)
                .unwrap_or(cookie_defaults.enabled),
            ttl_secs: cookie_file
                .ttl_secs
                .or(cli.cookie_ttl_secs)
                .unwrap_or(cookie_defaults.ttl_secs),
            browser_executable: cookie_file
                .browser_executable
                .or_else(|| cli.browser_executable.clone())
                .unwrap_or(cookie_defaults.browser_executable),
            browser_args: cookie_file
                .browser_args
                .or_else(|| cli.browser_args.clone())
                .unwrap_or(cookie_defaults.browser_args),
            portal_url: cookie_file.portal_url.unwrap_or(cookie_defaults.portal_url),
            warmup_url: cookie_file.warmup_url.or(cookie_defaults.warmup_url),
            settle_delay_ms: cookie_file
                .settle_delay_ms
                .unwrap_or(cookie_defaults.settle_delay_ms),
        };

        let dl_file = file.downloads.unwrap_or_default();
        let downloads = DownloadSettings {
            download_dir: download_dir.clone(),
            default_extension: dl_file
                .default_extension
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .unwrap_or_else(|| "mp3".to_string()),
            task_ttl_secs: dl_file.task_ttl_secs,
            cover_size: dl_file.cover_size.unwrap_or(500),
        };

        let lib_file = file.library.unwrap_or_default();
        let lib_defaults = LibrarySettings::default();
        let library = LibrarySettings {
            allow_reorganize: lib_file
                .allow_reorganize
                .or(cli.allow_reorganize)
                .unwrap_or(lib_defaults.allow_reorganize),
            plan_a_min_confidence: lib_file
                .plan_a_min_confidence
                .unwrap_or(lib_defaults.plan_a_min_confidence),
            plan_b_floor: lib_file.plan_b_floor.unwrap_or(lib_defaults.plan_b_floor),
            plan_b_relocate_threshold: lib_file
                .plan_b_relocate_threshold
                .unwrap_or(lib_defaults.plan_b_relocate_threshold),
            candidates_per_source: lib_file
                .candidates_per_source
                .unwrap_or(lib_defaults.candidates_per_source),
            max_log_lines: lib_file.max_log_lines.unwrap_or(lib_defaults.max_log_lines),
        };

        Ok(Self {
            db_path,
            download_dir,
            library_root,
            upstream,
            cookies,
            downloads,
            library,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub api_url: String,
    /// Bitrate-parameterized endpoint tried first for non-primary sources
    pub download_url: Option<String>,
    pub primary_source: String,
    pub secondary_source: String,
    /// Ordered alternate sources for covers and lyrics
    pub fallback_sources: Vec<String>,
    pub default_bitrate: u32,
    pub search_count: usize,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub signature_host: String,
    pub signature_version: String,
    pub server_time_url: Option<String>,
    /// None disables the external lyrics lookup
    pub lrclib_url: Option<String>,
    // Rate limit settings
    pub rate_limit: usize,
    pub rate_window_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            api_url: "https://music-api.gdstudio.xyz/api.php".to_string(),
            download_url: None,
            primary_source: "netease".to_string(),
            secondary_source: "kuwo".to_string(),
            fallback_sources: vec!["kuwo".to_string(), "joox".to_string(), "netease".to_string()],
            default_bitrate: 320,
            search_count: 20,
            timeout_secs: 15,
            max_attempts: 3,
            retry_delay_ms: 1000,
            signature_host: "music.gdstudio.xyz".to_string(),
            signature_version: "2025.11.4".to_string(),
            server_time_url: None,
            lrclib_url: Some(LRCLIB_BASE_URL.to_string()),
            rate_limit: 5,
            rate_window_secs: 5,
        }
    }
}

impl UpstreamSettings {
    pub fn client_config(&self) -> UpstreamClientConfig {
        UpstreamClientConfig {
            api_url: self.api_url.clone(),
            download_url: self.download_url.clone(),
            primary_source: self.primary_source.clone(),
            timeout: self.timeout(),
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay(),
            signature_host: self.signature_host.clone(),
            signature_version: self.signature_version.clone(),
            server_time_url: self.server_time_url.clone(),
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            limit: self.rate_limit,
            window: Duration::from_secs(self.rate_window_secs),
            enabled: self.rate_limit > 0,
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub browser_executable: String,
    pub browser_args: Vec<String>,
    pub portal_url: String,
    pub warmup_url: Option<String>,
    pub settle_delay_ms: u64,
}

impl Default for CookieSettings {
    fn default() -> Self {
        let browser = BrowserSettings::default();
        Self {
            enabled: false,
            ttl_secs: 30 * 60,
            browser_executable: browser.executable,
            browser_args: browser.launch_args,
            portal_url: browser.portal_url,
            warmup_url: None,
            settle_delay_ms: browser.settle_delay.as_millis() as u64,
        }
    }
}

impl CookieSettings {
    pub fn provider_config(&self) -> CookieProviderConfig {
        CookieProviderConfig {
            enabled: self.enabled,
            ttl: Duration::from_secs(self.ttl_secs),
        }
    }

    pub fn browser_settings(&self) -> BrowserSettings {
        BrowserSettings {
            executable: self.browser_executable.clone(),
            launch_args: self.browser_args.clone(),
            portal_url: self.portal_url.clone(),
            warmup_url: self.warmup_url.clone(),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub download_dir: PathBuf,
    /// Extension used when nothing in the response identifies the container
    pub default_extension: String,
    /// Remove terminal tasks from memory after this many seconds
    pub task_ttl_secs: Option<u64>,
    /// Cover edge size requested from the `pic` endpoint
    pub cover_size: u32,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            default_extension: "mp3".to_string(),
            task_ttl_secs: None,
            cover_size: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LibrarySettings {
    /// Whether matched messy files may be moved into `artist/album/title.ext`
    pub allow_reorganize: bool,
    /// Plan A confidence (0-2) required before a file is moved
    pub plan_a_min_confidence: u32,
    /// Plan B score required to accept a match at all
    pub plan_b_floor: u32,
    /// Plan B score required before a file is moved
    pub plan_b_relocate_threshold: u32,
    /// Plan B takes this many hits from each source
    pub candidates_per_source: usize,
    /// Scan log lines kept for status queries
    pub max_log_lines: usize,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            allow_reorganize: false,
            plan_a_min_confidence: 2,
            plan_b_floor: 2,
            plan_b_relocate_threshold: 4,
            candidates_per_source: 5,
            max_log_lines: 500,
        }
    }
}
