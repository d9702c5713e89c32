use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunevault::config::{AppConfig, CliConfig, FileConfig};
use tunevault::download_manager::{
    DownloadManager, DownloadManagerConfig, DownloadService, RequestOutcome, TaskEvent,
};
use tunevault::library::{LibraryReconciler, ReconcilerConfig, SqliteTrackStore, TrackStore};
use tunevault::matching::FallbackResolver;
use tunevault::upstream::{
    ChromiumCookieSource, LrcLibClient, MatchCandidate, MusicCatalog, RateLimiter,
    SessionCookieProvider, UpstreamClient,
};

const PROGRESS_STYLE: &str =
    "{spinner:.blue} [{elapsed_precise}] {wide_bar:.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(name = "tunevault", about = "Music acquisition and library reconciliation")]
struct CliArgs {
    /// Path to a TOML config file. Its values override the flags below.
    #[clap(long, env = "TUNEVAULT_CONFIG", value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite track database.
    #[clap(long, env = "TUNEVAULT_DB", value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Directory downloads are written to.
    #[clap(long, env = "TUNEVAULT_DOWNLOAD_DIR", value_parser = parse_path)]
    pub download_dir: Option<PathBuf>,

    /// Root of the local library to reconcile.
    #[clap(long, env = "TUNEVAULT_LIBRARY_ROOT", value_parser = parse_path)]
    pub library_root: Option<PathBuf>,

    /// Aggregator API endpoint.
    #[clap(long, env = "TUNEVAULT_API_URL")]
    pub api_url: Option<String>,

    /// Dedicated download endpoint for non primary sources.
    #[clap(long, env = "TUNEVAULT_DOWNLOAD_URL")]
    pub download_url: Option<String>,

    /// Bitrate requested when resolving audio.
    #[clap(long, env = "TUNEVAULT_BITRATE")]
    pub bitrate: Option<u32>,

    /// Comma separated sources searched for missing covers and lyrics.
    #[clap(long, env = "TUNEVAULT_FALLBACK_SOURCES", value_delimiter = ',')]
    pub fallback_sources: Option<Vec<String>>,

    /// Harvest session cookies with a headless browser.
    #[clap(long, env = "TUNEVAULT_COOKIES")]
    pub cookies: bool,

    /// Seconds a harvested cookie header stays valid.
    #[clap(long, env = "TUNEVAULT_COOKIE_TTL_SECS")]
    pub cookie_ttl_secs: Option<u64>,

    /// Chromium executable used for cookie harvesting.
    #[clap(long, env = "TUNEVAULT_BROWSER")]
    pub browser: Option<String>,

    /// Extra browser launch arguments, comma separated.
    #[clap(long, env = "TUNEVAULT_BROWSER_ARGS", value_delimiter = ',')]
    pub browser_args: Option<Vec<String>>,

    /// Move confidently matched library files into artist/album folders.
    #[clap(long, env = "TUNEVAULT_REORGANIZE")]
    pub reorganize: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search a source and print the hits.
    Search {
        query: String,
        #[clap(long)]
        source: Option<String>,
        #[clap(long, default_value_t = 10)]
        count: usize,
    },

    /// List the tracks of a playlist.
    Playlist {
        id: String,
        #[clap(long)]
        source: Option<String>,
    },

    /// Search, pick a hit and download it with cover and lyrics.
    Download {
        query: String,
        #[clap(long)]
        source: Option<String>,
        /// Index of the search hit to download.
        #[clap(long, default_value_t = 0)]
        pick: usize,
        /// Download the hit with this track id instead of using --pick.
        #[clap(long)]
        id: Option<String>,
    },

    /// Reconcile the library root once.
    Scan,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_path: self.db_path.clone(),
            download_dir: self.download_dir.clone(),
            library_root: self.library_root.clone(),
            api_url: self.api_url.clone(),
            download_url: self.download_url.clone(),
            default_bitrate: self.bitrate,
            fallback_sources: self.fallback_sources.clone(),
            cookie_ttl_secs: self.cookie_ttl_secs,
            cookies_enabled: self.cookies.then_some(true),
            browser_executable: self.browser.clone(),
            browser_args: self.browser_args.clone(),
            allow_reorganize: self.reorganize.then_some(true),
        }
    }
}

struct App {
    config: AppConfig,
    catalog: Arc<dyn MusicCatalog>,
    fallback: Arc<FallbackResolver>,
    store: Arc<SqliteTrackStore>,
}

impl App {
    fn build(config: AppConfig) -> Result<Self> {
        let upstream = &config.upstream;
        let rate_limiter = Arc::new(RateLimiter::new(upstream.rate_limiter_config()));

        let cookies = if config.cookies.enabled {
            info!(
                "Cookie harvesting enabled via {}",
                config.cookies.browser_executable
            );
            let source = Arc::new(ChromiumCookieSource::new(config.cookies.browser_settings()));
            SessionCookieProvider::new(source, config.cookies.provider_config())
        } else {
            SessionCookieProvider::disabled()
        };

        let mut client = UpstreamClient::new(
            upstream.client_config(),
            rate_limiter.clone(),
            Arc::new(cookies),
        )?;
        if let Some(url) = &upstream.lrclib_url {
            client = client.with_lrclib(LrcLibClient::new(
                url.clone(),
                upstream.timeout(),
                rate_limiter,
            )?);
        }
        let catalog: Arc<dyn MusicCatalog> = Arc::new(client);

        let fallback = Arc::new(FallbackResolver::new(
            catalog.clone(),
            upstream.fallback_sources.clone(),
            upstream.search_count,
            config.downloads.cover_size,
        ));

        info!("Opening track database at {:?}...", config.db_path);
        let store = Arc::new(SqliteTrackStore::new(&config.db_path)?);

        Ok(Self {
            config,
            catalog,
            fallback,
            store,
        })
    }

    fn source_or_primary(&self, source: Option<String>) -> String {
        source.unwrap_or_else(|| self.config.upstream.primary_source.clone())
    }

    async fn search(&self, query: &str, source: Option<String>, count: usize) -> Result<()> {
        let source = self.source_or_primary(source);
        let hits = self.catalog.search(query, &source, count).await?;
        if hits.is_empty() {
            println!("No results on {}", source);
        }
        for (index, hit) in hits.iter().enumerate() {
            print_candidate(index, hit);
        }
        Ok(())
    }

    async fn playlist(&self, id: &str, source: Option<String>) -> Result<()> {
        let source = self.source_or_primary(source);
        let playlist = self.catalog.fetch_playlist(id, &source).await?;
        println!(
            "{} ({} tracks)",
            if playlist.name.is_empty() { &playlist.id } else { &playlist.name },
            playlist.tracks.len()
        );
        for (index, track) in playlist.tracks.iter().enumerate() {
            print_candidate(index, track);
        }
        Ok(())
    }

    async fn download(
        &self,
        query: &str,
        source: Option<String>,
        pick: usize,
        id: Option<String>,
    ) -> Result<()> {
        let source = self.source_or_primary(source);
        let hits = self
            .catalog
            .search(query, &source, self.config.upstream.search_count)
            .await?;
        let hit = match &id {
            Some(id) => hits.iter().find(|hit| &hit.id == id),
            None => hits.get(pick),
        };
        let Some(hit) = hit else {
            bail!("No matching search result for {:?} on {}", query, source);
        };
        info!("Downloading {} - {} ({}:{})", hit.artist_line(), hit.title, hit.source, hit.id);

        let shutdown = CancellationToken::new();
        let downloads = &self.config.downloads;
        let manager = DownloadManager::start(
            DownloadManagerConfig {
                download_dir: downloads.download_dir.clone(),
                default_extension: downloads.default_extension.clone(),
                task_ttl: None,
                ..Default::default()
            },
            Some(self.store.clone() as Arc<dyn TrackStore>),
            shutdown.clone(),
        )?;
        let mut events = manager.subscribe();
        let service = DownloadService::new(
            self.catalog.clone(),
            self.fallback.clone(),
            manager,
            Some(self.store.clone() as Arc<dyn TrackStore>),
            self.config.upstream.default_bitrate,
        );

        let task = match service.request_track(hit.to_metadata(), None).await? {
            RequestOutcome::AlreadyInLibrary(track) => {
                println!("Already in library: {}", track.file_path.display());
                return Ok(());
            }
            RequestOutcome::Failed(task) => {
                bail!(
                    "Download failed: {}",
                    task.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
            RequestOutcome::Queued(task) => task,
        };

        let bar = ProgressBar::no_length();
        if let Ok(style) = ProgressStyle::with_template(PROGRESS_STYLE) {
            bar.set_style(style);
        }

        let result = loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} progress events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break Err(anyhow::anyhow!("download worker stopped")),
            };
            if event.task_id() != task.id {
                continue;
            }
            match event {
                TaskEvent::Queued { .. } => {}
                TaskEvent::Started { total_bytes, .. } => {
                    if let Some(total) = total_bytes {
                        bar.set_length(total);
                    }
                }
                TaskEvent::Progress {
                    bytes_downloaded,
                    total_bytes,
                    ..
                } => {
                    if let Some(total) = total_bytes {
                        bar.set_length(total);
                    }
                    bar.set_position(bytes_downloaded);
                }
                TaskEvent::Completed { file_path, .. } => {
                    bar.finish();
                    break Ok(file_path);
                }
                TaskEvent::Failed { error, .. } => {
                    bar.abandon();
                    break Err(anyhow::anyhow!("Download failed: {}", error));
                }
            }
        };
        shutdown.cancel();

        let file_path = result?;
        let size = std::fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
        println!(
            "Saved {} ({:#})",
            file_path.display(),
            byte_unit::Byte::from(size)
        );
        Ok(())
    }

    async fn scan(&self) -> Result<()> {
        let Some(root) = self.config.library_root.clone() else {
            bail!("No library root configured, pass --library-root");
        };
        let library = &self.config.library;
        let upstream = &self.config.upstream;
        let reconciler = LibraryReconciler::new(
            self.catalog.clone(),
            self.fallback.clone(),
            self.store.clone(),
            ReconcilerConfig {
                library_root: root,
                primary_source: upstream.primary_source.clone(),
                secondary_source: upstream.secondary_source.clone(),
                allow_reorganize: library.allow_reorganize,
                plan_a_min_confidence: library.plan_a_min_confidence,
                plan_b_floor: library.plan_b_floor,
                plan_b_relocate_threshold: library.plan_b_relocate_threshold,
                candidates_per_source: library.candidates_per_source,
                search_count: upstream.search_count,
                max_log_lines: library.max_log_lines,
            },
        )?;

        let summary = tokio::select! {
            summary = reconciler.run_scan() => summary?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping scan");
                return Ok(());
            }
        };
        println!(
            "{} files: {} imported ({} moved), {} backfilled, {} skipped, {} unmatched, {} failed",
            summary.files_seen,
            summary.imported,
            summary.relocated,
            summary.backfilled,
            summary.skipped,
            summary.unmatched,
            summary.failed
        );
        info!("Library now holds {} tracks", self.store.count_tracks()?);
        Ok(())
    }
}

fn print_candidate(index: usize, candidate: &MatchCandidate) {
    let album = if candidate.album.is_empty() {
        String::new()
    } else {
        format!(" [{}]", candidate.album)
    };
    println!(
        "{:>3}. {} - {}{} ({}:{})",
        index,
        candidate.artist_line(),
        candidate.title,
        album,
        candidate.source,
        candidate.id
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;
    let app = App::build(config)?;

    match cli_args.command {
        Command::Search {
            query,
            source,
            count,
        } => app.search(&query, source, count).await,
        Command::Playlist { id, source } => app.playlist(&id, source).await,
        Command::Download {
            query,
            source,
            pick,
            id,
        } => app.download(&query, source, pick, id).await,
        Command::Scan => app.scan().await,
    }
}
