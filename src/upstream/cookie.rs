//! Cached, single-flight session cookie for passing the edge bot-check.
//!
//! The provider moves through `no cache -> refreshing -> cached(expires_at)
//! -> expired -> refreshing`. While a refresh is in flight every caller
//! awaits the same shared future instead of opening another browser.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Errors produced while acquiring a cookie header.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CookieError {
    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("browser session failed: {0}")]
    Session(String),

    #[error("no cookies were collected from {0}")]
    Empty(String),
}

/// Something that can produce a fresh cookie header, usually a headless browser.
#[async_trait]
pub trait CookieSource: Send + Sync {
    async fn acquire(&self) -> Result<String, CookieError>;
}

type RefreshFuture = Shared<BoxFuture<'static, Result<String, CookieError>>>;

struct CachedCookie {
    header: String,
    expires_at: Instant,
}

#[derive(Default)]
struct CookieState {
    cached: Option<CachedCookie>,
    in_flight: Option<(u64, RefreshFuture)>,
    generation: u64,
}

/// Configuration for the cookie provider.
#[derive(Debug, Clone)]
pub struct CookieProviderConfig {
    pub enabled: bool,
    pub ttl: Duration,
}

impl Default for CookieProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Owns the cookie cache and the single in-flight refresh.
pub struct SessionCookieProvider {
    source: Option<Arc<dyn CookieSource>>,
    config: CookieProviderConfig,
    state: Mutex<CookieState>,
}

impl SessionCookieProvider {
    pub fn new(source: Arc<dyn CookieSource>, config: CookieProviderConfig) -> Self {
        Self {
            source: Some(source),
            config,
            state: Mutex::new(CookieState::default()),
        }
    }

    /// A provider that never attaches cookies.
    pub fn disabled() -> Self {
        Self {
            source: None,
            config: CookieProviderConfig {
                enabled: false,
                ..Default::default()
            },
            state: Mutex::new(CookieState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.source.is_some()
    }

    /// Return a cookie header, refreshing it if the cache is cold or expired.
    ///
    /// Returns an empty string when the provider is disabled.
    pub async fn cookie_header(&self) -> Result<String, CookieError> {
        let Some(source) = self.source.as_ref().filter(|_| self.config.enabled) else {
            return Ok(String::new());
        };

        let (generation, refresh) = {
            let mut state = self.lock_state();
            if let Some(cached) = &state.cached {
                if Instant::now() < cached.expires_at {
                    return Ok(cached.header.clone());
                }
                debug!("Session cookie expired");
                state.cached = None;
            }

            match &state.in_flight {
                Some((generation, refresh)) => (*generation, refresh.clone()),
                None => {
                    state.generation += 1;
                    let generation = state.generation;
                    let source = source.clone();
                    let refresh = async move { source.acquire().await }.boxed().shared();
                    state.in_flight = Some((generation, refresh.clone()));
                    info!("Refreshing session cookie");
                    (generation, refresh)
                }
            }
        };

        let result = refresh.await;

        let mut state = self.lock_state();
        let still_current = matches!(&state.in_flight, Some((g, _)) if *g == generation);
        if still_current {
            state.in_flight = None;
            match &result {
                Ok(header) => {
                    state.cached = Some(CachedCookie {
                        header: header.clone(),
                        expires_at: Instant::now() + self.config.ttl,
                    });
                }
                Err(e) => warn!("Session cookie refresh failed: {}", e),
            }
        }

        result
    }

    /// Drop the cached cookie so the next call refreshes it.
    pub fn invalidate(&self) {
        let mut state = self.lock_state();
        if state.cached.take().is_some() {
            info!("Session cookie invalidated");
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CookieState> {
        // The state holds no invariants that a panicking holder could break.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
