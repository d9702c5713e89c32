//! Everything that talks to the aggregator and its helper services.

mod browser;
mod client;
mod cookie;
mod error;
#[cfg(test)]
pub(crate) mod fake;
mod lrclib;
mod models;
mod payload;
mod rate_limiter;
mod signature;

pub use browser::{BrowserSettings, ChromiumCookieSource};
pub use client::{MusicCatalog, RequestType, UpstreamClient, UpstreamClientConfig, UpstreamRequest};
pub use cookie::{CookieError, CookieProviderConfig, CookieSource, SessionCookieProvider};
pub use error::{UpstreamError, UpstreamResult};
pub use lrclib::{LrcLibClient, LRCLIB_BASE_URL};
pub use models::{Lyrics, MatchCandidate, Playlist, ResolvedTrackUrl, TrackMetadata};
pub use payload::{unwrap_jsonp, UpstreamPayload};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateWindowStats};
pub use signature::{pack_version, ServerClock, SignatureEngine};
