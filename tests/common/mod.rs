#![allow(dead_code)]

mod server;

pub use server::MockUpstream;

use std::sync::Arc;
use std::time::Duration;

use tunevault::upstream::{
    RateLimiter, RateLimiterConfig, SessionCookieProvider, UpstreamClient, UpstreamClientConfig,
};

/// Minimal JPEG header, enough for image sniffing.
pub const JPEG_BYTES: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];

/// A client talking to `mock` with no rate limiting and short retry delays.
pub fn client_for(mock: &MockUpstream, max_attempts: u32) -> UpstreamClient {
    let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
        enabled: false,
        ..Default::default()
    }));
    client_with(mock, limiter, |config| config.max_attempts = max_attempts)
}

/// A client talking to `mock` through `limiter`, with `configure` applied last.
pub fn client_with(
    mock: &MockUpstream,
    limiter: Arc<RateLimiter>,
    configure: impl FnOnce(&mut UpstreamClientConfig),
) -> UpstreamClient {
    let mut config = UpstreamClientConfig {
        api_url: mock.api_url(),
        retry_delay: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
        ..Default::default()
    };
    configure(&mut config);
    UpstreamClient::new(
        config,
        limiter,
        Arc::new(SessionCookieProvider::disabled()),
    )
    .expect("client should build")
}
