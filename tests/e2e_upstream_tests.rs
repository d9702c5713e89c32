//! Upstream client against the mock aggregator

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{client_for, client_with, MockUpstream};
use tunevault::upstream::{
    LrcLibClient, MusicCatalog, RateLimiter, RateLimiterConfig, SignatureEngine, UpstreamError,
};

#[tokio::test]
async fn test_search_unwraps_jsonp_and_signs_form() {
    let mock = MockUpstream::start().await;
    mock.respond(
        "search",
        "netease",
        "artist song",
        200,
        r#"jQuery123_456([{"id":1,"name":"Song","artist":["Artist"],"album":"Album","pic_id":"p1","lyric_id":"1","source":"netease"}])"#,
    );
    let client = client_for(&mock, 3);

    let hits = client.search("artist song", "netease", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "1");
    assert_eq!(hits[0].title, "Song");
    assert_eq!(hits[0].artists, vec!["Artist"]);
    assert_eq!(hits[0].pic_id.as_deref(), Some("p1"));

    let forms = mock.forms();
    assert_eq!(forms.len(), 1);
    let form = &forms[0];
    assert_eq!(form.get("types").map(String::as_str), Some("search"));
    assert_eq!(form.get("count").map(String::as_str), Some("5"));
    let signature = form.get("s").unwrap();
    assert!(!signature.is_empty());
    assert!(signature
        .chars()
        .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
    assert!(form.get("_").unwrap().parse::<u64>().is_ok());
}

#[tokio::test]
async fn test_server_errors_are_retried_up_to_the_limit() {
    let mock = MockUpstream::start().await;
    mock.respond("url", "netease", "7", 500, "oops");
    let client = client_for(&mock, 3);

    let result = client.resolve_track_url("7", "netease", 320).await;
    assert!(matches!(result, Err(UpstreamError::Transient(_))));
    assert_eq!(mock.hits("url", "netease", "7"), 3);
}

#[tokio::test]
async fn test_each_retry_is_signed_afresh() {
    let mock = MockUpstream::start().await;
    mock.respond("url", "netease", "7", 500, "oops");
    let client = client_for(&mock, 3);

    let result = client.resolve_track_url("7", "netease", 320).await;
    assert!(matches!(result, Err(UpstreamError::Transient(_))));

    let forms = mock.forms();
    assert_eq!(forms.len(), 3);
    let signer = SignatureEngine::new("music.gdstudio.xyz", "2025.11.4");
    let mut previous = 0;
    for form in &forms {
        let timestamp: u64 = form.get("_").unwrap().parse().unwrap();
        assert!(timestamp > previous, "timestamps should advance between attempts");
        previous = timestamp;
        assert_eq!(form.get("s").unwrap(), &signer.sign("7", timestamp));
    }
}

#[tokio::test]
async fn test_retries_wait_for_the_rate_limiter() {
    let mock = MockUpstream::start().await;
    mock.respond("url", "netease", "7", 500, "oops");
    let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
        limit: 1,
        window: Duration::from_millis(200),
        min_sleep: Duration::from_millis(10),
        enabled: true,
    }));
    let client = client_with(&mock, limiter.clone(), |config| config.max_attempts = 3);

    let started = Instant::now();
    let result = client.resolve_track_url("7", "netease", 320).await;
    assert!(matches!(result, Err(UpstreamError::Transient(_))));
    assert_eq!(mock.hits("url", "netease", "7"), 3);
    // Three calls with one slot per 200ms need two full windows.
    assert!(started.elapsed() >= Duration::from_millis(380));
    assert_eq!(limiter.stats().await.limit, 1);
}

#[tokio::test]
async fn test_secondary_source_resolves_through_download_endpoint() {
    let mock = MockUpstream::start().await;
    mock.respond_download(
        "url",
        "kuwo",
        "7",
        200,
        r#"{"url":"https://cdn.example.com/k7.flac","br":999}"#,
    );
    let download_url = mock.download_url();
    let client = client_with(&mock, Arc::new(RateLimiter::unlimited()), |config| {
        config.download_url = Some(download_url);
    });

    let resolved = client.resolve_track_url("7", "kuwo", 999).await.unwrap();
    assert_eq!(resolved.url, "https://cdn.example.com/k7.flac");
    assert_eq!(mock.download_hits("url", "kuwo", "7"), 1);
    assert_eq!(mock.hits("url", "kuwo", "7"), 0);

    let forms = mock.forms();
    assert_eq!(forms.len(), 1);
    assert_eq!(forms[0].get("br").map(String::as_str), Some("999"));
}

#[tokio::test]
async fn test_empty_download_endpoint_falls_back_to_resolver() {
    let mock = MockUpstream::start().await;
    mock.respond_download("url", "kuwo", "7", 200, "[]");
    mock.respond(
        "url",
        "kuwo",
        "7",
        200,
        r#"{"url":"https://cdn.example.com/k7.mp3","br":320}"#,
    );
    let download_url = mock.download_url();
    let client = client_with(&mock, Arc::new(RateLimiter::unlimited()), |config| {
        config.download_url = Some(download_url);
    });

    let resolved = client.resolve_track_url("7", "kuwo", 320).await.unwrap();
    assert_eq!(resolved.url, "https://cdn.example.com/k7.mp3");
    assert_eq!(mock.download_hits("url", "kuwo", "7"), 1);
    assert_eq!(mock.hits("url", "kuwo", "7"), 1);
}

#[tokio::test]
async fn test_primary_source_skips_download_endpoint() {
    let mock = MockUpstream::start().await;
    mock.respond_download(
        "url",
        "netease",
        "7",
        200,
        r#"{"url":"https://cdn.example.com/wrong.mp3"}"#,
    );
    mock.respond(
        "url",
        "netease",
        "7",
        200,
        r#"{"url":"https://cdn.example.com/7.mp3"}"#,
    );
    let download_url = mock.download_url();
    let client = client_with(&mock, Arc::new(RateLimiter::unlimited()), |config| {
        config.download_url = Some(download_url);
    });

    let resolved = client.resolve_track_url("7", "netease", 320).await.unwrap();
    assert_eq!(resolved.url, "https://cdn.example.com/7.mp3");
    assert_eq!(mock.download_hits("url", "netease", "7"), 0);
    assert_eq!(mock.hits("url", "netease", "7"), 1);
}

#[tokio::test]
async fn test_forbidden_is_not_retried() {
    let mock = MockUpstream::start().await;
    mock.respond("url", "netease", "7", 403, "forbidden");
    let client = client_for(&mock, 3);

    let result = client.resolve_track_url("7", "netease", 320).await;
    assert!(matches!(result, Err(UpstreamError::Blocked(_))));
    assert_eq!(mock.hits("url", "netease", "7"), 1);
}

#[tokio::test]
async fn test_challenge_page_is_blocked() {
    let mock = MockUpstream::start().await;
    mock.respond(
        "search",
        "kuwo",
        "song",
        200,
        "<html><title>Just a moment...</title></html>",
    );
    let client = client_for(&mock, 3);

    let result = client.search("song", "kuwo", 5).await;
    assert!(matches!(result, Err(UpstreamError::Blocked(_))));
    assert_eq!(mock.hits("search", "kuwo", "song"), 1);
}

#[tokio::test]
async fn test_track_url_with_metadata() {
    let mock = MockUpstream::start().await;
    mock.respond(
        "url",
        "netease",
        "7",
        200,
        r#"{"url":"//cdn.example.com/7.mp3","br":320,"size":"1024"}"#,
    );
    let client = client_for(&mock, 1);

    let resolved = client.resolve_track_url("7", "netease", 320).await.unwrap();
    assert_eq!(resolved.url, "https://cdn.example.com/7.mp3");
    assert_eq!(resolved.bitrate, Some(320));
    assert_eq!(resolved.size, Some(1024));
}

#[tokio::test]
async fn test_missing_track_url_is_not_found() {
    let mock = MockUpstream::start().await;
    mock.respond("url", "netease", "7", 200, r#"{"url":"","br":0}"#);
    let client = client_for(&mock, 3);

    let result = client.resolve_track_url("7", "netease", 320).await;
    assert!(matches!(result, Err(UpstreamError::NotFound(_))));
    assert_eq!(mock.hits("url", "netease", "7"), 1);
}

#[tokio::test]
async fn test_playlist_tracks_are_projected() {
    let mock = MockUpstream::start().await;
    mock.respond(
        "playlist",
        "netease",
        "99",
        200,
        r#"{"playlist":{"name":"Mix","tracks":[{"id":1,"name":"One","ar":[{"name":"A"}],"al":{"name":"X","pic_str":"p"}},{"id":2,"name":"Two","ar":[{"name":"B"}],"al":{"name":"Y"}}]}}"#,
    );
    let client = client_for(&mock, 1);

    let playlist = client.fetch_playlist("99", "netease").await.unwrap();
    assert_eq!(playlist.name, "Mix");
    assert_eq!(playlist.tracks.len(), 2);
    assert_eq!(playlist.tracks[0].album, "X");
    assert_eq!(playlist.tracks[0].pic_id.as_deref(), Some("p"));
    assert_eq!(playlist.tracks[1].artists, vec!["B"]);
}

#[tokio::test]
async fn test_lyrics_fall_back_to_lrclib() {
    let mock = MockUpstream::start().await;
    mock.respond("lyric", "netease", "7", 200, r#"{"lyric":""}"#);
    mock.serve_lrclib("Song", "Artist", "[00:05.00]from lrclib");
    let lrclib = LrcLibClient::new(
        mock.lrclib_url(),
        Duration::from_secs(5),
        Arc::new(RateLimiter::with_defaults()),
    )
    .unwrap();
    let client = client_for(&mock, 1).with_lrclib(lrclib);

    let lyrics = client
        .resolve_lyrics("7", "netease", "Song", "Artist", "Album")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lyrics.lyric, "[00:05.00]from lrclib");

    let missing = client
        .resolve_lyrics("7", "netease", "Other", "Artist", "")
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_source_lyrics_win_over_lrclib() {
    let mock = MockUpstream::start().await;
    mock.respond("lyric", "netease", "7", 200, r#"{"lyric":"[00:01.00]source","tlyric":"[00:01.00]translated"}"#);
    mock.serve_lrclib("Song", "Artist", "[00:05.00]from lrclib");
    let lrclib = LrcLibClient::new(
        mock.lrclib_url(),
        Duration::from_secs(5),
        Arc::new(RateLimiter::with_defaults()),
    )
    .unwrap();
    let client = client_for(&mock, 1).with_lrclib(lrclib);

    let lyrics = client
        .resolve_lyrics("7", "netease", "Song", "Artist", "Album")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lyrics.lyric, "[00:01.00]source");
    assert_eq!(lyrics.translated.as_deref(), Some("[00:01.00]translated"));
}
