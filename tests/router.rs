//! End-to-end scenarios driving `RequestRouter` directly, against a
//! `FakeStore` instead of real S3.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::{Method, StatusCode};

use remote_cache_proxy::breaker::CircuitBreaker;
use remote_cache_proxy::cache::MemoryCache;
use remote_cache_proxy::config::Config;
use remote_cache_proxy::router::RequestRouter;
use remote_cache_proxy::shutdown::ShutdownCoordinator;
use remote_cache_proxy::spooler::UploadSpooler;
use remote_cache_proxy::store::fake::FakeStore;
use remote_cache_proxy::types::{Request, RequestBody};
use remote_cache_proxy::watchdog::IdleWatchdog;

fn config(overrides: impl FnOnce(&mut Config)) -> Config {
    let mut config = Config {
        host: "127.0.0.1".parse().unwrap(),
        port: 7799,
        bucket: "test-bucket".into(),
        s3_prefix: "".into(),
        s3_endpoint: None,
        region: "us-east-1".into(),
        idle_minutes: 0,
        socket_timeout_seconds: 60,
        errors_before_pausing: 3,
        pause_minutes: 60,
        allow_offline: true,
        allow_gcc_depfiles: true,
        max_entry_size_bytes: 0,
        max_cache_bytes: 1024 * 1024,
        async_upload_enabled: true,
        async_upload_cache_dir: std::env::temp_dir().join("remote-cache-proxy-it-placeholder"),
        max_pending_upload_bytes: 10 * 1024 * 1024,
        log_file: None,
    };
    overrides(&mut config);
    config
}

struct Harness {
    router: RequestRouter,
    store: Arc<FakeStore>,
    spool_dir: tempfile::TempDir,
}

fn harness(overrides: impl FnOnce(&mut Config)) -> Harness {
    let spool_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FakeStore::new());
    let mut config = config(overrides);
    config.async_upload_cache_dir = spool_dir.path().to_path_buf();

    let cache = Arc::new(MemoryCache::new(config.max_cache_bytes, config.max_entry_size_bytes));
    let spooler = Arc::new(UploadSpooler::new(
        config.async_upload_cache_dir.clone(),
        config.max_entry_size_bytes,
        config.max_pending_upload_bytes,
    ));
    let breaker = CircuitBreaker::new(config.errors_before_pausing, Duration::from_secs(config.pause_minutes * 60));
    let watchdog = Arc::new(IdleWatchdog::new(0, || {}));
    let shutdown = Arc::new(ShutdownCoordinator::new(spooler.clone()));
    let router = RequestRouter::new(cache, spooler, breaker, watchdog, store.clone(), shutdown, Arc::new(config));

    Harness { router, store, spool_dir }
}

fn empty_body() -> RequestBody {
    Empty::new()
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed_unsync()
}

fn full_body(bytes: &'static [u8]) -> RequestBody {
    Full::from(Bytes::from_static(bytes))
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed_unsync()
}

fn request(method: Method, path: &str, body: RequestBody) -> Request {
    hyper::Request::builder().method(method).uri(path).body(body).unwrap()
}

#[tokio::test]
async fn ping_responds_pong() {
    let h = harness(|_| {});
    let resp = h.router.handle(request(Method::GET, "/ping", empty_body())).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn async_put_responds_before_upload_completes_then_spool_file_disappears() {
    let h = harness(|c| c.async_upload_enabled = true);

    let resp = h
        .router
        .handle(request(Method::PUT, "/a/b/c", full_body(b"HELLO")))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    // Give the detached upload task a chance to run to completion.
    for _ in 0..20 {
        if !h.spool_dir.path().join("a/b/c").exists() {
            break;
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!h.spool_dir.path().join("a/b/c").exists());
}

#[tokio::test]
async fn put_then_get_is_served_from_cache() {
    let h = harness(|c| c.async_upload_enabled = false);

    let put_resp = h.router.handle(request(Method::PUT, "/a/b/c", full_body(b"HELLO"))).await;
    assert_eq!(put_resp.status(), StatusCode::OK);

    // Any further remote call would fail; a cache hit must not make one.
    h.store
        .fail_next_calls(10, remote_cache_proxy::store::fake::FakeFailure::Other(500));

    let get_resp = h.router.handle(request(Method::GET, "/a/b/c", empty_body())).await;
    assert_eq!(get_resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn get_then_cached_get_round_trips() {
    let h = harness(|_| {});
    h.store.seed("a/b/c", Bytes::from_static(b"HELLO"));

    let resp1 = h.router.handle(request(Method::GET, "/a/b/c", empty_body())).await;
    assert_eq!(resp1.status(), StatusCode::OK);

    let resp2 = h.router.handle(request(Method::GET, "/a/b/c", empty_body())).await;
    assert_eq!(resp2.status(), StatusCode::OK);
}

#[tokio::test]
async fn depfile_body_is_blocked_and_not_cached() {
    let h = harness(|c| c.allow_gcc_depfiles = false);
    h.store.seed("x", Bytes::from_static(b".o: \\\nrest of depfile"));

    let resp = h.router.handle(request(Method::GET, "/x", empty_body())).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn breaker_open_with_allow_offline_put_skips_remote_call() {
    let h = harness(|c| {
        c.errors_before_pausing = 1;
        c.allow_offline = true;
        c.async_upload_enabled = false;
    });

    h.store
        .fail_next_calls(1, remote_cache_proxy::store::fake::FakeFailure::Other(502));
    let _ = h.router.handle(request(Method::GET, "/missing", empty_body())).await;

    let calls_before = h.store.calls.load(std::sync::atomic::Ordering::SeqCst);
    let resp = h.router.handle(request(Method::PUT, "/q", full_body(b"X"))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(h.store.calls.load(std::sync::atomic::Ordering::SeqCst), calls_before);
    assert!(!h.spool_dir.path().join("q").exists());
}
