//! The HTTP state machine: dispatches by method, orchestrates the cache,
//! spooler, breaker, and remote store, and implements the response/error
//! policy.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use hyper::body::Body;
use hyper::{Method, StatusCode};

use crate::body::ProxyBody;
use crate::breaker::CircuitBreaker;
use crate::cache::MemoryCache;
use crate::config::Config;
use crate::depfile;
use crate::error::StoreError;
use crate::shutdown::ShutdownCoordinator;
use crate::spooler::{AdmitOutcome, StageOutcome, UploadSpooler};
use crate::store::ObjectStoreClient;
use crate::types::{Request, RequestBody, Response};
use crate::watchdog::IdleWatchdog;

/// Orchestrates every other component to answer one HTTP request. Cheap to
/// clone: everything it owns is already `Arc`'d or internally synchronized.
pub struct RequestRouter {
    cache: Arc<MemoryCache>,
    spooler: Arc<UploadSpooler>,
    breaker: CircuitBreaker,
    watchdog: Arc<IdleWatchdog>,
    store: Arc<dyn ObjectStoreClient>,
    shutdown: Arc<ShutdownCoordinator>,
    config: Arc<Config>,
}

/// Per-request bookkeeping used only for the terminal log line.
struct RequestLog {
    method: Method,
    path: String,
    start: Instant,
    from_cache: bool,
    aws_paused: bool,
    is_blocked_gcc_depfile: bool,
    remote_ms: Option<u128>,
    response_len_override: Option<usize>,
}

impl RequestLog {
    fn new(method: Method, path: String) -> Self {
        Self {
            method,
            path,
            start: Instant::now(),
            from_cache: false,
            aws_paused: false,
            is_blocked_gcc_depfile: false,
            remote_ms: None,
            response_len_override: None,
        }
    }

    fn finish(&self, status: StatusCode, response_len: usize) {
        tracing::info!(
            method = %self.method,
            url = %self.path,
            status = status.as_u16(),
            response_length = response_len,
            elapsed_ms = self.start.elapsed().as_millis() as u64,
            remote_ms = self.remote_ms.map(|ms| ms as u64),
            from_cache = self.from_cache,
            aws_paused = self.aws_paused,
            is_blocked_gcc_depfile = self.is_blocked_gcc_depfile,
            "request handled",
        );
    }
}

impl RequestRouter {
    pub fn new(
        cache: Arc<MemoryCache>,
        spooler: Arc<UploadSpooler>,
        breaker: CircuitBreaker,
        watchdog: Arc<IdleWatchdog>,
        store: Arc<dyn ObjectStoreClient>,
        shutdown: Arc<ShutdownCoordinator>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            cache,
            spooler,
            breaker,
            watchdog,
            store,
            shutdown,
            config,
        }
    }

    /// Entry point called once per incoming request.
    pub async fn handle(&self, req: Request) -> Response {
        self.watchdog.kick();

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let mut log = RequestLog::new(method.clone(), path.clone());

        let response = match (&method, path.as_str()) {
            (&Method::GET, "/ping") => text_response(StatusCode::OK, "pong"),
            (&Method::GET, "/shutdown") => {
                self.shutdown.trigger(0, "http /shutdown request");
                text_response(StatusCode::OK, "shutting down")
            }
            (&Method::GET, _) => self.handle_get(&path, &mut log).await,
            (&Method::HEAD, _) => self.handle_head(&path, &mut log).await,
            (&Method::PUT, _) => self.handle_put(&path, req, &mut log).await,
            (&Method::DELETE, _) => self.handle_delete(&path, &mut log).await,
            _ => text_response(StatusCode::METHOD_NOT_ALLOWED, ""),
        };

        let (parts, body) = response.into_parts();
        let response_len = log
            .response_len_override
            .unwrap_or_else(|| body.size_hint().exact().unwrap_or(0) as usize);
        let status = parts.status;
        log.finish(status, response_len);

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Unrecoverable Error, shutting down");
            self.shutdown.trigger(1, "unrecoverable error");
        }

        Response::from_parts(parts, body)
    }

    fn key_of(path: &str) -> &str {
        path.strip_prefix('/').unwrap_or(path)
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.config.s3_prefix, key)
    }

    async fn handle_get(&self, path: &str, log: &mut RequestLog) -> Response {
        let key = Self::key_of(path);

        if let Some(bytes) = self.cache.get(key.as_bytes()) {
            log.from_cache = true;
            return bytes_response(StatusCode::OK, bytes.to_vec());
        }

        if self.breaker.is_open() {
            log.aws_paused = true;
            return text_response(StatusCode::NOT_FOUND, "");
        }

        let object_key = self.object_key(key);
        let remote_start = Instant::now();
        let result = self.store.get_object(&self.config.bucket, &object_key).await;
        log.remote_ms = Some(remote_start.elapsed().as_millis());

        match result {
            Ok(bytes) => {
                self.breaker.on_success();
                if !self.config.allow_gcc_depfiles && depfile::is_blocked_gcc_depfile(&bytes) {
                    log.is_blocked_gcc_depfile = true;
                    return text_response(StatusCode::NOT_FOUND, "");
                }
                self.cache.maybe_add(key.as_bytes(), Arc::from(bytes.as_ref()));
                bytes_response(StatusCode::OK, bytes.to_vec())
            }
            Err(err) => self.respond_to_store_error(err, false, log),
        }
    }

    async fn handle_head(&self, path: &str, log: &mut RequestLog) -> Response {
        let key = Self::key_of(path);

        if self.cache.contains(key.as_bytes()) {
            log.from_cache = true;
            return empty_status(StatusCode::OK);
        }

        if self.breaker.is_open() {
            log.aws_paused = true;
            return empty_status(StatusCode::NOT_FOUND);
        }

        let object_key = self.object_key(key);
        let remote_start = Instant::now();
        let result = self.store.head_object(&self.config.bucket, &object_key).await;
        log.remote_ms = Some(remote_start.elapsed().as_millis());

        match result {
            Ok(()) => {
                self.breaker.on_success();
                empty_status(StatusCode::OK)
            }
            Err(err) => self.respond_to_store_error(err, false, log),
        }
    }

    async fn handle_delete(&self, path: &str, log: &mut RequestLog) -> Response {
        let key = Self::key_of(path);
        self.cache.delete(key.as_bytes());

        let object_key = self.object_key(key);
        let remote_start = Instant::now();
        let result = self.store.delete_object(&self.config.bucket, &object_key).await;
        log.remote_ms = Some(remote_start.elapsed().as_millis());

        match result {
            Ok(()) => {
                self.breaker.on_success();
                text_response(StatusCode::OK, "")
            }
            Err(err) => self.respond_to_store_error(err, true, log),
        }
    }

    async fn handle_put(&self, path: &str, req: Request, log: &mut RequestLog) -> Response {
        let key = Self::key_of(path);
        if key.is_empty() {
            return text_response(StatusCode::FORBIDDEN, "");
        }

        let body_stream = incoming_data_stream(req.into_body());
        let stage_result = self.spooler.stage(key.as_bytes(), body_stream).await;

        let (size, body_bytes) = match stage_result {
            Ok(StageOutcome::Duplicate) => return text_response(StatusCode::OK, ""),
            Ok(StageOutcome::Accepted { size, bytes }) => (size, bytes),
            Err(e) => {
                tracing::warn!(error = %e, key, "failed to spool PUT body");
                return text_response(StatusCode::OK, "");
            }
        };

        let spool_path = self.spooler.spool_path(key.as_bytes());

        if self.breaker.is_open() {
            log.aws_paused = true;
            let _ = std::fs::remove_file(&spool_path);
            return text_response(StatusCode::OK, "");
        }

        match self.spooler.try_admit(size) {
            Err(AdmitOutcome::TooLarge) => {
                tracing::info!(key, size, "exceeds max entry size");
                let _ = std::fs::remove_file(&spool_path);
                return text_response(StatusCode::OK, "");
            }
            Err(AdmitOutcome::BudgetExceeded) => {
                tracing::info!(key, size, "too many pending uploads");
                let _ = std::fs::remove_file(&spool_path);
                return text_response(StatusCode::OK, "");
            }
            Ok(()) => {}
        }

        // Admission succeeded: the entry is observable from the cache
        // immediately, independent of whether the upload itself is
        // synchronous or detached.
        self.cache.maybe_add(key.as_bytes(), Arc::from(body_bytes.as_ref()));

        let object_key = self.object_key(key);

        if self.config.async_upload_enabled {
            let spooler = self.spooler.clone();
            let store = self.store.clone();
            let breaker = self.breaker.clone();
            let bucket = self.config.bucket.clone();
            tokio::spawn(async move {
                if let Err(e) = spooler
                    .upload_and_finish(&spool_path, size, &*store, &bucket, &object_key, &breaker)
                    .await
                {
                    tracing::warn!(error = %e, "async upload failed");
                }
            });
            log.response_len_override = Some(size as usize);
            text_response(StatusCode::OK, "")
        } else {
            let remote_start = Instant::now();
            let result = self
                .spooler
                .upload_and_finish(&spool_path, size, &*self.store, &self.config.bucket, &object_key, &self.breaker)
                .await;
            log.remote_ms = Some(remote_start.elapsed().as_millis());

            match result {
                Ok(()) => text_response(StatusCode::OK, ""),
                Err(err) => self.respond_to_store_error(err, true, log),
            }
        }
    }

    /// Maps a [`StoreError`] to the §7 response/breaker policy, triggering a
    /// fatal shutdown for credential expiry (and for any other 500).
    fn respond_to_store_error(&self, err: StoreError, is_write: bool, log: &mut RequestLog) -> Response {
        match &err {
            StoreError::NotFound => {
                self.breaker.on_success();
                text_response(StatusCode::NOT_FOUND, "")
            }
            StoreError::CredentialExpiry(message) => {
                tracing::error!(message, "remote credentials expired or rejected");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "")
            }
            StoreError::Other { retryable, .. } => {
                if err.counts_toward_breaker() {
                    self.breaker.on_error();
                }
                if *retryable && self.config.allow_offline {
                    log.aws_paused = true;
                    let status = if is_write { StatusCode::OK } else { StatusCode::NOT_FOUND };
                    text_response(status, "")
                } else {
                    let status = StatusCode::from_u16(err.fallback_status()).unwrap_or(StatusCode::NOT_FOUND);
                    text_response(status, "")
                }
            }
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response {
    hyper::Response::builder()
        .status(status)
        .body(ProxyBody::from(body))
        .expect("static response is always well-formed")
}

fn bytes_response(status: StatusCode, body: Vec<u8>) -> Response {
    hyper::Response::builder()
        .status(status)
        .body(ProxyBody::from(body))
        .expect("byte response is always well-formed")
}

fn empty_status(status: StatusCode) -> Response {
    hyper::Response::builder()
        .status(status)
        .body(ProxyBody::empty())
        .expect("empty response is always well-formed")
}

/// Adapts a request body into a plain byte-chunk stream for the spooler,
/// dropping frame/trailer structure it doesn't need.
fn incoming_data_stream(
    body: RequestBody,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, crate::types::BoxError>> + Send>> {
    Box::pin(http_body_util::BodyStream::new(body).filter_map(|frame| async move {
        match frame {
            Ok(frame) => frame.into_data().ok().map(Ok),
            Err(e) => Some(Err(e)),
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http_body_util::{BodyExt, Empty, Full};

    use super::*;
    use crate::store::fake::{FakeFailure, FakeStore};

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

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".parse().unwrap(),
            port: 7799,
            bucket: "test-bucket".into(),
            s3_prefix: "prefix/".into(),
            s3_endpoint: None,
            region: "us-east-1".into(),
            idle_minutes: 0,
            socket_timeout_seconds: 60,
            errors_before_pausing: 3,
            pause_minutes: 60,
            allow_offline: false,
            allow_gcc_depfiles: false,
            max_entry_size_bytes: 0,
            max_cache_bytes: 1024 * 1024,
            async_upload_enabled: false,
            async_upload_cache_dir: std::env::temp_dir().join("remote-cache-proxy-test"),
            max_pending_upload_bytes: 1024 * 1024,
            log_file: None,
        }
    }

    fn test_router(store: Arc<FakeStore>, config: Config) -> (RequestRouter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MemoryCache::new(config.max_cache_bytes, config.max_entry_size_bytes));
        let spooler = Arc::new(UploadSpooler::new(
            dir.path().to_path_buf(),
            config.max_entry_size_bytes,
            config.max_pending_upload_bytes,
        ));
        let breaker = CircuitBreaker::new(config.errors_before_pausing, Duration::from_secs(config.pause_minutes * 60));
        let watchdog = Arc::new(IdleWatchdog::new(0, || {}));
        let shutdown = Arc::new(ShutdownCoordinator::new(spooler.clone()));
        let router = RequestRouter::new(cache, spooler, breaker, watchdog, store, shutdown, Arc::new(config));
        (router, dir)
    }

    #[tokio::test]
    async fn ping_returns_pong() {
        let store = Arc::new(FakeStore::new());
        let (router, _dir) = test_router(store, test_config());
        let req = request(Method::GET, "/ping", empty_body());
        let resp = router.handle(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_miss_then_hit_serves_from_cache() {
        let store = Arc::new(FakeStore::new());
        store.seed("prefix/a/b/c", Bytes::from_static(b"HELLO"));
        let mut config = test_config();
        config.allow_gcc_depfiles = true;
        let (router, _dir) = test_router(store, config);

        let resp1 = router.handle(request(Method::GET, "/a/b/c", empty_body())).await;
        assert_eq!(resp1.status(), StatusCode::OK);

        let resp2 = router.handle(request(Method::GET, "/a/b/c", empty_body())).await;
        assert_eq!(resp2.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_blocked_depfile_is_not_cached() {
        let store = Arc::new(FakeStore::new());
        store.seed("prefix/x", Bytes::from_static(b".o: \\\nrest"));
        let (router, _dir) = test_router(store, test_config());

        let resp = router.handle(request(Method::GET, "/x", empty_body())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn breaker_open_short_circuits_get() {
        let store = Arc::new(FakeStore::new());
        let mut config = test_config();
        config.errors_before_pausing = 1;
        let (router, _dir) = test_router(store.clone(), config);

        store.fail_next_calls(1, FakeFailure::Other(502));
        let _ = router.handle(request(Method::GET, "/missing-one", empty_body())).await;

        let calls_before = store.calls.load(std::sync::atomic::Ordering::SeqCst);
        let resp2 = router.handle(request(Method::GET, "/missing-two", empty_body())).await;
        assert_eq!(resp2.status(), StatusCode::NOT_FOUND);
        assert_eq!(store.calls.load(std::sync::atomic::Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn allow_offline_downgrades_retryable_get_to_404() {
        let store = Arc::new(FakeStore::new());
        let mut config = test_config();
        config.allow_offline = true;
        let (router, _dir) = test_router(store.clone(), config);

        store.fail_next_calls(1, FakeFailure::Retryable);
        let resp = router.handle(request(Method::GET, "/whatever", empty_body())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn put_empty_key_is_forbidden() {
        let store = Arc::new(FakeStore::new());
        let (router, _dir) = test_router(store, test_config());

        let resp = router.handle(request(Method::PUT, "/", empty_body())).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn put_then_get_round_trips_synchronously() {
        let store = Arc::new(FakeStore::new());
        let mut config = test_config();
        config.async_upload_enabled = false;
        let (router, _dir) = test_router(store.clone(), config);

        let put_resp = router.handle(request(Method::PUT, "/a/b/c", full_body(b"HELLO"))).await;
        assert_eq!(put_resp.status(), StatusCode::OK);

        let get_resp = router.handle(request(Method::GET, "/a/b/c", empty_body())).await;
        assert_eq!(get_resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn put_populates_cache_so_get_skips_the_remote_store() {
        let store = Arc::new(FakeStore::new());
        let mut config = test_config();
        config.async_upload_enabled = false;
        let (router, _dir) = test_router(store.clone(), config);

        let put_resp = router.handle(request(Method::PUT, "/a/b/c", full_body(b"HELLO"))).await;
        assert_eq!(put_resp.status(), StatusCode::OK);

        // Any further remote call would fail; a cache hit must not make one.
        store.fail_next_calls(10, FakeFailure::Other(500));

        let get_resp = router.handle(request(Method::GET, "/a/b/c", empty_body())).await;
        assert_eq!(get_resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn async_put_populates_cache_before_the_upload_completes() {
        let store = Arc::new(FakeStore::new());
        let mut config = test_config();
        config.async_upload_enabled = true;
        let (router, _dir) = test_router(store.clone(), config);

        let put_resp = router.handle(request(Method::PUT, "/a/b/c", full_body(b"HELLO"))).await;
        assert_eq!(put_resp.status(), StatusCode::OK);

        // Force any remote call to fail, proving the following GET is served
        // from the cache rather than racing the detached upload.
        store.fail_next_calls(10, FakeFailure::Other(500));

        let get_resp = router.handle(request(Method::GET, "/a/b/c", empty_body())).await;
        assert_eq!(get_resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn duplicate_concurrent_put_is_accepted_without_reupload() {
        let store = Arc::new(FakeStore::new());
        let config = test_config();
        let (router, dir) = test_router(store.clone(), config);

        // Simulate a PUT already in flight by pre-creating the spool file.
        let spool_path = dir.path().join("a");
        tokio::fs::write(&spool_path, b"partial").await.unwrap();

        let resp = router.handle(request(Method::PUT, "/a", full_body(b"HELLO"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(store.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsupported_method_is_405() {
        let store = Arc::new(FakeStore::new());
        let (router, _dir) = test_router(store, test_config());

        let resp = router.handle(request(Method::PATCH, "/a", empty_body())).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
