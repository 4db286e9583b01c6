//! A localhost HTTP caching proxy in front of an S3-compatible remote build
//! cache.
//!
//! The build tool speaks a small `GET`/`PUT`/`HEAD`/`DELETE` protocol over
//! opaque keys; this crate serves hits out of an in-memory cache, stages
//! writes to disk and uploads them in the background, and degrades to
//! "proceed without the cache" rather than fail a build when the remote
//! store is unhealthy. See [`router::RequestRouter`] for the request
//! state machine that ties the rest of the modules together.

/// HTTP response body wrapper.
pub mod body;

/// Consecutive-error circuit breaker guarding the remote store.
pub mod breaker;

/// Bounded in-memory LRU cache of remote objects.
pub mod cache;

/// Command-line configuration.
pub mod config;

/// Content-based filter for build-tool depfiles.
pub mod depfile;

/// Process-boundary error type.
pub mod error;

/// Structured logging setup.
pub mod logging;

/// The HTTP request state machine.
pub mod router;

/// Hyper server bootstrap.
pub mod server;

/// Graceful teardown.
pub mod shutdown;

/// Remote object store client abstraction and S3 implementation.
pub mod store;

/// Core type aliases (`Request`, `Response`).
pub mod types;

/// Idle-timeout watchdog.
pub mod watchdog;

/// Asynchronous upload staging pipeline.
pub mod spooler;
