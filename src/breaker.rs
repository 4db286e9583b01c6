//! Consecutive-error counter with timed open state.
//!
//! A caching proxy should prefer "proceed without the cache" to "fail the
//! build", so once the remote store looks unhealthy the breaker opens and
//! the router stops contacting it until a cooldown elapses.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

struct Inner {
    consecutive_errors: AtomicU32,
    open: AtomicBool,
    /// Bumped every time the breaker opens; lets a stale auto-close timer
    /// from an earlier opening notice it's been superseded and no-op.
    epoch: AtomicU64,
    threshold: u32,
    pause: Duration,
}

/// Shared, cheaply-cloneable circuit breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, pause: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                consecutive_errors: AtomicU32::new(0),
                open: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                threshold,
                pause,
            }),
        }
    }

    /// Resets the consecutive-error count. Called after any successful
    /// remote call, including a store-reported "not found".
    pub fn on_success(&self) {
        self.inner.consecutive_errors.store(0, Ordering::Release);
    }

    /// Records a countable remote error. If this reaches the threshold and
    /// the breaker was closed, opens it and schedules an auto-close after
    /// the configured pause.
    pub fn on_error(&self) {
        let errors = self.inner.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
        if errors < self.inner.threshold {
            return;
        }
        if self.inner.open.swap(true, Ordering::AcqRel) {
            // already open
            return;
        }

        let epoch = self.inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.inner.pause).await;
            // Only close if no newer opening has superseded this timer.
            if this.inner.epoch.load(Ordering::Acquire) == epoch {
                this.inner.consecutive_errors.store(0, Ordering::Release);
                this.inner.open.store(false, Ordering::Release);
                tracing::info!("circuit breaker auto-closed after cooldown");
            }
        });

        tracing::warn!(errors, "circuit breaker opened");
    }

    /// Whether the breaker is currently open (remote calls short-circuited).
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }
}
