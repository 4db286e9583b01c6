//! Graceful teardown: log the reason, purge the spool directory, exit.
//!
//! Any in-flight background uploads are abandoned — async writes were never
//! promised durability.

use std::sync::Arc;
use std::time::Duration;

use crate::spooler::UploadSpooler;

/// A brief delay before `exit`, giving the in-flight response a chance to
/// flush to the client before the process disappears.
const EXIT_GRACE_PERIOD: Duration = Duration::from_millis(50);

pub struct ShutdownCoordinator {
    spooler: Arc<UploadSpooler>,
}

impl ShutdownCoordinator {
    pub fn new(spooler: Arc<UploadSpooler>) -> Self {
        Self { spooler }
    }

    /// Spawns the teardown sequence and returns immediately, so the caller
    /// (a request handler) can still finish writing its response.
    pub fn trigger(&self, exit_code: i32, reason: &'static str) {
        let spooler = self.spooler.clone();
        tokio::spawn(async move {
            tracing::info!(reason, exit_code, "shutting down");
            tokio::time::sleep(EXIT_GRACE_PERIOD).await;
            if let Err(e) = spooler.purge_all().await {
                tracing::warn!(error = %e, "failed to purge spool directory during shutdown");
            }
            std::process::exit(exit_code);
        });
    }
}
