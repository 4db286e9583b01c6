//! Idle-timeout watchdog: fires a shutdown callback after a period with no
//! requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A single renewable one-shot timer. Armed only when `idle_minutes > 0`;
/// every [`kick`](Self::kick) call postpones the fire time.
pub struct IdleWatchdog {
    generation: Arc<AtomicU64>,
    armed: bool,
}

impl IdleWatchdog {
    /// Spawns the watchdog task (if armed) and calls `on_fire` once, from
    /// that task, when `idle_minutes` elapses with no intervening `kick`.
    pub fn new<F>(idle_minutes: u64, on_fire: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let generation = Arc::new(AtomicU64::new(0));
        let armed = idle_minutes > 0;

        if armed {
            let generation = generation.clone();
            let idle = Duration::from_secs(idle_minutes * 60);
            tokio::spawn(async move {
                loop {
                    let seen = generation.load(Ordering::Acquire);
                    tokio::time::sleep(idle).await;
                    if generation.load(Ordering::Acquire) == seen {
                        on_fire();
                        break;
                    }
                }
            });
        }

        Self { generation, armed }
    }

    /// Cancels any pending fire and rearms the timer. Called at the entry
    /// of every request handler.
    pub fn kick(&self) {
        if self.armed {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
    }
}
