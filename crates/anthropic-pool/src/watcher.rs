//! Hot-reload watcher for the accounts file
//!
//! Polls the backing accounts file's mtime on an interval and reloads the
//! pool when it changes. Poll-based rather than inotify-based: no extra
//! dependency, and the reconciliation logic in `Pool::reload_if_changed`
//! already has to tolerate an arbitrary gap between the file changing and
//! the pool noticing, so a short poll interval costs nothing in practice.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::pool::Pool;

/// How often the watcher checks the accounts file's mtime.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Spawn a background task that polls for accounts file changes and
/// reloads the pool when they occur. Returns a `JoinHandle` for the
/// spawned task.
pub fn spawn_hot_reload_task(pool: Arc<Pool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        pool.init_reload_baseline().await;
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if pool.reload_if_changed().await {
                debug!("hot reload applied");
            }
        }
    })
}
