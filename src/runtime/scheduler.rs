//! Periodic refresh utility.
//!
//! Wraps an entity that wants `refresh(timestamp)` called on an interval.
//! The callback may return the delay until the next refresh; returning
//! `None` falls back to the configured default. Interval-backoff policy
//! (growing on failures) belongs to the callback, not to this utility.

use crate::util;
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[async_trait]
pub trait PeriodicUpdate: Send + Sync {
    /// Stable name used in logs.
    fn update_id(&self) -> String;

    /// Perform one refresh; optionally override the next interval.
    async fn refresh(&self, timestamp: f64) -> Option<Duration>;
}

/// Spawn the refresh loop for `target`. The first refresh runs immediately.
pub fn spawn_updater(
    target: Arc<dyn PeriodicUpdate>,
    default_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = target
                .refresh(util::timestamp())
                .await
                .unwrap_or(default_interval);
            debug!(
                "Next refresh of {} in {:.1} s.",
                target.update_id(),
                next.as_secs_f64()
            );
            tokio::time::sleep(next).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        count: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicUpdate for Counter {
        fn update_id(&self) -> String {
            "counter".to_string()
        }

        async fn refresh(&self, _timestamp: f64) -> Option<Duration> {
            self.count.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_on_default_interval() {
        let counter = Arc::new(Counter {
            count: AtomicUsize::new(0),
        });
        let handle = spawn_updater(counter.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(150)).await;
        // t=0, t=60 and t=120 have fired by now.
        assert_eq!(counter.count.load(Ordering::SeqCst), 3);
        handle.abort();
    }
}
