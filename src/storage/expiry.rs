//! Active expiry.
//!
//! Lazy eviction alone never reclaims a key that is not read again after its
//! deadline. While a server is running, a background task periodically calls
//! [`StorageEngine::cleanup_expired`]. The period adapts: it halves when a
//! large share of keys turned out to be expired and doubles when a sweep found
//! nothing, staying within `[min_interval, max_interval]`.
//!
//! The sweeper is never needed for correctness; expired entries are invisible
//! whether or not it runs.

use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Tuning for the background sweeper.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiryConfig {
    /// Starting interval between sweeps.
    pub base_interval: Duration,

    pub min_interval: Duration,

    pub max_interval: Duration,

    /// Sweep faster when more than this fraction of keys was expired.
    pub speedup_threshold: f64,

    /// Sweep slower when less than this fraction of keys was expired.
    pub slowdown_threshold: f64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            speedup_threshold: 0.25,
            slowdown_threshold: 0.01,
        }
    }
}

impl ExpiryConfig {
    /// Interval to use after a sweep that removed `expired` of `keys_before` keys.
    fn next_interval(&self, current: Duration, keys_before: u64, expired: u64) -> Duration {
        if keys_before == 0 {
            return current;
        }

        let rate = expired as f64 / keys_before as f64;
        if rate > self.speedup_threshold {
            (current / 2).max(self.min_interval)
        } else if expired == 0 && rate < self.slowdown_threshold {
            (current * 2).min(self.max_interval)
        } else {
            current
        }
    }
}

/// Handle to a running sweeper task. Dropping it stops the task.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ExpirySweeper {
    /// Spawns the sweeper on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime context, like `tokio::spawn`.
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(sweeper_loop(engine, config, shutdown_rx));

        debug!("Expiry sweeper started");

        Self { shutdown_tx, task }
    }

    /// Asks the task to exit after its current sweep.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    engine: Arc<StorageEngine>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper stopped");
                    return;
                }
            }
        }

        let keys_before = engine.len();
        let expired = engine.cleanup_expired();
        let next = config.next_interval(interval, keys_before, expired);

        if expired > 0 {
            debug!(
                expired,
                keys_remaining = engine.len(),
                interval_ms = next.as_millis() as u64,
                "Swept expired keys"
            );
        } else if next != interval {
            trace!(interval_ms = next.as_millis() as u64, "Sweeper backing off");
        }

        interval = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn fast_config() -> ExpiryConfig {
        ExpiryConfig {
            base_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_next_interval_adapts() {
        let config = ExpiryConfig::default();
        let base = config.base_interval;

        assert_eq!(config.next_interval(base, 100, 50), base / 2);
        assert_eq!(config.next_interval(base, 100, 0), base * 2);
        assert_eq!(config.next_interval(base, 100, 10), base);
        assert_eq!(config.next_interval(base, 0, 0), base);

        assert_eq!(
            config.next_interval(config.min_interval, 10, 10),
            config.min_interval
        );
        assert_eq!(
            config.next_interval(config.max_interval, 10, 0),
            config.max_interval
        );
    }

    #[tokio::test]
    async fn test_sweeper_reclaims_untouched_keys() {
        let engine = Arc::new(StorageEngine::new());

        for i in 0..10 {
            engine.set_with_ttl(
                Bytes::from(format!("temp{}", i)),
                Bytes::from("value"),
                Duration::from_millis(30),
            );
        }
        engine.set(Bytes::from("persistent"), Bytes::from("value"));
        assert_eq!(engine.len(), 11);

        let _sweeper = ExpirySweeper::start(Arc::clone(&engine), fast_config());
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Nothing read the temp keys, yet they are gone from the map.
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.stats().expired, 10);
    }

    #[tokio::test]
    async fn test_sweeper_exits_when_dropped() {
        let engine = Arc::new(StorageEngine::new());
        let sweeper = ExpirySweeper::start(Arc::clone(&engine), fast_config());
        tokio::time::sleep(Duration::from_millis(20)).await;

        sweeper.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sweeper.is_finished());

        engine.set_with_ttl(
            Bytes::from("key"),
            Bytes::from("value"),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Nobody swept it, but it is still invisible.
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.get(b"key"), None);
        assert_eq!(engine.len(), 0);
    }
}
