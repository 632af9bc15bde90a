//! Expiry Scheduling
//!
//! String keys written with a TTL get an entry in a deadline index ordered by
//! `(deadline, generation, key)`. Every string write is stamped with a fresh
//! generation, and overwriting a key cancels the deadline of the write it
//! replaces, so a stale timer can never delete a newer value.
//!
//! Expiry happens two ways:
//! 1. **Lazy**: reads treat a key past its deadline as absent and drop it.
//! 2. **Active**: the [`ExpirySweeper`] task sleeps until the earliest deadline,
//!    then removes due keys under the store guard.
//!
//! ## Sweeper Loop
//!
//! ```text
//!   ┌──────────────────────────────────────────────┐
//!   │ purge due keys (bounded batch, under guard)  │
//!   └──────────────────────┬───────────────────────┘
//!                          ▼
//!   sleep until next deadline ── or ── earlier deadline scheduled (Notify)
//!                          │            or shutdown (watch)
//!                          └──────────── loop
//! ```

use crate::storage::StorageEngine;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Generation stamp of a string write.
pub type Generation = u64;

/// Ordered index of pending string deadlines.
#[derive(Debug, Default)]
pub struct ExpiryIndex {
    deadlines: BTreeSet<(Instant, Generation, Bytes)>,
}

impl ExpiryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `key` (written with `generation`) to expire at `at`.
    ///
    /// Returns true if this is now the earliest pending deadline, in which
    /// case the sweeper has to be told to wake up sooner.
    pub fn schedule(&mut self, at: Instant, generation: Generation, key: Bytes) -> bool {
        let earliest = self.next_deadline().map_or(true, |next| at < next);
        self.deadlines.insert((at, generation, key));
        earliest
    }

    /// Cancels a deadline scheduled with [`schedule`](Self::schedule).
    pub fn cancel(&mut self, at: Instant, generation: Generation, key: &Bytes) {
        self.deadlines.remove(&(at, generation, key.clone()));
    }

    /// The earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(at, _, _)| *at)
    }

    /// Removes and returns the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(Generation, Bytes)> {
        match self.deadlines.first() {
            Some((at, _, _)) if *at <= now => self
                .deadlines
                .pop_first()
                .map(|(_, generation, key)| (generation, key)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Upper bound on keys removed while holding the guard once (default: 256)
    pub max_purge_per_pass: usize,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            max_purge_per_pass: 256,
        }
    }
}

/// A handle to the running expiry sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct ExpirySweeper {
    /// Sender to signal shutdown
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Starts the expiry sweeper as a background task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use streamkv::storage::{StorageEngine, ExpirySweeper, ExpiryConfig};
    /// use std::sync::Arc;
    ///
    /// let engine = Arc::new(StorageEngine::new());
    /// let sweeper = ExpirySweeper::start(engine, ExpiryConfig::default());
    ///
    /// // Dropping the handle stops the task
    /// drop(sweeper);
    /// ```
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(engine, config, shutdown_rx));

        info!("Background expiry sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the expiry sweeper.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
        debug!("Background expiry sweeper stopped");
    }
}

async fn sweeper_loop(
    engine: Arc<StorageEngine>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let (expired, next_deadline) = engine.purge_expired(config.max_purge_per_pass);

        if expired > 0 {
            debug!(
                expired = expired,
                keys_remaining = engine.len(),
                "Expired keys cleaned up"
            );
        }

        // A full batch means more keys may already be due
        if expired == config.max_purge_per_pass {
            tokio::task::yield_now().await;
            continue;
        }

        let sleep = async {
            match next_deadline {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = sleep => {}
            _ = engine.expiry_rescheduled() => {
                trace!("Earlier deadline scheduled, re-arming sweeper");
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper received shutdown signal");
                    return;
                }
            }
        }
    }
}

/// Starts the expiry sweeper with default configuration.
pub fn start_expiry_sweeper(engine: Arc<StorageEngine>) -> ExpirySweeper {
    ExpirySweeper::start(engine, ExpiryConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_index_orders_by_deadline() {
        let mut index = ExpiryIndex::new();
        let now = Instant::now();

        assert!(index.schedule(now + Duration::from_secs(5), 1, Bytes::from("late")));
        assert!(index.schedule(now + Duration::from_secs(1), 2, Bytes::from("early")));
        assert!(!index.schedule(now + Duration::from_secs(3), 3, Bytes::from("middle")));

        assert_eq!(index.next_deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(index.pop_due(now), None);

        let later = now + Duration::from_secs(4);
        assert_eq!(index.pop_due(later), Some((2, Bytes::from("early"))));
        assert_eq!(index.pop_due(later), Some((3, Bytes::from("middle"))));
        assert_eq!(index.pop_due(later), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_index_cancel() {
        let mut index = ExpiryIndex::new();
        let at = Instant::now();
        let key = Bytes::from("k");

        index.schedule(at, 7, key.clone());
        index.cancel(at, 6, &key);
        assert_eq!(index.len(), 1);

        index.cancel(at, 7, &key);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_cleans_expired_keys() {
        let engine = Arc::new(StorageEngine::new());

        for i in 0..10 {
            engine.set(
                Bytes::from(format!("key{}", i)),
                Bytes::from("value"),
                Some(Duration::from_millis(50)),
            );
        }
        engine.set(Bytes::from("persistent"), Bytes::from("value"), None);
        assert_eq!(engine.len(), 11);

        let _sweeper = start_expiry_sweeper(Arc::clone(&engine));

        tokio::time::sleep(Duration::from_millis(200)).await;

        // Physically removed, not just hidden
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.stats().pending_expiries, 0);
    }

    #[tokio::test]
    async fn test_sweeper_wakes_for_earlier_deadline() {
        let engine = Arc::new(StorageEngine::new());
        engine.set(
            Bytes::from("slow"),
            Bytes::from("v"),
            Some(Duration::from_secs(60)),
        );

        let _sweeper = start_expiry_sweeper(Arc::clone(&engine));
        tokio::time::sleep(Duration::from_millis(20)).await;

        engine.set(
            Bytes::from("fast"),
            Bytes::from("v"),
            Some(Duration::from_millis(30)),
        );
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(engine.len(), 1);
        assert_eq!(engine.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_sweeper_spares_overwritten_key() {
        let engine = Arc::new(StorageEngine::new());
        let _sweeper = start_expiry_sweeper(Arc::clone(&engine));
        let key = Bytes::from("session");

        engine.set(key.clone(), Bytes::from("old"), Some(Duration::from_millis(40)));
        engine.set(key.clone(), Bytes::from("new"), None);

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(engine.get(&key).unwrap(), Some(Bytes::from("new")));
        assert_eq!(engine.stats().expired, 0);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let engine = Arc::new(StorageEngine::new());

        {
            let _sweeper = start_expiry_sweeper(Arc::clone(&engine));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        engine.set(
            Bytes::from("key"),
            Bytes::from("value"),
            Some(Duration::from_millis(10)),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Nobody swept it, but reads still see it as gone
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.get(&Bytes::from("key")).unwrap(), None);
        assert_eq!(engine.len(), 0);
    }
}
