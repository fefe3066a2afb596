use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::store::KeyValueStore;

/// Periodic removal of expired store entries, owned by the process
/// lifecycle. Expired entries already read as absent, so a missed sweep
/// only costs memory.
pub struct Sweeper;

pub struct SweeperHandle {
    shutdown_token: CancellationToken,
    task: JoinHandle<()>,
}

impl Sweeper {
    pub fn spawn(store: Arc<dyn KeyValueStore>, interval: Duration) -> SweeperHandle {
        let shutdown_token = CancellationToken::new();
        let shutdown = shutdown_token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so the first pass runs one interval after boot.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Store sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match store.sweep().await {
                            Ok(0) => {}
                            Ok(removed) => {
                                counter!("store_sweep_removed_total").increment(removed as u64);
                                tracing::debug!(removed, "Expired store entries swept");
                            }
                            Err(e) => tracing::warn!(error = %e, "Store sweep failed"),
                        }
                    }
                }
            }
        });

        tracing::info!(interval_seconds = interval.as_secs(), "Store sweeper started");

        SweeperHandle {
            shutdown_token,
            task,
        }
    }
}

impl SweeperHandle {
    /// Stops the sweeper and waits for an in-flight pass to finish.
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Store sweeper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::{Clock, ManualClock};
    use crate::services::store::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries_and_stops() {
        let clock = ManualClock::default();
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::new(clock_arc));
        store
            .set("nonce:sso:a", "1", Duration::from_secs(1))
            .await
            .unwrap();
        store
            .set("nonce:sso:b", "1", Duration::from_secs(3600))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(2));

        let handle = Sweeper::spawn(store.clone(), Duration::from_secs(300));
        tokio::time::sleep(Duration::from_secs(301)).await;

        assert_eq!(store.len(), 1);
        handle.shutdown().await;
    }
}
