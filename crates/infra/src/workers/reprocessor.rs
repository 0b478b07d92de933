//! Pending-entry reprocessor.
//!
//! Entries left in `Received` or `Error` (a crash between append and
//! processing, or a store hiccup mid-handler) are periodically re-driven
//! through the coordinator's transition pipeline. Entries past the attempt
//! cap stay in `Error` for out-of-band intervention.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::coordinator::SagaCoordinator;
use crate::saga_log::SagaLogStore;

pub struct Reprocessor<S> {
    store: S,
    coordinator: Arc<SagaCoordinator<S>>,
    interval: Duration,
    max_attempts: u32,
}

impl<S> Reprocessor<S>
where
    S: SagaLogStore + Clone + 'static,
{
    pub fn new(
        store: S,
        coordinator: Arc<SagaCoordinator<S>>,
        interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            coordinator,
            interval,
            max_attempts,
        }
    }

    /// Run one drain pass. Returns how many entries were re-driven.
    pub async fn drain_once(&self) -> usize {
        let pending = match self.store.find_pending(self.max_attempts).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, "could not load pending entries, skipping pass");
                return 0;
            }
        };

        let mut driven = 0;
        for entry in pending {
            match self.coordinator.reprocess_entry(&entry).await {
                Ok(()) => driven += 1,
                Err(err) => {
                    warn!(
                        entry_id = %entry.entry_id,
                        partner_id = %entry.partner_id,
                        error = %err,
                        "reprocessing failed, entry stays pending"
                    );
                }
            }
        }
        driven
    }

    /// Spawn the periodic drain loop.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "reprocessor started");
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let driven = self.drain_once().await;
                        if driven > 0 {
                            info!(driven, "reprocessed pending saga log entries");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("reprocessor stopped");
        })
    }
}
