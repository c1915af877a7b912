//! Retention pruning task
//!
//! Watches the event-table byte estimate on a heartbeat. Once it exceeds
//! the configured ceiling, oldest rows are deleted in batches until the
//! estimate drops below 90% of the ceiling. Appends keep succeeding while
//! pruning runs; failures are retried with back-off and surfaced through
//! `stats()`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Store;

/// Rows deleted per batch. Small enough to keep the write lock responsive.
const BATCH_SIZE: usize = 500;

/// Pruning stops once the estimate falls below this fraction of the ceiling.
const LOW_WATERMARK: f64 = 0.9;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Run the pruning loop until cancelled. `on_change` fires when the pruning
/// flag flips, so the hub can push a fresh `db-status` to clients.
pub async fn run_pruner<F>(
    store: Arc<Store>,
    heartbeat: Duration,
    cancel: CancellationToken,
    on_change: F,
) where
    F: Fn() + Send + Sync + 'static,
{
    info!(
        byte_ceiling = store.byte_ceiling(),
        "Retention pruner started"
    );

    let mut interval = tokio::time::interval(heartbeat);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Retention pruner stopping");
                return;
            }
            _ = interval.tick() => {}
        }

        if store.event_bytes() < store.byte_ceiling() {
            continue;
        }

        let target = (store.byte_ceiling() as f64 * LOW_WATERMARK) as u64;
        info!(
            bytes = store.event_bytes(),
            target, "Byte ceiling exceeded, pruning oldest events"
        );

        store.set_pruning_active(true);
        on_change();

        let mut backoff = Duration::from_secs(1);
        while store.event_bytes() > target {
            if cancel.is_cancelled() {
                break;
            }

            let store_ref = Arc::clone(&store);
            let result =
                tokio::task::spawn_blocking(move || store_ref.delete_oldest(BATCH_SIZE)).await;

            match result {
                Ok(Ok((0, _))) => {
                    // Estimate drifted above reality; re-prime next heartbeat.
                    warn!("Pruner found no rows to delete despite byte estimate");
                    break;
                }
                Ok(Ok((deleted, freed))) => {
                    debug!(deleted, freed, remaining = store.event_bytes(), "Pruned batch");
                    store.set_last_prune_error(None);
                    backoff = Duration::from_secs(1);
                    // Yield between batches so appends and readers interleave.
                    tokio::task::yield_now().await;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Prune batch failed, backing off");
                    store.set_last_prune_error(Some(e.to_string()));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    warn!(error = %e, "Prune task panicked, backing off");
                    store.set_last_prune_error(Some(e.to_string()));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        store.set_pruning_active(false);
        on_change();
        info!(bytes = store.event_bytes(), "Pruning pass complete");
    }
}
