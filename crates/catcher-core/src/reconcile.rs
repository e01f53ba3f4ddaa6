//! Queue reconciler: re-sync the believed-outstanding set with the service's
//! own list of outstanding work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::classify::check_listing_reply;
use crate::context::EngineContext;
use crate::error::AppError;
use crate::listing::parse_queue;
use crate::reporter::EngineEvent;
use crate::traits::{Accept, Fetcher};

/// Interval between scheduled reconciliations.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(8);

/// Result of one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Ids the service reports as outstanding.
    pub live: usize,
    /// Size of the believed-outstanding set after the merge.
    pub believed: usize,
    pub queue_size: u32,
    pub queue_free: u32,
}

/// Runs reconciliations, one at a time.
pub struct Reconciler<F: Fetcher> {
    ctx: Arc<EngineContext<F>>,
    busy: Arc<AtomicBool>,
}

impl<F: Fetcher> Clone for Reconciler<F> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            busy: self.busy.clone(),
        }
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<F: Fetcher> Reconciler<F> {
    pub fn new(ctx: Arc<EngineContext<F>>) -> Self {
        Self {
            ctx,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Fetch the outstanding queue and merge it into the ledger.
    ///
    /// Returns `Ok(None)` when another reconciliation is already running.
    /// Failures are reported and returned; they never touch the ledger.
    pub async fn run(&self) -> Result<Option<ReconcileSummary>, AppError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        let _guard = BusyGuard(&self.busy);

        match self.fetch_and_merge().await {
            Ok(summary) => {
                self.ctx.report(EngineEvent::Reconciled {
                    live: summary.live,
                    believed: summary.believed,
                    queue_size: summary.queue_size,
                });
                Ok(Some(summary))
            }
            Err(e) => {
                let msg = e.to_string();
                self.ctx.report(EngineEvent::ReconcileFailed { error: &msg });
                Err(e)
            }
        }
    }

    async fn fetch_and_merge(&self) -> Result<ReconcileSummary, AppError> {
        let url = self.ctx.endpoints.queue();
        let timeout = self.ctx.config.timeouts.queue;
        let reply = tokio::time::timeout(timeout, self.ctx.fetcher.fetch(&url, Accept::Json, timeout))
            .await
            .map_err(|_| AppError::Timeout(timeout.as_millis() as u64))??;
        check_listing_reply(&reply)?;
        let snapshot = parse_queue(&reply.body)?;
        let live = snapshot.live.len();
        let queue_size = snapshot.size;
        let queue_free = snapshot.free_slots(self.ctx.config.queue_capacity);

        self.ctx.ledger.apply_snapshot(snapshot);
        // Answered after the snapshot above: the actor handles messages in
        // order.
        let stats = self.ctx.ledger.stats().await?;

        Ok(ReconcileSummary {
            live,
            believed: stats.outstanding,
            queue_size,
            queue_free,
        })
    }
}
