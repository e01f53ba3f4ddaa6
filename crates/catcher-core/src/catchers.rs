//! Dedicated catchers: tight claim loops aimed at one known item, outside of
//! the listing scan.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::claim::{BurstOutcome, ClaimEngine, ClaimTarget};
use crate::models::{ClaimGroupId, ItemDescriptor};
use crate::traits::Fetcher;

/// Cadence of an auto-started mass-batch catcher.
pub const BATCH_INTERVAL: Duration = Duration::from_millis(200);
/// Attempts per burst of a mass-batch catcher.
pub const BATCH_BLASTS: u32 = 3;

/// What a catcher loop is aimed at.
#[derive(Debug, Clone)]
pub enum CatcherKind {
    /// The operator's pinned item.
    Favorite(ClaimGroupId),
    /// A claim group on the watch list. Paused while it is believed
    /// outstanding.
    Watched(ClaimGroupId),
    /// A mass batch seen in the listing.
    Batch(ItemDescriptor),
}

impl CatcherKind {
    pub fn group_id(&self) -> &ClaimGroupId {
        match self {
            CatcherKind::Favorite(id) | CatcherKind::Watched(id) => id,
            CatcherKind::Batch(item) => &item.group_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CatcherKind::Favorite(_) => "favorite",
            CatcherKind::Watched(_) => "watched",
            CatcherKind::Batch(_) => "batch",
        }
    }

    fn target(&self) -> ClaimTarget {
        match self {
            CatcherKind::Favorite(id) => ClaimTarget {
                favorite: true,
                ..ClaimTarget::bare(id.clone())
            },
            CatcherKind::Watched(id) => ClaimTarget::bare(id.clone()),
            CatcherKind::Batch(item) => ClaimTarget::listed(item.clone()),
        }
    }
}

/// Catchers configured for every run: the favourite first, then the watch
/// list.
pub fn configured_catchers(
    favorite: Option<&ClaimGroupId>,
    watched: &[ClaimGroupId],
) -> Vec<CatcherKind> {
    favorite
        .cloned()
        .map(CatcherKind::Favorite)
        .into_iter()
        .chain(watched.iter().cloned().map(CatcherKind::Watched))
        .collect()
}

/// Run one catcher until `token` is cancelled.
///
/// Each round waits for its burst to settle before sleeping, so a catcher
/// never has more than one burst in flight. Rounds are skipped while the
/// global cool-down is active.
pub async fn run_catcher<F: Fetcher>(
    claims: ClaimEngine<F>,
    kind: CatcherKind,
    token: CancellationToken,
) {
    let ctx = claims.context().clone();
    let (interval, blasts) = match &kind {
        CatcherKind::Favorite(_) => (ctx.config.favorite_interval, ctx.config.favorite_blasts),
        CatcherKind::Watched(_) => (ctx.config.watched_interval, ctx.config.watched_blasts),
        CatcherKind::Batch(_) => (BATCH_INTERVAL, BATCH_BLASTS),
    };
    let target = kind.target();
    tracing::info!(kind = kind.label(), group_id = %kind.group_id(), "Catcher started");

    let mut wins = 0u64;
    loop {
        if token.is_cancelled() {
            break;
        }
        let skip = ctx.is_cooling().await
            || (matches!(kind, CatcherKind::Watched(_))
                && ctx
                    .ledger
                    .is_outstanding(kind.group_id())
                    .await
                    .unwrap_or(false));
        if !skip {
            match claims.fire(target.clone(), blasts).await {
                BurstOutcome::Won(_) => wins += 1,
                BurstOutcome::Challenge | BurstOutcome::Aborted => break,
                BurstOutcome::Skipped(_) | BurstOutcome::Missed { .. } => {}
            }
        }
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = token.cancelled() => break,
        }
    }
    tracing::info!(kind = kind.label(), group_id = %kind.group_id(), wins, "Catcher stopped");
}
