//! Claim engine: multi-shot bursts and listing intake.
//!
//! A burst fires B concurrent GETs at the claim endpoint for one item. Every
//! attempt classifies its own response; the first one to flip the burst's
//! shared `resolved` flag owns the win. Everything that settles afterwards is
//! discarded.

use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::classify::{Verdict, classify};
use crate::context::{EngineCommand, EngineContext};
use crate::error::AppError;
use crate::ledger::Gate;
use crate::models::{ClaimGroupId, ClaimRecord, ItemCategory, ItemDescriptor};
use crate::reporter::{EngineEvent, Source};
use crate::traits::{Accept, Fetcher};

/// What a claim burst is aimed at.
#[derive(Debug, Clone)]
pub struct ClaimTarget {
    pub item: ItemDescriptor,
    pub favorite: bool,
}

impl ClaimTarget {
    pub fn listed(item: ItemDescriptor) -> Self {
        Self {
            item,
            favorite: false,
        }
    }

    pub fn favorite(item: ItemDescriptor) -> Self {
        Self {
            item,
            favorite: true,
        }
    }

    /// Target known only by id. Treated as a single-slot item.
    pub fn bare(group_id: ClaimGroupId) -> Self {
        Self::listed(ItemDescriptor {
            group_id,
            title: "HIT".to_string(),
            reward: 0.0,
            requester_id: String::new(),
            requester_name: String::new(),
            slots: 1,
            updated_at: None,
        })
    }
}

/// Result of one burst.
#[derive(Debug, Clone)]
pub enum BurstOutcome {
    /// A gate refused the burst; nothing was sent.
    Skipped(Gate),
    Won(ClaimRecord),
    /// Every attempt settled without a win.
    Missed { attempts: u32 },
    /// A verification challenge cut the burst short.
    Challenge,
    /// The run ended while the burst was in flight.
    Aborted,
}

impl BurstOutcome {
    pub fn is_won(&self) -> bool {
        matches!(self, BurstOutcome::Won(_))
    }
}

enum Attempt {
    Won(ClaimRecord),
    Discarded,
    Lost,
    Challenge,
}

/// Fires claim bursts for one run. Cloning is cheap.
pub struct ClaimEngine<F: Fetcher> {
    ctx: Arc<EngineContext<F>>,
    run: CancellationToken,
}

impl<F: Fetcher> Clone for ClaimEngine<F> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            run: self.run.clone(),
        }
    }
}

impl<F: Fetcher> ClaimEngine<F> {
    pub fn new(ctx: Arc<EngineContext<F>>, run: CancellationToken) -> Self {
        Self { ctx, run }
    }

    pub fn context(&self) -> &Arc<EngineContext<F>> {
        &self.ctx
    }

    /// Blast count for an item with `slots` available.
    pub fn blasts_for(&self, slots: u32) -> u32 {
        self.ctx.config.blast_table.blasts_for(slots)
    }

    /// Fire a burst in the background, bound to the run.
    pub fn spawn_burst(&self, target: ClaimTarget, blasts: u32) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.fire(target, blasts).await;
        });
    }

    /// Fire up to `blasts` concurrent claim attempts for `target` and wait
    /// for all of them to settle.
    pub async fn fire(&self, target: ClaimTarget, blasts: u32) -> BurstOutcome {
        if self.run.is_cancelled() {
            return BurstOutcome::Aborted;
        }
        let id = target.item.group_id.clone();
        let ticket = match self
            .ctx
            .ledger
            .begin_burst(&id, target.item.slots, target.favorite, blasts)
            .await
        {
            Ok(Ok(ticket)) => ticket,
            Ok(Err(gate)) => return BurstOutcome::Skipped(gate),
            Err(_) => return BurstOutcome::Aborted,
        };
        self.ctx.report(EngineEvent::BurstFired {
            group_id: &id,
            blasts: ticket.granted,
            category: ticket.category,
        });

        let resolved = Arc::new(AtomicBool::new(false));
        let target = Arc::new(target);
        let mut attempts = JoinSet::new();
        for _ in 0..ticket.granted {
            let guard = self.ctx.ledger.slot_guard();
            let ctx = self.ctx.clone();
            let resolved = resolved.clone();
            let target = target.clone();
            let category = ticket.category;
            attempts.spawn(async move {
                let _slot = guard;
                attempt(&ctx, &target, category, &resolved).await
            });
        }

        let mut won = None;
        let mut challenged = false;
        loop {
            let next = tokio::select! {
                next = attempts.join_next() => next,
                () = self.run.cancelled() => {
                    attempts.abort_all();
                    if won.is_none() {
                        self.ctx.ledger.release(&id);
                    }
                    return BurstOutcome::Aborted;
                }
            };
            let Some(result) = next else { break };
            match result {
                Ok(Attempt::Won(record)) => won = Some(record),
                Ok(Attempt::Challenge) if !challenged => {
                    challenged = true;
                    attempts.abort_all();
                    self.ctx.send(EngineCommand::ChallengeDetected {
                        source: Source::Claim,
                    });
                }
                _ => {}
            }
        }

        match won {
            Some(record) => BurstOutcome::Won(record),
            None => {
                self.ctx.ledger.release(&id);
                if challenged {
                    BurstOutcome::Challenge
                } else {
                    self.ctx.report(EngineEvent::BurstMissed {
                        group_id: &id,
                        attempts: ticket.granted,
                    });
                    BurstOutcome::Missed {
                        attempts: ticket.granted,
                    }
                }
            }
        }
    }

    /// Hand one listing page to the claim engine.
    ///
    /// The first row is the newest item and is fired immediately. The rest
    /// are filtered (blocked requesters, empty items, reward floor), sorted
    /// newest first, and fired with scarce items ahead of the others.
    pub async fn intake(&self, items: Vec<ItemDescriptor>) {
        if items.is_empty() || self.run.is_cancelled() {
            return;
        }

        if let Some(newest) = items.first()
            && self.eligible(newest).await
        {
            self.note_batch(newest).await;
            self.spawn_burst(
                ClaimTarget::listed(newest.clone()),
                self.blasts_for(newest.slots),
            );
        }

        if let Some(favorite) = &self.ctx.config.favorite
            && let Some(item) = items.iter().find(|i| &i.group_id == favorite)
        {
            self.spawn_burst(
                ClaimTarget::favorite(item.clone()),
                self.ctx.config.watched_blasts,
            );
        }

        let mut rest = items;
        // Stable: rows without a timestamp keep their listing order, last.
        rest.sort_by_key(|i| Reverse(i.updated_at));

        let mut scarce = Vec::new();
        let mut normal = Vec::new();
        for item in rest {
            if !self.eligible(&item).await {
                continue;
            }
            self.note_batch(&item).await;
            if item.is_scarce() {
                scarce.push(item);
            } else {
                normal.push(item);
            }
        }

        for item in scarce.into_iter().chain(normal) {
            if self.run.is_cancelled() {
                return;
            }
            let blasts = self.blasts_for(item.slots);
            self.spawn_burst(ClaimTarget::listed(item), blasts);
        }
    }

    async fn eligible(&self, item: &ItemDescriptor) -> bool {
        let config = &self.ctx.config;
        if self.ctx.blocked.contains_key(&item.group_id) {
            return false;
        }
        if config
            .blocklist
            .is_blocked(&item.requester_id, &item.requester_name)
        {
            self.ctx.blocked.insert(item.group_id.clone(), ()).await;
            return false;
        }
        if item.slots == 0 {
            return false;
        }
        if config.min_reward > 0.0 && item.reward < config.min_reward {
            return false;
        }
        true
    }

    async fn note_batch(&self, item: &ItemDescriptor) {
        if !item.is_mass_batch() {
            return;
        }
        if let Ok(true) = self.ctx.ledger.mark_batch(&item.group_id).await {
            self.ctx.report(EngineEvent::BatchDetected {
                group_id: &item.group_id,
                title: &item.title,
            });
            self.ctx.send(EngineCommand::BatchDetected(item.clone()));
        }
    }
}

async fn attempt<F: Fetcher>(
    ctx: &EngineContext<F>,
    target: &ClaimTarget,
    category: ItemCategory,
    resolved: &AtomicBool,
) -> Attempt {
    let timeout = ctx.config.timeouts.claim;
    let url = ctx.endpoints.claim(&target.item.group_id);
    let reply = match tokio::time::timeout(timeout, ctx.fetcher.fetch(&url, Accept::Html, timeout))
        .await
    {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            tracing::trace!(group_id = %target.item.group_id, error = %e, "Claim attempt failed");
            return Attempt::Lost;
        }
        Err(_) => {
            let e = AppError::Timeout(timeout.as_millis() as u64);
            tracing::trace!(group_id = %target.item.group_id, error = %e, "Claim attempt timed out");
            return Attempt::Lost;
        }
    };

    match classify(&reply) {
        Verdict::Accepted {
            confidence,
            assignment_id,
        } => {
            if resolved
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Attempt::Discarded;
            }
            ctx.ledger.record_claim(&target.item.group_id, category);
            let record = ClaimRecord {
                group_id: target.item.group_id.clone(),
                title: target.item.title.clone(),
                reward: target.item.reward,
                requester_name: target.item.requester_name.clone(),
                category,
                assignment_id,
                confidence,
                claimed_at: Utc::now(),
            };
            ctx.report(EngineEvent::Claimed { record: &record });
            Attempt::Won(record)
        }
        Verdict::Throttled => {
            ctx.throttled(Source::Claim).await;
            Attempt::Lost
        }
        Verdict::Challenge => {
            if resolved.load(Ordering::Acquire) {
                Attempt::Discarded
            } else {
                Attempt::Challenge
            }
        }
        Verdict::Rejected(_) | Verdict::Unknown => Attempt::Lost,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testutil::{MockFetcher, MockReporter, TestHarness, item, work_item_redirect};

    const CLAIM_PATH: &str = "/accept_random";

    #[tokio::test]
    async fn single_slot_item_gets_six_attempts_and_one_win() {
        // Every attempt "succeeds"; only the first may count.
        let fetcher = MockFetcher::new().route(CLAIM_PATH, |url| Ok(work_item_redirect(url)));
        let reporter = MockReporter::new();
        let harness = TestHarness::new(fetcher.clone(), reporter.clone());
        let claims = harness.claims();

        let target = item("3SINGLE", 1);
        let blasts = claims.blasts_for(target.slots);
        assert_eq!(blasts, 6);

        let outcome = claims.fire(ClaimTarget::listed(target), blasts).await;
        assert!(outcome.is_won());
        assert_eq!(fetcher.count(CLAIM_PATH), 6);
        assert_eq!(reporter.count("claimed"), 1);

        let stats = harness.ledger.stats().await.unwrap();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.recent, 1);
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.locks, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn second_burst_inside_cooldown_is_a_noop() {
        let fetcher = MockFetcher::new().route(CLAIM_PATH, |url| Ok(work_item_redirect(url)));
        let harness = TestHarness::new(fetcher.clone(), MockReporter::new());
        let claims = harness.claims();

        let first = claims.fire(ClaimTarget::listed(item("3AGAIN", 1)), 6).await;
        assert!(first.is_won());
        let second = claims.fire(ClaimTarget::listed(item("3AGAIN", 1)), 6).await;
        assert!(matches!(second, BurstOutcome::Skipped(Gate::Recent)));
        assert_eq!(fetcher.count(CLAIM_PATH), 6);
    }

    #[tokio::test]
    async fn overlapping_bursts_fire_once() {
        let fetcher = MockFetcher::new()
            .route(CLAIM_PATH, |url| Ok(work_item_redirect(url)))
            .with_delay(Duration::from_millis(50));
        let harness = TestHarness::new(fetcher.clone(), MockReporter::new());
        let claims = harness.claims();

        let a = claims.fire(ClaimTarget::listed(item("3RACE", 1)), 3);
        let b = claims.fire(ClaimTarget::listed(item("3RACE", 1)), 3);
        let (a, b) = tokio::join!(a, b);
        let wins = [a.is_won(), b.is_won()].iter().filter(|w| **w).count();
        assert_eq!(wins, 1);
        assert_eq!(fetcher.count(CLAIM_PATH), 3);
    }

    #[tokio::test]
    async fn all_rejected_releases_the_lock() {
        let fetcher = MockFetcher::new().route(CLAIM_PATH, |url| {
            Ok(crate::models::HttpReply::new(
                200,
                url,
                "There are no more of these HITs available",
            ))
        });
        let reporter = MockReporter::new();
        let harness = TestHarness::new(fetcher, reporter.clone());
        let claims = harness.claims();

        let outcome = claims.fire(ClaimTarget::listed(item("3GONE", 1)), 4).await;
        assert!(matches!(outcome, BurstOutcome::Missed { attempts: 4 }));
        assert_eq!(reporter.count("burst_missed"), 1);
        // Eligible again straight away.
        let again = claims.fire(ClaimTarget::listed(item("3GONE", 1)), 1).await;
        assert!(matches!(again, BurstOutcome::Missed { attempts: 1 }));
    }

    #[tokio::test]
    async fn throttled_attempts_feed_the_limiter_without_ending_the_burst() {
        let fetcher = MockFetcher::new().route(CLAIM_PATH, |url| {
            Ok(crate::models::HttpReply::new(429, url, ""))
        });
        let harness = TestHarness::new(fetcher.clone(), MockReporter::new());
        let claims = harness.claims();

        let outcome = claims.fire(ClaimTarget::listed(item("3BUSY", 1)), 5).await;
        assert!(matches!(outcome, BurstOutcome::Missed { attempts: 5 }));
        assert_eq!(fetcher.count(CLAIM_PATH), 5);
        let stats = harness.ledger.stats().await.unwrap();
        assert_eq!(stats.throttle_signals, 5);
        assert!(stats.cooling);
    }

    #[tokio::test]
    async fn challenge_response_escalates() {
        let fetcher = MockFetcher::new().route(CLAIM_PATH, |url| {
            Ok(crate::models::HttpReply::new(200, url, "<form action=\"/validateCaptcha\">"))
        });
        let mut harness = TestHarness::new(fetcher, MockReporter::new());
        let claims = harness.claims();

        let outcome = claims.fire(ClaimTarget::listed(item("3CAP", 1)), 3).await;
        assert!(matches!(outcome, BurstOutcome::Challenge));
        let commands = harness.drain_commands();
        let challenges = commands
            .iter()
            .filter(|c| matches!(c, EngineCommand::ChallengeDetected { source: Source::Claim }))
            .count();
        assert_eq!(challenges, 1);
    }

    #[tokio::test]
    async fn mass_batch_items_skip_the_outstanding_gate() {
        let fetcher = MockFetcher::new().route(CLAIM_PATH, |url| Ok(work_item_redirect(url)));
        let harness = TestHarness::new(fetcher, MockReporter::new());
        let claims = harness.claims();

        let mut snapshot = crate::listing::QueueSnapshot::default();
        snapshot.live.insert(ClaimGroupId::from("3BATCH"));
        harness.ledger.apply_snapshot(snapshot);

        let single = claims.fire(ClaimTarget::listed(item("3BATCH", 1)), 1).await;
        assert!(matches!(single, BurstOutcome::Skipped(Gate::Outstanding)));

        let batch = claims.fire(ClaimTarget::listed(item("3BATCH", 500)), 1).await;
        let BurstOutcome::Won(record) = batch else {
            panic!("expected a win, got {batch:?}");
        };
        assert_eq!(record.category, ItemCategory::MassBatch);
    }

    #[tokio::test]
    async fn intake_filters_and_orders() {
        let fetcher = MockFetcher::new()
            .route(CLAIM_PATH, |url| {
                Ok(crate::models::HttpReply::new(200, url, "you are not qualified"))
            });
        let mut harness = TestHarness::with_config(
            fetcher.clone(),
            MockReporter::new(),
            |config| {
                config.min_reward = 0.10;
                config.blocklist = crate::config::Blocklist::new(["Spammy Co"]);
            },
        );
        let claims = harness.claims();

        let mut cheap = item("3CHEAP", 1);
        cheap.reward = 0.01;
        let mut blocked = item("3BLOCKED", 1);
        blocked.requester_name = "Spammy Co".into();
        let empty = item("3EMPTY", 0);
        let big = item("3BIG", 5000);
        let ok = item("3OK", 1);

        claims
            .intake(vec![ok.clone(), cheap, blocked, empty, big])
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let urls = fetcher.urls();
        assert!(urls.iter().any(|u| u.contains("3OK")));
        assert!(urls.iter().any(|u| u.contains("3BIG")));
        assert!(!urls.iter().any(|u| u.contains("3CHEAP")));
        assert!(!urls.iter().any(|u| u.contains("3BLOCKED")));
        assert!(!urls.iter().any(|u| u.contains("3EMPTY")));
        assert!(harness.context.blocked.contains_key(&ClaimGroupId::from("3BLOCKED")));

        let commands = harness.drain_commands();
        assert!(commands
            .iter()
            .any(|c| matches!(c, EngineCommand::BatchDetected(i) if i.group_id.as_str() == "3BIG")));
    }

    #[tokio::test]
    async fn cancelled_run_aborts_bursts() {
        let fetcher = MockFetcher::new()
            .route(CLAIM_PATH, |url| Ok(work_item_redirect(url)))
            .with_delay(Duration::from_secs(5));
        let harness = TestHarness::new(fetcher, MockReporter::new());
        let claims = harness.claims();

        let run = harness.run.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            run.cancel();
        });
        let outcome = claims.fire(ClaimTarget::listed(item("3SLOW", 1)), 3).await;
        assert!(matches!(outcome, BurstOutcome::Aborted));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = harness.ledger.stats().await.unwrap();
        assert_eq!(stats.locks, 0);
        assert_eq!(stats.in_flight, 0);
    }
}
