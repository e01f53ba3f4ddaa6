//! Scanner pool: concurrent listing pollers feeding the claim engine.
//!
//! Each scanner owns one [`ListingQuery`] and polls it in its own task. A
//! throttled response backs off that scanner only; a challenge stops the
//! scanner and hands the session to the supervisor, which tears the whole
//! pool down.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::claim::ClaimEngine;
use crate::classify::check_listing_reply;
use crate::context::{EngineCommand, EngineContext};
use crate::error::AppError;
use crate::listing::parse_listing;
use crate::query::ListingQuery;
use crate::reporter::{EngineEvent, Source};
use crate::traits::{Accept, Fetcher};

/// Reschedule delay after a throttled poll.
pub const THROTTLE_RESCHEDULE: Duration = Duration::from_millis(600);
/// Retry delay after a non-200 or unparseable listing.
pub const ERROR_RETRY: Duration = Duration::from_millis(300);
/// Retry delay after a transport failure.
pub const TRANSPORT_RETRY: Duration = Duration::from_millis(300);
/// Retry delay once a scanner has failed more than [`ESCALATE_AFTER`] times
/// in a row.
pub const TRANSPORT_RETRY_ESCALATED: Duration = Duration::from_millis(2000);
pub const ESCALATE_AFTER: u32 = 8;
/// Offset between the first polls of consecutive scanners.
const STAGGER: Duration = Duration::from_millis(50);
/// Keep-alive cadence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Listing queries for one run: one per scanner, then one per watched
/// requester.
pub fn scanner_queries(scanner_count: usize, watched_requesters: &[String]) -> Vec<ListingQuery> {
    (0..scanner_count.max(1))
        .map(ListingQuery::for_scanner)
        .chain(
            watched_requesters
                .iter()
                .map(|r| ListingQuery::Requester(r.clone())),
        )
        .collect()
}

/// A running set of scanners. Dropping the pool does not stop it; call
/// [`stop`](Self::stop).
pub struct ScannerPool {
    token: CancellationToken,
    tasks: JoinSet<()>,
    size: usize,
}

impl ScannerPool {
    /// Start every scanner under a child of `run`.
    pub fn start<F: Fetcher>(claims: &ClaimEngine<F>, run: &CancellationToken) -> Self {
        let config = &claims.context().config;
        let queries = scanner_queries(config.scanner_count, &config.watched_requesters);
        let token = run.child_token();
        let mut tasks = JoinSet::new();
        let size = queries.len();
        for (index, query) in queries.into_iter().enumerate() {
            let scanner = Scanner {
                index,
                query,
                claims: claims.clone(),
                token: token.clone(),
            };
            tasks.spawn(scanner.run());
        }
        tracing::debug!(scanners = size, "Scanner pool started");
        Self {
            token,
            tasks,
            size,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub async fn stop(mut self) {
        self.shutdown().await;
    }

    /// Replace every scanner with a fresh one.
    pub async fn restart<F: Fetcher>(&mut self, claims: &ClaimEngine<F>, run: &CancellationToken) {
        self.shutdown().await;
        *self = Self::start(claims, run);
    }

    async fn shutdown(&mut self) {
        self.token.cancel();
        while self.tasks.join_next().await.is_some() {}
    }
}

struct Scanner<F: Fetcher> {
    index: usize,
    query: ListingQuery,
    claims: ClaimEngine<F>,
    token: CancellationToken,
}

impl<F: Fetcher> Scanner<F> {
    async fn run(self) {
        let ctx = self.claims.context().clone();
        let source = Source::Scanner(self.index);
        tracing::debug!(scanner = self.index, query = %self.query.label(), "Scanner started");

        if !self.sleep(STAGGER * self.index as u32).await {
            return;
        }

        let mut streak: u32 = 0;
        loop {
            if self.token.is_cancelled() {
                break;
            }

            let wait = ctx.ledger.scanner_wait(self.index).await.unwrap_or_default();
            if !wait.is_zero() {
                if !self.sleep(wait).await {
                    break;
                }
                continue;
            }

            let url = ctx.endpoints.listing(&self.query);
            let timeout = ctx.config.timeouts.listing;
            let fetched = tokio::select! {
                r = tokio::time::timeout(timeout, ctx.fetcher.fetch(&url, Accept::Json, timeout)) => r,
                () = self.token.cancelled() => break,
            };
            let result = match fetched {
                Ok(r) => r,
                Err(_) => Err(AppError::Timeout(timeout.as_millis() as u64)),
            };

            let delay = match result.and_then(|reply| {
                check_listing_reply(&reply)?;
                parse_listing(&reply.body)
            }) {
                Ok(items) => {
                    streak = 0;
                    ctx.ledger.record_scan(items.len());
                    ctx.report(EngineEvent::ItemsScanned {
                        scanner: self.index,
                        count: items.len(),
                    });
                    self.claims.intake(items).await;
                    ctx.config.poll_delay
                }
                Err(AppError::Throttled(_)) => {
                    ctx.throttled(source).await;
                    THROTTLE_RESCHEDULE
                }
                Err(AppError::Challenge) => {
                    ctx.send(EngineCommand::ChallengeDetected { source });
                    break;
                }
                Err(e) => {
                    streak += 1;
                    let msg = e.to_string();
                    ctx.report(EngineEvent::ScannerError {
                        scanner: self.index,
                        error: &msg,
                        streak,
                    });
                    match e {
                        AppError::Transport(_) | AppError::Timeout(_) if streak > ESCALATE_AFTER => {
                            TRANSPORT_RETRY_ESCALATED
                        }
                        AppError::Transport(_) | AppError::Timeout(_) => TRANSPORT_RETRY,
                        _ => ERROR_RETRY,
                    }
                }
            };

            if !self.sleep(delay).await {
                break;
            }
        }
        tracing::debug!(scanner = self.index, "Scanner stopped");
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn sleep(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.token.is_cancelled();
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = self.token.cancelled() => false,
        }
    }
}

/// Keep the session warm with one small listing request a minute. Skipped
/// while the global cool-down is active.
pub async fn keepalive<F: Fetcher>(ctx: Arc<EngineContext<F>>, token: CancellationToken) {
    let mut tick = tokio::time::interval(KEEPALIVE_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the scanners already hit the
    // listing at startup.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            () = token.cancelled() => break,
        }
        if ctx.is_cooling().await {
            continue;
        }
        let url = ctx.endpoints.keepalive();
        let timeout = ctx.config.timeouts.listing;
        let result = match tokio::time::timeout(timeout, ctx.fetcher.fetch(&url, Accept::Json, timeout)).await {
            Ok(r) => r.and_then(|reply| check_listing_reply(&reply)),
            Err(_) => Err(AppError::Timeout(timeout.as_millis() as u64)),
        };
        match result {
            Ok(()) => tracing::trace!("Keep-alive ok"),
            Err(AppError::Challenge) => {
                ctx.send(EngineCommand::ChallengeDetected {
                    source: Source::KeepAlive,
                });
            }
            Err(AppError::Throttled(_)) => ctx.throttled(Source::KeepAlive).await,
            Err(e) => {
                let msg = e.to_string();
                ctx.report(EngineEvent::KeepAliveFailed { error: &msg });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HttpReply;
    use crate::testutil::{MockFetcher, MockReporter, TestHarness, challenge_page, item, listing_json};

    #[test]
    fn queries_cover_scanners_and_requesters() {
        let queries = scanner_queries(3, &["RWATCH".to_string()]);
        assert_eq!(queries.len(), 4);
        assert_eq!(queries[3], ListingQuery::Requester("RWATCH".into()));

        let many = scanner_queries(12, &[]);
        assert_eq!(many.len(), 12);
        assert_eq!(many[11], many[10]);
    }

    #[tokio::test]
    async fn scanners_feed_intake_and_record_scans() {
        let body = listing_json(&[item("3FRESH", 1)]);
        let fetcher = MockFetcher::new()
            .route("/projects.json", move |url| Ok(HttpReply::new(200, url, body.clone())))
            .route("/accept_random", |url| {
                Ok(HttpReply::new(200, url, "There are no more of these HITs available"))
            });
        let reporter = MockReporter::new();
        let harness = TestHarness::with_config(fetcher.clone(), reporter.clone(), |c| {
            c.scanner_count = 2;
        });
        let claims = harness.claims();

        let pool = ScannerPool::start(&claims, &harness.run);
        assert_eq!(pool.len(), 2);
        tokio::time::sleep(Duration::from_millis(300)).await;
        pool.stop().await;

        assert!(fetcher.count("/projects.json") >= 2);
        assert!(fetcher.count("3FRESH/tasks/accept_random") >= 1);
        assert!(reporter.count("items_scanned") >= 2);
        let stats = harness.ledger.stats().await.unwrap();
        assert!(stats.scans >= 2);
        assert!(stats.last_scan_age_ms.is_some());
    }

    #[tokio::test]
    async fn throttled_scanner_backs_off_alone() {
        let fetcher = MockFetcher::new()
            .route("/projects.json", |url| Ok(HttpReply::new(429, url, "")));
        let reporter = MockReporter::new();
        let harness = TestHarness::with_config(fetcher.clone(), reporter.clone(), |c| {
            c.scanner_count = 1;
        });
        let pool = ScannerPool::start(&harness.claims(), &harness.run);
        tokio::time::sleep(Duration::from_millis(500)).await;
        pool.stop().await;

        // One poll, then a 500 ms backoff plus the 600 ms reschedule.
        assert_eq!(fetcher.count("/projects.json"), 1);
        assert_eq!(reporter.count("throttled"), 1);
        let stats = harness.ledger.stats().await.unwrap();
        assert_eq!(stats.throttle_signals, 1);
    }

    #[tokio::test]
    async fn challenge_stops_the_scanner_and_escalates() {
        let fetcher = MockFetcher::new().route("/projects.json", |url| Ok(challenge_page(url)));
        let mut harness = TestHarness::with_config(fetcher.clone(), MockReporter::new(), |c| {
            c.scanner_count = 1;
        });
        let pool = ScannerPool::start(&harness.claims(), &harness.run);
        tokio::time::sleep(Duration::from_millis(200)).await;
        pool.stop().await;

        assert_eq!(fetcher.count("/projects.json"), 1);
        let commands = harness.drain_commands();
        assert!(commands.iter().any(|c| matches!(
            c,
            EngineCommand::ChallengeDetected {
                source: Source::Scanner(0)
            }
        )));
    }

    #[tokio::test]
    async fn transport_errors_retry_and_report_streak() {
        let fetcher = MockFetcher::new().route("/projects.json", |_| {
            Err(AppError::Transport("connection reset".into()))
        });
        let reporter = MockReporter::new();
        let harness = TestHarness::with_config(fetcher.clone(), reporter.clone(), |c| {
            c.scanner_count = 1;
        });
        let pool = ScannerPool::start(&harness.claims(), &harness.run);
        tokio::time::sleep(Duration::from_millis(750)).await;
        pool.stop().await;

        let polls = fetcher.count("/projects.json");
        assert!((2..=4).contains(&polls), "polls = {polls}");
        assert_eq!(reporter.count("scanner_error"), polls);
    }

    #[tokio::test]
    async fn cancelling_the_run_stops_the_pool() {
        let fetcher = MockFetcher::new().with_delay(Duration::from_secs(3));
        let harness = TestHarness::new(fetcher, MockReporter::new());
        let pool = ScannerPool::start(&harness.claims(), &harness.run);
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.run.cancel();
        tokio::time::timeout(Duration::from_secs(1), pool.stop())
            .await
            .expect("pool should stop promptly");
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_polls_once_a_minute() {
        let fetcher = MockFetcher::new();
        let harness = TestHarness::new(fetcher.clone(), MockReporter::new());
        let token = CancellationToken::new();
        let task = tokio::spawn(keepalive(harness.context.clone(), token.clone()));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fetcher.count("/projects.json"), 0);
        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(fetcher.count("/projects.json"), 2);

        token.cancel();
        task.await.unwrap();
    }
}
