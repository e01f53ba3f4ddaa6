//! The ledger: single owner of all mutable acquisition state.
//!
//! Claim locks, the recently-claimed and believed-outstanding sets, the
//! rate-limit window, per-scanner backoff and the in-flight counter are all
//! touched from many tasks at once. Instead of sharing them behind locks,
//! one actor task owns them and every other task talks to it through a
//! [`LedgerHandle`]. Messages are applied one at a time, so the "at most one
//! burst per id" check-and-set is atomic by construction.
//!
//! The bookkeeping itself lives in [`ClaimBook`] and [`RateLimiter`], plain
//! structs that take an explicit `now` and are tested without the actor.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::{CooldownTable, OutstandingPolicy};
use crate::error::AppError;
use crate::listing::QueueSnapshot;
use crate::models::{ClaimGroupId, ItemCategory};
use crate::throttle::{RateLimitConfig, RateLimiter, ScannerBackoff, ThrottleOutcome};

/// Why a burst was not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Another burst for this id is in flight.
    Locked,
    /// Claimed moments ago; still cooling down.
    Recent,
    /// Believed to be held already.
    Outstanding,
    /// The global in-flight cap is exhausted.
    Saturated,
}

// ---------------------------------------------------------------------------
// ClaimBook
// ---------------------------------------------------------------------------

/// Per-id acquisition bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ClaimBook {
    /// id → when the lock was taken.
    locks: HashMap<ClaimGroupId, Instant>,
    /// id → end of the post-claim cool-down.
    recent: HashMap<ClaimGroupId, Instant>,
    /// id → optional expiry. `None` means held until reconciliation drops it.
    outstanding: HashMap<ClaimGroupId, Option<Instant>>,
    /// Ids ever seen with a mass-batch slot count during this run.
    batches: HashSet<ClaimGroupId>,
}

impl ClaimBook {
    pub fn category(&self, id: &ClaimGroupId, slots: u32, favorite: bool) -> ItemCategory {
        ItemCategory::classify(slots, favorite, self.batches.contains(id))
    }

    /// Check every gate, and take the lock if they all pass.
    pub fn try_lock(
        &mut self,
        id: &ClaimGroupId,
        category: ItemCategory,
        now: Instant,
    ) -> Result<(), Gate> {
        if self.locks.contains_key(id) {
            return Err(Gate::Locked);
        }
        if self.recent.get(id).is_some_and(|until| *until > now) {
            return Err(Gate::Recent);
        }
        if !category.is_exempt() && self.is_outstanding(id, now) {
            return Err(Gate::Outstanding);
        }
        self.locks.insert(id.clone(), now);
        Ok(())
    }

    pub fn release(&mut self, id: &ClaimGroupId) {
        self.locks.remove(id);
    }

    pub fn is_locked(&self, id: &ClaimGroupId) -> bool {
        self.locks.contains_key(id)
    }

    pub fn is_recent(&self, id: &ClaimGroupId, now: Instant) -> bool {
        self.recent.get(id).is_some_and(|until| *until > now)
    }

    pub fn is_outstanding(&self, id: &ClaimGroupId, now: Instant) -> bool {
        match self.outstanding.get(id) {
            Some(None) => true,
            Some(Some(expiry)) => *expiry > now,
            None => false,
        }
    }

    /// Record a win: release the lock and start the category cool-down.
    pub fn record_claim(
        &mut self,
        id: &ClaimGroupId,
        category: ItemCategory,
        cooldowns: &CooldownTable,
        now: Instant,
    ) {
        self.locks.remove(id);
        let cooldown = cooldowns.for_category(category);
        self.recent.insert(id.clone(), now + cooldown.recent);
        match cooldown.outstanding {
            OutstandingPolicy::Skip => {}
            OutstandingPolicy::Hold => {
                self.outstanding.insert(id.clone(), None);
            }
            OutstandingPolicy::Expire(ttl) => {
                self.outstanding.insert(id.clone(), Some(now + ttl));
            }
        }
    }

    /// Returns true if the id was not yet known as a batch.
    pub fn mark_batch(&mut self, id: &ClaimGroupId) -> bool {
        self.batches.insert(id.clone())
    }

    pub fn is_batch(&self, id: &ClaimGroupId) -> bool {
        self.batches.contains(id)
    }

    /// Merge the authoritative outstanding list into the believed set.
    ///
    /// Believed ids the authority no longer lists are dropped unless they
    /// were claimed moments ago (the authority may lag). Live ids are added
    /// unless they are known batches. Applying the same snapshot twice
    /// leaves the set unchanged.
    pub fn merge(&mut self, live: &HashSet<ClaimGroupId>, now: Instant) {
        let recent = &self.recent;
        self.outstanding.retain(|id, _| {
            live.contains(id) || recent.get(id).is_some_and(|until| *until > now)
        });
        for id in live {
            if !self.batches.contains(id) {
                self.outstanding.entry(id.clone()).or_insert(None);
            }
        }
    }

    /// Drop expired cool-downs and outstanding entries, and locks older than
    /// `stale_lock`. Returns the number of stale locks released.
    pub fn prune(&mut self, now: Instant, stale_lock: Duration) -> usize {
        self.recent.retain(|_, until| *until > now);
        self.outstanding
            .retain(|_, expiry| expiry.is_none_or(|e| e > now));
        let before = self.locks.len();
        self.locks
            .retain(|_, taken| now.duration_since(*taken) < stale_lock);
        before - self.locks.len()
    }

    pub fn clear(&mut self) {
        self.locks.clear();
        self.recent.clear();
        self.outstanding.clear();
        self.batches.clear();
    }

    pub fn outstanding_ids(&self, now: Instant) -> HashSet<ClaimGroupId> {
        self.outstanding
            .iter()
            .filter(|(_, expiry)| expiry.is_none_or(|e| e > now))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn recent_count(&self) -> usize {
        self.recent.len()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A started burst: its category and how many attempts it may fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstTicket {
    pub category: ItemCategory,
    pub granted: u32,
}

/// Point-in-time view of the ledger, for stats and the watchdog.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerStats {
    pub locks: usize,
    pub recent: usize,
    pub outstanding: usize,
    pub batches: usize,
    pub in_flight: usize,
    pub throttle_window: usize,
    pub busy_count: u32,
    pub cooling: bool,
    pub scans: u64,
    pub items_seen: u64,
    pub attempts: u64,
    pub accepted: u64,
    pub throttle_signals: u64,
    pub queue_size: u32,
    pub queue_free: u32,
    /// Milliseconds since the last completed listing poll.
    pub last_scan_age_ms: Option<u64>,
    /// Milliseconds since the last successful reconciliation.
    pub last_reconcile_age_ms: Option<u64>,
}

#[derive(Debug)]
enum LedgerMsg {
    BeginBurst {
        id: ClaimGroupId,
        slots: u32,
        favorite: bool,
        blasts: u32,
        reply: oneshot::Sender<Result<BurstTicket, Gate>>,
    },
    SlotsReleased(u32),
    Claimed {
        id: ClaimGroupId,
        category: ItemCategory,
    },
    Missed(ClaimGroupId),
    MarkBatch {
        id: ClaimGroupId,
        reply: oneshot::Sender<bool>,
    },
    Throttle {
        scanner: Option<usize>,
        reply: oneshot::Sender<ThrottleOutcome>,
    },
    ScannerWait {
        scanner: usize,
        reply: oneshot::Sender<Duration>,
    },
    Scanned {
        items: usize,
    },
    Reconciled(QueueSnapshot),
    IsOutstanding {
        id: ClaimGroupId,
        reply: oneshot::Sender<bool>,
    },
    IsCooling(oneshot::Sender<bool>),
    Prune {
        stale_lock: Duration,
        reply: oneshot::Sender<usize>,
    },
    Reset,
    Stats(oneshot::Sender<LedgerStats>),
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct LedgerState {
    book: ClaimBook,
    limiter: RateLimiter,
    backoff: ScannerBackoff,
    cooldowns: CooldownTable,
    in_flight_cap: usize,
    queue_capacity: u32,
    in_flight: usize,
    scans: u64,
    items_seen: u64,
    attempts: u64,
    accepted: u64,
    throttle_signals: u64,
    queue_size: u32,
    last_scan: Option<Instant>,
    last_reconcile: Option<Instant>,
}

impl LedgerState {
    fn handle(&mut self, msg: LedgerMsg, now: Instant) {
        match msg {
            LedgerMsg::BeginBurst {
                id,
                slots,
                favorite,
                blasts,
                reply,
            } => {
                let _ = reply.send(self.begin_burst(&id, slots, favorite, blasts, now));
            }
            LedgerMsg::SlotsReleased(n) => {
                self.in_flight = self.in_flight.saturating_sub(n as usize);
            }
            LedgerMsg::Claimed { id, category } => {
                self.accepted += 1;
                self.book
                    .record_claim(&id, category, &self.cooldowns, now);
            }
            LedgerMsg::Missed(id) => self.book.release(&id),
            LedgerMsg::MarkBatch { id, reply } => {
                let _ = reply.send(self.book.mark_batch(&id));
            }
            LedgerMsg::Throttle { scanner, reply } => {
                self.throttle_signals += 1;
                if let Some(scanner) = scanner {
                    let until = now + self.limiter.config().scanner_backoff;
                    self.backoff.back_off(scanner, until);
                }
                let _ = reply.send(self.limiter.record(now));
            }
            LedgerMsg::ScannerWait { scanner, reply } => {
                let _ = reply.send(self.backoff.wait_for(scanner, now));
            }
            LedgerMsg::Scanned { items } => {
                self.scans += 1;
                self.items_seen += items as u64;
                self.last_scan = Some(now);
            }
            LedgerMsg::Reconciled(snapshot) => {
                self.book.merge(&snapshot.live, now);
                self.queue_size = snapshot.size;
                self.last_reconcile = Some(now);
            }
            LedgerMsg::IsOutstanding { id, reply } => {
                let _ = reply.send(self.book.is_outstanding(&id, now));
            }
            LedgerMsg::IsCooling(reply) => {
                let _ = reply.send(self.limiter.is_cooling(now));
            }
            LedgerMsg::Prune { stale_lock, reply } => {
                let released = self.book.prune(now, stale_lock);
                self.backoff.prune(now);
                let _ = reply.send(released);
            }
            LedgerMsg::Reset => {
                self.book.clear();
                self.limiter.reset();
                self.backoff.clear();
                self.last_scan = Some(now);
                self.last_reconcile = None;
            }
            LedgerMsg::Stats(reply) => {
                let _ = reply.send(self.stats(now));
            }
        }
    }

    fn begin_burst(
        &mut self,
        id: &ClaimGroupId,
        slots: u32,
        favorite: bool,
        blasts: u32,
        now: Instant,
    ) -> Result<BurstTicket, Gate> {
        let category = self.book.category(id, slots, favorite);
        self.book.try_lock(id, category, now)?;
        let room = self.in_flight_cap.saturating_sub(self.in_flight);
        let granted = (blasts as usize).min(room) as u32;
        if granted == 0 {
            self.book.release(id);
            return Err(Gate::Saturated);
        }
        self.in_flight += granted as usize;
        self.attempts += u64::from(granted);
        Ok(BurstTicket { category, granted })
    }

    fn stats(&self, now: Instant) -> LedgerStats {
        let age = |t: Option<Instant>| t.map(|t| now.duration_since(t).as_millis() as u64);
        LedgerStats {
            locks: self.book.lock_count(),
            recent: self.book.recent_count(),
            outstanding: self.book.outstanding_ids(now).len(),
            batches: self.book.batch_count(),
            in_flight: self.in_flight,
            throttle_window: self.limiter.window_len(),
            busy_count: self.limiter.busy_count(),
            cooling: self.limiter.is_cooling(now),
            scans: self.scans,
            items_seen: self.items_seen,
            attempts: self.attempts,
            accepted: self.accepted,
            throttle_signals: self.throttle_signals,
            queue_size: self.queue_size,
            queue_free: self.queue_capacity.saturating_sub(self.queue_size),
            last_scan_age_ms: age(self.last_scan),
            last_reconcile_age_ms: age(self.last_reconcile),
        }
    }
}

/// Settings the ledger needs from the engine config.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub cooldowns: CooldownTable,
    pub rate_limit: RateLimitConfig,
    pub in_flight_cap: usize,
    pub queue_capacity: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cooldowns: CooldownTable::default(),
            rate_limit: RateLimitConfig::default(),
            in_flight_cap: 200,
            queue_capacity: 25,
        }
    }
}

/// Spawn the ledger actor on the current runtime and return its handle.
///
/// The actor exits once every handle has been dropped.
pub fn spawn_ledger(config: LedgerConfig) -> LedgerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut state = LedgerState {
        book: ClaimBook::default(),
        limiter: RateLimiter::new(config.rate_limit),
        backoff: ScannerBackoff::default(),
        cooldowns: config.cooldowns,
        in_flight_cap: config.in_flight_cap.max(1),
        queue_capacity: config.queue_capacity,
        in_flight: 0,
        scans: 0,
        items_seen: 0,
        attempts: 0,
        accepted: 0,
        throttle_signals: 0,
        queue_size: 0,
        last_scan: None,
        last_reconcile: None,
    };
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            state.handle(msg, Instant::now());
        }
        tracing::debug!("Ledger stopped");
    });
    LedgerHandle { tx }
}

/// Cloneable handle to the ledger actor.
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    tx: mpsc::UnboundedSender<LedgerMsg>,
}

fn closed() -> AppError {
    AppError::Generic("ledger is not running".into())
}

impl LedgerHandle {
    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> LedgerMsg) -> Result<T, AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    fn tell(&self, msg: LedgerMsg) {
        // A closed ledger means the engine is shutting down; nothing to do.
        let _ = self.tx.send(msg);
    }

    /// Take the claim lock for `id` and reserve up to `blasts` in-flight
    /// slots. The outer error is a closed ledger; the inner one says which
    /// gate refused the burst.
    pub async fn begin_burst(
        &self,
        id: &ClaimGroupId,
        slots: u32,
        favorite: bool,
        blasts: u32,
    ) -> Result<Result<BurstTicket, Gate>, AppError> {
        self.ask(|reply| LedgerMsg::BeginBurst {
            id: id.clone(),
            slots,
            favorite,
            blasts,
            reply,
        })
        .await
    }

    /// Release one in-flight slot when dropped.
    pub fn slot_guard(&self) -> SlotGuard {
        SlotGuard {
            ledger: self.clone(),
        }
    }

    pub fn record_claim(&self, id: &ClaimGroupId, category: ItemCategory) {
        self.tell(LedgerMsg::Claimed {
            id: id.clone(),
            category,
        });
    }

    pub fn release(&self, id: &ClaimGroupId) {
        self.tell(LedgerMsg::Missed(id.clone()));
    }

    /// Remember `id` as a mass batch. Returns true the first time.
    pub async fn mark_batch(&self, id: &ClaimGroupId) -> Result<bool, AppError> {
        self.ask(|reply| LedgerMsg::MarkBatch {
            id: id.clone(),
            reply,
        })
        .await
    }

    /// Record a throttle signal, optionally attributed to one scanner.
    pub async fn record_throttle(&self, scanner: Option<usize>) -> Result<ThrottleOutcome, AppError> {
        self.ask(|reply| LedgerMsg::Throttle { scanner, reply }).await
    }

    pub async fn scanner_wait(&self, scanner: usize) -> Result<Duration, AppError> {
        self.ask(|reply| LedgerMsg::ScannerWait { scanner, reply })
            .await
    }

    pub fn record_scan(&self, items: usize) {
        self.tell(LedgerMsg::Scanned { items });
    }

    pub fn apply_snapshot(&self, snapshot: QueueSnapshot) {
        self.tell(LedgerMsg::Reconciled(snapshot));
    }

    pub async fn is_outstanding(&self, id: &ClaimGroupId) -> Result<bool, AppError> {
        self.ask(|reply| LedgerMsg::IsOutstanding {
            id: id.clone(),
            reply,
        })
        .await
    }

    /// Whether the global rate-limit cool-down is active.
    pub async fn is_cooling(&self) -> Result<bool, AppError> {
        self.ask(LedgerMsg::IsCooling).await
    }

    pub async fn prune(&self, stale_lock: Duration) -> Result<usize, AppError> {
        self.ask(|reply| LedgerMsg::Prune { stale_lock, reply })
            .await
    }

    /// Wipe locks, cool-downs, believed-outstanding, batches, the rate
    /// window and scanner backoff. Counters survive.
    pub fn reset(&self) {
        self.tell(LedgerMsg::Reset);
    }

    pub async fn stats(&self) -> Result<LedgerStats, AppError> {
        self.ask(LedgerMsg::Stats).await
    }
}

/// Holds one in-flight claim slot; releases it on drop, whether the attempt
/// settled, timed out or was aborted.
#[derive(Debug)]
pub struct SlotGuard {
    ledger: LedgerHandle,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.ledger.tell(LedgerMsg::SlotsReleased(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ClaimGroupId {
        ClaimGroupId::from(s)
    }

    fn live(ids: &[&str]) -> HashSet<ClaimGroupId> {
        ids.iter().map(|s| id(s)).collect()
    }

    #[test]
    fn lock_blocks_second_burst() {
        let mut book = ClaimBook::default();
        let now = Instant::now();
        assert!(book.try_lock(&id("A"), ItemCategory::SingleSlot, now).is_ok());
        assert_eq!(
            book.try_lock(&id("A"), ItemCategory::SingleSlot, now),
            Err(Gate::Locked)
        );
        book.release(&id("A"));
        assert!(book.try_lock(&id("A"), ItemCategory::SingleSlot, now).is_ok());
    }

    #[test]
    fn single_slot_claim_is_held_until_reconciled() {
        let mut book = ClaimBook::default();
        let table = CooldownTable::default();
        let t0 = Instant::now();
        book.try_lock(&id("A"), ItemCategory::SingleSlot, t0).unwrap();
        book.record_claim(&id("A"), ItemCategory::SingleSlot, &table, t0);
        assert!(!book.is_locked(&id("A")));

        let t1 = t0 + Duration::from_secs(7);
        book.prune(t1, Duration::from_secs(10));
        assert!(!book.is_recent(&id("A"), t1));
        assert_eq!(
            book.try_lock(&id("A"), ItemCategory::SingleSlot, t1),
            Err(Gate::Outstanding)
        );

        // Authority no longer lists it.
        book.merge(&live(&[]), t1);
        assert!(book.try_lock(&id("A"), ItemCategory::SingleSlot, t1).is_ok());
    }

    #[test]
    fn multi_slot_outstanding_entry_expires() {
        let mut book = ClaimBook::default();
        let table = CooldownTable::default();
        let t0 = Instant::now();
        book.record_claim(&id("M"), ItemCategory::MultiSlot, &table, t0);
        assert_eq!(
            book.try_lock(&id("M"), ItemCategory::MultiSlot, t0 + Duration::from_secs(1)),
            Err(Gate::Recent)
        );
        assert!(book
            .try_lock(&id("M"), ItemCategory::MultiSlot, t0 + Duration::from_millis(2001))
            .is_ok());
    }

    #[test]
    fn exempt_categories_skip_outstanding_gate() {
        let mut book = ClaimBook::default();
        let t0 = Instant::now();
        book.merge(&live(&["B"]), t0);
        assert_eq!(
            book.try_lock(&id("B"), ItemCategory::SingleSlot, t0),
            Err(Gate::Outstanding)
        );
        assert!(book.try_lock(&id("B"), ItemCategory::MassBatch, t0).is_ok());
    }

    #[test]
    fn mass_batch_cooldown_is_short() {
        let mut book = ClaimBook::default();
        let table = CooldownTable::default();
        let t0 = Instant::now();
        book.mark_batch(&id("X"));
        book.try_lock(&id("X"), ItemCategory::MassBatch, t0).unwrap();
        book.record_claim(&id("X"), ItemCategory::MassBatch, &table, t0);
        let later = t0 + table.mass_batch + Duration::from_millis(1);
        assert!(book.try_lock(&id("X"), ItemCategory::MassBatch, later).is_ok());
        assert!(!book.is_outstanding(&id("X"), later));
    }

    #[test]
    fn merge_keeps_recent_claims_and_skips_batches() {
        let mut book = ClaimBook::default();
        let table = CooldownTable::default();
        let t0 = Instant::now();
        book.record_claim(&id("NEW"), ItemCategory::SingleSlot, &table, t0);
        book.merge(&live(&["OLD"]), t0);
        book.mark_batch(&id("BATCH"));

        book.merge(&live(&["BATCH", "OTHER"]), t0 + Duration::from_secs(1));
        let ids = book.outstanding_ids(t0 + Duration::from_secs(1));
        assert!(ids.contains(&id("NEW")), "recent claim must survive a lagging authority");
        assert!(ids.contains(&id("OTHER")));
        assert!(!ids.contains(&id("OLD")));
        assert!(!ids.contains(&id("BATCH")));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut book = ClaimBook::default();
        let table = CooldownTable::default();
        let t0 = Instant::now();
        book.record_claim(&id("A"), ItemCategory::SingleSlot, &table, t0);
        book.merge(&live(&["Z"]), t0);
        let snapshot = live(&["B", "C"]);
        let now = t0 + Duration::from_secs(1);
        book.merge(&snapshot, now);
        let once = book.outstanding_ids(now);
        book.merge(&snapshot, now);
        assert_eq!(book.outstanding_ids(now), once);
    }

    #[test]
    fn prune_releases_stale_locks() {
        let mut book = ClaimBook::default();
        let t0 = Instant::now();
        book.try_lock(&id("A"), ItemCategory::SingleSlot, t0).unwrap();
        assert_eq!(book.prune(t0 + Duration::from_secs(5), Duration::from_secs(10)), 0);
        assert_eq!(book.prune(t0 + Duration::from_secs(11), Duration::from_secs(10)), 1);
        assert!(!book.is_locked(&id("A")));
    }

    #[tokio::test]
    async fn actor_enforces_in_flight_cap() {
        let ledger = spawn_ledger(LedgerConfig {
            in_flight_cap: 5,
            ..LedgerConfig::default()
        });
        let first = ledger.begin_burst(&id("A"), 1, false, 4).await.unwrap().unwrap();
        assert_eq!(first.granted, 4);
        let second = ledger.begin_burst(&id("B"), 1, false, 4).await.unwrap().unwrap();
        assert_eq!(second.granted, 1);
        assert_eq!(
            ledger.begin_burst(&id("C"), 1, false, 4).await.unwrap(),
            Err(Gate::Saturated)
        );

        let guards: Vec<SlotGuard> = (0..5).map(|_| ledger.slot_guard()).collect();
        drop(guards);
        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.attempts, 5);
        // C was refused, so its lock must not linger.
        assert_eq!(stats.locks, 2);
    }

    #[tokio::test]
    async fn actor_serialises_concurrent_bursts_on_one_id() {
        let ledger = spawn_ledger(LedgerConfig::default());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.begin_burst(&id("HOT"), 1, false, 3).await.unwrap()
            }));
        }
        let mut started = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn actor_scanner_backoff_and_reset() {
        let ledger = spawn_ledger(LedgerConfig::default());
        let outcome = ledger.record_throttle(Some(3)).await.unwrap();
        assert_eq!(outcome.recent, 1);
        assert!(ledger.scanner_wait(3).await.unwrap() > Duration::ZERO);
        assert_eq!(ledger.scanner_wait(1).await.unwrap(), Duration::ZERO);
        assert!(ledger.is_cooling().await.unwrap());

        ledger.reset();
        assert_eq!(ledger.scanner_wait(3).await.unwrap(), Duration::ZERO);
        assert!(!ledger.is_cooling().await.unwrap());
        assert_eq!(ledger.stats().await.unwrap().throttle_signals, 1);
    }
}
