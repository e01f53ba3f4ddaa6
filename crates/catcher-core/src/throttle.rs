//! Adaptive rate-limit control.
//!
//! The service never says how fast is too fast; it only answers 429/503 or a
//! "server busy" page. Every such signal lands here:
//!
//! ```text
//! throttle signal ─► window (last 30, < 20 s old) ─► tier ─► global cool-down
//!                └─► busy counter ─[>= 100, once per 30 s]─► reconcile
//! scanner i throttled ─► scanner i backoff (500 ms), other scanners untouched
//! ```
//!
//! All types take an explicit `now` so the ledger can drive them from
//! `tokio::time::Instant` and tests can step time by hand.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

/// Tunables of the rate-limit controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum number of signals kept in the window.
    pub window_len: usize,
    /// Signals older than this no longer count.
    pub horizon: Duration,
    /// `(min_signals, cool-down)` tiers, checked from the first entry down.
    pub tiers: Vec<(usize, Duration)>,
    /// Cool-down when no tier matches.
    pub base: Duration,
    /// Busy-counter value that asks for a reconciliation.
    pub busy_threshold: u32,
    /// Minimum time between two busy-triggered reconciliations.
    pub busy_cooldown: Duration,
    /// Per-scanner pause after that scanner was throttled.
    pub scanner_backoff: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_len: 30,
            horizon: Duration::from_secs(20),
            tiers: vec![
                (8, Duration::from_millis(6000)),
                (5, Duration::from_millis(2500)),
                (3, Duration::from_millis(1000)),
            ],
            base: Duration::from_millis(400),
            busy_threshold: 100,
            busy_cooldown: Duration::from_secs(30),
            scanner_backoff: Duration::from_millis(500),
        }
    }
}

impl RateLimitConfig {
    /// Cool-down for a given number of recent signals.
    pub fn cooldown_for(&self, recent: usize) -> Duration {
        self.tiers
            .iter()
            .find(|(min, _)| recent >= *min)
            .map(|(_, d)| *d)
            .unwrap_or(self.base)
    }
}

/// What recording one throttle signal led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleOutcome {
    /// Signals inside the horizon, this one included.
    pub recent: usize,
    pub cooldown: Duration,
    /// The busy counter crossed its threshold; reconcile once.
    pub reconcile: bool,
}

/// Sliding window of throttle signals plus the busy counter.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: VecDeque<Instant>,
    cooling_until: Option<Instant>,
    busy: u32,
    last_busy_reconcile: Option<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_len + 1),
            config,
            cooling_until: None,
            busy: 0,
            last_busy_reconcile: None,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Record one throttle signal observed at `now`.
    pub fn record(&mut self, now: Instant) -> ThrottleOutcome {
        self.window.push_back(now);
        while self.window.len() > self.config.window_len {
            self.window.pop_front();
        }
        let recent = self.recent(now);
        let cooldown = self.config.cooldown_for(recent);
        self.cooling_until = Some(now + cooldown);

        self.busy = self.busy.saturating_add(1);
        let mut reconcile = false;
        if self.busy >= self.config.busy_threshold {
            let allowed = self
                .last_busy_reconcile
                .is_none_or(|last| now.duration_since(last) >= self.config.busy_cooldown);
            if allowed {
                self.last_busy_reconcile = Some(now);
                self.busy = 0;
                reconcile = true;
            }
        }

        ThrottleOutcome {
            recent,
            cooldown,
            reconcile,
        }
    }

    /// Signals younger than the horizon.
    pub fn recent(&self, now: Instant) -> usize {
        self.window
            .iter()
            .filter(|t| now.duration_since(**t) < self.config.horizon)
            .count()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn busy_count(&self) -> u32 {
        self.busy
    }

    /// Whether the global cool-down is still active.
    pub fn is_cooling(&self, now: Instant) -> bool {
        self.cooling_until.is_some_and(|until| now < until)
    }

    /// Time left on the global cool-down.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.cooling_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.cooling_until = None;
        self.busy = 0;
        self.last_busy_reconcile = None;
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

/// Per-scanner backoff deadlines. Throttling one scanner never delays
/// another.
#[derive(Debug, Clone, Default)]
pub struct ScannerBackoff {
    deadlines: HashMap<usize, Instant>,
}

impl ScannerBackoff {
    pub fn back_off(&mut self, scanner: usize, until: Instant) {
        self.deadlines.insert(scanner, until);
    }

    /// Remaining wait for `scanner`, zero if it may poll now.
    pub fn wait_for(&self, scanner: usize, now: Instant) -> Duration {
        self.deadlines
            .get(&scanner)
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    pub fn prune(&mut self, now: Instant) {
        self.deadlines.retain(|_, until| *until > now);
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn tiers_follow_window_density() {
        let mut rl = RateLimiter::default();
        let t0 = Instant::now();
        let cooldowns: Vec<Duration> = (0..10).map(|i| rl.record(t0 + MS * i).cooldown).collect();
        assert_eq!(cooldowns[0], MS * 400);
        assert_eq!(cooldowns[1], MS * 400);
        assert_eq!(cooldowns[2], MS * 1000);
        assert_eq!(cooldowns[4], MS * 2500);
        assert_eq!(cooldowns[7], MS * 6000);
        assert_eq!(cooldowns[9], MS * 6000);
    }

    #[test]
    fn tier_is_monotonic_in_signal_count() {
        let config = RateLimitConfig::default();
        let mut prev = Duration::ZERO;
        for n in 0..=40 {
            let d = config.cooldown_for(n);
            assert!(d >= prev, "cool-down dropped at {n}");
            prev = d;
        }
    }

    #[test]
    fn window_is_bounded_and_old_signals_expire() {
        let mut rl = RateLimiter::default();
        let t0 = Instant::now();
        for i in 0..50 {
            rl.record(t0 + MS * i);
        }
        assert_eq!(rl.window_len(), 30);

        let later = t0 + Duration::from_secs(25);
        assert_eq!(rl.recent(later), 0);
        let outcome = rl.record(later);
        assert_eq!(outcome.recent, 1);
        assert_eq!(outcome.cooldown, MS * 400);
    }

    #[test]
    fn global_cooldown_expires() {
        let mut rl = RateLimiter::default();
        let t0 = Instant::now();
        rl.record(t0);
        assert!(rl.is_cooling(t0 + MS * 399));
        assert!(!rl.is_cooling(t0 + MS * 400));
        assert_eq!(rl.remaining(t0 + MS * 100), MS * 300);
    }

    #[test]
    fn busy_counter_requests_one_reconcile_per_cooldown() {
        let mut rl = RateLimiter::default();
        let t0 = Instant::now();
        let mut triggers = Vec::new();
        for i in 0..250u32 {
            if rl.record(t0 + MS * i).reconcile {
                triggers.push(i);
            }
        }
        // 100th signal triggers and resets; the next crossing falls inside
        // the 30 s cool-down and is suppressed.
        assert_eq!(triggers, vec![99]);
        assert!(rl.busy_count() >= 100);

        let after = t0 + Duration::from_secs(31);
        assert!(rl.record(after).reconcile);
        assert_eq!(rl.busy_count(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut rl = RateLimiter::default();
        let t0 = Instant::now();
        rl.record(t0);
        rl.reset();
        assert_eq!(rl.window_len(), 0);
        assert_eq!(rl.busy_count(), 0);
        assert!(!rl.is_cooling(t0));
    }

    #[test]
    fn scanner_backoff_is_per_scanner() {
        let mut b = ScannerBackoff::default();
        let t0 = Instant::now();
        b.back_off(2, t0 + MS * 500);
        assert_eq!(b.wait_for(2, t0), MS * 500);
        assert_eq!(b.wait_for(0, t0), Duration::ZERO);
        assert_eq!(b.wait_for(2, t0 + MS * 600), Duration::ZERO);
        b.prune(t0 + MS * 600);
        assert_eq!(b.wait_for(2, t0), Duration::ZERO);
    }
}
