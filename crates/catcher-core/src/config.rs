//! Engine configuration.
//!
//! Every knob has a default matching what the live service tolerates;
//! [`EngineConfig::from_env`] overrides them from `CATCHER_*` variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::models::{ClaimGroupId, ItemCategory};

/// Hard ceiling on attempts per burst.
pub const MAX_BLASTS: u32 = 200;

/// Default endpoint root of the listing service.
pub const DEFAULT_BASE_URL: &str = "https://worker.mturk.com";

// ---------------------------------------------------------------------------
// Blast table
// ---------------------------------------------------------------------------

/// Maps an item's available-slot count to the number of claim attempts in
/// a burst.
///
/// Bands are `(upper_bound, blasts)` pairs sorted by bound; the first band
/// whose bound is `>= slots` wins, otherwise `fallback` applies. Values are
/// clamped to `1..=MAX_BLASTS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlastTable {
    bands: Vec<(u32, u32)>,
    fallback: u32,
}

impl BlastTable {
    pub fn new(mut bands: Vec<(u32, u32)>, fallback: u32) -> Self {
        bands.sort_by_key(|(bound, _)| *bound);
        Self { bands, fallback }
    }

    pub fn blasts_for(&self, slots: u32) -> u32 {
        let raw = self
            .bands
            .iter()
            .find(|(bound, _)| slots <= *bound)
            .map(|(_, blasts)| *blasts)
            .unwrap_or(self.fallback);
        raw.clamp(1, MAX_BLASTS)
    }
}

impl Default for BlastTable {
    fn default() -> Self {
        Self::new(
            vec![(1, 6), (3, 6), (5, 5), (20, 8), (100, 5), (999, 6)],
            10,
        )
    }
}

impl FromStr for BlastTable {
    type Err = AppError;

    /// Parse `"1:6,3:6,5:5,20:8,100:5,999:6,*:10"`. `*` sets the fallback.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bands = Vec::new();
        let mut fallback = None;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (bound, blasts) = part.split_once(':').ok_or_else(|| {
                AppError::ConfigError(format!("Invalid blast band '{part}': expected BOUND:BLASTS"))
            })?;
            let blasts: u32 = blasts.trim().parse().map_err(|_| {
                AppError::ConfigError(format!("Invalid blast count in band '{part}'"))
            })?;
            if blasts == 0 {
                return Err(AppError::ConfigError(format!(
                    "Blast count in band '{part}' must be at least 1"
                )));
            }
            match bound.trim() {
                "*" => fallback = Some(blasts),
                b => {
                    let bound: u32 = b.parse().map_err(|_| {
                        AppError::ConfigError(format!("Invalid slot bound in band '{part}'"))
                    })?;
                    bands.push((bound, blasts));
                }
            }
        }
        if bands.is_empty() && fallback.is_none() {
            return Err(AppError::ConfigError("Blast table is empty".into()));
        }
        let fallback = fallback.unwrap_or_else(|| bands.last().map(|(_, b)| *b).unwrap_or(1));
        Ok(Self::new(bands, fallback))
    }
}

impl fmt::Display for BlastTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bound, blasts) in &self.bands {
            write!(f, "{bound}:{blasts},")?;
        }
        write!(f, "*:{}", self.fallback)
    }
}

// ---------------------------------------------------------------------------
// Cool-downs
// ---------------------------------------------------------------------------

/// How a successful claim is recorded in the believed-outstanding set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutstandingPolicy {
    /// Not recorded; the item is re-acquired continuously.
    Skip,
    /// Recorded until the next reconciliation says otherwise.
    Hold,
    /// Recorded, and dropped again after the given time.
    Expire(Duration),
}

/// Cool-down applied after a successful claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldown {
    /// How long the id stays in the recently-claimed set.
    pub recent: Duration,
    pub outstanding: OutstandingPolicy,
}

/// Per-category cool-downs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownTable {
    pub single_slot: Duration,
    pub multi_slot: Duration,
    pub mass_batch: Duration,
    pub favorite: Duration,
}

impl CooldownTable {
    pub fn for_category(&self, category: ItemCategory) -> Cooldown {
        match category {
            ItemCategory::SingleSlot => Cooldown {
                recent: self.single_slot,
                outstanding: OutstandingPolicy::Hold,
            },
            ItemCategory::MultiSlot => Cooldown {
                recent: self.multi_slot,
                outstanding: OutstandingPolicy::Expire(self.multi_slot),
            },
            ItemCategory::MassBatch => Cooldown {
                recent: self.mass_batch,
                outstanding: OutstandingPolicy::Skip,
            },
            ItemCategory::Favorite => Cooldown {
                recent: self.favorite,
                outstanding: OutstandingPolicy::Skip,
            },
        }
    }

    /// Longest recent-claim TTL across categories.
    pub fn longest(&self) -> Duration {
        self.single_slot
            .max(self.multi_slot)
            .max(self.mass_batch)
            .max(self.favorite)
    }
}

impl Default for CooldownTable {
    fn default() -> Self {
        Self {
            single_slot: Duration::from_secs(6),
            multi_slot: Duration::from_secs(2),
            mass_batch: Duration::from_millis(150),
            favorite: Duration::from_millis(150),
        }
    }
}

// ---------------------------------------------------------------------------
// Requester blocklist
// ---------------------------------------------------------------------------

/// Requesters whose items are never claimed.
///
/// An entry matches a requester id exactly, or a requester name exactly
/// (case-insensitive). Entries of four or more characters also match any
/// name containing them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blocklist {
    entries: Vec<String>,
}

impl Blocklist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|e| e.as_ref().trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_blocked(&self, requester_id: &str, requester_name: &str) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let id = requester_id.trim().to_lowercase();
        let name = requester_name.trim().to_lowercase();
        self.entries.iter().any(|entry| {
            (!id.is_empty() && *entry == id)
                || (!name.is_empty()
                    && (*entry == name || (entry.chars().count() >= 4 && name.contains(entry.as_str()))))
        })
    }
}

// ---------------------------------------------------------------------------
// Engine config
// ---------------------------------------------------------------------------

/// Per-request deadlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub listing: Duration,
    pub claim: Duration,
    pub queue: Duration,
    pub probe: Duration,
    pub signal: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            listing: Duration::from_secs(5),
            claim: Duration::from_secs(7),
            queue: Duration::from_secs(8),
            probe: Duration::from_secs(15),
            signal: Duration::from_secs(8),
        }
    }
}

/// Configuration of one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the listing service, without trailing slash.
    pub base_url: String,
    /// Pause between two polls of one scanner.
    pub poll_delay: Duration,
    pub scanner_count: usize,
    pub blast_table: BlastTable,
    pub cooldowns: CooldownTable,
    /// Items paying less than this are ignored. 0 disables the floor.
    pub min_reward: f64,
    /// Global cap on claim attempts in flight.
    pub in_flight_cap: usize,
    /// Capacity of the outstanding queue on the remote service.
    pub queue_capacity: u32,
    pub timeouts: Timeouts,
    /// Interval of the low-frequency challenge probe.
    pub probe_interval: Duration,
    pub probe_enabled: bool,
    /// Operator-pinned item, claimed in a dedicated tight loop.
    pub favorite: Option<ClaimGroupId>,
    pub favorite_interval: Duration,
    pub favorite_blasts: u32,
    /// Claim groups polled directly, outside of the listing.
    pub watched_groups: Vec<ClaimGroupId>,
    pub watched_interval: Duration,
    pub watched_blasts: u32,
    /// Requesters that get a dedicated listing scanner each.
    pub watched_requesters: Vec<String>,
    pub blocklist: Blocklist,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_delay: Duration::from_millis(100),
            scanner_count: 6,
            blast_table: BlastTable::default(),
            cooldowns: CooldownTable::default(),
            min_reward: 0.0,
            in_flight_cap: 200,
            queue_capacity: 25,
            timeouts: Timeouts::default(),
            probe_interval: Duration::from_secs(600),
            probe_enabled: true,
            favorite: None,
            favorite_interval: Duration::from_millis(60),
            favorite_blasts: 100,
            watched_groups: Vec::new(),
            watched_interval: Duration::from_millis(60),
            watched_blasts: 10,
            watched_requesters: Vec::new(),
            blocklist: Blocklist::default(),
        }
    }
}

impl EngineConfig {
    /// Read configuration from environment variables, falling back to the
    /// defaults for anything unset.
    ///
    /// - `CATCHER_BASE_URL`
    /// - `CATCHER_POLL_DELAY_MS`
    /// - `CATCHER_SCANNERS` (1..=12)
    /// - `CATCHER_BLAST_TABLE` (e.g. `1:6,3:6,5:5,20:8,100:5,999:6,*:10`)
    /// - `CATCHER_MIN_REWARD` (dollars, 0 disables)
    /// - `CATCHER_PROBE_MINUTES` (1..=60, 0 disables the probe)
    /// - `CATCHER_FAVORITE`, `CATCHER_FAVORITE_INTERVAL_MS` (30..=2000)
    /// - `CATCHER_WATCH_GROUPS`, `CATCHER_WATCH_REQUESTERS` (comma-separated)
    /// - `CATCHER_BLOCKLIST` (comma-separated requester ids or names)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, AppError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("CATCHER_BASE_URL") {
            let url = url::Url::parse(raw.trim()).map_err(|e| {
                AppError::ConfigError(format!("Invalid CATCHER_BASE_URL '{raw}': {e}"))
            })?;
            config.base_url = url.as_str().trim_end_matches('/').to_string();
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "CATCHER_POLL_DELAY_MS")? {
            config.poll_delay = Duration::from_millis(ms);
        }

        if let Some(n) = parse_var::<usize>(&lookup, "CATCHER_SCANNERS")? {
            if !(1..=12).contains(&n) {
                return Err(AppError::ConfigError(format!(
                    "CATCHER_SCANNERS must be between 1 and 12, got {n}"
                )));
            }
            config.scanner_count = n;
        }

        if let Some(raw) = lookup("CATCHER_BLAST_TABLE") {
            config.blast_table = raw.parse()?;
        }

        if let Some(reward) = parse_var::<f64>(&lookup, "CATCHER_MIN_REWARD")? {
            if !reward.is_finite() || reward < 0.0 {
                return Err(AppError::ConfigError(format!(
                    "CATCHER_MIN_REWARD must be a non-negative amount, got {reward}"
                )));
            }
            config.min_reward = reward;
        }

        if let Some(minutes) = parse_var::<u64>(&lookup, "CATCHER_PROBE_MINUTES")? {
            if minutes == 0 {
                config.probe_enabled = false;
            } else {
                config.probe_interval = Duration::from_secs(minutes.clamp(1, 60) * 60);
            }
        }

        if let Some(raw) = lookup("CATCHER_FAVORITE") {
            let id = raw.trim();
            config.favorite = (!id.is_empty()).then(|| ClaimGroupId::from(id));
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "CATCHER_FAVORITE_INTERVAL_MS")? {
            config.favorite_interval = Duration::from_millis(ms.clamp(30, 2000));
        }

        if let Some(raw) = lookup("CATCHER_WATCH_GROUPS") {
            config.watched_groups = split_list(&raw).map(ClaimGroupId::from).collect();
        }

        if let Some(raw) = lookup("CATCHER_WATCH_REQUESTERS") {
            config.watched_requesters = split_list(&raw).map(str::to_string).collect();
        }

        if let Some(raw) = lookup("CATCHER_BLOCKLIST") {
            config.blocklist = Blocklist::new(split_list(&raw));
        }

        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_scanner_count(mut self, n: usize) -> Self {
        self.scanner_count = n.clamp(1, 12);
        self
    }

    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    pub fn with_favorite(mut self, id: impl Into<ClaimGroupId>) -> Self {
        self.favorite = Some(id.into());
        self
    }

    pub fn with_blocklist(mut self, blocklist: Blocklist) -> Self {
        self.blocklist = blocklist;
        self
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AppError::ConfigError(format!("Invalid {key} '{raw}'"))),
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}
