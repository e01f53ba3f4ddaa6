use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Items listing more than this many slots are mass-batch items.
pub const MASS_BATCH_THRESHOLD: u32 = 100;

/// Slot count assumed when a listing row omits it.
pub const UNKNOWN_SLOTS: u32 = 9999;

/// Items at or below this many slots are fired before the rest of a page.
pub const SCARCE_THRESHOLD: u32 = 10;

/// Opaque identifier of one listed work item (a claim group).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimGroupId(String);

impl ClaimGroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClaimGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClaimGroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClaimGroupId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One row of a listing response. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemDescriptor {
    pub group_id: ClaimGroupId,
    pub title: String,
    /// Reward in dollars.
    pub reward: f64,
    pub requester_id: String,
    pub requester_name: String,
    /// Number of claimable slots currently available.
    pub slots: u32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ItemDescriptor {
    pub fn is_mass_batch(&self) -> bool {
        self.slots > MASS_BATCH_THRESHOLD
    }

    pub fn is_scarce(&self) -> bool {
        self.slots <= SCARCE_THRESHOLD
    }
}

/// Cool-down category of an item, derived from its slot count and pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemCategory {
    /// Only one copy exists.
    SingleSlot,
    /// A handful of copies; worth re-racing after a short pause.
    MultiSlot,
    /// Very large batch, re-acquired continuously.
    MassBatch,
    /// Operator-pinned item, re-acquired continuously.
    Favorite,
}

impl ItemCategory {
    /// Classify an item. `known_batch` is true when the id was seen earlier
    /// with a mass-batch slot count.
    pub fn classify(slots: u32, is_favorite: bool, known_batch: bool) -> Self {
        if is_favorite {
            ItemCategory::Favorite
        } else if known_batch || slots > MASS_BATCH_THRESHOLD {
            ItemCategory::MassBatch
        } else if slots > 1 {
            ItemCategory::MultiSlot
        } else {
            ItemCategory::SingleSlot
        }
    }

    /// Whether the category bypasses the believed-outstanding gate.
    pub fn is_exempt(&self) -> bool {
        matches!(self, ItemCategory::MassBatch | ItemCategory::Favorite)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemCategory::SingleSlot => "single_slot",
            ItemCategory::MultiSlot => "multi_slot",
            ItemCategory::MassBatch => "mass_batch",
            ItemCategory::Favorite => "favorite",
        }
    }
}

impl fmt::Display for ItemCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw HTTP exchange as seen by the engine, after redirects were followed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    /// URL of the final response (differs from the request URL after a redirect).
    pub final_url: String,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, final_url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status,
            final_url: final_url.into(),
            body: body.into(),
        }
    }
}

/// Coordination signal shared by the instances of one operator group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Run,
    Stop,
    Kill,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Run => "RUN",
            Signal::Stop => "STOP",
            Signal::Kill => "KILL",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "RUN" => Ok(Signal::Run),
            "STOP" => Ok(Signal::Stop),
            "KILL" => Ok(Signal::Kill),
            _ => Err(format!("Unknown signal: {s}")),
        }
    }
}

/// Operator-group key scoping coordination signals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    /// Placeholder key used before (or instead of) a resolved group.
    pub const DEFAULT: &'static str = "DEFAULT";

    /// Build a key from a free-form group name.
    ///
    /// Upper-cases, turns whitespace runs into `_`, drops anything outside
    /// `[A-Z0-9_]` and truncates to 40 characters. An empty result maps to
    /// `DEFAULT`.
    pub fn sanitize(raw: &str) -> Self {
        let mut key = String::with_capacity(raw.len());
        let mut in_space = false;
        for c in raw.trim().chars() {
            if c.is_whitespace() {
                if !in_space {
                    key.push('_');
                }
                in_space = true;
                continue;
            }
            in_space = false;
            let c = c.to_ascii_uppercase();
            if c.is_ascii_alphanumeric() || c == '_' {
                key.push(c);
            }
        }
        key.truncate(40);
        if key.is_empty() {
            Self(Self::DEFAULT.to_string())
        } else {
            Self(key)
        }
    }

    pub fn default_group() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    /// The default key is not a real group; remote coordination stays off.
    pub fn is_default(&self) -> bool {
        self.0 == Self::DEFAULT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A successful acquisition, kept in the claimed-item history.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimRecord {
    pub group_id: ClaimGroupId,
    pub title: String,
    pub reward: f64,
    pub requester_name: String,
    pub category: ItemCategory,
    pub assignment_id: Option<String>,
    pub confidence: u8,
    pub claimed_at: DateTime<Utc>,
}
