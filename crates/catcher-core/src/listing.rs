//! Parsing of listing and outstanding-queue responses.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::AppError;
use crate::models::{ClaimGroupId, ItemDescriptor, UNKNOWN_SLOTS};

/// Number that the service sometimes sends as a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Loose {
    Num(f64),
    Text(String),
}

impl Loose {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Loose::Num(n) => Some(*n),
            Loose::Text(s) => s.trim().trim_start_matches('$').parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawReward {
    amount_in_dollars: Option<Loose>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    hit_set_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    requester_id: Option<String>,
    #[serde(default)]
    requester_name: Option<String>,
    #[serde(default)]
    monetary_reward: Option<RawReward>,
    #[serde(default)]
    assignable_hits_count: Option<Loose>,
    #[serde(default)]
    number_of_hits_available: Option<Loose>,
    #[serde(default)]
    hits_available: Option<Loose>,
    #[serde(default)]
    last_updated_time: Option<String>,
    #[serde(default)]
    creation_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawListing {
    #[serde(default)]
    results: Vec<RawItem>,
}

impl RawItem {
    fn into_descriptor(self) -> Option<ItemDescriptor> {
        let group_id = self.hit_set_id.filter(|id| !id.trim().is_empty())?;
        let slots = [
            &self.assignable_hits_count,
            &self.number_of_hits_available,
            &self.hits_available,
        ]
        .into_iter()
        .find_map(|v| v.as_ref().and_then(Loose::as_f64))
        .map(|n| n.max(0.0).min(u32::MAX as f64) as u32)
        .unwrap_or(UNKNOWN_SLOTS);
        let reward = self
            .monetary_reward
            .and_then(|r| r.amount_in_dollars)
            .and_then(|a| a.as_f64())
            .filter(|r| r.is_finite())
            .unwrap_or(0.0);
        let updated_at = self
            .last_updated_time
            .or(self.creation_time)
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|t| t.with_timezone(&Utc));

        Some(ItemDescriptor {
            group_id: ClaimGroupId::new(group_id.trim()),
            title: self.title.unwrap_or_else(|| "HIT".to_string()),
            reward,
            requester_id: self.requester_id.unwrap_or_default(),
            requester_name: self.requester_name.unwrap_or_default(),
            slots,
            updated_at,
        })
    }
}

/// Parse a listing response into descriptors, in response order. Rows
/// without an id are dropped.
pub fn parse_listing(body: &str) -> Result<Vec<ItemDescriptor>, AppError> {
    let raw: RawListing = serde_json::from_str(body)
        .map_err(|e| AppError::Parse(format!("listing response: {e}")))?;
    Ok(raw
        .results
        .into_iter()
        .filter_map(RawItem::into_descriptor)
        .collect())
}

// ---------------------------------------------------------------------------
// Outstanding queue
// ---------------------------------------------------------------------------

/// Authoritative view of the items this account currently holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub live: HashSet<ClaimGroupId>,
    /// Number of held items as reported by the service.
    pub size: u32,
}

impl QueueSnapshot {
    pub fn free_slots(&self, capacity: u32) -> u32 {
        capacity.saturating_sub(self.size)
    }
}

#[derive(Debug, Deserialize)]
struct RawProject {
    hit_set_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    #[serde(default)]
    hit_set_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    project: Option<RawProject>,
}

#[derive(Debug, Deserialize)]
struct RawQueue {
    #[serde(default)]
    tasks: Option<Vec<RawTask>>,
    #[serde(default)]
    assignments: Option<Vec<RawTask>>,
    #[serde(default)]
    results: Option<Vec<RawTask>>,
    #[serde(default)]
    num_tasks_available: Option<Loose>,
    #[serde(default)]
    total_num_results: Option<Loose>,
    #[serde(default)]
    total: Option<Loose>,
}

/// Parse the outstanding-queue response.
pub fn parse_queue(body: &str) -> Result<QueueSnapshot, AppError> {
    let raw: RawQueue = serde_json::from_str(body)
        .map_err(|e| AppError::Parse(format!("queue response: {e}")))?;
    let tasks = raw
        .tasks
        .or(raw.assignments)
        .or(raw.results)
        .unwrap_or_default();
    let size = [&raw.num_tasks_available, &raw.total_num_results, &raw.total]
        .into_iter()
        .find_map(|v| v.as_ref().and_then(Loose::as_f64))
        .filter(|n| *n > 0.0)
        .map(|n| n as u32)
        .unwrap_or(tasks.len() as u32);
    let live = tasks
        .into_iter()
        .filter_map(|t| {
            t.hit_set_id
                .or(t.project_id)
                .or_else(|| t.project.and_then(|p| p.hit_set_id))
        })
        .filter(|id| !id.is_empty())
        .map(ClaimGroupId::from)
        .collect();
    Ok(QueueSnapshot { live, size })
}
