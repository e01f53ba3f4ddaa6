use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Body of `PUT /v1/signals/{group}`. `null` clears the group's signal.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SetSignalRequest {
    /// `"RUN"`, `"STOP"` or `null` (case-insensitive)
    #[schema(example = "RUN")]
    pub value: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SignalResponse {
    /// Sanitised group key
    pub group: String,
    /// `"RUN"`, `"STOP"` or `null` when never set
    pub value: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SignalListResponse {
    pub signals: Vec<SignalResponse>,
}

// ---------------------------------------------------------------------------
// Kill switch
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SetKillRequest {
    pub active: bool,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct KillResponse {
    pub active: bool,
    /// When the kill switch was last engaged
    pub since: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub groups: usize,
    pub kill: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
