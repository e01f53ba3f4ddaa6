use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use chrono::Utc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use catcher_core::error::AppError;
use catcher_core::models::{GroupKey, Signal};

use crate::auth::require_admin_token;
use crate::dto::{
    HealthResponse, KillResponse, SetKillRequest, SetSignalRequest, SignalListResponse,
    SignalResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::{AppState, SignalEntry};

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    // Only kill writes need the admin token.
    let guarded_kill = put(set_kill).route_layer(middleware::from_fn_with_state(
        state.clone(),
        require_admin_token,
    ));

    Router::new()
        .route("/health", get(health))
        .route("/v1/signals", get(list_signals))
        .route("/v1/signals/{group}", get(get_signal).put(set_signal))
        .route("/v1/kill", get(get_kill).merge(guarded_kill))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
}

fn signal_response(group: &GroupKey, entry: Option<&SignalEntry>) -> SignalResponse {
    SignalResponse {
        group: group.to_string(),
        value: entry.map(|e| e.value.to_string()),
        updated_at: entry.map(|e| e.updated_at),
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/signals",
    responses(
        (status = 200, description = "Every group with a signal", body = SignalListResponse),
    ),
    tag = "signals"
)]
pub async fn list_signals(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let signals = state.signals.read().await;
    let mut groups: Vec<_> = signals.iter().collect();
    groups.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
    let response = SignalListResponse {
        signals: groups
            .into_iter()
            .map(|(group, entry)| signal_response(group, Some(entry)))
            .collect(),
    };
    axum::Json(response)
}

#[utoipa::path(
    get,
    path = "/v1/signals/{group}",
    params(("group" = String, Path, description = "Operator group (sanitised server-side)")),
    responses(
        (status = 200, description = "Current signal, `null` if never set", body = SignalResponse),
    ),
    tag = "signals"
)]
pub async fn get_signal(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
) -> impl IntoResponse {
    let group = GroupKey::sanitize(&group);
    let signals = state.signals.read().await;
    axum::Json(signal_response(&group, signals.get(&group)))
}

#[utoipa::path(
    put,
    path = "/v1/signals/{group}",
    params(("group" = String, Path, description = "Operator group (sanitised server-side)")),
    request_body = SetSignalRequest,
    responses(
        (status = 200, description = "Signal stored", body = SignalResponse),
        (status = 400, description = "Invalid value", body = crate::dto::ErrorResponse),
    ),
    tag = "signals"
)]
pub async fn set_signal(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
    axum::Json(body): axum::Json<SetSignalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let group = GroupKey::sanitize(&group);
    let value = body
        .value
        .as_deref()
        .map(|raw| match raw.parse::<Signal>() {
            Ok(signal @ (Signal::Run | Signal::Stop)) => Ok(signal),
            Ok(Signal::Kill) => Err(AppError::Parse(
                "KILL is not a group signal; use /v1/kill".to_string(),
            )),
            Err(e) => Err(AppError::Parse(e)),
        })
        .transpose()?;

    let mut signals = state.signals.write().await;
    let entry = match value {
        Some(value) => {
            let entry = SignalEntry {
                value,
                updated_at: Utc::now(),
            };
            signals.insert(group.clone(), entry);
            Some(entry)
        }
        None => {
            signals.remove(&group);
            None
        }
    };
    tracing::info!(%group, value = ?value, "Group signal updated");

    Ok(axum::Json(signal_response(&group, entry.as_ref())))
}

// ---------------------------------------------------------------------------
// Kill switch
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/kill",
    responses(
        (status = 200, description = "Kill switch state", body = KillResponse),
    ),
    tag = "kill"
)]
pub async fn get_kill(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let since = *state.kill.read().await;
    axum::Json(KillResponse {
        active: since.is_some(),
        since,
    })
}

#[utoipa::path(
    put,
    path = "/v1/kill",
    request_body = SetKillRequest,
    responses(
        (status = 200, description = "Kill switch updated", body = KillResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Kill writes disabled", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "kill"
)]
pub async fn set_kill(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<SetKillRequest>,
) -> impl IntoResponse {
    let mut kill = state.kill.write().await;
    match (body.active, *kill) {
        (true, None) => *kill = Some(Utc::now()),
        (false, _) => *kill = None,
        (true, Some(_)) => {}
    }
    tracing::warn!(active = body.active, "Kill switch updated");
    axum::Json(KillResponse {
        active: kill.is_some(),
        since: *kill,
    })
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy",
        groups: state.signals.read().await.len(),
        kill: state.kill.read().await.is_some(),
    };
    (StatusCode::OK, axum::Json(response))
}
