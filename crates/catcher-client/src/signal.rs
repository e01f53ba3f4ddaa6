use std::time::Duration;

use catcher_core::error::AppError;
use catcher_core::models::{GroupKey, Signal};
use catcher_core::traits::SignalService;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Serialize, Deserialize)]
struct SignalBody {
    value: Option<Signal>,
}

#[derive(Debug, Serialize, Deserialize)]
struct KillBody {
    active: bool,
}

/// Client for the remote coordination service (`catcher-server`).
///
/// Group signals live under `/v1/signals/{group}`, the kill flag under
/// `/v1/kill`. Writes carry the bearer token when one is configured.
#[derive(Clone)]
pub struct HttpSignalService {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpSignalService {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, AppError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let base = Url::parse(&format!("{trimmed}/")).map_err(|e| {
            AppError::ConfigError(format!("Invalid signal service URL '{base_url}': {e}"))
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn url(&self, path: &str) -> Result<Url, AppError> {
        self.base
            .join(path)
            .map_err(|e| AppError::Signal(format!("bad path {path}: {e}")))
    }

    fn signal_url(&self, group: &GroupKey) -> Result<Url, AppError> {
        self.url(&format!("v1/signals/{}", group.as_str()))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(request: RequestBuilder) -> Result<reqwest::Response, AppError> {
        let response = request
            .send()
            .await
            .map_err(|e| AppError::Signal(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(AppError::Signal(format!("HTTP {}: {detail}", status.as_u16())))
    }
}

impl SignalService for HttpSignalService {
    async fn get(&self, group: &GroupKey) -> Result<Option<Signal>, AppError> {
        let response = self
            .client
            .get(self.signal_url(group)?)
            .send()
            .await
            .map_err(|e| AppError::Signal(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(AppError::Signal(format!(
                "HTTP {} reading signal for {group}",
                response.status().as_u16()
            )));
        }
        let body: SignalBody = response
            .json()
            .await
            .map_err(|e| AppError::Signal(format!("bad signal body: {e}")))?;
        Ok(body.value)
    }

    async fn set(&self, group: &GroupKey, signal: Signal) -> Result<(), AppError> {
        let request = self
            .client
            .put(self.signal_url(group)?)
            .json(&SignalBody {
                value: Some(signal),
            });
        Self::send(self.authorized(request)).await?;
        tracing::debug!(%group, %signal, "Remote signal written");
        Ok(())
    }

    async fn get_kill(&self) -> Result<bool, AppError> {
        let response = Self::send(self.client.get(self.url("v1/kill")?)).await?;
        let body: KillBody = response
            .json()
            .await
            .map_err(|e| AppError::Signal(format!("bad kill body: {e}")))?;
        Ok(body.active)
    }

    async fn set_kill(&self, active: bool) -> Result<(), AppError> {
        let request = self
            .client
            .put(self.url("v1/kill")?)
            .json(&KillBody { active });
        Self::send(self.authorized(request)).await?;
        tracing::info!(active, "Remote kill flag written");
        Ok(())
    }
}
