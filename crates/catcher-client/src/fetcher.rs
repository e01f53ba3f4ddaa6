use std::time::Duration;

use catcher_core::error::AppError;
use catcher_core::models::HttpReply;
use catcher_core::traits::{Accept, Fetcher};
use reqwest::header::{ACCEPT, COOKIE, HeaderValue};
use reqwest::{Client, redirect};

/// Default user agent. The listing service serves browsers, so look like one.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

const MAX_REDIRECTS: usize = 10;

/// HTTP fetcher using reqwest.
///
/// Sends every request with the operator's session cookie, follows
/// redirects and keeps the final URL, which the claim classifier relies on.
/// Any HTTP status is returned as a reply; only transport failures and
/// timeouts are errors.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    cookie: Option<HeaderValue>,
}

impl ReqwestFetcher {
    pub fn new(session_cookie: Option<&str>) -> Result<Self, AppError> {
        Self::with_user_agent(session_cookie, DEFAULT_USER_AGENT)
    }

    pub fn with_user_agent(session_cookie: Option<&str>, user_agent: &str) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| AppError::ConfigError(format!("HTTP client: {e}")))?;

        let cookie = session_cookie
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| {
                let mut value = HeaderValue::from_str(c)
                    .map_err(|e| AppError::ConfigError(format!("Invalid session cookie: {e}")))?;
                value.set_sensitive(true);
                Ok::<_, AppError>(value)
            })
            .transpose()?;
        if cookie.is_none() {
            tracing::warn!("No session cookie configured; listings may require a login");
        }

        Ok(Self { client, cookie })
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str, accept: Accept, timeout: Duration) -> Result<HttpReply, AppError> {
        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, accept.mime())
            .timeout(timeout);
        if let Some(cookie) = &self.cookie {
            request = request.header(COOKIE, cookie.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        Ok(HttpReply::new(status, final_url, body))
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout.as_millis() as u64)
    } else if e.is_connect() {
        AppError::Transport(format!("Connection failed: {e}"))
    } else {
        AppError::Transport(e.to_string())
    }
}
