use std::path::PathBuf;
use std::sync::Arc;

use catcher_core::classify::is_challenge_page;
use catcher_core::error::AppError;
use catcher_core::traits::ChallengeSurface;
use catcher_core::util::random_token;
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Visible Chromium window where the operator solves a verification
/// challenge.
///
/// Each [`open`](ChallengeSurface::open) launches a fresh browser with a
/// throwaway profile, seeds it with the session cookie and navigates to the
/// challenge page. [`is_present`](ChallengeSurface::is_present) re-reads the
/// rendered DOM; a window the operator closed counts as solved.
#[derive(Clone)]
pub struct BrowserSurface {
    session_cookie: Option<String>,
    session: Arc<Mutex<Option<Session>>>,
}

struct Session {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    profile: PathBuf,
}

impl BrowserSurface {
    pub fn new(session_cookie: Option<String>) -> Self {
        Self {
            session_cookie,
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Looks for a Chrome/Chromium binary. `CHROME_BIN` wins; otherwise the
    /// real binary inside a snap is preferred over the snap wrapper, which
    /// strips unknown flags. `None` lets chromiumoxide do its own lookup.
    fn find_chrome_binary() -> Option<PathBuf> {
        let candidates: &[&str] = &[
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ];

        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        candidates.iter().map(PathBuf::from).find(|p| p.exists())
    }

    fn cookies_for(&self, url: &str) -> Vec<CookieParam> {
        let Some(raw) = self.session_cookie.as_deref() else {
            return Vec::new();
        };
        raw.split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .filter_map(|(name, value)| {
                CookieParam::builder()
                    .name(name.trim())
                    .value(value.trim())
                    .url(url)
                    .build()
                    .ok()
            })
            .collect()
    }

    async fn launch(&self, url: &str) -> Result<Session, AppError> {
        let profile = std::env::temp_dir().join(format!("catcher-challenge-{}", random_token()));
        let mut builder = BrowserConfig::builder()
            .with_head()
            .user_data_dir(&profile)
            .arg("--no-first-run")
            .arg("--disable-extensions")
            .arg("--window-size=1100,900");
        if let Some(bin) = Self::find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }
        let config = builder
            .build()
            .map_err(|e| AppError::Generic(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Generic(format!("Failed to launch browser: {e}")))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::debug!("Browser CDP handler stopped: {event:?}");
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::Generic(format!("Failed to open tab: {e}")))?;
        let cookies = self.cookies_for(url);
        if !cookies.is_empty()
            && let Err(e) = page.set_cookies(cookies).await
        {
            tracing::warn!(error = %e, "Cannot seed session cookie");
        }
        page.goto(url)
            .await
            .map_err(|e| AppError::Generic(format!("Failed to navigate to {url}: {e}")))?;

        Ok(Session {
            browser,
            page,
            handler,
            profile,
        })
    }
}

impl ChallengeSurface for BrowserSurface {
    async fn open(&self, url: &str) -> Result<(), AppError> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        *slot = Some(self.launch(url).await?);
        tracing::warn!(%url, "Verification challenge opened in a browser window; solve it to resume");
        Ok(())
    }

    async fn is_present(&self) -> Result<bool, AppError> {
        let slot = self.session.lock().await;
        let Some(session) = slot.as_ref() else {
            return Ok(false);
        };
        match session.page.content().await {
            Ok(html) => Ok(is_challenge_page(&html)),
            // The operator closed the window.
            Err(e) if session.handler.is_finished() => {
                tracing::debug!(error = %e, "Challenge window gone");
                Ok(false)
            }
            Err(e) => Err(AppError::Generic(format!("Cannot read challenge page: {e}"))),
        }
    }

    async fn close(&self) -> Result<(), AppError> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };
        if let Err(e) = session.browser.close().await {
            tracing::debug!(error = %e, "Browser close failed");
        }
        let _ = session.browser.wait().await;
        session.handler.abort();
        if let Err(e) = tokio::fs::remove_dir_all(&session.profile).await {
            tracing::debug!(error = %e, "Cannot remove challenge profile");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_becomes_browser_cookies() {
        let surface = BrowserSurface::new(Some("session=abc; csrf = x1 ;broken".into()));
        let cookies = surface.cookies_for("https://host.test/dashboard");
        let names: Vec<_> = cookies.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["session", "csrf"]);
        assert_eq!(cookies[1].value, "x1");
    }

    #[tokio::test]
    async fn closed_surface_reports_no_challenge() {
        let surface = BrowserSurface::new(None);
        assert!(!surface.is_present().await.unwrap());
        surface.close().await.unwrap();
    }
}
