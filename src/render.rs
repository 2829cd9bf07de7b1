//! Headless browser capability.
//!
//! A [`Renderer`] hands out short-lived [`RenderSession`]s. Callers open one
//! session per sub-operation and close it before opening the next, on the
//! error path too; [`render_html`] and [`render_screenshot`] wrap that
//! discipline for the stages.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::RenderError;

/// Load condition a navigation waits for.
///
/// With Chromium both variants wait for the page `load` event, since
/// `Page::goto` does not return earlier. `NetworkIdle` additionally waits
/// for the navigation to settle and then sleeps `settle_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// The document has loaded; no extra settle time.
    DomContentLoaded,
    /// Loaded, then a quiet period for late requests.
    NetworkIdle,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    type Session: RenderSession;

    async fn open(&self) -> Result<Self::Session, RenderError>;
}

#[async_trait]
pub trait RenderSession: Send {
    async fn navigate(
        &mut self,
        url: &str,
        wait: WaitUntil,
        timeout: Duration,
    ) -> Result<(), RenderError>;

    async fn html(&mut self) -> Result<String, RenderError>;

    /// Full-page PNG of the current document.
    async fn screenshot(&mut self) -> Result<Vec<u8>, RenderError>;

    async fn close(self) -> Result<(), RenderError>;
}

/// Load `url` in a fresh session and return the rendered DOM.
pub async fn render_html<R: Renderer>(
    renderer: &R,
    url: &str,
    wait: WaitUntil,
    timeout: Duration,
) -> Result<String, RenderError> {
    let mut session = renderer.open().await?;
    let result = match session.navigate(url, wait, timeout).await {
        Ok(()) => session.html().await,
        Err(e) => Err(e),
    };
    release(session, url).await;
    result
}

/// Load `url` in a fresh session and capture a full-page screenshot.
pub async fn render_screenshot<R: Renderer>(
    renderer: &R,
    url: &str,
    wait: WaitUntil,
    timeout: Duration,
) -> Result<Vec<u8>, RenderError> {
    let mut session = renderer.open().await?;
    let result = match session.navigate(url, wait, timeout).await {
        Ok(()) => session.screenshot().await,
        Err(e) => Err(e),
    };
    release(session, url).await;
    result
}

async fn release<S: RenderSession>(session: S, url: &str) {
    if let Err(e) = session.close().await {
        warn!("Failed to close browser session for {}: {}", url, e);
    }
}

// ── Chromium ──

/// Chromium via the DevTools protocol. Each session is its own browser
/// process unless `remote_debugging_url` points at a running instance.
pub struct ChromeRenderer {
    executable: Option<PathBuf>,
    remote_url: Option<String>,
    settle: Duration,
}

impl ChromeRenderer {
    pub fn from_settings(settings: &Settings) -> Self {
        ChromeRenderer {
            executable: settings.chrome_executable.clone(),
            remote_url: settings.remote_debugging_url.clone(),
            settle: settings.settle(),
        }
    }
}

pub struct ChromeSession {
    browser: Browser,
    page: Page,
    events: JoinHandle<()>,
    owned: bool,
    settle: Duration,
}

#[async_trait]
impl Renderer for ChromeRenderer {
    type Session = ChromeSession;

    async fn open(&self) -> Result<ChromeSession, RenderError> {
        let (mut browser, mut handler) = match &self.remote_url {
            Some(url) => Browser::connect(url.as_str())
                .await
                .map_err(|e| RenderError::Launch(format!("connect {}: {}", url, e)))?,
            None => {
                let mut builder = BrowserConfig::builder()
                    .no_sandbox()
                    .arg("--disable-gpu")
                    .arg("--disable-dev-shm-usage");
                if let Some(exe) = &self.executable {
                    builder = builder.chrome_executable(exe);
                }
                let config = builder.build().map_err(RenderError::Launch)?;
                Browser::launch(config)
                    .await
                    .map_err(|e| RenderError::Launch(e.to_string()))?
            }
        };

        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                if self.remote_url.is_none() {
                    let _ = browser.close().await;
                    let _ = browser.wait().await;
                }
                events.abort();
                return Err(RenderError::Launch(format!("new page: {}", e)));
            }
        };

        debug!("Browser session opened");
        Ok(ChromeSession {
            browser,
            page,
            events,
            owned: self.remote_url.is_none(),
            settle: self.settle,
        })
    }
}

#[async_trait]
impl RenderSession for ChromeSession {
    async fn navigate(
        &mut self,
        url: &str,
        wait: WaitUntil,
        timeout: Duration,
    ) -> Result<(), RenderError> {
        let page = &self.page;
        let settle = self.settle;
        let load = async move {
            page.goto(url).await.map_err(|e| RenderError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            // goto returns after `load`; CDP has no network-idle event, so
            // approximate it with a settle window.
            if wait == WaitUntil::NetworkIdle {
                page.wait_for_navigation()
                    .await
                    .map_err(|e| RenderError::Navigation {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })?;
                tokio::time::sleep(settle).await;
            }
            Ok::<(), RenderError>(())
        };

        tokio::time::timeout(timeout, load)
            .await
            .map_err(|_| RenderError::Timeout {
                url: url.to_string(),
                secs: timeout.as_secs(),
            })?
    }

    async fn html(&mut self) -> Result<String, RenderError> {
        self.page
            .content()
            .await
            .map_err(|e| RenderError::Capture(format!("html: {}", e)))
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, RenderError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.page
            .screenshot(params)
            .await
            .map_err(|e| RenderError::Capture(format!("screenshot: {}", e)))
    }

    async fn close(self) -> Result<(), RenderError> {
        let ChromeSession {
            mut browser,
            page,
            events,
            owned,
            ..
        } = self;

        let closed = page.close().await;
        if owned {
            if let Err(e) = browser.close().await {
                warn!("Browser close failed: {}", e);
            }
            let _ = browser.wait().await;
        }
        events.abort();
        debug!("Browser session closed");
        closed.map_err(|e| RenderError::Capture(format!("close: {}", e)))
    }
}

// ── In-memory renderer for tests ──

#[cfg(test)]
pub mod testing {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// PNG signature followed by filler; enough for size checks.
    pub const FAKE_PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake-image-data";

    #[derive(Default)]
    struct State {
        pages: HashMap<String, String>,
        /// url -> remaining navigation failures (`u32::MAX` = always)
        failing: Mutex<HashMap<String, u32>>,
        broken_screenshots: HashSet<String>,
        navigations: Mutex<Vec<String>>,
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    /// Serves canned HTML keyed by URL.
    #[derive(Clone, Default)]
    pub struct FakeRenderer {
        state: Arc<State>,
    }

    impl FakeRenderer {
        pub fn new() -> Self {
            Self::default()
        }

        fn state_mut(&mut self) -> &mut State {
            Arc::get_mut(&mut self.state).expect("configure before sharing")
        }

        pub fn page(mut self, url: &str, html: &str) -> Self {
            self.state_mut().pages.insert(url.to_string(), html.to_string());
            self
        }

        pub fn timeout(self, url: &str) -> Self {
            self.flaky(url, u32::MAX)
        }

        pub fn flaky(mut self, url: &str, failures: u32) -> Self {
            self.state_mut()
                .failing
                .get_mut()
                .unwrap()
                .insert(url.to_string(), failures);
            self
        }

        pub fn broken_screenshot(mut self, url: &str) -> Self {
            self.state_mut().broken_screenshots.insert(url.to_string());
            self
        }

        pub fn opened(&self) -> usize {
            self.state.opened.load(Ordering::SeqCst)
        }

        pub fn closed(&self) -> usize {
            self.state.closed.load(Ordering::SeqCst)
        }

        pub fn navigations(&self) -> Vec<String> {
            self.state.navigations.lock().unwrap().clone()
        }
    }

    pub struct FakeSession {
        state: Arc<State>,
        current: Option<String>,
    }

    #[async_trait]
    impl Renderer for FakeRenderer {
        type Session = FakeSession;

        async fn open(&self) -> Result<FakeSession, RenderError> {
            let live = self.opened() - self.closed();
            assert_eq!(live, 0, "a previous session was not closed");
            self.state.opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeSession {
                state: Arc::clone(&self.state),
                current: None,
            })
        }
    }

    #[async_trait]
    impl RenderSession for FakeSession {
        async fn navigate(
            &mut self,
            url: &str,
            _wait: WaitUntil,
            timeout: Duration,
        ) -> Result<(), RenderError> {
            self.state.navigations.lock().unwrap().push(url.to_string());
            {
                let mut failing = self.state.failing.lock().unwrap();
                if let Some(left) = failing.get_mut(url) {
                    if *left > 0 {
                        if *left != u32::MAX {
                            *left -= 1;
                        }
                        return Err(RenderError::Timeout {
                            url: url.to_string(),
                            secs: timeout.as_secs(),
                        });
                    }
                }
            }
            if !self.state.pages.contains_key(url) {
                return Err(RenderError::Navigation {
                    url: url.to_string(),
                    reason: "net::ERR_NAME_NOT_RESOLVED".into(),
                });
            }
            self.current = Some(url.to_string());
            Ok(())
        }

        async fn html(&mut self) -> Result<String, RenderError> {
            let url = self
                .current
                .as_ref()
                .ok_or_else(|| RenderError::Capture("no document".into()))?;
            Ok(self.state.pages[url].clone())
        }

        async fn screenshot(&mut self) -> Result<Vec<u8>, RenderError> {
            let url = self
                .current
                .as_ref()
                .ok_or_else(|| RenderError::Capture("no document".into()))?;
            if self.state.broken_screenshots.contains(url) {
                return Err(RenderError::Capture("screenshot: target crashed".into()));
            }
            Ok(FAKE_PNG.to_vec())
        }

        async fn close(self) -> Result<(), RenderError> {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
