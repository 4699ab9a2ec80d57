//! In-memory driver used by unit and integration tests

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{E2eError, E2eResult};
use crate::webdriver::{BrowserLogEntry, Driver, ElementId, Session};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// 1x1 transparent PNG
pub const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15, 0xc4,
    0x89, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae,
    0x42, 0x60, 0x82,
];

type ClickHook = Box<dyn Fn() + Send + Sync>;

/// Scriptable stand-in for a WebDriver endpoint
///
/// Every CSS selector resolves to an element unless it was marked missing.
/// Calls are recorded so tests can assert on what the run did.
#[derive(Default)]
pub struct FakeDriver {
    failing_sessions: AtomicU32,
    broken_diagnostics: bool,
    missing: Vec<String>,
    texts: HashMap<String, String>,
    click_hooks: Vec<(String, ClickHook)>,
    sessions_requested: AtomicU32,
    sessions_deleted: AtomicU32,
    windows_closed: AtomicU32,
    screenshots: AtomicU32,
    logs: AtomicU32,
    calls: Mutex<Vec<String>>,
    session: Mutex<Option<String>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` session requests
    pub fn fail_sessions(self, n: u32) -> Self {
        self.failing_sessions.store(n, Ordering::SeqCst);
        self
    }

    /// Make browser log and screenshot calls fail
    pub fn broken_diagnostics(mut self) -> Self {
        self.broken_diagnostics = true;
        self
    }

    /// Selector that never resolves
    pub fn missing(mut self, selector: &str) -> Self {
        self.missing.push(selector.to_string());
        self
    }

    /// Text returned for the element behind `selector`
    pub fn with_text(mut self, selector: &str, text: &str) -> Self {
        self.texts.insert(selector.to_string(), text.to_string());
        self
    }

    /// Run `hook` whenever the element behind `selector` is clicked
    pub fn on_click<F>(mut self, selector: &str, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.click_hooks.push((selector.to_string(), Box::new(hook)));
        self
    }

    pub fn sessions_requested(&self) -> u32 {
        self.sessions_requested.load(Ordering::SeqCst)
    }

    pub fn sessions_deleted(&self) -> u32 {
        self.sessions_deleted.load(Ordering::SeqCst)
    }

    pub fn windows_closed(&self) -> u32 {
        self.windows_closed.load(Ordering::SeqCst)
    }

    pub fn screenshots_taken(&self) -> u32 {
        self.screenshots.load(Ordering::SeqCst)
    }

    pub fn logs_fetched(&self) -> u32 {
        self.logs.load(Ordering::SeqCst)
    }

    /// Recorded interaction calls, e.g. `click:#login`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn broken(&self, command: &str) -> E2eError {
        E2eError::WebDriver {
            command: command.to_string(),
            message: "driver went away".to_string(),
        }
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn create_session(&self) -> E2eResult<Session> {
        let n = self.sessions_requested.fetch_add(1, Ordering::SeqCst);
        if n < self.failing_sessions.load(Ordering::SeqCst) {
            return Err(E2eError::WebDriver {
                command: "create-session".to_string(),
                message: "chrome not reachable".to_string(),
            });
        }
        let id = format!("session-{}", n + 1);
        *self.session.lock() = Some(id.clone());
        Ok(Session {
            id,
            created_at: Utc::now(),
        })
    }

    async fn delete_session(&self) -> E2eResult<()> {
        if self.session.lock().take().is_some() {
            self.sessions_deleted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn close_window(&self) -> E2eResult<()> {
        self.windows_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn browser_log(&self) -> E2eResult<Vec<BrowserLogEntry>> {
        self.logs.fetch_add(1, Ordering::SeqCst);
        if self.broken_diagnostics {
            return Err(self.broken("log"));
        }
        Ok(vec![BrowserLogEntry {
            timestamp: 1_500_000_000_000.0,
            level: "SEVERE".to_string(),
            message: "Uncaught TypeError\\n    at app.js:1".to_string(),
        }])
    }

    async fn screenshot(&self) -> E2eResult<Vec<u8>> {
        self.screenshots.fetch_add(1, Ordering::SeqCst);
        if self.broken_diagnostics {
            return Err(self.broken("screenshot"));
        }
        Ok(TINY_PNG.to_vec())
    }

    async fn navigate(&self, url: &str) -> E2eResult<()> {
        self.record(format!("navigate:{}", url));
        Ok(())
    }

    async fn find_element(&self, selector: &str) -> E2eResult<Option<ElementId>> {
        if self.missing.iter().any(|m| m == selector) {
            return Ok(None);
        }
        Ok(Some(ElementId(selector.to_string())))
    }

    async fn click(&self, element: &ElementId) -> E2eResult<()> {
        self.record(format!("click:{}", element.0));
        for (selector, hook) in &self.click_hooks {
            if *selector == element.0 {
                hook();
            }
        }
        Ok(())
    }

    async fn send_keys(&self, element: &ElementId, text: &str) -> E2eResult<()> {
        self.record(format!("keys:{}={}", element.0, text));
        Ok(())
    }

    async fn element_text(&self, element: &ElementId) -> E2eResult<String> {
        Ok(self.texts.get(&element.0).cloned().unwrap_or_default())
    }
}
