//! WebDriver client for the automation driver's control endpoint
//!
//! Only the handful of commands the smoke run needs are implemented: session
//! lifecycle, window close, browser log, screenshots and basic element
//! interaction.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::error::{E2eError, E2eResult};

/// W3C element reference key
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// A negotiated remote-control session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// One entry of the driver's `browser` log channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserLogEntry {
    /// Milliseconds since the epoch
    pub timestamp: f64,
    pub level: String,
    pub message: String,
}

/// Opaque element handle returned by `find_element`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementId(pub String);

/// The remote automation capability the run depends on
#[async_trait]
pub trait Driver: Send + Sync {
    async fn create_session(&self) -> E2eResult<Session>;

    async fn delete_session(&self) -> E2eResult<()>;

    async fn close_window(&self) -> E2eResult<()>;

    async fn browser_log(&self) -> E2eResult<Vec<BrowserLogEntry>>;

    /// PNG bytes of the current window
    async fn screenshot(&self) -> E2eResult<Vec<u8>>;

    async fn navigate(&self, url: &str) -> E2eResult<()>;

    /// Look up one element by CSS selector; Ok(None) when nothing matches
    async fn find_element(&self, selector: &str) -> E2eResult<Option<ElementId>>;

    async fn click(&self, element: &ElementId) -> E2eResult<()>;

    async fn send_keys(&self, element: &ElementId, text: &str) -> E2eResult<()>;

    async fn element_text(&self, element: &ElementId) -> E2eResult<String>;
}

/// Browser capabilities sent on session creation
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Electron (or Chrome) binary the driver should start
    pub binary: PathBuf,
    /// Extra browser arguments, e.g. `app=<path>`
    pub args: Vec<String>,
}

impl Capabilities {
    pub fn electron_app(binary: PathBuf, app_path: &std::path::Path) -> Self {
        Self {
            binary,
            args: vec![format!("app={}", app_path.display())],
        }
    }

    fn to_json(&self) -> Value {
        let chrome = json!({
            "binary": self.binary.to_string_lossy(),
            "args": self.args,
        });
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": chrome,
                }
            },
            "desiredCapabilities": {
                "browserName": "chrome",
                "chromeOptions": chrome,
            }
        })
    }
}

/// HTTP client for a chromedriver-compatible endpoint
pub struct WebDriverClient {
    base_url: String,
    http: reqwest::Client,
    capabilities: Capabilities,
    session: Mutex<Option<String>>,
}

impl WebDriverClient {
    pub fn new(base_url: impl Into<String>, capabilities: Capabilities) -> E2eResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            capabilities,
            session: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_id(&self, command: &str) -> E2eResult<String> {
        self.session.lock().clone().ok_or_else(|| E2eError::WebDriver {
            command: command.to_string(),
            message: "no active session".to_string(),
        })
    }

    /// Send one command and unwrap the `value` member of the reply
    async fn command(
        &self,
        command: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> E2eResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!("webdriver {} {} {}", command, method, path);

        let mut req = self.http.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let payload: Value = resp.json().await.unwrap_or(Value::Null);
        let mut value = payload.get("value").cloned().unwrap_or(Value::Null);

        // Legacy replies keep the session id next to `value` rather than in it
        if let (Some(id), Some(obj)) = (payload.get("sessionId"), value.as_object_mut()) {
            if id.is_string() {
                obj.entry("sessionId").or_insert_with(|| id.clone());
            }
        }

        // Legacy JSON wire replies carry a numeric status instead of an HTTP error
        let legacy_failed = payload
            .get("status")
            .and_then(Value::as_i64)
            .map(|s| s != 0)
            .unwrap_or(false);

        if !status.is_success() || legacy_failed {
            return Err(E2eError::WebDriver {
                command: command.to_string(),
                message: error_message(status, &value),
            });
        }
        Ok(value)
    }
}

fn error_message(status: reqwest::StatusCode, value: &Value) -> String {
    let error = value.get("error").and_then(Value::as_str);
    let message = value.get("message").and_then(Value::as_str);
    match (error, message) {
        (Some(e), Some(m)) => format!("{} ({}): {}", e, status, m),
        (None, Some(m)) => format!("{}: {}", status, m),
        _ => status.to_string(),
    }
}

fn element_from(value: &Value) -> Option<ElementId> {
    value
        .get(ELEMENT_KEY)
        .or_else(|| value.get("ELEMENT"))
        .and_then(Value::as_str)
        .map(|id| ElementId(id.to_string()))
}

#[async_trait]
impl Driver for WebDriverClient {
    async fn create_session(&self) -> E2eResult<Session> {
        let value = self
            .command(
                "create-session",
                reqwest::Method::POST,
                "/session",
                Some(self.capabilities.to_json()),
            )
            .await?;

        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| E2eError::WebDriver {
                command: "create-session".to_string(),
                message: "reply carried no sessionId".to_string(),
            })?
            .to_string();

        *self.session.lock() = Some(id.clone());
        Ok(Session {
            id,
            created_at: Utc::now(),
        })
    }

    async fn delete_session(&self) -> E2eResult<()> {
        let Some(id) = self.session.lock().take() else {
            return Ok(());
        };
        self.command(
            "delete-session",
            reqwest::Method::DELETE,
            &format!("/session/{}", id),
            None,
        )
        .await?;
        Ok(())
    }

    async fn close_window(&self) -> E2eResult<()> {
        let id = self.session_id("close-window")?;
        self.command(
            "close-window",
            reqwest::Method::DELETE,
            &format!("/session/{}/window", id),
            None,
        )
        .await?;
        Ok(())
    }

    async fn browser_log(&self) -> E2eResult<Vec<BrowserLogEntry>> {
        let id = self.session_id("log")?;
        let value = self
            .command(
                "log",
                reqwest::Method::POST,
                &format!("/session/{}/log", id),
                Some(json!({ "type": "browser" })),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn screenshot(&self) -> E2eResult<Vec<u8>> {
        let id = self.session_id("screenshot")?;
        let value = self
            .command(
                "screenshot",
                reqwest::Method::GET,
                &format!("/session/{}/screenshot", id),
                None,
            )
            .await?;
        let encoded = value.as_str().ok_or_else(|| E2eError::WebDriver {
            command: "screenshot".to_string(),
            message: "reply was not a base64 string".to_string(),
        })?;
        Ok(STANDARD.decode(encoded)?)
    }

    async fn navigate(&self, url: &str) -> E2eResult<()> {
        let id = self.session_id("navigate")?;
        self.command(
            "navigate",
            reqwest::Method::POST,
            &format!("/session/{}/url", id),
            Some(json!({ "url": url })),
        )
        .await?;
        Ok(())
    }

    async fn find_element(&self, selector: &str) -> E2eResult<Option<ElementId>> {
        let id = self.session_id("find-element")?;
        let result = self
            .command(
                "find-element",
                reqwest::Method::POST,
                &format!("/session/{}/element", id),
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await;

        match result {
            Ok(value) => Ok(element_from(&value)),
            Err(E2eError::WebDriver { message, .. }) if message.contains("no such element") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn click(&self, element: &ElementId) -> E2eResult<()> {
        let id = self.session_id("click")?;
        self.command(
            "click",
            reqwest::Method::POST,
            &format!("/session/{}/element/{}/click", id, element.0),
            Some(json!({})),
        )
        .await?;
        Ok(())
    }

    async fn send_keys(&self, element: &ElementId, text: &str) -> E2eResult<()> {
        let id = self.session_id("send-keys")?;
        let chars: Vec<String> = text.chars().map(String::from).collect();
        self.command(
            "send-keys",
            reqwest::Method::POST,
            &format!("/session/{}/element/{}/value", id, element.0),
            Some(json!({ "text": text, "value": chars })),
        )
        .await?;
        Ok(())
    }

    async fn element_text(&self, element: &ElementId) -> E2eResult<String> {
        let id = self.session_id("element-text")?;
        let value = self
            .command(
                "element-text",
                reqwest::Method::GET,
                &format!("/session/{}/element/{}/text", id, element.0),
                None,
            )
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}
