//! Scripted UI phases
//!
//! A phase plan is a YAML document listing the four phases of a smoke run,
//! each a sequence of driver steps:
//!
//! ```yaml
//! phases:
//!   - name: prepare
//!     steps:
//!       - action: wait_for
//!         selector: '#login-username'
//!   - name: navigate
//!     steps: [...]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::context::RunContext;
use crate::error::{E2eError, E2eResult};
use crate::logwatch::LogWatchRegistry;
use crate::webdriver::{Driver, ElementId};

/// Phases every plan must contain, in this order
pub const PHASE_ORDER: [&str; 4] = ["prepare", "navigate", "install", "login"];

const DEFAULT_PLAN: &str = include_str!("../phases/default.yaml");

const ELEMENT_POLL: Duration = Duration::from_millis(100);

/// The full ordered plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasePlan {
    pub phases: Vec<Phase>,
}

/// One named block of steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub steps: Vec<PhaseStep>,
}

/// A single driver interaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PhaseStep {
    /// Load a URL in the app window
    Navigate { url: String },

    /// Click an element once it exists
    ///
    /// With `expect_log`, the log watch is registered before the click and
    /// waited on after it, so a line the click causes right away is not lost.
    Click {
        selector: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        expect_log: Option<String>,
        #[serde(default)]
        log_timeout_ms: Option<u64>,
    },

    /// Type into an element once it exists
    Fill { selector: String, value: String },

    /// Wait for an element to appear
    WaitFor {
        selector: String,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
    },

    /// Check an element's text
    AssertText { selector: String, contains: String },

    /// Wait for a line in the app log
    ///
    /// The watch only exists from this step on. Lines caused by an earlier
    /// step belong in that step's `expect_log`.
    WaitLog {
        pattern: String,
        #[serde(default = "default_log_timeout")]
        timeout_ms: u64,
    },

    /// Save a screenshot under `name`
    Screenshot { name: String },

    /// Fixed pause (use sparingly)
    Sleep { ms: u64 },

    /// Log a message
    Log { message: String },
}

fn default_wait_timeout() -> u64 {
    5000
}

fn default_log_timeout() -> u64 {
    30_000
}

impl PhaseStep {
    /// Short label used in logs and errors
    pub fn label(&self) -> String {
        match self {
            PhaseStep::Navigate { url } => format!("navigate:{}", url),
            PhaseStep::Click { selector, .. } => format!("click:{}", selector),
            PhaseStep::Fill { selector, .. } => format!("fill:{}", selector),
            PhaseStep::WaitFor { selector, .. } => format!("wait_for:{}", selector),
            PhaseStep::AssertText { selector, .. } => format!("assert_text:{}", selector),
            PhaseStep::WaitLog { pattern, .. } => format!("wait_log:{}", pattern),
            PhaseStep::Screenshot { name } => format!("screenshot:{}", name),
            PhaseStep::Sleep { ms } => format!("sleep:{}ms", ms),
            PhaseStep::Log { message } => {
                format!("log:{}", message.chars().take(30).collect::<String>())
            }
        }
    }
}

impl PhasePlan {
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let plan: Self = serde_yaml::from_str(yaml)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// The plan shipped with the binary
    pub fn builtin() -> E2eResult<Self> {
        Self::from_yaml(DEFAULT_PLAN)
    }

    /// Plans must list exactly prepare, navigate, install, login in that order
    pub fn validate(&self) -> E2eResult<()> {
        let names: Vec<&str> = self.phases.iter().map(|p| p.name.as_str()).collect();
        if names != PHASE_ORDER {
            return Err(E2eError::InvalidPhasePlan(format!(
                "expected phases {:?}, got {:?}",
                PHASE_ORDER, names
            )));
        }
        Ok(())
    }
}

/// Runs a plan's phases strictly in order, stopping at the first failure
pub struct PhaseSequencer<'a> {
    driver: &'a dyn Driver,
    ctx: &'a RunContext,
    logs: &'a LogWatchRegistry,
}

impl<'a> PhaseSequencer<'a> {
    pub fn new(driver: &'a dyn Driver, ctx: &'a RunContext, logs: &'a LogWatchRegistry) -> Self {
        Self { driver, ctx, logs }
    }

    pub async fn run(&self, plan: &PhasePlan) -> E2eResult<()> {
        for phase in &plan.phases {
            self.run_phase(phase).await?;
        }
        Ok(())
    }

    pub async fn run_phase(&self, phase: &Phase) -> E2eResult<()> {
        let start = Instant::now();
        info!("Phase {} starting ({} steps)", phase.name, phase.steps.len());

        for step in &phase.steps {
            debug!("[{}] {}", phase.name, step.label());
            self.execute_step(step)
                .await
                .map_err(|e| E2eError::PhaseFailed {
                    phase: phase.name.clone(),
                    step: step.label(),
                    reason: e.to_string(),
                })?;
        }

        info!("Phase {} done in {:?}", phase.name, start.elapsed());
        Ok(())
    }

    async fn execute_step(&self, step: &PhaseStep) -> E2eResult<()> {
        match step {
            PhaseStep::Navigate { url } => self.driver.navigate(&self.expand(url)).await,
            PhaseStep::Click {
                selector,
                timeout_ms,
                expect_log,
                log_timeout_ms,
            } => {
                let watch = expect_log
                    .as_deref()
                    .map(|pattern| self.logs.register(pattern))
                    .transpose()?;

                let timeout = Duration::from_millis(timeout_ms.unwrap_or_else(default_wait_timeout));
                let el = self.wait_element(selector, timeout).await?;
                self.driver.click(&el).await?;

                match watch {
                    Some(watch) => {
                        let timeout = log_timeout_ms.unwrap_or_else(default_log_timeout);
                        watch.wait(Duration::from_millis(timeout)).await
                    }
                    None => Ok(()),
                }
            }
            PhaseStep::Fill { selector, value } => {
                let timeout = Duration::from_millis(default_wait_timeout());
                let el = self.wait_element(selector, timeout).await?;
                self.driver.send_keys(&el, &self.expand(value)).await
            }
            PhaseStep::WaitFor {
                selector,
                timeout_ms,
            } => {
                self.wait_element(selector, Duration::from_millis(*timeout_ms))
                    .await?;
                Ok(())
            }
            PhaseStep::AssertText { selector, contains } => {
                let timeout = Duration::from_millis(default_wait_timeout());
                let el = self.wait_element(selector, timeout).await?;
                let text = self.driver.element_text(&el).await?;
                let expected = self.expand(contains);
                if text.contains(&expected) {
                    Ok(())
                } else {
                    Err(E2eError::WebDriver {
                        command: "assert-text".to_string(),
                        message: format!("{:?} does not contain {:?}", text, expected),
                    })
                }
            }
            PhaseStep::WaitLog {
                pattern,
                timeout_ms,
            } => {
                let watch = self.logs.register(pattern)?;
                watch.wait(Duration::from_millis(*timeout_ms)).await
            }
            PhaseStep::Screenshot { name } => {
                self.ctx
                    .artifacts()
                    .capture(self.driver, self.ctx, name)
                    .await?;
                Ok(())
            }
            PhaseStep::Sleep { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(())
            }
            PhaseStep::Log { message } => {
                info!("[phase] {}", self.expand(message));
                Ok(())
            }
        }
    }

    /// Poll for an element until it shows up or `timeout` elapses
    async fn wait_element(&self, selector: &str, timeout: Duration) -> E2eResult<ElementId> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(el) = self.driver.find_element(selector).await? {
                return Ok(el);
            }
            if Instant::now() >= deadline {
                return Err(E2eError::ElementTimeout {
                    selector: selector.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(ELEMENT_POLL).await;
        }
    }

    fn expand(&self, value: &str) -> String {
        substitute(value, self.ctx)
    }
}

/// Replace `{{account}}`, `{{password}}` and `{{api_key}}` with credentials
pub fn substitute(value: &str, ctx: &RunContext) -> String {
    let Some(creds) = ctx.credentials() else {
        return value.to_string();
    };
    value
        .replace("{{account}}", &creds.account)
        .replace("{{password}}", &creds.password)
        .replace("{{api_key}}", &creds.api_key)
}
