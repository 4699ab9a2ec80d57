//! Fatal error handling and run cleanup
//!
//! Every fatal error ends up in [`FailureController::fail`], whether it came
//! from the main flow or from a background task through [`FatalReporter`].
//! The controller captures what diagnostics it can, runs the cleanup callback
//! and hands back the exit status. Only the top-level runner decides to exit.

use chrono::{Local, TimeZone};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::context::RunContext;
use crate::error::E2eError;

/// Exit status of a run that hit a fatal error
pub const FAILURE_EXIT_CODE: i32 = 1;

const BANNER: &str = "==================================================================";

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// One-shot async cleanup slot
///
/// The callback is registered once and runs at most once, no matter how
/// many paths (success, failure, crash) ask for it.
pub struct Cleanup {
    slot: Mutex<Option<CleanupFn>>,
    registered: Mutex<bool>,
}

impl Default for Cleanup {
    fn default() -> Self {
        Self::new()
    }
}

impl Cleanup {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            registered: Mutex::new(false),
        }
    }

    /// Register the cleanup callback; returns false if one was already registered
    pub fn register<F>(&self, f: F) -> bool
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let mut registered = self.registered.lock();
        if *registered {
            warn!("Cleanup already registered, ignoring the new callback");
            return false;
        }
        *registered = true;
        *self.slot.lock() = Some(Box::new(f));
        true
    }

    /// Run the callback if it has not run yet; returns whether it ran now
    pub async fn run(&self) -> bool {
        let f = self.slot.lock().take();
        match f {
            Some(f) => {
                f().await;
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// Sending half of the fatal-event channel, handed to background tasks
#[derive(Clone)]
pub struct FatalReporter {
    tx: mpsc::UnboundedSender<E2eError>,
}

impl FatalReporter {
    pub fn report(&self, err: E2eError) {
        if self.tx.send(err).is_err() {
            warn!("Fatal event dropped, run already finished");
        }
    }
}

/// Receiving half, owned by the top-level runner
pub struct FatalReceiver {
    rx: mpsc::UnboundedReceiver<E2eError>,
}

impl FatalReceiver {
    /// Next fatal event; pends forever once every reporter is gone
    pub async fn recv(&mut self) -> E2eError {
        match self.rx.recv().await {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<E2eError> {
        self.rx.try_recv().ok()
    }
}

pub fn fatal_channel() -> (FatalReporter, FatalReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FatalReporter { tx }, FatalReceiver { rx })
}

/// What `fail` did
#[derive(Debug)]
pub struct FailureReport {
    pub exit_code: i32,
    pub error: String,
    /// Diagnostic steps that failed; never affects the exit code
    pub diagnostic_errors: Vec<E2eError>,
    pub cleanup_ran: bool,
}

pub struct FailureController {
    ctx: Arc<RunContext>,
}

impl FailureController {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    /// Handle a fatal error; the run does not continue after this
    pub async fn fail(&self, err: E2eError) -> FailureReport {
        error!("{}", BANNER);
        error!("Fatal error: {}", err);
        error!("{}", BANNER);
        error!("Failed in {:?}", self.ctx.since_test_start());

        let mut diagnostic_errors = Vec::new();

        if let Some(driver) = self.ctx.driver() {
            match driver.browser_log().await {
                Ok(entries) => {
                    info!("Browser log:");
                    for entry in &entries {
                        info!(
                            target: "browser",
                            "♪ {} {} {}",
                            format_stamp(entry.timestamp),
                            entry.level,
                            entry.message.replace("\\n", "\n")
                        );
                    }
                }
                Err(e) => {
                    error!("Could not get browser log: {}", e);
                    diagnostic_errors.push(E2eError::DiagnosticCapture(format!("browser log: {}", e)));
                }
            }

            info!("Taking failure screenshot...");
            if let Err(e) = self
                .ctx
                .artifacts()
                .capture(driver.as_ref(), &self.ctx, &err.to_string())
                .await
            {
                error!("Could not take failure screenshot: {}", e);
                diagnostic_errors.push(e);
            }
        }

        let cleanup_ran = self.ctx.cleanup().run().await;

        FailureReport {
            exit_code: FAILURE_EXIT_CODE,
            error: err.to_string(),
            diagnostic_errors,
            cleanup_ran,
        }
    }
}

/// `HH:MM:SS.mmm` in local time for a millisecond epoch timestamp
pub fn format_stamp(timestamp_ms: f64) -> String {
    let millis = timestamp_ms as i64;
    match Local.timestamp_millis_opt(millis).single() {
        Some(t) => t.format("%H:%M:%S%.3f").to_string(),
        None => format!("{}ms", millis),
    }
}
