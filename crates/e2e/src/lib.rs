//! Smokerun - smoke test orchestration for an Electron app driven over WebDriver
//!
//! This crate runs a single end-to-end smoke run:
//! - Launches a WebDriver driver process and watches it for crashes
//! - Negotiates a browser session, retrying a bounded number of times
//! - Tails the app's log file and wakes waiters on matching lines
//! - Runs the scripted phases (prepare, navigate, install, login)
//! - On any fatal error, captures diagnostics and cleans up exactly once
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SmokeRunner                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  prepare (bundle, locate driver, resolve app binary)        │
//! │  ProcessSupervisor ──crash──▶ FatalReporter ──┐             │
//! │  LogTailer ──lines──▶ LogWatchRegistry        │             │
//! │  SessionNegotiator (N attempts)               ▼             │
//! │  PhaseSequencer ──error──────────────▶ FailureController    │
//! │                                         ├── browser log     │
//! │                                         ├── screenshot      │
//! │                                         └── Cleanup (once)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RunContext: clocks, readiness flag, driver, session        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod artifacts;
pub mod config;
pub mod context;
pub mod error;
pub mod failure;
pub mod logwatch;
pub mod phases;
pub mod prepare;
pub mod runner;
pub mod session;
pub mod supervisor;
pub mod tailer;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod webdriver;

pub use config::{Credentials, SmokeConfig};
pub use error::{E2eError, E2eResult};
pub use runner::{RunOutcome, SmokeRunner};
