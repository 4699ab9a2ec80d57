//! Shared per-run state
//!
//! One [`RunContext`] exists per smoke run. It is shared as `Arc<RunContext>`
//! between the main flow, the failure controller and the cleanup callback.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::artifacts::ArtifactStore;
use crate::config::Credentials;
use crate::failure::Cleanup;
use crate::webdriver::{Driver, Session};

pub struct RunContext {
    boot: Instant,
    test_start: Mutex<Option<Instant>>,
    ready_for_screenshot: AtomicBool,
    driver: Mutex<Option<Arc<dyn Driver>>>,
    /// Current session and how long its handshake took
    session: Mutex<Option<(Session, Duration)>>,
    credentials: Option<Credentials>,
    artifacts: ArtifactStore,
    cleanup: Cleanup,
}

impl RunContext {
    pub fn new(credentials: Option<Credentials>, artifacts: ArtifactStore) -> Self {
        Self {
            boot: Instant::now(),
            test_start: Mutex::new(None),
            ready_for_screenshot: AtomicBool::new(false),
            driver: Mutex::new(None),
            session: Mutex::new(None),
            credentials,
            artifacts,
            cleanup: Cleanup::new(),
        }
    }

    /// Context with no credentials and a throwaway screenshot directory
    #[cfg(any(test, feature = "test-support"))]
    pub fn for_tests() -> Self {
        let dir = std::env::temp_dir().join(format!(
            "smokerun-test-{}-{}",
            std::process::id(),
            crate::testing::next_id()
        ));
        Self::new(None, ArtifactStore::new(dir))
    }

    /// Time since the process booted
    pub fn since_boot(&self) -> Duration {
        self.boot.elapsed()
    }

    /// Mark the beginning of the scripted test phases
    pub fn mark_test_start(&self) {
        *self.test_start.lock() = Some(Instant::now());
    }

    /// Time since the test phases began, or since boot if they never did
    pub fn since_test_start(&self) -> Duration {
        self.test_start
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_else(|| self.boot.elapsed())
    }

    pub fn ready_for_screenshot(&self) -> bool {
        self.ready_for_screenshot.load(Ordering::SeqCst)
    }

    pub fn set_ready_for_screenshot(&self, ready: bool) {
        self.ready_for_screenshot.store(ready, Ordering::SeqCst);
    }

    pub fn driver(&self) -> Option<Arc<dyn Driver>> {
        self.driver.lock().clone()
    }

    pub fn set_driver(&self, driver: Arc<dyn Driver>) {
        *self.driver.lock() = Some(driver);
    }

    pub fn session(&self) -> Option<Session> {
        self.session.lock().as_ref().map(|(session, _)| session.clone())
    }

    /// Creation latency of the current session
    pub fn session_latency(&self) -> Option<Duration> {
        self.session.lock().as_ref().map(|(_, latency)| *latency)
    }

    pub fn set_session(&self, session: Session, latency: Duration) {
        *self.session.lock() = Some((session, latency));
    }

    pub fn clear_session(&self) -> Option<Session> {
        self.session.lock().take().map(|(session, _)| session)
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn cleanup(&self) -> &Cleanup {
        &self.cleanup
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_falls_back_to_boot() {
        let ctx = RunContext::for_tests();
        std::thread::sleep(Duration::from_millis(20));
        assert!(ctx.since_test_start() >= Duration::from_millis(20));

        ctx.mark_test_start();
        assert!(ctx.since_test_start() < Duration::from_millis(20));
        assert!(ctx.since_boot() >= Duration::from_millis(20));
    }

    #[test]
    fn readiness_flag_round_trips() {
        let ctx = RunContext::for_tests();
        assert!(!ctx.ready_for_screenshot());
        ctx.set_ready_for_screenshot(true);
        assert!(ctx.ready_for_screenshot());
    }

    #[test]
    fn session_keeps_its_latency_until_cleared() {
        let ctx = RunContext::for_tests();
        assert!(ctx.session_latency().is_none());

        let session = Session {
            id: "abc".to_string(),
            created_at: chrono::Utc::now(),
        };
        ctx.set_session(session.clone(), Duration::from_millis(340));
        assert_eq!(ctx.session(), Some(session.clone()));
        assert_eq!(ctx.session_latency(), Some(Duration::from_millis(340)));

        assert_eq!(ctx.clear_session(), Some(session));
        assert!(ctx.session().is_none());
        assert!(ctx.session_latency().is_none());
    }
}
