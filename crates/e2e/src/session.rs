//! Session negotiation with bounded retries

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::context::RunContext;
use crate::error::{E2eError, E2eResult};
use crate::webdriver::{Driver, Session};

/// How many times to try for a session, and how long to pause between tries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,

    /// Delay between failed attempts. Zero keeps retries back to back.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 0,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// A session that passed verification
#[derive(Debug, Clone)]
pub struct AcquiredSession {
    pub session: Session,
    /// Attempts it took, counting the successful one
    pub attempts: u32,
    pub latency: Duration,
}

pub struct SessionNegotiator {
    policy: RetryPolicy,
}

impl SessionNegotiator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Create and verify a session, retrying up to the policy's attempt budget
    ///
    /// `verify` runs right after the handshake with the readiness flag set.
    /// If it fails the flag is cleared again and the attempt counts as failed.
    pub async fn acquire<F, Fut>(
        &self,
        driver: &dyn Driver,
        ctx: &RunContext,
        mut verify: F,
    ) -> E2eResult<AcquiredSession>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = E2eResult<()>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            info!("Creating a webdriver session (try #{})", attempt);

            match self.try_once(driver, ctx, &mut verify).await {
                Ok((session, latency)) => {
                    info!("Session {} created in {:?}", session.id, latency);
                    ctx.set_session(session.clone(), latency);
                    return Ok(AcquiredSession {
                        session,
                        attempts: attempt,
                        latency,
                    });
                }
                Err(e) => {
                    warn!("Could not create a webdriver session: {}", e);
                    last_error = e.to_string();
                }
            }

            if attempt < max_attempts && !self.policy.backoff().is_zero() {
                tokio::time::sleep(self.policy.backoff()).await;
            }
        }

        warn!("Could not create a webdriver session after {} tries", max_attempts);
        Err(E2eError::SessionExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn try_once<F, Fut>(
        &self,
        driver: &dyn Driver,
        ctx: &RunContext,
        verify: &mut F,
    ) -> E2eResult<(Session, Duration)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = E2eResult<()>>,
    {
        let before = Instant::now();
        let session = driver.create_session().await?;
        let latency = before.elapsed();

        ctx.set_ready_for_screenshot(true);
        if let Err(e) = verify().await {
            ctx.set_ready_for_screenshot(false);
            if let Err(del) = driver.delete_session().await {
                warn!("Could not discard unverified session {}: {}", session.id, del);
            }
            return Err(e);
        }

        Ok((session, latency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDriver;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let driver = FakeDriver::new().fail_sessions(2);
        let ctx = RunContext::for_tests();
        let negotiator = SessionNegotiator::new(RetryPolicy::default());

        let acquired = negotiator
            .acquire(&driver, &ctx, || async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(acquired.attempts, 3);
        assert_eq!(driver.sessions_requested(), 3);
        assert!(ctx.ready_for_screenshot());
        assert_eq!(ctx.session().map(|s| s.id), Some(acquired.session.id));
        assert_eq!(ctx.session_latency(), Some(acquired.latency));
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let driver = FakeDriver::new().fail_sessions(u32::MAX);
        let ctx = RunContext::for_tests();
        let negotiator = SessionNegotiator::new(RetryPolicy {
            max_attempts: 5,
            backoff_ms: 0,
        });

        let err = negotiator
            .acquire(&driver, &ctx, || async { Ok(()) })
            .await
            .unwrap_err();

        match err {
            E2eError::SessionExhausted { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(driver.sessions_requested(), 5);
        assert!(ctx.session().is_none());
    }

    #[tokio::test]
    async fn failed_verification_resets_readiness_and_retries() {
        let driver = FakeDriver::new();
        let ctx = RunContext::for_tests();
        let negotiator = SessionNegotiator::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let acquired = negotiator
            .acquire(&driver, &ctx, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let ready = ctx.ready_for_screenshot();
                async move {
                    assert!(ready, "verification must run with the readiness flag set");
                    if n == 0 {
                        Err(E2eError::DiagnosticCapture("blank window".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(acquired.attempts, 2);
        assert_eq!(driver.sessions_deleted(), 1);
        assert!(ctx.ready_for_screenshot());
    }

    #[tokio::test]
    async fn verification_failing_every_time_leaves_flag_cleared() {
        let driver = FakeDriver::new();
        let ctx = RunContext::for_tests();
        let negotiator = SessionNegotiator::new(RetryPolicy {
            max_attempts: 2,
            backoff_ms: 1,
        });

        let err = negotiator
            .acquire(&driver, &ctx, || async {
                Err(E2eError::DiagnosticCapture("no pixels".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, E2eError::SessionExhausted { attempts: 2, .. }));
        assert!(!ctx.ready_for_screenshot());
    }
}
