//! Top-level smoke run that ties the driver, log stream and phases together

use futures::FutureExt;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::config::{Credentials, SmokeConfig};
use crate::context::RunContext;
use crate::error::E2eResult;
use crate::failure::{fatal_channel, FailureController, FailureReport, FatalReporter};
use crate::logwatch::LogWatchRegistry;
use crate::phases::{PhasePlan, PhaseSequencer};
use crate::prepare;
use crate::session::SessionNegotiator;
use crate::supervisor::{LaunchSpec, ProcessHandle, ProcessSupervisor};
use crate::tailer::LogTailer;
use crate::webdriver::{Capabilities, Driver, WebDriverClient};

/// How a run ended
#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub failure: Option<FailureReport>,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Orchestrates one smoke run from launch to exit status
pub struct SmokeRunner {
    config: SmokeConfig,
    credentials: Option<Credentials>,
    driver: Option<Arc<dyn Driver>>,
    plan: Option<PhasePlan>,
    logs: LogWatchRegistry,
}

impl SmokeRunner {
    pub fn new(config: SmokeConfig) -> Self {
        Self {
            config,
            credentials: None,
            driver: None,
            plan: None,
            logs: LogWatchRegistry::new(),
        }
    }

    /// Use these credentials instead of reading the environment
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Use this driver instead of an HTTP client to the launched process
    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_plan(mut self, plan: PhasePlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_log_registry(mut self, logs: LogWatchRegistry) -> Self {
        self.logs = logs;
        self
    }

    /// Run everything; the returned exit code is what the process should exit with
    pub async fn run(mut self) -> RunOutcome {
        let credentials = match self.credentials.take() {
            Some(c) => Ok(c),
            None => Credentials::from_env(&self.config),
        };
        let artifacts = ArtifactStore::new(self.config.screenshot_dir());

        let credentials = match credentials {
            Ok(c) => c,
            Err(e) => {
                // Nothing launched yet; fail fast with nothing to clean up
                let ctx = Arc::new(RunContext::new(None, artifacts));
                return Self::finish(&ctx, Err(e)).await;
            }
        };

        let ctx = Arc::new(RunContext::new(Some(credentials), artifacts));
        let (fatal, mut fatal_rx) = fatal_channel();
        let tail_cancel = CancellationToken::new();

        let mut result = tokio::select! {
            biased;
            err = fatal_rx.recv() => Err(err),
            res = self.main_flow(&ctx, fatal, tail_cancel.clone()) => res,
        };

        // A crash that raced a successful finish still fails the run
        if result.is_ok() {
            if let Some(err) = fatal_rx.try_recv() {
                result = Err(err);
            }
        }

        let outcome = Self::finish(&ctx, result).await;
        tail_cancel.cancel();
        outcome
    }

    async fn finish(ctx: &Arc<RunContext>, result: E2eResult<()>) -> RunOutcome {
        match result {
            Ok(()) => {
                ctx.cleanup().run().await;
                RunOutcome {
                    exit_code: 0,
                    failure: None,
                }
            }
            Err(e) => {
                let report = FailureController::new(ctx.clone()).fail(e).await;
                RunOutcome {
                    exit_code: report.exit_code,
                    failure: Some(report),
                }
            }
        }
    }

    async fn main_flow(
        &self,
        ctx: &Arc<RunContext>,
        fatal: FatalReporter,
        tail_cancel: CancellationToken,
    ) -> E2eResult<()> {
        let config = &self.config;

        prepare::reset_workspace(config, ctx.artifacts())?;
        let prepared = prepare::prepare(config).await?;
        let plan = self.load_plan()?;

        let setup_watch = self.logs.register(&config.setup_pattern)?;
        LogTailer::new(config.app_log_path(), config.tail_poll_interval())
            .spawn(self.logs.clone(), tail_cancel);

        let process = ProcessSupervisor::start(
            LaunchSpec {
                executable: prepared.driver,
                args: config.driver_args(),
                env: config.driver_env(),
                shutdown_grace: config.shutdown_grace(),
            },
            fatal,
        )?;

        let driver: Arc<dyn Driver> = match &self.driver {
            Some(driver) => driver.clone(),
            None => Arc::new(WebDriverClient::new(
                config.driver_url(),
                Capabilities::electron_app(prepared.app_binary, &config.app_path()),
            )?),
        };
        ctx.set_driver(driver.clone());
        register_cleanup(ctx, driver.clone(), process);

        let ctx_ref: &RunContext = ctx;
        let driver_ref: &dyn Driver = driver.as_ref();
        SessionNegotiator::new(config.session.clone())
            .acquire(driver_ref, ctx_ref, move || async move {
                ctx_ref
                    .artifacts()
                    .capture(driver_ref, ctx_ref, "initial")
                    .await
                    .map(|_| ())
            })
            .await?;

        info!("Waiting for setup to be done...");
        setup_watch.wait(config.setup_timeout()).await?;
        ctx.mark_test_start();

        PhaseSequencer::new(driver_ref, ctx_ref, &self.logs)
            .run(&plan)
            .await?;

        info!("Succeeded in {:?}", ctx.since_test_start());
        info!("Total time {:?}", ctx.since_boot());
        if let Some(latency) = ctx.session_latency() {
            info!("Session creation took {:?}", latency);
        }

        info!("Taking final screenshot");
        if let Err(e) = ctx.artifacts().capture(driver_ref, ctx_ref, "final").await {
            error!("Could not take final screenshot: {}", e);
        }

        Ok(())
    }

    fn load_plan(&self) -> E2eResult<PhasePlan> {
        match (&self.plan, &self.config.phases_file) {
            (Some(plan), _) => {
                plan.validate()?;
                Ok(plan.clone())
            }
            (None, Some(path)) => PhasePlan::from_file(path),
            (None, None) => PhasePlan::builtin(),
        }
    }
}

/// Close the window, release the session and stop the driver, once
fn register_cleanup(ctx: &Arc<RunContext>, driver: Arc<dyn Driver>, process: ProcessHandle) {
    let weak: Weak<RunContext> = Arc::downgrade(ctx);
    ctx.cleanup().register(move || {
        async move {
            let session = weak.upgrade().and_then(|ctx| ctx.clear_session());
            if let Some(session) = session {
                info!("Closing driver window...");
                if let Err(e) = driver.close_window().await {
                    warn!("Could not close window: {}", e);
                }
                if let Err(e) = driver.delete_session().await {
                    warn!("Could not delete session {}: {}", session.id, e);
                }
            }
            info!("Cancelling driver context...");
            process.shutdown().await;
        }
        .boxed()
    });
}
