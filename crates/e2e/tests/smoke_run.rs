//! Full smoke runs against a shell-script driver process and an in-memory
//! WebDriver endpoint.
//!
//! Run with: cargo test --package smokerun-e2e --test smoke_run

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use smokerun_e2e::artifacts::ArtifactStore;
use smokerun_e2e::phases::PhasePlan;
use smokerun_e2e::testing::FakeDriver;
use smokerun_e2e::{Credentials, RunOutcome, SmokeConfig, SmokeRunner};

const PLAN: &str = r#"
phases:
  - name: prepare
    steps:
      - action: fill
        selector: '#login-username'
        value: '{{account}}'
      - action: fill
        selector: '#login-password'
        value: '{{password}}'
  - name: navigate
    steps:
      - action: click
        selector: '#search'
        timeout_ms: 300
  - name: install
    steps:
      - action: screenshot
        name: installed
  - name: login
    steps:
      - action: log
        message: 'logged in as {{account}}'
"#;

/// Driver stand-in: records its launch, then idles until terminated
fn write_driver(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-chromedriver");
    let script = format!(
        "#!/bin/sh\necho \"$INTEGRATION_TESTS\" > '{}'\n{}\n",
        dir.join("launched").display(),
        body
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config_for(dir: &Path, driver: PathBuf) -> SmokeConfig {
    let mut config = SmokeConfig {
        workdir: dir.to_path_buf(),
        bundle: false,
        app_binary: Some(PathBuf::from("/opt/electron/electron")),
        tail_poll_ms: 20,
        ..Default::default()
    };
    config.driver.executable = driver;
    config.driver.shutdown_grace_ms = 500;
    config
}

fn credentials() -> Credentials {
    Credentials {
        account: "itch-test-account".to_string(),
        api_key: "test-api-key".to_string(),
        password: "hunter2".to_string(),
    }
}

fn runner(config: SmokeConfig, driver: &Arc<FakeDriver>) -> SmokeRunner {
    SmokeRunner::new(config)
        .with_credentials(credentials())
        .with_driver(driver.clone())
        .with_plan(PhasePlan::from_yaml(PLAN).unwrap())
}

/// Write the setup line once the app would have been launched by the session
fn announce_setup(config: &SmokeConfig, driver: Arc<FakeDriver>) {
    let log = config.app_log_path();
    tokio::spawn(async move {
        while driver.sessions_requested() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        std::fs::create_dir_all(log.parent().unwrap()).unwrap();
        std::fs::write(&log, "booting\nSetup done\n").unwrap();
    });
}

async fn run_bounded(runner: SmokeRunner) -> RunOutcome {
    tokio::time::timeout(Duration::from_secs(20), runner.run())
        .await
        .expect("smoke run hung")
}

#[tokio::test]
async fn successful_run_exits_zero_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path(), write_driver(dir.path(), "exec sleep 30"));
    let driver = Arc::new(FakeDriver::new());
    announce_setup(&config, driver.clone());

    let outcome = run_bounded(runner(config.clone(), &driver)).await;

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.failure);
    assert!(outcome.success());

    let launched = std::fs::read_to_string(dir.path().join("launched")).unwrap();
    assert_eq!(launched.trim(), "1");

    let shots = ArtifactStore::new(config.screenshot_dir());
    assert!(shots.path_for("initial").exists());
    assert!(shots.path_for("installed").exists());
    assert!(shots.path_for("final").exists());

    let calls = driver.calls();
    assert_eq!(
        calls,
        vec![
            "keys:#login-username=itch-test-account".to_string(),
            "keys:#login-password=hunter2".to_string(),
            "click:#search".to_string(),
        ]
    );

    assert_eq!(driver.sessions_requested(), 1);
    assert_eq!(driver.windows_closed(), 1);
    assert_eq!(driver.sessions_deleted(), 1);
    assert_eq!(driver.logs_fetched(), 0);
}

#[tokio::test]
async fn missing_api_key_stops_before_launch() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(dir.path(), write_driver(dir.path(), "exec sleep 30"));
    config.env_prefix = "SMOKERUN_IT_UNSET_".to_string();
    let driver = Arc::new(FakeDriver::new());

    let outcome = run_bounded(
        SmokeRunner::new(config.clone())
            .with_driver(driver.clone())
            .with_plan(PhasePlan::from_yaml(PLAN).unwrap()),
    )
    .await;

    assert_eq!(outcome.exit_code, 1);
    let failure = outcome.failure.unwrap();
    assert!(
        failure.error.contains("SMOKERUN_IT_UNSET_TEST_ACCOUNT_API_KEY"),
        "{}",
        failure.error
    );
    assert!(!dir.path().join("launched").exists());
    assert_eq!(driver.sessions_requested(), 0);
    assert_eq!(driver.screenshots_taken(), 0);
    assert!(ArtifactStore::new(config.screenshot_dir())
        .list()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn setup_timeout_captures_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(dir.path(), write_driver(dir.path(), "exec sleep 30"));
    config.setup_timeout_secs = 1;
    let driver = Arc::new(FakeDriver::new());

    let outcome = run_bounded(runner(config.clone(), &driver)).await;

    assert_eq!(outcome.exit_code, 1);
    let failure = outcome.failure.unwrap();
    assert!(failure.error.contains("Timed out"), "{}", failure.error);
    assert!(failure.error.contains("Setup done"), "{}", failure.error);
    assert!(failure.cleanup_ran);

    // Initial screenshot plus the failure screenshot
    assert!(driver.screenshots_taken() >= 2);
    assert_eq!(driver.logs_fetched(), 1);
    assert_eq!(driver.sessions_deleted(), 1);
    assert!(driver.calls().is_empty());

    let shots = ArtifactStore::new(config.screenshot_dir()).list().unwrap();
    assert_eq!(shots.len(), 2, "{shots:?}");
}

#[tokio::test]
async fn driver_crash_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(dir.path(), write_driver(dir.path(), "sleep 0.5\nexit 3"));
    config.setup_timeout_secs = 30;
    let driver = Arc::new(FakeDriver::new());

    let outcome = run_bounded(runner(config, &driver)).await;

    assert_eq!(outcome.exit_code, 1);
    let failure = outcome.failure.unwrap();
    assert!(failure.error.contains("crashed"), "{}", failure.error);
    assert!(failure.cleanup_ran);
    assert_eq!(driver.sessions_deleted(), 1);
}

#[tokio::test]
async fn exhausted_session_attempts_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path(), write_driver(dir.path(), "exec sleep 30"));
    let driver = Arc::new(FakeDriver::new().fail_sessions(5));

    let outcome = run_bounded(runner(config, &driver)).await;

    assert_eq!(outcome.exit_code, 1);
    let failure = outcome.failure.unwrap();
    assert!(failure.error.contains("5 attempt"), "{}", failure.error);
    assert_eq!(driver.sessions_requested(), 5);
    // Never ready, so no screenshot was attempted
    assert_eq!(driver.screenshots_taken(), 0);
    assert!(failure.cleanup_ran);
}

#[tokio::test]
async fn session_retries_recover() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path(), write_driver(dir.path(), "exec sleep 30"));
    let driver = Arc::new(FakeDriver::new().fail_sessions(2));
    announce_setup(&config, driver.clone());

    let outcome = run_bounded(runner(config, &driver)).await;

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.failure);
    assert_eq!(driver.sessions_requested(), 3);
}

#[tokio::test]
async fn failing_phase_is_named_in_the_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path(), write_driver(dir.path(), "exec sleep 30"));
    let driver = Arc::new(FakeDriver::new().missing("#search"));
    announce_setup(&config, driver.clone());

    let outcome = run_bounded(runner(config, &driver)).await;

    assert_eq!(outcome.exit_code, 1);
    let failure = outcome.failure.unwrap();
    assert!(failure.error.contains("Phase navigate"), "{}", failure.error);
    assert!(failure.error.contains("#search"), "{}", failure.error);
    // The prepare phase ran, the install phase did not
    assert_eq!(driver.calls().len(), 2);
    assert_eq!(driver.windows_closed(), 1);
}

#[tokio::test]
async fn invalid_plan_is_rejected_before_launch() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path(), write_driver(dir.path(), "exec sleep 30"));
    let driver = Arc::new(FakeDriver::new());
    let mut plan = PhasePlan::from_yaml(PLAN).unwrap();
    plan.phases.swap(1, 2);

    let outcome = run_bounded(
        SmokeRunner::new(config)
            .with_credentials(credentials())
            .with_driver(driver.clone())
            .with_plan(plan),
    )
    .await;

    assert_eq!(outcome.exit_code, 1);
    assert!(outcome.failure.unwrap().error.contains("Invalid phase plan"));
    assert!(!dir.path().join("launched").exists());
    assert_eq!(driver.sessions_requested(), 0);
}
