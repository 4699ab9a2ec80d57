//! Smoke run configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{E2eError, E2eResult};
use crate::session::RetryPolicy;

/// Top-level configuration for a smoke run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmokeConfig {
    /// Working directory of the app under test
    pub workdir: PathBuf,

    /// Scratch prefix (relative to workdir) the app keeps its user data in
    pub prefix: String,

    /// App name, used for the log file name
    pub app_name: String,

    /// Automation driver settings
    pub driver: DriverConfig,

    /// Electron binary (None = resolve through node)
    pub app_binary: Option<PathBuf>,

    /// Path passed to the app as `app=<path>` (None = workdir)
    pub app_path: Option<PathBuf>,

    /// Directory screenshots are written to
    pub screenshot_dir: PathBuf,

    /// Log pattern that marks the app as ready
    pub setup_pattern: String,

    /// How long to wait for the setup pattern
    pub setup_timeout_secs: u64,

    /// Session acquisition policy
    pub session: RetryPolicy,

    /// Log tailer poll interval
    pub tail_poll_ms: u64,

    /// Run `npm run compile` before launching
    pub bundle: bool,

    /// Prefix prepended to every environment variable name we read or inject
    pub env_prefix: String,

    /// Test account used by the login phase
    pub account_name: String,

    /// Phase plan file (None = built-in plan)
    pub phases_file: Option<PathBuf>,
}

impl Default for SmokeConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            prefix: "tmp".to_string(),
            app_name: "itch".to_string(),
            driver: DriverConfig::default(),
            app_binary: None,
            app_path: None,
            screenshot_dir: PathBuf::from("screenshots"),
            setup_pattern: "Setup done".to_string(),
            setup_timeout_secs: 60,
            session: RetryPolicy::default(),
            tail_poll_ms: 250,
            bundle: true,
            env_prefix: String::new(),
            account_name: "itch-test-account".to_string(),
            phases_file: None,
        }
    }
}

/// Automation driver (chromedriver) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Executable path or name looked up on PATH
    pub executable: PathBuf,

    /// Control endpoint port
    pub port: u16,

    /// Driver log file (None = `<workdir>/chrome-driver.log.txt`)
    pub log_path: Option<PathBuf>,

    /// Grace period between SIGTERM and a forced kill
    pub shutdown_grace_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("chromedriver"),
            port: 9515,
            log_path: None,
            shutdown_grace_ms: 2000,
        }
    }
}

impl SmokeConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject values the run cannot work with
    pub fn validate(&self) -> E2eResult<()> {
        if self.session.max_attempts == 0 {
            return Err(E2eError::Config(
                "session.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.prefix.is_empty() {
            return Err(E2eError::Config("prefix must not be empty".to_string()));
        }
        if self.app_name.is_empty() {
            return Err(E2eError::Config("app_name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Directory holding the app's scratch data
    pub fn prefix_dir(&self) -> PathBuf {
        self.workdir.join(&self.prefix)
    }

    /// The app log file the tailer follows
    pub fn app_log_path(&self) -> PathBuf {
        self.prefix_dir()
            .join("prefix")
            .join("userData")
            .join("logs")
            .join(format!("{}.txt", self.app_name))
    }

    pub fn driver_log_path(&self) -> PathBuf {
        self.driver
            .log_path
            .clone()
            .unwrap_or_else(|| self.workdir.join("chrome-driver.log.txt"))
    }

    pub fn driver_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.driver.port)
    }

    pub fn app_path(&self) -> PathBuf {
        self.app_path.clone().unwrap_or_else(|| self.workdir.clone())
    }

    pub fn screenshot_dir(&self) -> PathBuf {
        if self.screenshot_dir.is_absolute() {
            self.screenshot_dir.clone()
        } else {
            self.workdir.join(&self.screenshot_dir)
        }
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    pub fn tail_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tail_poll_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.driver.shutdown_grace_ms)
    }

    /// Name of an environment variable, with the configured prefix applied
    pub fn env_key(&self, name: &str) -> String {
        format!("{}{}", self.env_prefix, name)
    }

    /// Environment overrides injected into the driver process
    pub fn driver_env(&self) -> Vec<(String, String)> {
        vec![
            (self.env_key("INTEGRATION_TESTS"), "1".to_string()),
            (self.env_key("LOG_LEVEL"), "debug".to_string()),
            (self.env_key("NO_STDOUT"), "1".to_string()),
        ]
    }

    /// Command line arguments passed to the driver process
    pub fn driver_args(&self) -> Vec<String> {
        vec![
            format!("--port={}", self.driver.port),
            format!("--log-path={}", self.driver_log_path().display()),
        ]
    }
}

/// Test account credentials sourced from the environment
#[derive(Clone)]
pub struct Credentials {
    pub account: String,
    pub api_key: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("api_key", &"<redacted>")
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Read credentials from the process environment
    pub fn from_env(config: &SmokeConfig) -> E2eResult<Self> {
        Self::from_lookup(config, |key| std::env::var(key).ok())
    }

    /// Read credentials through an arbitrary lookup (the environment in production)
    pub fn from_lookup<F>(config: &SmokeConfig, lookup: F) -> E2eResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key_var = config.env_key("TEST_ACCOUNT_API_KEY");
        let api_key = lookup(&api_key_var)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                E2eError::Precondition(format!(
                    "API key not given via environment ({}), stopping here",
                    api_key_var
                ))
            })?;
        let password = lookup(&config.env_key("TEST_ACCOUNT_PASSWORD")).unwrap_or_default();

        Ok(Self {
            account: config.account_name.clone(),
            api_key,
            password,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_paths_follow_app_layout() {
        let config = SmokeConfig {
            workdir: PathBuf::from("/work"),
            ..Default::default()
        };
        assert_eq!(
            config.app_log_path(),
            PathBuf::from("/work/tmp/prefix/userData/logs/itch.txt")
        );
        assert_eq!(
            config.driver_log_path(),
            PathBuf::from("/work/chrome-driver.log.txt")
        );
        assert_eq!(config.driver_url(), "http://127.0.0.1:9515");
        assert_eq!(
            config.driver_args(),
            vec![
                "--port=9515".to_string(),
                "--log-path=/work/chrome-driver.log.txt".to_string()
            ]
        );
    }

    #[test]
    fn driver_env_applies_prefix() {
        let config = SmokeConfig {
            env_prefix: "ITCH_".to_string(),
            ..Default::default()
        };
        let env: HashMap<_, _> = config.driver_env().into_iter().collect();
        assert_eq!(env.get("ITCH_INTEGRATION_TESTS").map(String::as_str), Some("1"));
        assert_eq!(env.get("ITCH_LOG_LEVEL").map(String::as_str), Some("debug"));
        assert_eq!(env.get("ITCH_NO_STDOUT").map(String::as_str), Some("1"));
    }

    #[test]
    fn missing_api_key_is_a_precondition_error() {
        let config = SmokeConfig::default();
        let err = Credentials::from_lookup(&config, |_| None).unwrap_err();
        assert!(matches!(err, E2eError::Precondition(_)));

        let err = Credentials::from_lookup(&config, |_| Some(String::new())).unwrap_err();
        assert!(matches!(err, E2eError::Precondition(_)));
    }

    #[test]
    fn credentials_are_read_and_redacted() {
        let config = SmokeConfig::default();
        let creds = Credentials::from_lookup(&config, |key| match key {
            "TEST_ACCOUNT_API_KEY" => Some("key-123".to_string()),
            "TEST_ACCOUNT_PASSWORD" => Some("hunter2".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(creds.api_key, "key-123");
        assert_eq!(creds.password, "hunter2");
        assert_eq!(creds.account, "itch-test-account");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("key-123"));
    }

    #[test]
    fn load_parses_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smokerun.toml");
        std::fs::write(
            &path,
            r#"
app_name = "kitch"
setup_timeout_secs = 5

[driver]
port = 4444

[session]
max_attempts = 3
"#,
        )
        .unwrap();

        let config = SmokeConfig::load(&path).unwrap();
        assert_eq!(config.app_name, "kitch");
        assert_eq!(config.setup_timeout(), Duration::from_secs(5));
        assert_eq!(config.driver.port, 4444);
        assert_eq!(config.session.max_attempts, 3);
        assert_eq!(config.prefix, "tmp");
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let config = SmokeConfig::load(Path::new("/nonexistent/smokerun.toml")).unwrap();
        assert_eq!(config.session.max_attempts, 5);
        assert_eq!(config.setup_pattern, "Setup done");
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut config = SmokeConfig::default();
        config.session.max_attempts = 0;
        assert!(matches!(config.validate(), Err(E2eError::Config(_))));
    }
}
