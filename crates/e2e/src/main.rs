//! smokerun
//!
//! Launches the driver, runs the smoke phases and exits with the run's status.

use anyhow::Context;
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use smokerun_e2e::{SmokeConfig, SmokeRunner};

#[derive(Parser)]
#[command(name = "smokerun")]
#[command(about = "Smoke test an Electron app over WebDriver")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "smokerun.toml")]
    config: PathBuf,

    /// Working directory of the app under test
    #[arg(short, long)]
    workdir: Option<PathBuf>,

    /// Driver executable (path or name on PATH)
    #[arg(long)]
    driver: Option<PathBuf>,

    /// Driver control port
    #[arg(short, long)]
    port: Option<u16>,

    /// Electron binary, skips resolving it through node
    #[arg(long)]
    app_binary: Option<PathBuf>,

    /// Phase plan (YAML)
    #[arg(long)]
    phases: Option<PathBuf>,

    /// Screenshot directory
    #[arg(long)]
    screenshots: Option<PathBuf>,

    /// Skip `npm run compile` (`NO_BUNDLE=1` works too)
    #[arg(
        long,
        env = "NO_BUNDLE",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    no_bundle: bool,

    /// Seconds to wait for the app to finish setup
    #[arg(long)]
    setup_timeout: Option<u64>,

    /// Session creation attempts
    #[arg(long)]
    attempts: Option<u32>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn apply(self, config: &mut SmokeConfig) {
        if let Some(workdir) = self.workdir {
            config.workdir = workdir;
        }
        if let Some(driver) = self.driver {
            config.driver.executable = driver;
        }
        if let Some(port) = self.port {
            config.driver.port = port;
        }
        if let Some(app_binary) = self.app_binary {
            config.app_binary = Some(app_binary);
        }
        if let Some(phases) = self.phases {
            config.phases_file = Some(phases);
        }
        if let Some(screenshots) = self.screenshots {
            config.screenshot_dir = screenshots;
        }
        if self.no_bundle {
            config.bundle = false;
        }
        if let Some(secs) = self.setup_timeout {
            config.setup_timeout_secs = secs;
        }
        if let Some(attempts) = self.attempts {
            config.session.max_attempts = attempts;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("smokerun v{}", env!("CARGO_PKG_VERSION"));

    let mut config = SmokeConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let outcome = SmokeRunner::new(config).run().await;
    std::process::exit(outcome.exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_bundle_follows_flag_and_environment() {
        std::env::remove_var("NO_BUNDLE");
        let cli = Cli::try_parse_from(["smokerun"]).unwrap();
        assert!(!cli.no_bundle);

        let cli = Cli::try_parse_from(["smokerun", "--no-bundle"]).unwrap();
        assert!(cli.no_bundle);

        std::env::set_var("NO_BUNDLE", "1");
        let cli = Cli::try_parse_from(["smokerun"]).unwrap();
        assert!(cli.no_bundle);

        std::env::set_var("NO_BUNDLE", "0");
        let cli = Cli::try_parse_from(["smokerun"]).unwrap();
        assert!(!cli.no_bundle);

        std::env::remove_var("NO_BUNDLE");
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "smokerun",
            "--workdir",
            "/work",
            "--port",
            "9600",
            "--attempts",
            "2",
            "--setup-timeout",
            "5",
        ])
        .unwrap();

        let mut config = SmokeConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.workdir, PathBuf::from("/work"));
        assert_eq!(config.driver.port, 9600);
        assert_eq!(config.session.max_attempts, 2);
        assert_eq!(config.setup_timeout_secs, 5);
    }
}
