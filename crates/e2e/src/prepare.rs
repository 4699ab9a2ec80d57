//! Work that has to happen before the driver is launched

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{error, info};

use crate::artifacts::ArtifactStore;
use crate::config::SmokeConfig;
use crate::error::{E2eError, E2eResult};

/// Outcome of the preparation tasks
#[derive(Debug, Clone)]
pub struct Prepared {
    /// Resolved driver executable
    pub driver: PathBuf,
    /// Electron binary handed to the driver
    pub app_binary: PathBuf,
}

/// Wipe state left over from a previous run
pub fn reset_workspace(config: &SmokeConfig, artifacts: &ArtifactStore) -> E2eResult<()> {
    let prefix = config.prefix_dir();
    match std::fs::remove_dir_all(&prefix) {
        Ok(()) => info!("Removed {}", prefix.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    artifacts.reset()
}

/// Run the preparation tasks concurrently
pub async fn prepare(config: &SmokeConfig) -> E2eResult<Prepared> {
    let (_, driver, app_binary) = tokio::try_join!(
        bundle(config),
        locate_driver(config),
        resolve_app_binary(config),
    )?;
    Ok(Prepared { driver, app_binary })
}

/// `npm run compile`, unless bundling is turned off
pub async fn bundle(config: &SmokeConfig) -> E2eResult<()> {
    if !config.bundle {
        info!("Skipping bundle step");
        return Ok(());
    }

    info!("Bundling...");
    let status = Command::new("npm")
        .args(["run", "compile"])
        .current_dir(&config.workdir)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| E2eError::Prepare(format!("could not run npm: {}", e)))?;

    if !status.success() {
        error!("Bundling failed: {}", status);
        return Err(E2eError::Prepare(format!("npm run compile: {}", status)));
    }
    info!("✓ Everything is bundled!");
    Ok(())
}

/// The driver executable, checked for existence
pub async fn locate_driver(config: &SmokeConfig) -> E2eResult<PathBuf> {
    let exe = &config.driver.executable;
    let found = if exe.components().count() > 1 || exe.is_absolute() {
        let path = if exe.is_absolute() {
            exe.clone()
        } else {
            config.workdir.join(exe)
        };
        path.is_file().then_some(path)
    } else {
        find_on_path(exe)
    };

    let driver = found.ok_or_else(|| {
        E2eError::Prepare(format!("driver executable {} not found", exe.display()))
    })?;
    info!("✓ Driver is set up: {}", driver.display());
    Ok(driver)
}

fn find_on_path(name: &Path) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// The Electron binary: configured explicitly or asked from node
pub async fn resolve_app_binary(config: &SmokeConfig) -> E2eResult<PathBuf> {
    let binary = match &config.app_binary {
        Some(path) => path.clone(),
        None => {
            let output = Command::new("node")
                .args(["-e", "console.log(require('electron'))"])
                .current_dir(&config.workdir)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| E2eError::Prepare(format!("could not run node: {}", e)))?;

            if !output.status.success() {
                return Err(E2eError::Prepare(format!(
                    "resolving electron failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            PathBuf::from(String::from_utf8_lossy(&output.stdout).trim())
        }
    };

    info!("Using electron: {}", relative_to(&binary, &config.workdir).display());
    Ok(binary)
}

/// `path` relative to `base` when it lives below it, otherwise unchanged
pub fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    path.strip_prefix(&base)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}
