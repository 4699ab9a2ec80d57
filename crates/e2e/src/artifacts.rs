//! Screenshot artifacts

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::context::RunContext;
use crate::error::{E2eError, E2eResult};
use crate::webdriver::Driver;

const MAX_SLUG_LEN: usize = 60;

/// Directory that screenshots are written to, one file per label
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remove screenshots from a previous run
    pub fn reset(&self) -> E2eResult<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path_for(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{}.png", file_stem(label)))
    }

    /// Capture the driver's current window as `<label>.png`
    pub async fn capture(
        &self,
        driver: &dyn Driver,
        ctx: &RunContext,
        label: &str,
    ) -> E2eResult<PathBuf> {
        if !ctx.ready_for_screenshot() {
            return Err(E2eError::DiagnosticCapture(format!(
                "not ready for screenshot '{}' yet",
                label
            )));
        }

        let png = driver
            .screenshot()
            .await
            .map_err(|e| E2eError::DiagnosticCapture(format!("screenshot '{}': {}", label, e)))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(label);
        tokio::fs::write(&path, &png).await?;
        info!("Screenshot saved to {}", path.display());
        Ok(path)
    }

    /// Screenshots currently in the store, sorted by name
    pub fn list(&self) -> E2eResult<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut shots = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().map(|e| e == "png").unwrap_or(false) {
                shots.push(path);
            }
        }
        shots.sort();
        Ok(shots)
    }
}

/// Filesystem-safe name for a screenshot label
///
/// Plain labels like `initial` are kept as is. Anything else (error text,
/// most commonly) is slugged and suffixed with a short digest of the label.
pub fn file_stem(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    for c in label.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');

    if slug == label && !slug.is_empty() && slug.len() <= MAX_SLUG_LEN {
        return slug.to_string();
    }

    let digest = hex::encode(Sha256::digest(label.as_bytes()));
    let short: String = slug.chars().take(MAX_SLUG_LEN).collect();
    let short = short.trim_end_matches('-');
    if short.is_empty() {
        format!("screenshot-{}", &digest[..8])
    } else {
        format!("{}-{}", short, &digest[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDriver;
    use test_case::test_case;

    #[test_case("initial", "initial" ; "plain label")]
    #[test_case("final", "final" ; "final label")]
    #[test_case("login-form_2", "login-form_2" ; "dashes and underscores")]
    fn plain_labels_are_kept(label: &str, expected: &str) {
        assert_eq!(file_stem(label), expected);
    }

    #[test]
    fn error_text_is_slugged_with_digest() {
        let stem = file_stem("Timed out after 60s waiting for pattern (Setup done)");
        assert!(stem.starts_with("Timed-out-after-60s-waiting-for-pattern-Setup-done-"));
        assert!(!stem.contains(' '));
        assert!(!stem.contains('('));
        assert_eq!(stem.len(), "Timed-out-after-60s-waiting-for-pattern-Setup-done-".len() + 8);
    }

    #[test]
    fn distinct_errors_get_distinct_names() {
        let a = file_stem("Phase login failed at click:#submit: gone");
        let b = file_stem("Phase login failed at click:#submit: gone!");
        assert_ne!(a, b);
    }

    #[test]
    fn long_and_symbol_only_labels_stay_bounded() {
        let long = "x".repeat(300);
        assert!(file_stem(&long).len() <= MAX_SLUG_LEN + 9);
        assert!(file_stem("/../..").starts_with("screenshot-"));
        assert!(file_stem("").starts_with("screenshot-"));
    }

    #[tokio::test]
    async fn capture_requires_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("shots"));
        let ctx = RunContext::for_tests();
        let driver = FakeDriver::new();

        let err = store.capture(&driver, &ctx, "initial").await.unwrap_err();
        assert!(matches!(err, E2eError::DiagnosticCapture(_)));
        assert_eq!(driver.screenshots_taken(), 0);

        ctx.set_ready_for_screenshot(true);
        let path = store.capture(&driver, &ctx, "initial").await.unwrap();
        assert_eq!(path, dir.path().join("shots").join("initial.png"));
        assert!(path.exists());
        assert_eq!(store.list().unwrap(), vec![path]);
    }

    #[tokio::test]
    async fn reset_clears_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("shots"));
        store.reset().unwrap();

        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.path_for("old"), b"png").unwrap();
        store.reset().unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
