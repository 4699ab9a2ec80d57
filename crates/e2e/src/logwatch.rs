//! Pattern watches over the app's log stream
//!
//! Test code registers a [`LogWatch`] for a regular expression and then blocks
//! on it. The tailer feeds every line through [`LogWatchRegistry::on_line`],
//! which fires and removes every watch the line matches.

use parking_lot::Mutex;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::{E2eError, E2eResult};

/// Receives every log line, matched or not
pub trait LineSink: Send + Sync {
    fn display(&self, line: &str);
}

/// Default sink: echo app log lines through tracing
#[derive(Debug, Default)]
pub struct TracingSink;

impl LineSink for TracingSink {
    fn display(&self, line: &str) {
        info!(target: "app", "★ {}", line);
    }
}

struct ActiveWatch {
    id: u64,
    pattern: Regex,
    signal: oneshot::Sender<()>,
}

struct Inner {
    watches: Mutex<Vec<ActiveWatch>>,
    next_id: AtomicU64,
    sink: Box<dyn LineSink>,
}

/// Registry of active log watches; cheap to clone
#[derive(Clone)]
pub struct LogWatchRegistry {
    inner: Arc<Inner>,
}

impl Default for LogWatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LogWatchRegistry {
    pub fn new() -> Self {
        Self::with_sink(TracingSink)
    }

    pub fn with_sink(sink: impl LineSink + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                watches: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                sink: Box::new(sink),
            }),
        }
    }

    /// Start watching for `pattern`
    pub fn register(&self, pattern: &str) -> E2eResult<LogWatch> {
        let re = Regex::new(pattern).map_err(|e| E2eError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        let (tx, rx) = oneshot::channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner.watches.lock().push(ActiveWatch {
            id,
            pattern: re.clone(),
            signal: tx,
        });
        debug!("Watching log for pattern ({})", re.as_str());

        Ok(LogWatch {
            id,
            pattern: re,
            signal: Some(rx),
            registry: self.clone(),
        })
    }

    /// Feed one log line; returns how many watches it fired
    pub fn on_line(&self, text: &str) -> usize {
        let hits = {
            let mut watches = self.inner.watches.lock();
            let (hits, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *watches)
                .into_iter()
                .partition(|w| w.pattern.is_match(text));
            *watches = rest;
            hits
        };

        let fired = hits.len();
        for watch in hits {
            // The waiter may have gone away; nothing left to notify then.
            let _ = watch.signal.send(());
        }

        self.inner.sink.display(text);
        fired
    }

    /// Block until `watch` fires or `timeout` elapses
    pub async fn wait(&self, watch: LogWatch, timeout: Duration) -> E2eResult<()> {
        watch.wait(timeout).await
    }

    /// Number of watches still waiting for a match
    pub fn active_count(&self) -> usize {
        self.inner.watches.lock().len()
    }

    fn deregister(&self, id: u64) {
        self.inner.watches.lock().retain(|w| w.id != id);
    }
}

/// A registered pattern awaiting its first matching line
///
/// Dropping the handle, or timing out in [`LogWatch::wait`], removes the
/// watch from the registry so a late match never lands in a dead channel.
pub struct LogWatch {
    id: u64,
    pattern: Regex,
    signal: Option<oneshot::Receiver<()>>,
    registry: LogWatchRegistry,
}

impl std::fmt::Debug for LogWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWatch")
            .field("id", &self.id)
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

impl LogWatch {
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Wait for the matching line with a hard deadline
    pub async fn wait(mut self, timeout: Duration) -> E2eResult<()> {
        let pattern = self.pattern.as_str().to_string();
        let Some(rx) = self.signal.take() else {
            return Err(E2eError::LogStreamClosed(pattern));
        };

        let start = Instant::now();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                info!("Saw pattern ({})", pattern);
                Ok(())
            }
            Ok(Err(_)) => Err(E2eError::LogStreamClosed(pattern)),
            Err(_) => Err(E2eError::Timeout {
                pattern,
                elapsed: start.elapsed(),
            }),
        }
    }
}

impl Drop for LogWatch {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}
