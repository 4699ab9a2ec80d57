//! Follow a growing log file line by line
//!
//! The tailer reads from the start of the file, waits for the file to appear,
//! buffers partial lines and reopens the file after errors or truncation.
//! Filesystem events on the log directory wake it early; the poll interval
//! stays as the fallback for missed events and for the directory not existing
//! yet.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::logwatch::LogWatchRegistry;

const READ_CHUNK: usize = 8 * 1024;

/// Filesystem watch on the log file's directory
struct Wakeup {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<()>,
}

impl Wakeup {
    /// Watch the parent directory for changes to `path`; None if it cannot be watched yet
    fn watch(path: &Path) -> Result<Option<Self>, notify::Error> {
        let dir = match path.parent() {
            Some(dir) if dir.as_os_str().is_empty() => Path::new("."),
            Some(dir) => dir,
            None => return Ok(None),
        };
        if !dir.is_dir() {
            return Ok(None);
        }
        let target: Option<OsString> = path.file_name().map(|n| n.to_os_string());

        let (tx, rx) = mpsc::channel(16);
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                let Ok(event) = res else { return };
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                let ours = event.paths.is_empty()
                    || event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == target.as_deref());
                if ours {
                    let _ = tx.try_send(());
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        debug!("Watching {} for log changes", dir.display());

        Ok(Some(Self {
            _watcher: watcher,
            rx,
        }))
    }
}

/// Follower of a single log file, woken by filesystem events or the poll tick
pub struct LogTailer {
    path: PathBuf,
    poll_interval: Duration,
    file: Option<File>,
    offset: u64,
    pending: Vec<u8>,
    ready: std::collections::VecDeque<String>,
    wakeup: Option<Wakeup>,
    /// Set once watching failed; the tailer then only polls
    poll_only: bool,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            file: None,
            offset: 0,
            pending: Vec::new(),
            ready: std::collections::VecDeque::new(),
            wakeup: None,
            poll_only: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next complete line; waits as long as it takes for one to be written
    pub async fn next_line(&mut self) -> String {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return line;
            }

            self.ensure_wakeup();

            match self.fill().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!("Tailing {} failed, reopening: {}", self.path.display(), e);
                    self.file = None;
                    self.wakeup = None;
                }
            }

            self.idle().await;
        }
    }

    fn ensure_wakeup(&mut self) {
        if self.wakeup.is_some() || self.poll_only {
            return;
        }
        match Wakeup::watch(&self.path) {
            Ok(wakeup) => self.wakeup = wakeup,
            Err(e) => {
                warn!(
                    "Cannot watch {} for changes, polling only: {}",
                    self.path.display(),
                    e
                );
                self.poll_only = true;
            }
        }
    }

    /// Sleep until the next filesystem event or poll tick
    async fn idle(&mut self) {
        let Some(wakeup) = self.wakeup.as_mut() else {
            tokio::time::sleep(self.poll_interval).await;
            return;
        };
        tokio::select! {
            Some(()) = wakeup.rx.recv() => {
                while wakeup.rx.try_recv().is_ok() {}
            }
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    /// Read whatever is available; Ok(false) means nothing new yet
    async fn fill(&mut self) -> std::io::Result<bool> {
        if self.file.is_none() {
            match File::open(&self.path).await {
                Ok(mut file) => {
                    file.seek(SeekFrom::Start(self.offset)).await?;
                    debug!("Tailing {} from offset {}", self.path.display(), self.offset);
                    self.file = Some(file);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e),
            }
        }

        let Some(file) = self.file.as_mut() else {
            return Ok(false);
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            warn!("{} shrank, reading it again from the start", self.path.display());
            file.seek(SeekFrom::Start(0)).await?;
            self.offset = 0;
            self.pending.clear();
        }

        let mut buf = vec![0u8; READ_CHUNK];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        self.offset += n as u64;
        self.pending.extend_from_slice(&buf[..n]);
        self.split_pending();
        Ok(true)
    }

    fn split_pending(&mut self) {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            self.ready.push_back(line);
        }
    }

    /// Feed every line into `registry` until `cancel` fires
    pub fn spawn(mut self, registry: LogWatchRegistry, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Log tailer started on {}", self.path.display());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = self.next_line() => {
                        registry.on_line(&line);
                    }
                }
            }
            debug!("Log tailer stopped");
        })
    }
}
