//! Log stream tailer.
//!
//! Polls the log file by size. A shrinking file (truncation or rotation) resets
//! the cursor to the start. An unterminated trailing line is held back until
//! its newline arrives.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::monitor::MonitorEvent;

/// A partial line longer than this is emitted as-is.
const MAX_PARTIAL: usize = 64 * 1024;

/// Consecutive read failures before a warning reaches the status snapshot.
const FAILURES_BEFORE_WARNING: u32 = 3;

#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    offset: Option<u64>,
    partial: Vec<u8>,
    start_at_end: bool,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>, start_at_end: bool) -> Self {
        Self {
            path: path.into(),
            offset: None,
            partial: Vec::new(),
            start_at_end,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Complete lines appended since the last poll. A missing file yields
    /// nothing until it appears.
    pub async fn poll(&mut self) -> std::io::Result<Vec<String>> {
        let len = match fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut offset = match self.offset {
            Some(offset) => offset,
            None => {
                let start = if self.start_at_end { len } else { 0 };
                debug!(path = %self.path.display(), offset = start, "tailing log file");
                self.offset = Some(start);
                start
            }
        };

        if len < offset {
            info!(path = %self.path.display(), previous = offset, now = len, "log file shrank, rewinding");
            offset = 0;
            self.partial.clear();
        }
        if len == offset {
            self.offset = Some(offset);
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut chunk = Vec::with_capacity((len - offset) as usize);
        file.take(len - offset).read_to_end(&mut chunk).await?;
        self.offset = Some(offset + chunk.len() as u64);

        self.partial.extend_from_slice(&chunk);
        Ok(self.drain_lines())
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let complete = match self.partial.iter().rposition(|&b| b == b'\n') {
            Some(idx) => idx + 1,
            None if self.partial.len() > MAX_PARTIAL => self.partial.len(),
            None => return Vec::new(),
        };

        let rest = self.partial.split_off(complete);
        let done = std::mem::replace(&mut self.partial, rest);
        String::from_utf8_lossy(&done)
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Poll the log on `interval` and forward each line into the control loop.
pub fn spawn_tailer(
    mut tailer: LogTailer,
    interval: Duration,
    events: mpsc::Sender<MonitorEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(path = %tailer.path().display(), "log tailer started");
        let mut ticker = tokio::time::interval(interval);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match tailer.poll().await {
                Ok(lines) => {
                    failures = 0;
                    for line in lines {
                        if events.send(MonitorEvent::Line(line)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    debug!(error = %e, failures, "log read failed");
                    if failures == FAILURES_BEFORE_WARNING {
                        warn!(path = %tailer.path().display(), error = %e, "log file unreadable");
                        let msg = format!("log file {} unreadable: {}", tailer.path().display(), e);
                        if events.send(MonitorEvent::Warning(msg)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        debug!("log tailer stopped");
    })
}
