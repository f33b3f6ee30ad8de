//! Broadcast Journal
//!
//! File transport that carries broadcast messages between processes sharing
//! one store directory. Every channel is an append-only file of JSON lines:
//!
//! ```text
//!  process A ──append──► <dir>/<channel>.events ◄──tail (poll)── process B
//!                                   ▲
//!  process C ──append───────────────┘
//! ```
//!
//! Lines are appended by one writer task per hub, so lines from one process
//! never interleave. Readers start at the end of the file as it was when they
//! joined, keep a byte offset, and consume only complete lines. Once a file
//! grows past [`JOURNAL_MAX_BYTES`] the next writer truncates it; a reader
//! that finds the file shorter than its offset starts over from zero and
//! skips any line it cannot parse.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::broadcast::Envelope;
use crate::error::{Error, Result};

/// Size past which a channel file is truncated before the next append
pub const JOURNAL_MAX_BYTES: u64 = 1024 * 1024;

/// Default interval between reads of a channel file
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const JOURNAL_EXTENSION: &str = "events";

/// Appends local messages and tails sibling processes' messages
pub(crate) struct Journal {
    dir: PathBuf,
    hub_id: Uuid,
    poll_interval: Duration,
    lines: mpsc::UnboundedSender<(PathBuf, String)>,
    runtime: Handle,
    shutdown: CancellationToken,
}

impl Journal {
    /// Open the journal directory and start the writer task
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn open(dir: PathBuf, hub_id: Uuid, poll_interval: Duration) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("broadcast journal needs a Tokio runtime: {}", e)))?;
        std::fs::create_dir_all(&dir)?;

        let (lines, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_writer(rx));
        debug!(dir = %dir.display(), %hub_id, "Broadcast journal opened");

        Ok(Self {
            dir,
            hub_id,
            poll_interval,
            lines,
            runtime,
            shutdown: CancellationToken::new(),
        })
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    fn channel_path(&self, channel: &str) -> PathBuf {
        let name: String = channel
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.{}", name, JOURNAL_EXTENSION))
    }

    /// Queue `envelope` for appending to the channel file
    pub(crate) fn append(&self, channel: &str, envelope: &Envelope) {
        let line = match serde_json::to_string(envelope) {
            Ok(line) => line,
            Err(e) => {
                warn!(channel, error = %e, "Unserializable broadcast message");
                return;
            }
        };
        if self.lines.send((self.channel_path(channel), line)).is_err() {
            trace!(channel, "Journal writer gone, message dropped");
        }
    }

    /// Start forwarding sibling processes' messages on `channel` into `sender`
    pub(crate) fn tail(&self, channel: &str, sender: broadcast::Sender<Envelope>) {
        let path = self.channel_path(channel);
        let start = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let tailer = Tailer {
            path,
            offset: start,
            hub_id: self.hub_id,
        };
        self.runtime.spawn(tailer.run(
            sender,
            self.poll_interval,
            self.shutdown.child_token(),
        ));
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("dir", &self.dir)
            .field("hub_id", &self.hub_id)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Exits once every sender is dropped and the queue is drained
async fn run_writer(mut lines: mpsc::UnboundedReceiver<(PathBuf, String)>) {
    while let Some((path, line)) = lines.recv().await {
        if let Err(e) = append_line(&path, &line).await {
            warn!(path = %path.display(), error = %e, "Failed to append broadcast message");
        }
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    if file.metadata().await?.len() > JOURNAL_MAX_BYTES {
        file.set_len(0).await?;
        debug!(path = %path.display(), "Truncated broadcast journal");
    }
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    file.write_all(&buf).await?;
    file.flush().await
}

// =============================================================================
// Tailer
// =============================================================================

struct Tailer {
    path: PathBuf,
    offset: u64,
    hub_id: Uuid,
}

impl Tailer {
    async fn run(
        mut self,
        sender: broadcast::Sender<Envelope>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.read_new().await {
                Ok(envelopes) => {
                    for envelope in envelopes {
                        // Messages from this hub were already delivered in-process
                        if envelope.hub != self.hub_id {
                            let _ = sender.send(envelope);
                        }
                    }
                }
                Err(e) => trace!(path = %self.path.display(), error = %e, "Journal read failed"),
            }
        }
        debug!(path = %self.path.display(), "Journal tailer stopped");
    }

    /// Complete lines appended since the last read
    async fn read_new(&mut self) -> std::io::Result<Vec<Envelope>> {
        let mut file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let len = file.metadata().await?.len();
        if len < self.offset {
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset).read_to_end(&mut buf).await?;

        let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        self.offset += last_newline as u64 + 1;

        Ok(buf[..last_newline]
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .filter_map(|line| match serde_json::from_slice::<Envelope>(line) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    trace!(error = %e, "Skipping unreadable journal line");
                    None
                }
            })
            .collect())
    }
}
