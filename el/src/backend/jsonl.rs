//! JSONL backend - one append-only file per session
//!
//! Layout:
//!
//! ```text
//! {root}/
//! ├── .lock                  # exclusive lock held by the writing process
//! └── {session_id}/
//!     └── events.jsonl       # one event envelope per line
//! ```

use std::collections::HashMap;
use std::fs::{self as stdfs, File as StdFile};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fs2::FileExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::LogBackend;
use crate::error::{LogError, LogResult, validate_session_id};
use crate::event::Event;

const EVENTS_FILE: &str = "events.jsonl";
const LOCK_FILE: &str = ".lock";

/// Event store writing per-session JSONL files under a root directory
pub struct JsonlBackend {
    root: PathBuf,
    /// Held for the lifetime of the backend; released on drop
    _lock: StdFile,
    /// Open append handles, one per session that has been written to
    writers: Mutex<HashMap<String, Arc<AsyncMutex<File>>>>,
}

impl JsonlBackend {
    /// Open (creating if needed) a store rooted at `root`
    ///
    /// Fails if another process already holds the store.
    pub fn open(root: impl AsRef<Path>) -> LogResult<Self> {
        let root = root.as_ref().to_path_buf();
        debug!(?root, "JsonlBackend::open: called");
        stdfs::create_dir_all(&root)?;

        let lock = StdFile::create(root.join(LOCK_FILE))?;
        lock.try_lock_exclusive().map_err(|_| {
            LogError::Unavailable(format!("event log at {} is locked by another process", root.display()))
        })?;

        info!(?root, "Opened JSONL event log");
        Ok(Self {
            root,
            _lock: lock,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn events_path(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id).join(EVENTS_FILE)
    }

    /// Get or open the append handle for a session
    async fn writer(&self, session_id: &str) -> LogResult<Arc<AsyncMutex<File>>> {
        {
            let writers = self
                .writers
                .lock()
                .map_err(|_| LogError::Unavailable("writer table lock poisoned".to_string()))?;
            if let Some(writer) = writers.get(session_id) {
                return Ok(Arc::clone(writer));
            }
        }

        let path = self.events_path(session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        debug!(?path, "JsonlBackend: opening log file");
        let mut file = OpenOptions::new().create(true).read(true).append(true).open(&path).await?;
        terminate_torn_line(&mut file).await?;

        let mut writers = self
            .writers
            .lock()
            .map_err(|_| LogError::Unavailable("writer table lock poisoned".to_string()))?;
        // Another task may have opened it meanwhile; keep the first handle
        let writer = writers
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(file)));
        Ok(Arc::clone(writer))
    }

    /// Forget the append handle for a session (it is reopened on next write)
    pub fn close_session(&self, session_id: &str) {
        debug!(%session_id, "JsonlBackend::close_session: called");
        if let Ok(mut writers) = self.writers.lock() {
            writers.remove(session_id);
        }
    }
}

/// A crash mid-write can leave a final line without its newline. Close it off
/// so the next append starts on a fresh line; readers skip the torn record.
async fn terminate_torn_line(file: &mut File) -> LogResult<()> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(());
    }
    file.seek(std::io::SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    if last[0] != b'\n' {
        warn!("JsonlBackend: terminating torn trailing line");
        file.write_all(b"\n").await?;
        file.flush().await?;
    }
    Ok(())
}

/// Cut the file back to `len` bytes and make the cut durable
async fn truncate_to(file: &mut File, len: u64) -> std::io::Result<()> {
    file.set_len(len).await?;
    file.sync_data().await
}

#[async_trait]
impl LogBackend for JsonlBackend {
    async fn write(&self, event: &Event) -> LogResult<()> {
        debug!(session_id = %event.session_id, sequence = event.sequence, "JsonlBackend::write: called");
        validate_session_id(&event.session_id)?;

        let line = serde_json::to_string(event)? + "\n";
        let writer = self.writer(&event.session_id).await?;
        let mut file = writer.lock().await;
        let before = file.metadata().await?.len();

        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = result {
            // Whatever part of the line landed is taken back so the store matches the error
            if let Err(rollback) = truncate_to(&mut file, before).await {
                warn!(
                    session_id = %event.session_id,
                    error = %rollback,
                    "JsonlBackend: rollback after failed write failed"
                );
            }
            drop(file);
            // Reopen on the next write so a torn line gets terminated first
            self.close_session(&event.session_id);
            return Err(e.into());
        }
        Ok(())
    }

    async fn scan(&self, session_id: &str, from_sequence: u64, limit: usize) -> LogResult<Vec<Event>> {
        debug!(%session_id, from_sequence, limit, "JsonlBackend::scan: called");
        validate_session_id(session_id)?;

        let path = self.events_path(session_id);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();
        let mut last_seen = 0u64;

        while events.len() < limit {
            let Some(line) = lines.next_line().await? else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(%session_id, error = %e, "JsonlBackend::scan: skipping unreadable line");
                    continue;
                }
            };
            // A retried write after an ambiguous failure can duplicate a record
            if event.sequence <= last_seen {
                continue;
            }
            last_seen = event.sequence;
            if event.sequence >= from_sequence {
                events.push(event);
            }
        }

        Ok(events)
    }

    async fn high_water(&self, session_id: &str) -> LogResult<u64> {
        debug!(%session_id, "JsonlBackend::high_water: called");
        validate_session_id(session_id)?;

        let path = self.events_path(session_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let latest = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<Event>(line).ok())
            .map(|e| e.sequence)
            .max()
            .unwrap_or(0);
        Ok(latest)
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}
