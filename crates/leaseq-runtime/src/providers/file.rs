//! Durable, log-backed queue shared between processes.
//!
//! Every push, pull and delete is appended to a single text log as a
//! [`LogRecord`]. The log is the source of truth: each [`FileQueue`] keeps a
//! private [`InMemoryQueue`] that is only a materialised view of the records
//! it has replayed so far. Pushes and deletes just append; their effect
//! becomes visible when the next pull replays the log.
//!
//! All log access happens under an exclusive [`LogLock`], so operations are
//! serialized across every process sharing the file.
//!
//! # Torn tails
//!
//! A record counts only once its terminating newline is on disk. A trailing
//! fragment left by a crashed writer is skipped during replay (with a
//! warning) and cut off by the next append. A complete line that fails to
//! decode is real corruption and fails the operation with
//! [`QueueError::CorruptRecord`].

use crate::client::QueueProvider;
use crate::clock::Clock;
use crate::error::QueueError;
use crate::journal::{LogRecord, Operation};
use crate::lock::LogLock;
use crate::message::{
    DeleteOutcome, DeleteRequest, HandleGenerator, Message, PullRequest, PushRequest, QueueName,
    UuidHandleGenerator, VisibilityTimeout,
};
use crate::provider::{FileConfig, ProviderType};
use crate::providers::memory::{InMemoryQueue, QueueSnapshot};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;

/// Default log file name inside the base directory
pub const DEFAULT_LOG_FILE_NAME: &str = "QUEUE";

const TAIL_SCAN_CHUNK: usize = 4096;

/// Position of the first record not yet replayed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    /// Complete records consumed
    pub records: usize,
    /// Byte offset just past the last consumed record
    pub offset: u64,
}

/// Result of one replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Records applied during this pass
    pub applied: usize,
    /// Whether an unterminated trailing fragment was found and skipped
    pub torn_tail: bool,
}

struct ReplayState {
    engine: InMemoryQueue,
    cursor: Cursor,
}

impl ReplayState {
    fn apply(&mut self, record: LogRecord) {
        match record.operation {
            Operation::Push => self.engine.apply_push(record.message),
            Operation::Pull => self.engine.apply_pull(record.message),
            Operation::Delete => {
                let outcome = self.engine.apply_delete(&record.message, record.recorded_at);
                if !outcome.is_deleted() {
                    debug!(
                        queue = %record.message.uri,
                        handle = %record.message.handle,
                        ?outcome,
                        "Replayed delete had no effect"
                    );
                }
            }
        }
    }
}

/// Log-backed queue engine.
///
/// Clones share the same view and cursor.
#[derive(Clone)]
pub struct FileQueue {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    handles: Arc<dyn HandleGenerator>,
    state: Arc<Mutex<ReplayState>>,
}

impl FileQueue {
    /// Open (creating if needed) `<base_path>/QUEUE`
    pub fn open(base_path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, QueueError> {
        Self::open_with(
            base_path.as_ref(),
            DEFAULT_LOG_FILE_NAME,
            clock,
            Arc::new(UuidHandleGenerator),
        )
    }

    pub fn from_config(config: &FileConfig, clock: Arc<dyn Clock>) -> Result<Self, QueueError> {
        config.validate()?;
        Self::open_at(config.log_path(), clock, Arc::new(UuidHandleGenerator))
    }

    /// Open with an explicit log file name and handle source
    pub fn open_with(
        base_path: &Path,
        file_name: &str,
        clock: Arc<dyn Clock>,
        handles: Arc<dyn HandleGenerator>,
    ) -> Result<Self, QueueError> {
        Self::open_at(base_path.join(file_name), clock, handles)
    }

    fn open_at(
        path: PathBuf,
        clock: Arc<dyn Clock>,
        handles: Arc<dyn HandleGenerator>,
    ) -> Result<Self, QueueError> {
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| QueueError::io("create directory", e))?;
        }

        // Create the file up front so a bad path fails here, not on first use
        open_log(&path)?;
        debug!(path = %path.display(), "Opened queue log");

        Ok(Self {
            path,
            handles,
            state: Arc::new(Mutex::new(ReplayState {
                engine: InMemoryQueue::new(Arc::clone(&clock)),
                cursor: Cursor::default(),
            })),
            clock,
        })
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current replay position of this instance
    pub fn cursor(&self) -> Cursor {
        self.lock_state().cursor
    }

    fn lock_state(&self) -> MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a `PUSH` record. The message is visible to pulls from any
    /// instance once they replay the log.
    pub fn push(
        &self,
        uri: &QueueName,
        content: String,
        handle: Option<String>,
    ) -> Result<Message, QueueError> {
        let handle = handle
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.handles.next_handle());
        let now = self.clock.now_ms();
        let message = Message::new(uri.clone(), handle, content, now);
        let line = LogRecord::new(Operation::Push, now, message.clone()).encode()?;

        let file = open_log(&self.path)?;
        let _lock = LogLock::exclusive(&file)?;
        append_line(&file, &line)?;

        debug!(queue = %uri, handle = %message.handle, "Appended push");
        Ok(message)
    }

    /// Replay outstanding records, then lease the earliest visible message
    pub fn pull(
        &self,
        uri: &QueueName,
        timeout: VisibilityTimeout,
    ) -> Result<Option<Message>, QueueError> {
        let mut state = self.lock_state();
        let file = open_log(&self.path)?;
        let _lock = LogLock::exclusive(&file)?;

        replay_into(&mut state, &file)?;

        let Some((message, visible_since)) = state.engine.lease(uri, timeout)? else {
            return Ok(None);
        };

        let appended = LogRecord::new(Operation::Pull, self.clock.now_ms(), message.clone())
            .encode()
            .and_then(|line| append_line(&file, &line));
        let end = match appended {
            Ok(end) => end,
            Err(e) => {
                // The log never saw this lease; hand the message back
                warn!(
                    queue = %uri,
                    handle = %message.handle,
                    error = %e,
                    "Pull not recorded, releasing lease"
                );
                state.engine.apply_push(Message {
                    visibility_timestamp: visible_since,
                    ..message
                });
                return Err(e);
            }
        };
        state.cursor.records += 1;
        state.cursor.offset = end;

        debug!(
            queue = %uri,
            handle = %message.handle,
            lease_expires_at = message.visibility_timestamp,
            "Appended pull"
        );
        Ok(Some(message))
    }

    /// Append a `DELETE` record. It takes effect when replayed, and only if
    /// it was issued before the message's lease expired.
    pub fn delete(&self, message: &Message) -> Result<DeleteOutcome, QueueError> {
        let line = LogRecord::new(Operation::Delete, self.clock.now_ms(), message.clone())
            .encode()?;

        let file = open_log(&self.path)?;
        let _lock = LogLock::exclusive(&file)?;
        append_line(&file, &line)?;

        debug!(queue = %message.uri, handle = %message.handle, "Appended delete");
        Ok(DeleteOutcome::Recorded)
    }

    /// Bring the private view up to date with the log
    pub fn replay(&self) -> Result<ReplayReport, QueueError> {
        let mut state = self.lock_state();
        let file = open_log(&self.path)?;
        let _lock = LogLock::exclusive(&file)?;
        replay_into(&mut state, &file)
    }

    /// Replay, then copy the queue's current contents
    pub fn snapshot(&self, uri: &QueueName) -> Result<Option<QueueSnapshot>, QueueError> {
        self.replay()?;
        Ok(self.lock_state().engine.snapshot(uri))
    }

    /// Replay, then list every queue seen in the log
    pub fn queue_names(&self) -> Result<Vec<QueueName>, QueueError> {
        self.replay()?;
        Ok(self.lock_state().engine.queue_names())
    }

    async fn run_blocking<T, F>(&self, operation: &str, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&FileQueue) -> Result<T, QueueError> + Send + 'static,
    {
        let queue = self.clone();
        tokio::task::spawn_blocking(move || f(&queue))
            .await
            .map_err(|e| QueueError::io(operation, std::io::Error::other(e)))?
    }
}

impl std::fmt::Debug for FileQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileQueue")
            .field("path", &self.path)
            .field("cursor", &self.cursor())
            .finish()
    }
}

#[async_trait]
impl QueueProvider for FileQueue {
    async fn send_message(&self, request: &PushRequest) -> Result<Message, QueueError> {
        request.validate()?;
        let uri = request.queue_name()?;
        let content = request.content.clone();
        let handle = request.explicit_handle().map(str::to_string);
        self.run_blocking("push", move |queue| queue.push(&uri, content, handle))
            .await
    }

    async fn receive_message(&self, request: &PullRequest) -> Result<Option<Message>, QueueError> {
        let uri = request.queue_name()?;
        let timeout = request.visibility_timeout()?;
        self.run_blocking("pull", move |queue| queue.pull(&uri, timeout))
            .await
    }

    async fn delete_message(&self, request: &DeleteRequest) -> Result<DeleteOutcome, QueueError> {
        request.validate()?;
        let message = request.message.clone();
        self.run_blocking("delete", move |queue| queue.delete(&message))
            .await
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::File
    }
}

// ============================================================================
// Log file access
// ============================================================================

fn open_log(path: &Path) -> Result<File, QueueError> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| QueueError::io("open", e))
}

/// Apply every complete record after the cursor, then promote expired leases.
/// Caller holds the log lock.
fn replay_into(state: &mut ReplayState, file: &File) -> Result<ReplayReport, QueueError> {
    let len = file
        .metadata()
        .map_err(|e| QueueError::io("read", e))?
        .len();
    if len < state.cursor.offset {
        return Err(QueueError::CorruptRecord {
            line: state.cursor.records,
            message: format!(
                "log shrank to {} bytes, below replay offset {}",
                len, state.cursor.offset
            ),
        });
    }

    let mut reader = file;
    reader
        .seek(SeekFrom::Start(state.cursor.offset))
        .map_err(|e| QueueError::io("read", e))?;
    let mut reader = BufReader::new(reader);

    let mut report = ReplayReport::default();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| QueueError::io("read", e))?;
        if n == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') {
            warn!(
                offset = state.cursor.offset,
                bytes = n,
                "Skipping unterminated record at end of log"
            );
            report.torn_tail = true;
            break;
        }

        let line_number = state.cursor.records + 1;
        let line = std::str::from_utf8(&buf[..n - 1]).map_err(|e| QueueError::CorruptRecord {
            line: line_number,
            message: e.to_string(),
        })?;
        let record = LogRecord::decode(line, line_number)?;

        state.apply(record);
        state.cursor.records += 1;
        state.cursor.offset += n as u64;
        report.applied += 1;
    }

    let promoted = state.engine.promote_all();
    if report.applied > 0 || promoted > 0 {
        debug!(
            applied = report.applied,
            promoted,
            records = state.cursor.records,
            "Replayed log"
        );
    }
    Ok(report)
}

/// Append one record line, first cutting off any torn tail. Returns the new
/// end-of-file offset. Caller holds the log lock.
fn append_line(file: &File, line: &str) -> Result<u64, QueueError> {
    let len = file
        .metadata()
        .map_err(|e| QueueError::io("append", e))?
        .len();
    let complete = complete_len(file, len).map_err(|e| QueueError::io("append", e))?;
    if complete < len {
        warn!(
            discarded_bytes = len - complete,
            "Truncating unterminated record at end of log"
        );
        file.set_len(complete)
            .map_err(|e| QueueError::io("truncate", e))?;
    }

    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');

    let mut writer = file;
    writer
        .write_all(&bytes)
        .map_err(|e| QueueError::io("append", e))?;
    writer.flush().map_err(|e| QueueError::io("append", e))?;

    Ok(complete + bytes.len() as u64)
}

/// Length of the longest prefix of the file that ends with a newline
fn complete_len(file: &File, len: u64) -> std::io::Result<u64> {
    let mut reader = file;
    let mut buf = [0u8; TAIL_SCAN_CHUNK];
    let mut end = len;

    while end > 0 {
        let start = end.saturating_sub(TAIL_SCAN_CHUNK as u64);
        let chunk = &mut buf[..(end - start) as usize];
        reader.seek(SeekFrom::Start(start))?;
        reader.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}
