//! Append-only, content-free audit trail.
//!
//! Entries are chained: each carries the SHA-256 of its predecessor, so
//! editing, inserting, dropping or reordering lines breaks verification.
//! Recording is fire-and-forget; a slow or failing sink never holds up or
//! fails the operation being audited.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// `prev_hash` of the first entry in a chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Save,
    Resume,
    Update,
    Delete,
    /// The request could not be parsed into an operation.
    Unrecognized,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// What a caller reports. Typed fields only, so there is nowhere to put
/// payloads or secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub operation: AuditOperation,
    pub artifact_id: Option<Uuid>,
    pub identity: String,
    pub outcome: AuditOutcome,
    pub error_class: Option<&'static str>,
}

/// A sealed line of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: AuditOperation,
    pub artifact_id: Option<Uuid>,
    pub identity: String,
    pub outcome: AuditOutcome,
    pub error_class: Option<String>,
    pub prev_hash: String,
    pub hash: String,
}

/// Fields covered by an entry's hash, in a fixed order.
#[derive(Serialize)]
struct ChainBody<'a> {
    seq: u64,
    timestamp: &'a DateTime<Utc>,
    operation: AuditOperation,
    artifact_id: Option<Uuid>,
    identity: &'a str,
    outcome: AuditOutcome,
    error_class: Option<&'a str>,
    prev_hash: &'a str,
}

impl AuditEntry {
    fn compute_hash(&self) -> Result<String> {
        let body = ChainBody {
            seq: self.seq,
            timestamp: &self.timestamp,
            operation: self.operation,
            artifact_id: self.artifact_id,
            identity: &self.identity,
            outcome: self.outcome,
            error_class: self.error_class.as_deref(),
            prev_hash: &self.prev_hash,
        };
        let bytes = serde_json::to_vec(&body)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// Position of the chain head.
#[derive(Debug, Clone)]
struct ChainState {
    last_seq: u64,
    last_hash: String,
}

impl Default for ChainState {
    fn default() -> Self {
        Self {
            last_seq: 0,
            last_hash: GENESIS_HASH.to_string(),
        }
    }
}

impl ChainState {
    /// Build the next entry without advancing; call [`advance`](Self::advance)
    /// once it is durably written.
    fn seal(&self, event: AuditEvent) -> Result<AuditEntry> {
        let mut entry = AuditEntry {
            seq: self.last_seq + 1,
            timestamp: Utc::now(),
            operation: event.operation,
            artifact_id: event.artifact_id,
            identity: event.identity,
            outcome: event.outcome,
            error_class: event.error_class.map(str::to_string),
            prev_hash: self.last_hash.clone(),
            hash: String::new(),
        };
        entry.hash = entry.compute_hash()?;
        Ok(entry)
    }

    fn advance(&mut self, entry: &AuditEntry) {
        self.last_seq = entry.seq;
        self.last_hash = entry.hash.clone();
    }
}

/// Destination of audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<AuditEntry>;
}

/// Keeps the chain in memory. Clones share entries.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    inner: Arc<Mutex<(ChainState, Vec<AuditEntry>)>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .map(|guard| guard.1.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<AuditEntry> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("audit sink lock poisoned"))?;
        let (state, entries) = &mut *guard;
        let entry = state.seal(event)?;
        state.advance(&entry);
        entries.push(entry.clone());
        Ok(entry)
    }
}

/// One JSON object per line, appended and flushed per entry. Reopening an
/// existing file continues its chain.
pub struct JsonlAuditSink {
    path: PathBuf,
    state: Mutex<ChainState>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating audit directory {}", parent.display()))?;
        }
        let state = load_head(&path)?;
        debug!(path = %path.display(), seq = state.last_seq, "audit log opened");
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<AuditEntry> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("audit sink lock poisoned"))?;
        let entry = state.seal(event)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening audit log {}", self.path.display()))?;
        let line = serde_json::to_string(&entry)?;
        writeln!(file, "{line}")?;
        file.flush()?;

        state.advance(&entry);
        Ok(entry)
    }
}

fn load_head(path: &Path) -> Result<ChainState> {
    let mut state = ChainState::default();
    if !path.exists() {
        return Ok(state);
    }
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(&line)
            .with_context(|| format!("parsing audit log {}", path.display()))?;
        state.advance(&entry);
    }
    Ok(state)
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to read audit log: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: unparseable entry: {reason}")]
    Parse { line: usize, reason: String },
    #[error("line {line}: chain broken: {reason}")]
    Broken { line: usize, reason: String },
}

/// Summary of a verified log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub entries: u64,
    pub head_hash: String,
}

/// Re-check every link of a JSON lines audit log. A missing file is an empty,
/// valid chain.
pub fn verify_chain(path: impl AsRef<Path>) -> Result<ChainReport, AuditError> {
    let path = path.as_ref();
    let mut head = ChainState::default();
    let mut entries = 0;
    if !path.exists() {
        return Ok(ChainReport {
            entries,
            head_hash: head.last_hash,
        });
    }

    let reader = BufReader::new(File::open(path)?);
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| AuditError::Parse {
            line: line_no,
            reason: e.to_string(),
        })?;
        let broken = |reason: String| AuditError::Broken {
            line: line_no,
            reason,
        };

        if entry.seq != head.last_seq + 1 {
            return Err(broken(format!(
                "expected seq {}, found {}",
                head.last_seq + 1,
                entry.seq
            )));
        }
        if entry.prev_hash != head.last_hash {
            return Err(broken("prev_hash does not match previous entry".into()));
        }
        let expected = entry
            .compute_hash()
            .map_err(|e| broken(format!("cannot hash entry: {e}")))?;
        if expected != entry.hash {
            return Err(broken("entry hash mismatch".into()));
        }
        head.advance(&entry);
        entries += 1;
    }

    Ok(ChainReport {
        entries,
        head_hash: head.last_hash,
    })
}

enum Command {
    Record(AuditEvent),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking front of an [`AuditSink`]. Clones feed the same worker.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<Command>,
    dropped: Arc<AtomicU64>,
}

impl AuditLogger {
    /// Start the background writer. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Record(event) => {
                        if let Err(err) = sink.append(event).await {
                            warn!(error = %err, "audit entry could not be written");
                        }
                    }
                    Command::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!("audit writer stopped");
        });
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue an entry. Never blocks; drops the entry when the queue is full.
    pub fn record(&self, event: AuditEvent) {
        if let Err(err) = self.tx.try_send(Command::Record(event)) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let reason = match err {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "writer stopped",
            };
            warn!(reason, "audit entry dropped");
        }
    }

    /// Entries dropped since start.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until everything queued before this call has reached the sink.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Drain the queue before exit.
    pub async fn shutdown(self) {
        self.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Semaphore;

    use super::*;

    fn event(outcome: AuditOutcome) -> AuditEvent {
        AuditEvent {
            operation: AuditOperation::Resume,
            artifact_id: Some(Uuid::new_v4()),
            identity: "198.51.100.4".into(),
            outcome,
            error_class: match outcome {
                AuditOutcome::Success => None,
                AuditOutcome::Failure => Some("integrity"),
            },
        }
    }

    #[tokio::test]
    async fn memory_sink_chains_entries() {
        let sink = MemoryAuditSink::new();
        let first = sink.append(event(AuditOutcome::Success)).await.unwrap();
        let second = sink.append(event(AuditOutcome::Failure)).await.unwrap();

        assert_eq!(first.seq, 1);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.seq, 2);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(second.error_class.as_deref(), Some("integrity"));
        assert_eq!(sink.entries().len(), 2);
    }

    #[tokio::test]
    async fn jsonl_log_verifies_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("audit.jsonl");

        let sink = JsonlAuditSink::open(&path).unwrap();
        for _ in 0..3 {
            sink.append(event(AuditOutcome::Success)).await.unwrap();
        }
        drop(sink);

        let reopened = JsonlAuditSink::open(&path).unwrap();
        let fourth = reopened.append(event(AuditOutcome::Failure)).await.unwrap();
        assert_eq!(fourth.seq, 4);

        let report = verify_chain(&path).unwrap();
        assert_eq!(report.entries, 4);
        assert_eq!(report.head_hash, fourth.hash);
    }

    #[tokio::test]
    async fn tampering_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::open(&path).unwrap();
        for _ in 0..3 {
            sink.append(event(AuditOutcome::Failure)).await.unwrap();
        }

        let original = fs::read_to_string(&path).unwrap();
        let edited = original.replacen("\"failure\"", "\"success\"", 1);
        fs::write(&path, &edited).unwrap();
        assert!(matches!(
            verify_chain(&path),
            Err(AuditError::Broken { line: 1, .. })
        ));

        let mut lines: Vec<&str> = original.lines().collect();
        lines.remove(1);
        fs::write(&path, lines.join("\n")).unwrap();
        assert!(matches!(
            verify_chain(&path),
            Err(AuditError::Broken { line: 2, .. })
        ));
    }

    #[test]
    fn missing_log_is_an_empty_chain() {
        let dir = tempfile::tempdir().unwrap();
        let report = verify_chain(dir.path().join("none.jsonl")).unwrap();
        assert_eq!(report.entries, 0);
        assert_eq!(report.head_hash, GENESIS_HASH);
    }

    #[tokio::test]
    async fn logger_delivers_in_order() {
        let sink = MemoryAuditSink::new();
        let logger = AuditLogger::spawn(Arc::new(sink.clone()), 16);
        logger.record(event(AuditOutcome::Success));
        logger.record(event(AuditOutcome::Failure));
        logger.shutdown().await;

        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].outcome, AuditOutcome::Success);
        assert_eq!(entries[1].outcome, AuditOutcome::Failure);
    }

    /// Holds every append until a permit is released.
    struct GatedSink {
        gate: Arc<Semaphore>,
        inner: MemoryAuditSink,
    }

    #[async_trait]
    impl AuditSink for GatedSink {
        async fn append(&self, event: AuditEvent) -> Result<AuditEntry> {
            let permit = self.gate.acquire().await?;
            permit.forget();
            self.inner.append(event).await
        }
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let gate = Arc::new(Semaphore::new(0));
        let inner = MemoryAuditSink::new();
        let logger = AuditLogger::spawn(
            Arc::new(GatedSink {
                gate: Arc::clone(&gate),
                inner: inner.clone(),
            }),
            1,
        );

        for _ in 0..3 {
            logger.record(event(AuditOutcome::Success));
        }
        assert_eq!(logger.dropped(), 2);

        gate.add_permits(10);
        logger.flush().await;
        assert_eq!(inner.entries().len(), 1);
    }

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn append(&self, _event: AuditEvent) -> Result<AuditEntry> {
            Err(anyhow!("disk full"))
        }
    }

    #[tokio::test]
    async fn sink_failures_do_not_stop_the_writer() {
        let logger = AuditLogger::spawn(Arc::new(BrokenSink), 4);
        logger.record(event(AuditOutcome::Success));
        logger.record(event(AuditOutcome::Success));
        logger.flush().await;
        assert_eq!(logger.dropped(), 0);
    }
}
