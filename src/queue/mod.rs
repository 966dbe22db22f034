//! The deferred-write queue: mutating requests that failed offline, kept
//! durably until connectivity returns.
//!
//! The queue is an ordered FIFO journaled to a single JSON file so it
//! survives the proxy being unloaded and reloaded. Recovery replays entries
//! in enqueue order; a failed entry is retained for the next pass while
//! later entries are still attempted (best-effort delivery over strict
//! ordering). At most one recovery pass runs at a time — an overlapping
//! trigger is ignored.
//!
//! Each entry carries a generated `write_id`, sent on replay as the
//! `X-Offramp-Write-Id` header, so an idempotent backend can detect the
//! duplicate deliveries that a crash between backend success and local
//! dequeue can otherwise produce.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::http::{Method, Request};
use crate::upstream::Fetch;

/// Header name carrying the idempotency key on replayed writes.
pub const WRITE_ID_HEADER: &str = "X-Offramp-Write-Id";

/// Default recovery-trigger tag for the message queue.
pub const DEFAULT_SYNC_TAG: &str = "background-sync-messages";

/// Errors from queue persistence.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to write queue journal: {0}")]
    Journal(#[from] std::io::Error),

    #[error("failed to encode queue journal: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One queued write: everything needed to replay the original request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredWrite {
    /// Idempotency key, unique per enqueue.
    pub write_id: String,
    /// Original target path (query included).
    pub path: String,
    /// Original method — always a write-class verb.
    pub method: Method,
    /// Original request body.
    pub payload: Vec<u8>,
    /// Enqueue time, milliseconds since the Unix epoch.
    pub enqueued_at: u64,
}

impl DeferredWrite {
    /// Captures a failed write request.
    pub fn from_request(request: &Request) -> Self {
        static SEQ: AtomicU64 = AtomicU64::new(1);
        let enqueued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            write_id: format!("{enqueued_at:x}-{seq:x}"),
            path: request.target().to_owned(),
            method: request.method().clone(),
            payload: request.body_bytes().to_vec(),
            enqueued_at,
        }
    }

    /// Builds the replay request: original target, method, and payload,
    /// plus the idempotency header.
    fn to_request(&self) -> Request {
        let mut request = Request::new(self.method.clone(), self.path.clone())
            .header(WRITE_ID_HEADER, self.write_id.clone())
            .body(self.payload.clone());
        if !self.payload.is_empty() {
            request = request.header("Content-Type", "application/json");
        }
        request
    }
}

/// Result of one completed recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Entries replayed successfully and removed.
    pub delivered: usize,
    /// Entries that failed and were retained for the next pass.
    pub retained: usize,
}

/// Outcome of a recovery trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// This trigger ran the pass.
    Completed(RecoveryReport),
    /// Another pass was already in flight; this trigger did nothing.
    AlreadyInFlight,
}

/// Durable FIFO of deferred writes, with single-pass recovery.
#[derive(Debug)]
pub struct DeferredWriteQueue {
    tag: String,
    journal: Option<PathBuf>,
    entries: Mutex<VecDeque<DeferredWrite>>,
    // Held for the duration of a recovery pass; try_lock makes an
    // overlapping trigger a no-op.
    pass_guard: tokio::sync::Mutex<()>,
}

impl DeferredWriteQueue {
    /// Creates a queue with no journal file. Entries do not survive reload.
    pub fn in_memory(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            journal: None,
            entries: Mutex::new(VecDeque::new()),
            pass_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Opens a queue journaled at `path`, loading any persisted entries.
    ///
    /// A missing journal starts the queue empty; a corrupt one is logged
    /// and discarded rather than blocking startup.
    pub async fn load(tag: impl Into<String>, path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<VecDeque<DeferredWrite>>(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(journal = %path.display(), error = %e, "corrupt queue journal — starting empty");
                    VecDeque::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => return Err(e),
        };
        debug!(entries = entries.len(), journal = %path.display(), "deferred-write queue loaded");
        Ok(Self {
            tag: tag.into(),
            journal: Some(path),
            entries: Mutex::new(entries),
            pass_guard: tokio::sync::Mutex::new(()),
        })
    }

    /// Returns the recovery-trigger tag this queue answers to.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns the number of entries waiting for replay.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns `true` if nothing is waiting for replay.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of the queued entries in FIFO order.
    pub fn snapshot(&self) -> Vec<DeferredWrite> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Appends a write and journals the queue.
    ///
    /// The entry is queued in memory even if journaling fails; the error is
    /// returned so the caller can log the lost durability.
    pub async fn enqueue(&self, write: DeferredWrite) -> Result<(), QueueError> {
        info!(write_id = %write.write_id, path = %write.path, "write deferred for replay");
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.push_back(write);
        }
        self.persist().await
    }

    /// Runs one recovery pass, replaying entries in enqueue order.
    ///
    /// Successful entries are removed and reported to `notices` with their
    /// original payload so the UI can reconcile optimistic state. Failed
    /// entries are retained ahead of anything enqueued during the pass,
    /// preserving FIFO order for the next trigger.
    ///
    /// If a pass is already in flight the call returns
    /// [`RecoveryOutcome::AlreadyInFlight`] without touching the queue.
    pub async fn recover(
        &self,
        upstream: &dyn Fetch,
        notices: &UnboundedSender<DeferredWrite>,
    ) -> RecoveryOutcome {
        let Ok(_pass) = self.pass_guard.try_lock() else {
            debug!(tag = %self.tag, "recovery pass already in flight — ignoring trigger");
            return RecoveryOutcome::AlreadyInFlight;
        };

        let pending: Vec<DeferredWrite> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.drain(..).collect()
        };

        if pending.is_empty() {
            return RecoveryOutcome::Completed(RecoveryReport {
                delivered: 0,
                retained: 0,
            });
        }

        info!(tag = %self.tag, pending = pending.len(), "recovery pass started");
        let mut delivered = 0usize;
        let mut failed: Vec<DeferredWrite> = Vec::new();

        for write in pending {
            let replayed = match upstream.fetch(&write.to_request()).await {
                Ok(response) if response.status().is_success() => true,
                Ok(response) => {
                    warn!(
                        write_id = %write.write_id,
                        status = response.status().as_u16(),
                        "replay rejected by backend — retaining"
                    );
                    false
                }
                Err(e) => {
                    warn!(write_id = %write.write_id, error = %e, "replay failed — retaining");
                    false
                }
            };

            if replayed {
                delivered += 1;
                // The receiver may have gone away; replay still counts.
                let _ = notices.send(write);
            } else {
                failed.push(write);
            }
        }

        let retained = failed.len();
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            for write in failed.into_iter().rev() {
                entries.push_front(write);
            }
        }
        if let Err(e) = self.persist().await {
            warn!(tag = %self.tag, error = %e, "failed to journal queue after recovery pass");
        }

        info!(tag = %self.tag, delivered, retained, "recovery pass finished");
        RecoveryOutcome::Completed(RecoveryReport {
            delivered,
            retained,
        })
    }

    async fn persist(&self) -> Result<(), QueueError> {
        let Some(path) = &self.journal else {
            return Ok(());
        };
        let serialized = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            serde_json::to_vec(&*entries)?
        };
        tokio::fs::write(path, serialized).await?;
        Ok(())
    }
}
