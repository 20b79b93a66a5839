//! Debounced, latest-wins autosave.
//!
//! A [`Debounce`] coalesces bursts of edits into a single deadline. A
//! [`SaveStream`] tickets every save of one stream with a sequence number;
//! writes are serialized, queued writes that were overtaken are skipped, and
//! the result of a write that completes after a newer ticket was issued is
//! reported as superseded so the caller ignores it.

use labelview_env::{EnvError, SaveEnvelope, SolutionStore, StreamKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Coalescing timer on an external clock.
#[derive(Debug, Clone)]
pub struct Debounce {
    delay: Duration,
    deadline: Option<Duration>,
}

impl Debounce {
    pub fn new(delay: Duration) -> Self {
        Self { delay, deadline: None }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Record an edit at `now`, pushing the deadline out.
    pub fn touch(&mut self, now: Duration) {
        self.deadline = Some(now + self.delay);
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_due(&self, now: Duration) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// True once per deadline: clears the timer when due.
    pub fn take_due(&mut self, now: Duration) -> bool {
        if self.is_due(now) {
            self.deadline = None;
            true
        } else {
            false
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}

/// What became of one ticketed save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Written, and still the latest ticket
    Persisted { sequence: u64 },

    /// A newer ticket exists; this result is to be ignored
    Superseded { sequence: u64 },

    /// The store rejected the write
    Failed { sequence: u64, error: String },
}

impl SaveOutcome {
    pub fn sequence(&self) -> u64 {
        match self {
            SaveOutcome::Persisted { sequence }
            | SaveOutcome::Superseded { sequence }
            | SaveOutcome::Failed { sequence, .. } => *sequence,
        }
    }
}

/// Ticketed writer for one stream of one store.
pub struct SaveStream<S: SolutionStore> {
    kind: StreamKind,
    store: Arc<S>,
    timeout: Duration,

    /// Latest ticket handed out
    issued: AtomicU64,

    /// Latest ticket written, guarding the store
    written: Mutex<u64>,
}

impl<S: SolutionStore> SaveStream<S> {
    pub fn new(kind: StreamKind, store: Arc<S>, timeout: Duration) -> Self {
        Self {
            kind,
            store,
            timeout,
            issued: AtomicU64::new(0),
            written: Mutex::new(0),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Hand out the next ticket.
    pub fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn latest_issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn is_latest(&self, sequence: u64) -> bool {
        sequence == self.latest_issued()
    }

    /// Ticket a payload.
    pub fn prepare(&self, folder: impl Into<String>, payload: Vec<u8>) -> SaveEnvelope {
        SaveEnvelope::new(self.kind, folder, self.issue(), payload)
    }

    /// Write an envelope, replacing the stream's content.
    pub async fn write(&self, envelope: SaveEnvelope) -> SaveOutcome {
        let sequence = envelope.sequence;
        let mut written = self.written.lock().await;

        if sequence <= *written || !self.is_latest(sequence) {
            debug!(stream = %self.kind, sequence, "queued save overtaken, skipped");
            return SaveOutcome::Superseded { sequence };
        }

        let bytes = envelope.size();
        let result = tokio::time::timeout(
            self.timeout,
            self.store.save(self.kind, &envelope.folder, envelope.payload),
        )
        .await
        .unwrap_or_else(|_| Err(EnvError::Timeout(self.timeout.as_millis() as u64)));

        match result {
            Ok(()) => {
                *written = sequence;
                if self.is_latest(sequence) {
                    debug!(stream = %self.kind, sequence, bytes, "save persisted");
                    SaveOutcome::Persisted { sequence }
                } else {
                    debug!(stream = %self.kind, sequence, "save landed after a newer edit, result ignored");
                    SaveOutcome::Superseded { sequence }
                }
            }
            Err(e) => {
                warn!(stream = %self.kind, sequence, "save failed, stream stays dirty: {}", e);
                if self.is_latest(sequence) {
                    SaveOutcome::Failed {
                        sequence,
                        error: e.to_string(),
                    }
                } else {
                    SaveOutcome::Superseded { sequence }
                }
            }
        }
    }
}
