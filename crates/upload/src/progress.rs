use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::UploadError;

#[derive(Debug, Clone, PartialEq)]
pub enum UploadStatus {
    InProgress,
    Succeeded { url: String },
    Failed { error: UploadError },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub percent: f64,
    pub status: UploadStatus,
}

impl UploadProgress {
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, UploadStatus::InProgress)
    }
}

struct Shared {
    sender: Mutex<Option<mpsc::Sender<UploadProgress>>>,
    sent: AtomicU64,
    total: AtomicU64,
}

/// Progress side channel for one upload attempt.
///
/// In-progress events use `try_send` and are dropped when the receiver lags.
/// The terminal event is awaited, after which the sender is released and the
/// receiver sees the channel close. Clones share the same channel; once the
/// attempt is finished, reports from any clone are ignored.
#[derive(Clone)]
pub struct ProgressSink {
    shared: Arc<Shared>,
}

impl ProgressSink {
    pub fn new(sender: Option<mpsc::Sender<UploadProgress>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                sender: Mutex::new(sender),
                sent: AtomicU64::new(0),
                total: AtomicU64::new(0),
            }),
        }
    }

    /// Sink that reports nowhere.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn set_total(&self, total: u64) {
        self.shared.total.store(total, Ordering::SeqCst);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.shared.sent.load(Ordering::SeqCst)
    }

    /// Record `bytes` more sent and report it if the receiver keeps up.
    pub fn advance(&self, bytes: u64) {
        let sent = self.shared.sent.fetch_add(bytes, Ordering::SeqCst) + bytes;
        let event = self.snapshot(sent, UploadStatus::InProgress);

        let guard = self
            .shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = guard.as_ref() {
            if sender.try_send(event).is_err() {
                debug!(sent, "progress receiver lagging, event dropped");
            }
        }
    }

    /// Emit the single terminal event and close the channel.
    pub async fn finish(self, outcome: &Result<String, UploadError>) {
        let sender = self
            .shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sender) = sender else {
            return;
        };

        let status = match outcome {
            Ok(url) => UploadStatus::Succeeded { url: url.clone() },
            Err(error) => UploadStatus::Failed {
                error: error.clone(),
            },
        };
        let event = self.snapshot(self.bytes_sent(), status);
        if sender.send(event).await.is_err() {
            debug!("progress receiver gone before the terminal event");
        }
    }

    fn snapshot(&self, sent: u64, status: UploadStatus) -> UploadProgress {
        let total = self.shared.total.load(Ordering::SeqCst);
        let percent = if total == 0 {
            0.0
        } else {
            (sent as f64 / total as f64 * 100.0).min(100.0)
        };
        UploadProgress {
            bytes_sent: sent,
            total_bytes: total,
            percent,
            status,
        }
    }
}
