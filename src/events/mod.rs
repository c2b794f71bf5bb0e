//! Ordered progress events for a migration run.
//!
//! `ProgressEventBus::publish` is the only way to add to the stream. Every
//! published event gets a sequence number and the overall progress as of that
//! event; overall progress never goes down.

use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::memory::MemoryPressureLevel;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgressEvent {
    BatchStarted {
        index: usize,
        total: usize,
        size: usize,
    },
    ItemProcessed {
        index: usize,
        total: usize,
        id: String,
        succeeded: bool,
    },
    BatchCompleted {
        index: usize,
        total: usize,
        processed: usize,
    },
    MemoryWarning {
        level: MemoryPressureLevel,
        percent: f64,
    },
    BatchSizeAdjusted {
        old: usize,
        new: usize,
        reason: String,
    },
    Error {
        message: String,
        recoverable: bool,
    },
    Paused {
        millis: u64,
    },
    Resumed,
    Cancelled {
        processed: usize,
    },
    Completed {
        total: usize,
        success: usize,
        fail: usize,
    },
}

impl ProgressEvent {
    /// Raw completion ratio implied by this event, if any.
    fn ratio(&self) -> Option<f64> {
        let ratio = |done: usize, total: usize| {
            if total == 0 {
                1.0
            } else {
                done as f64 / total as f64
            }
        };
        match self {
            ProgressEvent::BatchStarted { index, total, .. } => Some(ratio(*index, *total)),
            ProgressEvent::ItemProcessed { index, total, .. } => Some(ratio(index + 1, *total)),
            ProgressEvent::BatchCompleted { index, total, .. } => Some(ratio(index + 1, *total)),
            ProgressEvent::Completed { .. } => Some(1.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedEvent {
    pub sequence: u64,
    pub event: ProgressEvent,
    /// 0-100, running maximum over the stream so far.
    pub overall_progress: f64,
}

struct BusState {
    log: Vec<PublishedEvent>,
    progress: f64,
}

pub struct ProgressEventBus {
    state: Mutex<BusState>,
    sender: broadcast::Sender<PublishedEvent>,
}

impl ProgressEventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(BusState {
                log: Vec::new(),
                progress: 0.0,
            }),
            sender,
        }
    }

    pub fn publish(&self, event: ProgressEvent) -> PublishedEvent {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(ratio) = event.ratio() {
            let candidate = (ratio * 100.0).clamp(0.0, 100.0);
            state.progress = state.progress.max(candidate);
        }

        let published = PublishedEvent {
            sequence: state.log.len() as u64,
            event,
            overall_progress: state.progress,
        };
        state.log.push(published.clone());

        // Sent under the lock so subscribers see publication order.
        let _ = self.sender.send(published.clone());
        published
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    pub fn overall_progress(&self) -> f64 {
        match self.state.lock() {
            Ok(guard) => guard.progress,
            Err(poisoned) => poisoned.into_inner().progress,
        }
    }

    /// Everything published so far, in order.
    pub fn history(&self) -> Vec<PublishedEvent> {
        match self.state.lock() {
            Ok(guard) => guard.log.clone(),
            Err(poisoned) => poisoned.into_inner().log.clone(),
        }
    }
}

impl Default for ProgressEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Mirror bus events into the tracing log until the bus goes away.
pub fn spawn_log_observer(bus: &ProgressEventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(published) => log_event(&published),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Progress log observer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(published: &PublishedEvent) {
    let progress = format!("{:.1}%", published.overall_progress);
    match &published.event {
        ProgressEvent::BatchStarted { index, total, size } => {
            tracing::info!(batch = index + 1, total, size, %progress, "Batch started");
        }
        ProgressEvent::ItemProcessed { id, succeeded, .. } => {
            tracing::debug!(%id, succeeded, %progress, "Item processed");
        }
        ProgressEvent::BatchCompleted { index, total, processed } => {
            tracing::info!(batch = index + 1, total, processed, %progress, "Batch completed");
        }
        ProgressEvent::MemoryWarning { level, percent } => {
            tracing::warn!(%level, percent = format!("{:.1}", percent), "Memory pressure");
        }
        ProgressEvent::BatchSizeAdjusted { old, new, reason } => {
            tracing::info!(old, new, %reason, "Batch size adjusted");
        }
        ProgressEvent::Error { message, recoverable } => {
            if *recoverable {
                tracing::warn!(%message, "Item failed");
            } else {
                tracing::error!(%message, "Run aborted");
            }
        }
        ProgressEvent::Paused { millis } => tracing::debug!(millis, "Paused between batches"),
        ProgressEvent::Resumed => tracing::debug!("Resumed"),
        ProgressEvent::Cancelled { processed } => tracing::warn!(processed, "Run cancelled"),
        ProgressEvent::Completed { total, success, fail } => {
            tracing::info!(total, success, fail, "Run completed");
        }
    }
}
