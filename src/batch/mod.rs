//! Memory-bounded batch scheduling.
//!
//! Batches run one at a time. Between batches the scheduler samples memory,
//! resizes the next batch from the monitor's recommendation and optionally
//! pauses. Resizing never happens in the middle of a batch.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::events::{ProgressEvent, ProgressEventBus};
use crate::media::MediaItem;
use crate::memory::{MemoryPressureLevel, MemoryPressureMonitor, MemoryThresholds};
use crate::pairing::{CandidatePair, ImportItem};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSettings {
    /// When off, everything runs as a single batch.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub use_adaptive_sizing: bool,
    #[serde(default = "default_high_memory_threshold")]
    pub high_memory_threshold: f64,
    #[serde(default = "default_critical_memory_threshold")]
    pub critical_memory_threshold: f64,
    #[serde(default = "default_pause_ms")]
    pub pause_between_batches_ms: u64,
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    /// Items processed concurrently inside one batch.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    50
}

fn default_high_memory_threshold() -> f64 {
    0.80
}

fn default_critical_memory_threshold() -> f64 {
    0.90
}

fn default_pause_ms() -> u64 {
    500
}

fn default_min_batch_size() -> usize {
    5
}

fn default_workers() -> usize {
    1
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            use_adaptive_sizing: true,
            high_memory_threshold: default_high_memory_threshold(),
            critical_memory_threshold: default_critical_memory_threshold(),
            pause_between_batches_ms: default_pause_ms(),
            min_batch_size: default_min_batch_size(),
            workers: default_workers(),
        }
    }
}

impl BatchSettings {
    pub fn pause_between_batches(&self) -> Duration {
        Duration::from_millis(self.pause_between_batches_ms)
    }

    /// Monitor thresholds with the high/critical levels taken from these settings.
    pub fn apply_thresholds(&self, thresholds: MemoryThresholds) -> MemoryThresholds {
        MemoryThresholds {
            high: self.high_memory_threshold,
            critical: self.critical_memory_threshold,
            ..thresholds
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.min_batch_size == 0 {
            return Err("batch.min_batch_size must be at least 1".to_string());
        }
        if self.batch_size < self.min_batch_size {
            return Err(format!(
                "batch.batch_size ({}) is below batch.min_batch_size ({})",
                self.batch_size, self.min_batch_size
            ));
        }
        if self.workers == 0 {
            return Err("batch.workers must be at least 1".to_string());
        }
        let (high, critical) = (self.high_memory_threshold, self.critical_memory_threshold);
        if !(0.0 < high && high <= critical && critical <= 1.0) {
            return Err(format!(
                "batch memory thresholds must satisfy 0 < high <= critical <= 1 (got {} / {})",
                high, critical
            ));
        }
        Ok(())
    }
}

/// Identifier used in `ItemProcessed` events.
pub trait ProgressItem {
    fn progress_id(&self) -> String;
}

impl ProgressItem for MediaItem {
    fn progress_id(&self) -> String {
        self.id.clone()
    }
}

impl ProgressItem for CandidatePair {
    fn progress_id(&self) -> String {
        self.still.id.clone()
    }
}

impl ProgressItem for ImportItem {
    fn progress_id(&self) -> String {
        self.id().to_string()
    }
}

impl ProgressItem for String {
    fn progress_id(&self) -> String {
        self.clone()
    }
}

/// One slice of the input handed to the per-batch function.
pub struct Batch<T> {
    pub index: usize,
    /// Position of the first item in the full input.
    pub offset: usize,
    pub items: Vec<T>,
    workers: usize,
    cancel: CancellationToken,
    progress: BatchProgress,
}

/// Per-item event publishing shared between a batch and the scheduler.
#[derive(Clone)]
struct BatchProgress {
    bus: Arc<ProgressEventBus>,
    ids: Vec<String>,
    total_items: usize,
    /// Items of this batch whose events are already out.
    reported: Arc<AtomicUsize>,
}

impl BatchProgress {
    fn publish<R>(&self, offset: usize, position: usize, result: &Result<R, PipelineError>) {
        let id = self.ids.get(position).cloned().unwrap_or_default();
        self.bus.publish(ProgressEvent::ItemProcessed {
            index: offset + position,
            total: self.total_items,
            id: id.clone(),
            succeeded: result.is_ok(),
        });
        if let Err(e) = result {
            self.bus.publish(ProgressEvent::Error {
                message: format!("{}: {}", id, e),
                recoverable: true,
            });
        }
    }
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `f` over the items, `workers` at a time, keeping item order.
    ///
    /// `ItemProcessed` events go out as each wave finishes. Cancellation is
    /// checked before each wave. A wave that finishes after cancellation is
    /// awaited but dropped from the output, so the result can be shorter than
    /// the batch.
    pub async fn process_items<R, F, Fut>(self, mut f: F) -> Vec<Result<R, PipelineError>>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<R, PipelineError>>,
    {
        let mut results = Vec::with_capacity(self.items.len());
        let mut items = self.items.into_iter();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let wave: Vec<Fut> = items.by_ref().take(self.workers).map(&mut f).collect();
            if wave.is_empty() {
                break;
            }
            let outcomes = join_all(wave).await;
            if self.cancel.is_cancelled() {
                tracing::debug!(batch = self.index, dropped = outcomes.len(), "Discarding wave finished after cancel");
                break;
            }
            for outcome in outcomes {
                self.progress.publish(self.offset, results.len(), &outcome);
                self.progress.reported.fetch_add(1, Ordering::SeqCst);
                results.push(outcome);
            }
        }

        results
    }
}

#[derive(Debug)]
pub struct RunReport<R> {
    /// One entry per processed item, in input order.
    pub results: Vec<Result<R, PipelineError>>,
    pub total_items: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub cancelled: bool,
    pub batches: usize,
    pub final_batch_size: usize,
}

impl<R> RunReport<R> {
    pub fn processed(&self) -> usize {
        self.results.len()
    }

    /// `Err(Cancelled)` if the run stopped early.
    pub fn ensure_completed(&self) -> Result<(), PipelineError> {
        if self.cancelled {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub struct AdaptiveBatchScheduler {
    settings: BatchSettings,
    monitor: Arc<MemoryPressureMonitor>,
    bus: Arc<ProgressEventBus>,
    cancel: CancellationToken,
}

impl AdaptiveBatchScheduler {
    pub fn new(
        settings: BatchSettings,
        monitor: Arc<MemoryPressureMonitor>,
        bus: Arc<ProgressEventBus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            monitor,
            bus,
            cancel,
        }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn clamp_size(&self, size: usize) -> usize {
        let floor = self.settings.min_batch_size.max(1);
        let cap = self.monitor.thresholds().max_batch_size.max(floor);
        size.clamp(floor, cap)
    }

    fn initial_size(&self, total_items: usize) -> usize {
        if !self.settings.enabled {
            return total_items.max(1);
        }
        let size = self.clamp_size(self.settings.batch_size);
        let snapshot = self.monitor.sample();
        if self.settings.use_adaptive_sizing && snapshot.pressure > MemoryPressureLevel::Normal {
            let adjusted = self.clamp_size(self.monitor.recommended_batch_size(size));
            tracing::info!(from = size, to = adjusted, pressure = %snapshot.pressure, "Starting with a reduced batch size");
            return adjusted;
        }
        size
    }

    /// Split `items` into sequential batches and hand each to `process`.
    ///
    /// Per-item failures are kept as `Err` entries. An `Err` from `process`
    /// itself, or a result list whose length does not match its batch, aborts
    /// the run with `BatchAbort`.
    pub async fn run<T, R, F, Fut>(&self, items: Vec<T>, mut process: F) -> Result<RunReport<R>, PipelineError>
    where
        T: ProgressItem,
        F: FnMut(Batch<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<Result<R, PipelineError>>>>,
    {
        let total_items = items.len();
        let mut size = self.initial_size(total_items);
        let mut remaining = items.into_iter();
        let mut left = total_items;

        let mut results: Vec<Result<R, PipelineError>> = Vec::with_capacity(total_items);
        let mut success_count = 0;
        let mut failure_count = 0;
        let mut batch_index = 0;
        let mut cancelled = false;

        tracing::info!(total_items, batch_size = size, "Starting batched run");

        while left > 0 {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let take = size.min(left);
            let batch_items: Vec<T> = remaining.by_ref().take(take).collect();
            left -= take;
            let ids: Vec<String> = batch_items.iter().map(ProgressItem::progress_id).collect();
            let total_batches = batch_index + 1 + left.div_ceil(size);
            let offset = results.len();

            self.bus.publish(ProgressEvent::BatchStarted {
                index: batch_index,
                total: total_batches,
                size: take,
            });

            let progress = BatchProgress {
                bus: self.bus.clone(),
                ids,
                total_items,
                reported: Arc::new(AtomicUsize::new(0)),
            };
            let batch = Batch {
                index: batch_index,
                offset,
                items: batch_items,
                workers: self.settings.workers.max(1),
                cancel: self.cancel.clone(),
                progress: progress.clone(),
            };

            let batch_results = match process(batch).await {
                Ok(batch_results) => batch_results,
                Err(e) => return Err(self.abort(batch_index, format!("{:#}", e))),
            };

            let short = batch_results.len() < take && self.cancel.is_cancelled();
            if batch_results.len() != take && !short {
                let reason = format!("returned {} results for {} items", batch_results.len(), take);
                return Err(self.abort(batch_index, reason));
            }

            // Items the batch function did not report itself are published now.
            let processed = batch_results.len();
            let already_reported = progress.reported.load(Ordering::SeqCst).min(processed);
            for (position, result) in batch_results.into_iter().enumerate() {
                if position >= already_reported {
                    progress.publish(offset, position, &result);
                }
                match &result {
                    Ok(_) => success_count += 1,
                    Err(_) => failure_count += 1,
                }
                results.push(result);
            }

            self.bus.publish(ProgressEvent::BatchCompleted {
                index: batch_index,
                total: total_batches,
                processed,
            });
            batch_index += 1;

            if short {
                cancelled = true;
                break;
            }
            if left == 0 {
                break;
            }

            let snapshot = self.monitor.sample();
            if snapshot.pressure >= MemoryPressureLevel::High {
                self.bus.publish(ProgressEvent::MemoryWarning {
                    level: snapshot.pressure,
                    percent: snapshot.usage_percent(),
                });
            }

            let previous = size;
            if self.settings.enabled && self.settings.use_adaptive_sizing {
                let next = self.clamp_size(self.monitor.recommended_batch_size(size));
                if next != size {
                    self.bus.publish(ProgressEvent::BatchSizeAdjusted {
                        old: size,
                        new: next,
                        reason: format!("memory pressure {}", snapshot.pressure),
                    });
                    size = next;
                }
            }

            let reduced = size < previous;
            let pause = self.settings.pause_between_batches();
            if (snapshot.pressure != MemoryPressureLevel::Normal || reduced) && !pause.is_zero() {
                self.bus.publish(ProgressEvent::Paused {
                    millis: pause.as_millis() as u64,
                });
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = self.cancel.cancelled() => {}
                }
                self.bus.publish(ProgressEvent::Resumed);
            }
        }

        if cancelled {
            tracing::warn!(processed = results.len(), total_items, "Batched run cancelled");
            self.bus.publish(ProgressEvent::Cancelled {
                processed: results.len(),
            });
        } else {
            tracing::info!(total_items, success_count, failure_count, batches = batch_index, "Batched run finished");
            self.bus.publish(ProgressEvent::Completed {
                total: total_items,
                success: success_count,
                fail: failure_count,
            });
        }

        Ok(RunReport {
            results,
            total_items,
            success_count,
            failure_count,
            cancelled,
            batches: batch_index,
            final_batch_size: size,
        })
    }

    fn abort(&self, batch_index: usize, reason: String) -> PipelineError {
        let error = PipelineError::BatchAbort { batch_index, reason };
        tracing::error!(batch = batch_index, error = %error, "Batch processing failed, aborting run");
        self.bus.publish(ProgressEvent::Error {
            message: error.to_string(),
            recoverable: false,
        });
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PublishedEvent;
    use crate::memory::tests::FakeProbe;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        probe: FakeProbe,
        bus: Arc<ProgressEventBus>,
        cancel: CancellationToken,
        scheduler: AdaptiveBatchScheduler,
    }

    fn harness(settings: BatchSettings, fraction: f64) -> Harness {
        let probe = FakeProbe::new(1000, 0);
        probe.set_fraction(fraction);
        let monitor = Arc::new(MemoryPressureMonitor::new(
            Box::new(probe.clone()),
            MemoryThresholds::default(),
        ));
        let bus = Arc::new(ProgressEventBus::new());
        let cancel = CancellationToken::new();
        let scheduler = AdaptiveBatchScheduler::new(settings, monitor, bus.clone(), cancel.clone());
        Harness {
            probe,
            bus,
            cancel,
            scheduler,
        }
    }

    fn settings(batch_size: usize) -> BatchSettings {
        BatchSettings {
            batch_size,
            pause_between_batches_ms: 0,
            ..Default::default()
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("item-{}", i)).collect()
    }

    fn batch_sizes(history: &[PublishedEvent]) -> Vec<usize> {
        history
            .iter()
            .filter_map(|p| match p.event {
                ProgressEvent::BatchStarted { size, .. } => Some(size),
                _ => None,
            })
            .collect()
    }

    async fn echo(batch: Batch<String>) -> anyhow::Result<Vec<Result<String, PipelineError>>> {
        Ok(batch.process_items(|item| async move { Ok(item) }).await)
    }

    #[tokio::test]
    async fn test_results_preserve_input_order() {
        let h = harness(settings(10), 0.5);
        let report = h.scheduler.run(ids(35), echo).await.unwrap();

        let out: Vec<String> = report.results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(out, ids(35));
        assert_eq!(report.batches, 4);
        assert_eq!(report.success_count, 35);
        assert!(!report.cancelled);
        assert_eq!(batch_sizes(&h.bus.history()), vec![10, 10, 10, 5]);
    }

    #[tokio::test]
    async fn test_high_pressure_shrinks_next_batch() {
        let h = harness(settings(100), 0.5);
        let probe = h.probe.clone();

        let report = h
            .scheduler
            .run(ids(150), move |batch| {
                let probe = probe.clone();
                async move {
                    if batch.index == 0 {
                        probe.set_fraction(0.85);
                    }
                    Ok(batch.process_items(|item| async move { Ok(item) }).await)
                }
            })
            .await
            .unwrap();

        let history = h.bus.history();
        let sizes = batch_sizes(&history);
        assert_eq!(&sizes[..2], &[100, 25]);
        assert!(history.iter().any(|p| matches!(
            p.event,
            ProgressEvent::BatchSizeAdjusted { old: 100, new: 25, .. }
        )));
        assert!(history.iter().any(|p| matches!(
            p.event,
            ProgressEvent::MemoryWarning {
                level: MemoryPressureLevel::High,
                ..
            }
        )));
        assert_eq!(report.success_count, 150);
    }

    #[tokio::test]
    async fn test_low_usage_grows_batches_up_to_cap() {
        let h = harness(settings(150), 0.1);
        let report = h.scheduler.run(ids(600), echo).await.unwrap();

        let sizes = batch_sizes(&h.bus.history());
        assert_eq!(sizes[0], 150);
        assert_eq!(sizes[1], 200);
        assert!(sizes.iter().all(|s| *s <= 200));
        assert_eq!(report.final_batch_size, 200);
    }

    #[tokio::test]
    async fn test_starts_reduced_under_pressure() {
        let h = harness(settings(100), 0.95);
        h.scheduler.run(ids(20), echo).await.unwrap();
        assert_eq!(batch_sizes(&h.bus.history())[0], 12);
    }

    #[tokio::test]
    async fn test_failed_items_do_not_abort_the_run() {
        let h = harness(settings(10), 0.5);

        let report = h
            .scheduler
            .run(ids(20), |batch| async move {
                let failing = batch.index == 0;
                Ok(batch
                    .process_items(|item| async move {
                        if failing {
                            Err(PipelineError::import(format!("{} rejected", item)))
                        } else {
                            Ok(item)
                        }
                    })
                    .await)
            })
            .await
            .unwrap();

        assert_eq!(report.failure_count, 10);
        assert_eq!(report.success_count, 10);
        assert_eq!(report.success_count + report.failure_count, report.total_items);
        assert!(report.results[..10].iter().all(|r| r.is_err()));
        assert!(report.results[10..].iter().all(|r| r.is_ok()));

        let history = h.bus.history();
        let recoverable_errors = history
            .iter()
            .filter(|p| matches!(p.event, ProgressEvent::Error { recoverable: true, .. }))
            .count();
        assert_eq!(recoverable_errors, 10);
        assert!(matches!(
            history.last().unwrap().event,
            ProgressEvent::Completed {
                total: 20,
                success: 10,
                fail: 10
            }
        ));
        assert_eq!(h.bus.overall_progress(), 100.0);
    }

    #[tokio::test]
    async fn test_batch_error_aborts_run() {
        let h = harness(settings(10), 0.5);
        let calls = AtomicUsize::new(0);

        let result = h
            .scheduler
            .run(ids(30), |batch: Batch<String>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if batch.index == 1 {
                        return Err(anyhow!("library unreachable"));
                    }
                    Ok(batch.process_items(|item| async move { Ok(item) }).await)
                }
            })
            .await;

        match result {
            Err(PipelineError::BatchAbort { batch_index, reason }) => {
                assert_eq!(batch_index, 1);
                assert!(reason.contains("library unreachable"));
            }
            other => panic!("expected BatchAbort, got {:?}", other.map(|r| r.processed())),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(h
            .bus
            .history()
            .iter()
            .any(|p| matches!(p.event, ProgressEvent::Error { recoverable: false, .. })));
    }

    #[tokio::test]
    async fn test_wrong_result_count_aborts_run() {
        let h = harness(settings(5), 0.5);
        let result = h
            .scheduler
            .run(ids(5), |_batch: Batch<String>| async move {
                Ok(vec![Ok::<String, PipelineError>("only one".to_string())])
            })
            .await;
        assert!(matches!(result, Err(PipelineError::BatchAbort { batch_index: 0, .. })));
    }

    #[tokio::test]
    async fn test_cancel_between_batches() {
        let h = harness(settings(10), 0.5);
        let cancel = h.cancel.clone();

        let report = h
            .scheduler
            .run(ids(50), move |batch| {
                let cancel = cancel.clone();
                async move {
                    let out = batch.process_items(|item| async move { Ok(item) }).await;
                    if out.len() == 10 {
                        cancel.cancel();
                    }
                    Ok(out)
                }
            })
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.processed(), 10);
        assert_eq!(report.batches, 1);
        assert_eq!(report.ensure_completed(), Err(PipelineError::Cancelled));
        assert!(matches!(
            h.bus.history().last().unwrap().event,
            ProgressEvent::Cancelled { processed: 10 }
        ));
    }

    #[tokio::test]
    async fn test_cancel_inside_batch_drops_the_tail() {
        let h = harness(
            BatchSettings {
                workers: 2,
                ..settings(10)
            },
            0.5,
        );
        let cancel = h.cancel.clone();
        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();

        let report = h
            .scheduler
            .run(ids(10), move |batch| {
                let cancel = cancel.clone();
                let counter = counter.clone();
                async move {
                    Ok(batch
                        .process_items(|item| {
                            let cancel = cancel.clone();
                            let n = counter.fetch_add(1, Ordering::SeqCst);
                            async move {
                                // Third item is in the second wave; cancel while it runs.
                                if n == 2 {
                                    cancel.cancel();
                                }
                                Ok(item)
                            }
                        })
                        .await)
                }
            })
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.processed(), 2);
        assert_eq!(started.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_workers_bound_concurrency() {
        let h = harness(
            BatchSettings {
                workers: 3,
                ..settings(10)
            },
            0.5,
        );
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (in_flight_c, peak_c) = (in_flight.clone(), peak.clone());

        h.scheduler
            .run(ids(10), move |batch| {
                let in_flight = in_flight_c.clone();
                let peak = peak_c.clone();
                async move {
                    Ok(batch
                        .process_items(|item| {
                            let in_flight = in_flight.clone();
                            let peak = peak.clone();
                            async move {
                                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                tokio::task::yield_now().await;
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                Ok(item)
                            }
                        })
                        .await)
                }
            })
            .await
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_pause_under_pressure() {
        let h = harness(
            BatchSettings {
                pause_between_batches_ms: 5,
                use_adaptive_sizing: false,
                ..settings(5)
            },
            0.7,
        );
        h.scheduler.run(ids(10), echo).await.unwrap();

        let history = h.bus.history();
        let paused = history.iter().position(|p| matches!(p.event, ProgressEvent::Paused { millis: 5 }));
        let resumed = history.iter().position(|p| matches!(p.event, ProgressEvent::Resumed));
        assert!(paused.is_some());
        assert_eq!(resumed, paused.map(|i| i + 1));
    }

    #[tokio::test]
    async fn test_cancel_cuts_a_long_pause_short() {
        let h = harness(
            BatchSettings {
                pause_between_batches_ms: 60_000,
                use_adaptive_sizing: false,
                ..settings(5)
            },
            0.7,
        );
        let cancel = h.cancel.clone();
        let bus = h.bus.clone();
        tokio::spawn(async move {
            // Wait until the scheduler is sleeping between batches.
            while !bus.history().iter().any(|p| matches!(p.event, ProgressEvent::Paused { .. })) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), h.scheduler.run(ids(10), echo))
            .await
            .expect("pause did not end on cancel")
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.processed(), 5);
        assert_eq!(report.batches, 1);
        assert!(h
            .bus
            .history()
            .iter()
            .any(|p| matches!(p.event, ProgressEvent::Resumed)));
    }

    #[tokio::test]
    async fn test_items_are_reported_as_each_wave_finishes() {
        let h = harness(settings(4), 0.5);
        let bus = h.bus.clone();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_c = seen.clone();

        h.scheduler
            .run(ids(4), move |batch| {
                let bus = bus.clone();
                let seen = seen_c.clone();
                async move {
                    Ok(batch
                        .process_items(|item| {
                            let done = bus
                                .history()
                                .iter()
                                .filter(|p| matches!(p.event, ProgressEvent::ItemProcessed { .. }))
                                .count();
                            seen.lock().unwrap().push(done);
                            async move { Ok(item) }
                        })
                        .await)
                }
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        let items = h
            .bus
            .history()
            .iter()
            .filter(|p| matches!(p.event, ProgressEvent::ItemProcessed { .. }))
            .count();
        assert_eq!(items, 4);
    }

    #[tokio::test]
    async fn test_no_pause_when_normal() {
        let h = harness(
            BatchSettings {
                pause_between_batches_ms: 5,
                ..settings(5)
            },
            0.5,
        );
        h.scheduler.run(ids(10), echo).await.unwrap();
        assert!(!h
            .bus
            .history()
            .iter()
            .any(|p| matches!(p.event, ProgressEvent::Paused { .. })));
    }

    #[tokio::test]
    async fn test_batch_events_are_ordered() {
        let h = harness(settings(4), 0.5);
        h.scheduler.run(ids(10), echo).await.unwrap();

        let mut open: Option<usize> = None;
        let mut last_item = None;
        for published in h.bus.history() {
            match published.event {
                ProgressEvent::BatchStarted { index, .. } => {
                    assert!(open.is_none());
                    open = Some(index);
                }
                ProgressEvent::ItemProcessed { index, .. } => {
                    assert!(open.is_some());
                    assert!(last_item.map_or(true, |last| index > last));
                    last_item = Some(index);
                }
                ProgressEvent::BatchCompleted { index, .. } => {
                    assert_eq!(open.take(), Some(index));
                }
                _ => {}
            }
        }
        assert!(open.is_none());
        assert_eq!(last_item, Some(9));
    }

    #[tokio::test]
    async fn test_disabled_batching_runs_once() {
        let h = harness(
            BatchSettings {
                enabled: false,
                ..settings(5)
            },
            0.5,
        );
        let report = h.scheduler.run(ids(23), echo).await.unwrap();
        assert_eq!(report.batches, 1);
        assert_eq!(batch_sizes(&h.bus.history()), vec![23]);
    }

    #[tokio::test]
    async fn test_empty_input_completes() {
        let h = harness(settings(10), 0.5);
        let report = h.scheduler.run(Vec::<String>::new(), echo).await.unwrap();
        assert_eq!(report.batches, 0);
        assert!(matches!(
            h.bus.history()[0].event,
            ProgressEvent::Completed { total: 0, .. }
        ));
    }

    #[test]
    fn test_settings_validation() {
        assert!(BatchSettings::default().validate().is_ok());
        assert!(BatchSettings {
            workers: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(BatchSettings {
            high_memory_threshold: 0.95,
            critical_memory_threshold: 0.9,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(BatchSettings {
            batch_size: 2,
            min_batch_size: 5,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
