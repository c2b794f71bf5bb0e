//! Process memory sampling and pressure classification.
//!
//! The monitor is constructed once and shared by reference. Its samples and
//! current level change only inside [`MemoryPressureMonitor::sample`]; every
//! other component reads.

pub mod probe;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use probe::{MemoryProbe, SysinfoProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressureLevel {
    Normal,
    Medium,
    High,
    Critical,
}

impl MemoryPressureLevel {
    pub fn name(&self) -> &'static str {
        match self {
            MemoryPressureLevel::Normal => "normal",
            MemoryPressureLevel::Medium => "medium",
            MemoryPressureLevel::High => "high",
            MemoryPressureLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for MemoryPressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Usage fractions and batch-size bounds that drive classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryThresholds {
    #[serde(default = "default_medium")]
    pub medium: f64,
    #[serde(default = "default_high")]
    pub high: f64,
    #[serde(default = "default_critical")]
    pub critical: f64,
    /// Below this usage fraction a normal-pressure batch may grow.
    #[serde(default = "default_growth_below")]
    pub growth_below: f64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_medium_floor")]
    pub medium_floor: usize,
    #[serde(default = "default_high_floor")]
    pub high_floor: usize,
    #[serde(default = "default_critical_floor")]
    pub critical_floor: usize,
}

fn default_medium() -> f64 {
    0.65
}

fn default_high() -> f64 {
    0.80
}

fn default_critical() -> f64 {
    0.90
}

fn default_growth_below() -> f64 {
    0.30
}

fn default_max_batch_size() -> usize {
    200
}

fn default_medium_floor() -> usize {
    20
}

fn default_high_floor() -> usize {
    10
}

fn default_critical_floor() -> usize {
    5
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            medium: default_medium(),
            high: default_high(),
            critical: default_critical(),
            growth_below: default_growth_below(),
            max_batch_size: default_max_batch_size(),
            medium_floor: default_medium_floor(),
            high_floor: default_high_floor(),
            critical_floor: default_critical_floor(),
        }
    }
}

impl MemoryThresholds {
    pub fn classify(&self, usage_fraction: f64) -> MemoryPressureLevel {
        if usage_fraction >= self.critical {
            MemoryPressureLevel::Critical
        } else if usage_fraction >= self.high {
            MemoryPressureLevel::High
        } else if usage_fraction >= self.medium {
            MemoryPressureLevel::Medium
        } else {
            MemoryPressureLevel::Normal
        }
    }

    /// Batch size to use after a batch of `current` items at `level`.
    pub fn recommend(&self, level: MemoryPressureLevel, usage_fraction: f64, current: usize) -> usize {
        match level {
            MemoryPressureLevel::Normal if usage_fraction < self.growth_below => {
                current.saturating_mul(2).min(self.max_batch_size)
            }
            MemoryPressureLevel::Normal => current,
            MemoryPressureLevel::Medium => (current / 2).max(self.medium_floor),
            MemoryPressureLevel::High => (current / 4).max(self.high_floor),
            MemoryPressureLevel::Critical => (current / 8).max(self.critical_floor),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let ordered = 0.0 < self.medium
            && self.medium <= self.high
            && self.high <= self.critical
            && self.critical <= 1.0;
        if !ordered {
            return Err(format!(
                "memory thresholds must satisfy 0 < medium <= high <= critical <= 1 (got {}/{}/{})",
                self.medium, self.high, self.critical
            ));
        }
        if self.critical_floor == 0 || self.max_batch_size < self.medium_floor {
            return Err("batch size floors must be positive and below the cap".to_string());
        }
        Ok(())
    }
}

/// A point-in-time view of the monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySnapshot {
    pub current_usage: u64,
    pub peak_usage: u64,
    pub total_memory: u64,
    pub pressure: MemoryPressureLevel,
}

impl MemorySnapshot {
    pub fn usage_fraction(&self) -> f64 {
        if self.total_memory == 0 {
            0.0
        } else {
            self.current_usage as f64 / self.total_memory as f64
        }
    }

    pub fn usage_percent(&self) -> f64 {
        self.usage_fraction() * 100.0
    }
}

/// Sent to subscribers when the pressure level actually changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureChange {
    pub previous: MemoryPressureLevel,
    pub current: MemoryPressureLevel,
    pub usage_percent: f64,
}

pub struct MemoryPressureMonitor {
    probe: Box<dyn MemoryProbe>,
    thresholds: MemoryThresholds,
    state: RwLock<MemorySnapshot>,
    changes: broadcast::Sender<PressureChange>,
}

impl MemoryPressureMonitor {
    pub fn new(probe: Box<dyn MemoryProbe>, thresholds: MemoryThresholds) -> Self {
        let (changes, _) = broadcast::channel(16);
        let monitor = Self {
            probe,
            thresholds,
            state: RwLock::new(MemorySnapshot {
                current_usage: 0,
                peak_usage: 0,
                total_memory: 0,
                pressure: MemoryPressureLevel::Normal,
            }),
            changes,
        };
        monitor.sample();
        monitor
    }

    pub fn with_sysinfo(thresholds: MemoryThresholds) -> Self {
        Self::new(Box::new(SysinfoProbe::new()), thresholds)
    }

    pub fn thresholds(&self) -> &MemoryThresholds {
        &self.thresholds
    }

    /// Take one sample and reclassify. This is the only writer of monitor state.
    pub fn sample(&self) -> MemorySnapshot {
        let total_memory = self.probe.total_physical_memory();
        let current_usage = self.probe.current_resident_memory();

        let (snapshot, change) = {
            let mut state = match self.state.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let previous = state.pressure;

            state.total_memory = total_memory;
            state.current_usage = current_usage;
            state.peak_usage = state.peak_usage.max(current_usage);
            state.pressure = self.thresholds.classify(state.usage_fraction());

            let change = (state.pressure != previous).then(|| PressureChange {
                previous,
                current: state.pressure,
                usage_percent: state.usage_percent(),
            });
            (*state, change)
        };

        if let Some(change) = change {
            tracing::info!(
                from = %change.previous,
                to = %change.current,
                usage_percent = format!("{:.1}", change.usage_percent),
                "Memory pressure changed"
            );
            // No receivers is fine.
            let _ = self.changes.send(change);
        }

        snapshot
    }

    /// Entry point for OS-level pressure notifications.
    pub fn on_pressure_signal(&self) -> MemorySnapshot {
        tracing::debug!("External memory pressure signal");
        self.sample()
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn current_pressure(&self) -> MemoryPressureLevel {
        self.snapshot().pressure
    }

    pub fn current_usage(&self) -> u64 {
        self.snapshot().current_usage
    }

    pub fn peak_usage(&self) -> u64 {
        self.snapshot().peak_usage
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PressureChange> {
        self.changes.subscribe()
    }

    /// Recommended size for the next batch given the last sampled state.
    pub fn recommended_batch_size(&self, current: usize) -> usize {
        let snapshot = self.snapshot();
        self.thresholds
            .recommend(snapshot.pressure, snapshot.usage_fraction(), current)
    }

    /// Sample every `interval` until `cancel` fires.
    pub fn spawn_sampler(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.sample();
                    }
                }
            }
            tracing::debug!("Memory sampler stopped");
        })
    }
}
