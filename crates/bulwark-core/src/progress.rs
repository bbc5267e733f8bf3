//! Progress reporting for long-running operations.
//!
//! Reporters publish immutable `ProgressSnapshot`s. Observers of an
//! `AsyncProgress` are notified on its completion context, never on the
//! reporting thread.

use crate::dispatch::CompletionContext;
use crate::lock;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, OnceLock};

/// Point-in-time view of an operation's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Fraction complete, always within [0, 1].
    pub progress: f64,
    pub message: String,
    pub stage: String,
    pub bytes_transferred: i64,
    pub total_bytes: i64,
    pub timestamp: DateTime<Utc>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            progress: 0.0,
            message: String::new(),
            stage: String::new(),
            bytes_transferred: 0,
            total_bytes: 0,
            timestamp: Utc::now(),
        }
    }
}

impl ProgressSnapshot {
    /// Progress as a whole percentage, e.g. "75%".
    pub fn percentage_string(&self) -> String {
        format!("{:.0}%", self.progress * 100.0)
    }

    /// Transferred bytes in human units, e.g. "1.5 MB / 10.0 MB".
    pub fn transfer_size_string(&self) -> String {
        if self.total_bytes > 0 {
            format!(
                "{} / {}",
                format_bytes(self.bytes_transferred),
                format_bytes(self.total_bytes)
            )
        } else {
            format_bytes(self.bytes_transferred)
        }
    }
}

fn format_bytes(bytes: i64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let value = bytes as f64;
    if value >= GB {
        format!("{:.1} GB", value / GB)
    } else if value >= MB {
        format!("{:.1} MB", value / MB)
    } else if value >= KB {
        format!("{:.1} KB", value / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Sink for progress updates from in-flight work.
pub trait ProgressReporter: Send + Sync {
    /// Report fractional progress; values are clamped to [0, 1].
    fn report_progress(&self, progress: f64, message: &str);

    fn report_stage(&self, stage: &str);

    /// Report bytes moved so far; recomputes progress when `total > 0`.
    fn report_transfer_progress(&self, transferred: i64, total: i64);
}

/// Identifies a subscription on an `AsyncProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

#[derive(Default)]
struct ObserverTable {
    next_id: u64,
    entries: Vec<(ObserverId, Observer)>,
}

/// Thread-safe progress holder with change notifications.
pub struct AsyncProgress {
    snapshot: Mutex<ProgressSnapshot>,
    observers: Mutex<ObserverTable>,
    context: CompletionContext,
}

impl AsyncProgress {
    /// Create a progress holder notifying observers on `context`.
    pub fn new(context: CompletionContext) -> Self {
        Self {
            snapshot: Mutex::new(ProgressSnapshot::default()),
            observers: Mutex::new(ObserverTable::default()),
            context,
        }
    }

    pub fn subscribe(
        &self,
        observer: impl Fn(&ProgressSnapshot) + Send + Sync + 'static,
    ) -> ObserverId {
        let mut table = lock(&self.observers);
        table.next_id += 1;
        let id = ObserverId(table.next_id);
        table.entries.push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut table = lock(&self.observers);
        let before = table.entries.len();
        table.entries.retain(|(existing, _)| *existing != id);
        table.entries.len() != before
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        lock(&self.snapshot).clone()
    }

    /// Return to zero progress and notify observers.
    pub fn reset(&self) {
        self.publish(|snapshot| *snapshot = ProgressSnapshot::default());
    }

    fn publish(&self, update: impl FnOnce(&mut ProgressSnapshot)) {
        // Posting under the snapshot lock keeps notifications in update order.
        let mut current = lock(&self.snapshot);
        update(&mut current);
        current.timestamp = Utc::now();

        let observers: Vec<Observer> = lock(&self.observers)
            .entries
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        if observers.is_empty() {
            return;
        }

        let snapshot = current.clone();
        self.context.post(move || {
            for observer in &observers {
                observer(&snapshot);
            }
        });
    }
}

impl ProgressReporter for AsyncProgress {
    fn report_progress(&self, progress: f64, message: &str) {
        self.publish(|snapshot| {
            snapshot.progress = clamp_unit(progress);
            snapshot.message = message.to_string();
        });
    }

    fn report_stage(&self, stage: &str) {
        self.publish(|snapshot| snapshot.stage = stage.to_string());
    }

    fn report_transfer_progress(&self, transferred: i64, total: i64) {
        self.publish(|snapshot| {
            snapshot.bytes_transferred = transferred;
            snapshot.total_bytes = total;
            if total > 0 {
                snapshot.progress = clamp_unit(transferred as f64 / total as f64);
            }
        });
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Reporter that discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressReporter;

impl NullProgressReporter {
    /// Shared instance used when a caller supplies no reporter.
    pub fn shared() -> Arc<dyn ProgressReporter> {
        static SHARED: OnceLock<Arc<NullProgressReporter>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(NullProgressReporter)).clone()
    }
}

impl ProgressReporter for NullProgressReporter {
    fn report_progress(&self, _progress: f64, _message: &str) {}

    fn report_stage(&self, _stage: &str) {}

    fn report_transfer_progress(&self, _transferred: i64, _total: i64) {}
}
