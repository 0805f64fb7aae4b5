//! Import progress and cancellation shared between the pipeline stages and observers.
//!
//! Workers only ever touch atomics here; observers sample them on their own
//! schedule through [`ProgressReporter`], so a slow or absent observer never
//! stalls an import.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Per-import state machine: `Idle → Preparing → Parsing → Writing → Indexing → Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPhase {
    Idle,
    Preparing,
    Parsing,
    Writing,
    Indexing,
}

impl ImportPhase {
    fn to_u8(self) -> u8 {
        match self {
            ImportPhase::Idle => 0,
            ImportPhase::Preparing => 1,
            ImportPhase::Parsing => 2,
            ImportPhase::Writing => 3,
            ImportPhase::Indexing => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ImportPhase::Preparing,
            2 => ImportPhase::Parsing,
            3 => ImportPhase::Writing,
            4 => ImportPhase::Indexing,
            _ => ImportPhase::Idle,
        }
    }
}

#[derive(Debug, Default)]
struct ControlInner {
    cancelled: AtomicBool,
    phase: AtomicU8,
    total_rows: AtomicU64,
    parsed_rows: AtomicU64,
    written_rows: AtomicU64,
}

/// Cheap cloneable handle for cancelling an import and observing its counters.
#[derive(Clone, Debug, Default)]
pub struct ImportControl {
    inner: Arc<ControlInner>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub phase: ImportPhase,
    pub total_rows: u64,
    pub parsed_rows: u64,
    pub written_rows: u64,
}

impl ImportControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Batches already committed stay committed.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn set_phase(&self, phase: ImportPhase) {
        self.inner.phase.store(phase.to_u8(), Ordering::Relaxed);
    }

    pub fn phase(&self) -> ImportPhase {
        ImportPhase::from_u8(self.inner.phase.load(Ordering::Relaxed))
    }

    pub fn set_total_rows(&self, rows: u64) {
        self.inner.total_rows.store(rows, Ordering::Relaxed);
    }

    pub fn add_parsed(&self, rows: u64) {
        self.inner.parsed_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn add_written(&self, rows: u64) {
        self.inner.written_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            phase: self.phase(),
            total_rows: self.inner.total_rows.load(Ordering::Relaxed),
            parsed_rows: self.inner.parsed_rows.load(Ordering::Relaxed),
            written_rows: self.inner.written_rows.load(Ordering::Relaxed),
        }
    }
}

/// Background thread that samples an [`ImportControl`] at a fixed interval.
///
/// The callback runs on the reporter thread. Dropping the reporter stops it.
pub struct ProgressReporter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn spawn<F>(control: ImportControl, interval: Duration, mut on_sample: F) -> Self
    where
        F: FnMut(ProgressSnapshot) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let interval = interval.max(Duration::from_millis(10));
        let handle = std::thread::Builder::new()
            .name("regstat-progress".to_string())
            .spawn(move || {
                let mut last = None;
                while !thread_stop.load(Ordering::Relaxed) {
                    let snapshot = control.snapshot();
                    if last != Some(snapshot) {
                        on_sample(snapshot);
                        last = Some(snapshot);
                    }
                    std::thread::park_timeout(interval);
                }
                // Final sample so observers see the terminal counters.
                let snapshot = control.snapshot();
                if last != Some(snapshot) {
                    on_sample(snapshot);
                }
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                log::warn!("progress reporter unavailable: {err}");
                None
            }
        };
        Self { stop, handle }
    }

    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
