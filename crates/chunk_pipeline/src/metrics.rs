//! Engine-agnostic metrics for chunk processing.
//!
//! Feature-gated and runtime-toggled to ensure zero overhead when disabled.
//!
//! # Usage
//!
//! ```ignore
//! use chunk_pipeline::metrics::COLLECT_METRICS;
//!
//! // Compile with --features metrics
//! // Runtime toggle:
//! COLLECT_METRICS.store(false, Ordering::Relaxed);
//!
//! let metrics = pipeline.metrics();
//! println!("{}", metrics.report());
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

/// Runtime toggle for metrics collection.
pub static COLLECT_METRICS: AtomicBool = AtomicBool::new(true);

/// Check if metrics collection is enabled (both compile-time and runtime).
#[inline]
pub fn is_enabled() -> bool {
  #[cfg(feature = "metrics")]
  {
    COLLECT_METRICS.load(Ordering::Relaxed)
  }
  #[cfg(not(feature = "metrics"))]
  {
    false
  }
}

/// Fixed-capacity window over the most recent samples.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
  buffer: VecDeque<T>,
  capacity: usize,
}

impl<T> RollingWindow<T> {
  pub fn new(capacity: usize) -> Self {
    Self {
      buffer: VecDeque::with_capacity(capacity),
      capacity: capacity.max(1),
    }
  }

  /// Push a value, evicting the oldest once full.
  pub fn push(&mut self, value: T) {
    if self.buffer.len() >= self.capacity {
      self.buffer.pop_front();
    }
    self.buffer.push_back(value);
  }

  pub fn len(&self) -> usize {
    self.buffer.len()
  }

  pub fn is_empty(&self) -> bool {
    self.buffer.is_empty()
  }

  pub fn clear(&mut self) {
    self.buffer.clear();
  }

  /// Oldest to newest.
  pub fn iter(&self) -> impl Iterator<Item = &T> {
    self.buffer.iter()
  }

  pub fn last(&self) -> Option<&T> {
    self.buffer.back()
  }
}

impl RollingWindow<u64> {
  pub fn sum(&self) -> u64 {
    self.buffer.iter().sum()
  }

  pub fn average(&self) -> f64 {
    if self.buffer.is_empty() {
      0.0
    } else {
      self.sum() as f64 / self.buffer.len() as f64
    }
  }

  pub fn min_max(&self) -> Option<(u64, u64)> {
    let min = self.buffer.iter().min()?;
    let max = self.buffer.iter().max()?;
    Some((*min, *max))
  }
}

impl Default for RollingWindow<u64> {
  fn default() -> Self {
    Self::new(128)
  }
}

/// Counters and per-stage timings of one pipeline instance.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
  /// Chains that reached the end of the last stage.
  pub chunks_completed: AtomicU64,
  /// Chains that failed in a stage or the generator.
  pub chunks_failed: AtomicU64,
  /// Chains stopped by the caller.
  pub chunks_cancelled: AtomicU64,
  /// Steps the executor refused (queue full or shut down).
  pub tasks_rejected: AtomicU64,
  /// Stage invocations parked by a dependency reactor.
  pub deferrals: AtomicU64,
  /// Parked stages re-submitted after their requirements resolved.
  pub resumes: AtomicU64,

  stage_timings: Mutex<BTreeMap<String, RollingWindow<u64>>>,
}

impl PipelineMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  #[inline]
  fn bump(counter: &AtomicU64) {
    if is_enabled() {
      counter.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn record_completed(&self) {
    Self::bump(&self.chunks_completed);
  }

  pub fn record_failed(&self) {
    Self::bump(&self.chunks_failed);
  }

  pub fn record_cancelled(&self) {
    Self::bump(&self.chunks_cancelled);
  }

  pub fn record_rejected(&self) {
    Self::bump(&self.tasks_rejected);
  }

  pub fn record_deferral(&self) {
    Self::bump(&self.deferrals);
  }

  pub fn record_resume(&self) {
    Self::bump(&self.resumes);
  }

  /// Record how long one stage invocation took.
  pub fn record_stage_timing(&self, stage: &str, timing_us: u64) {
    if !is_enabled() {
      return;
    }
    let mut timings = self.stage_timings.lock();
    match timings.get_mut(stage) {
      Some(window) => window.push(timing_us),
      None => {
        let mut window = RollingWindow::default();
        window.push(timing_us);
        timings.insert(stage.to_string(), window);
      }
    }
  }

  /// Average timing per stage name, in microseconds.
  pub fn stage_averages(&self) -> Vec<(String, f64)> {
    self
      .stage_timings
      .lock()
      .iter()
      .map(|(name, window)| (name.clone(), window.average()))
      .collect()
  }

  pub fn reset(&self) {
    self.chunks_completed.store(0, Ordering::Relaxed);
    self.chunks_failed.store(0, Ordering::Relaxed);
    self.chunks_cancelled.store(0, Ordering::Relaxed);
    self.tasks_rejected.store(0, Ordering::Relaxed);
    self.deferrals.store(0, Ordering::Relaxed);
    self.resumes.store(0, Ordering::Relaxed);
    self.stage_timings.lock().clear();
  }

  /// Human readable summary.
  pub fn report(&self) -> String {
    let mut out = format!(
      "Chunk Pipeline\n\
       ==============\n\
       Completed: {}\n\
       Failed: {}\n\
       Cancelled: {}\n\
       Rejected: {}\n\
       Deferred: {} (resumed {})\n",
      self.chunks_completed.load(Ordering::Relaxed),
      self.chunks_failed.load(Ordering::Relaxed),
      self.chunks_cancelled.load(Ordering::Relaxed),
      self.tasks_rejected.load(Ordering::Relaxed),
      self.deferrals.load(Ordering::Relaxed),
      self.resumes.load(Ordering::Relaxed),
    );
    for (stage, avg_us) in self.stage_averages() {
      out.push_str(&format!("  [{stage}] avg {:.2} ms\n", avg_us / 1000.0));
    }
    out
  }
}
