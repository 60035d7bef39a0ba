//! Activity monitoring: scoped spans around units of work.
//!
//! An [`Activity`] opens a `tracing` span and reports its elapsed time to an
//! [`ActivityMonitor`] when dropped. Monitoring is purely observational; the
//! [`NoopMonitor`] is a valid choice everywhere.

use std::sync::Arc;

use web_time::Instant;

use crate::metrics::PipelineMetrics;

/// Sink for activity timings.
pub trait ActivityMonitor: Send + Sync {
  /// Called once per finished activity.
  fn record(&self, name: &str, elapsed_us: u64);
}

/// Ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMonitor;

impl ActivityMonitor for NoopMonitor {
  fn record(&self, _name: &str, _elapsed_us: u64) {}
}

/// Forwards timings into per-stage rolling windows.
impl ActivityMonitor for PipelineMetrics {
  fn record(&self, name: &str, elapsed_us: u64) {
    self.record_stage_timing(name, elapsed_us);
  }
}

/// Start a named activity on `monitor`.
pub fn start_activity(monitor: &Arc<dyn ActivityMonitor>, name: &str) -> Activity {
  Activity::new(Arc::clone(monitor), name)
}

/// Scoped activity handle. Closes its span and records timing on drop,
/// including during unwinding.
pub struct Activity {
  monitor: Arc<dyn ActivityMonitor>,
  name: String,
  start: Instant,
  _span: tracing::span::EnteredSpan,
}

impl Activity {
  pub fn new(monitor: Arc<dyn ActivityMonitor>, name: &str) -> Self {
    let span = tracing::info_span!("activity", name = name).entered();
    Self {
      monitor,
      name: name.to_string(),
      start: Instant::now(),
      _span: span,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

impl Drop for Activity {
  fn drop(&mut self) {
    let elapsed_us = self.start.elapsed().as_micros() as u64;
    self.monitor.record(&self.name, elapsed_us);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;

  #[derive(Default)]
  struct Recorder(Mutex<Vec<String>>);

  impl ActivityMonitor for Recorder {
    fn record(&self, name: &str, _elapsed_us: u64) {
      self.0.lock().push(name.to_string());
    }
  }

  #[test]
  fn test_activity_records_on_drop() {
    let recorder = Arc::new(Recorder::default());
    let monitor: Arc<dyn ActivityMonitor> = recorder.clone();
    {
      let activity = start_activity(&monitor, "second pass");
      assert_eq!(activity.name(), "second pass");
      assert!(recorder.0.lock().is_empty());
    }
    assert_eq!(*recorder.0.lock(), vec!["second pass".to_string()]);
  }

  #[test]
  fn test_activity_records_during_unwind() {
    let recorder = Arc::new(Recorder::default());
    let monitor: Arc<dyn ActivityMonitor> = recorder.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      let _activity = start_activity(&monitor, "explodes");
      panic!("boom");
    }));
    assert!(result.is_err());
    assert_eq!(*recorder.0.lock(), vec!["explodes".to_string()]);
  }
}
