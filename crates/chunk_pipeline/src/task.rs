//! Task abstraction shared by the worker pool and task masters.

use std::cmp::Ordering;
use std::sync::Arc;

/// A named unit of work.
pub trait Task: Send + 'static {
  /// Name used for activity spans and logs.
  fn name(&self) -> &str;

  /// Perform the work. Consumes the task.
  fn run(self);

  /// Sentinel tasks mark the end of a stream of work. They are never run;
  /// task masters discard them when draining.
  fn is_terminate_signal(&self) -> bool {
    false
  }
}

/// Ordering used by priority task masters. `Less` runs first.
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Comparator from a key function (lower keys run first).
pub fn comparator_by_key<T, K, F>(key: F) -> Comparator<T>
where
  K: Ord,
  F: Fn(&T) -> K + Send + Sync + 'static,
{
  Arc::new(move |a: &T, b: &T| key(a).cmp(&key(b)))
}

/// Natural ordering of `T`.
pub fn natural_order<T: Ord>() -> Comparator<T> {
  Arc::new(|a: &T, b: &T| a.cmp(b))
}

/// Closure-backed task, handy for ad-hoc work.
pub struct FnTask {
  name: String,
  priority: i64,
  work: Option<Box<dyn FnOnce() + Send>>,
}

impl FnTask {
  pub fn new(name: impl Into<String>, work: impl FnOnce() + Send + 'static) -> Self {
    Self {
      name: name.into(),
      priority: 0,
      work: Some(Box::new(work)),
    }
  }

  /// Sentinel that only marks termination.
  pub fn terminate(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      priority: 0,
      work: None,
    }
  }

  pub fn with_priority(mut self, priority: i64) -> Self {
    self.priority = priority;
    self
  }

  pub fn priority(&self) -> i64 {
    self.priority
  }
}

impl std::fmt::Debug for FnTask {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FnTask")
      .field("name", &self.name)
      .field("priority", &self.priority)
      .field("terminate", &self.work.is_none())
      .finish()
  }
}

impl Task for FnTask {
  fn name(&self) -> &str {
    &self.name
  }

  fn run(self) {
    if let Some(work) = self.work {
      work();
    }
  }

  fn is_terminate_signal(&self) -> bool {
    self.work.is_none()
  }
}

impl PartialEq for FnTask {
  fn eq(&self, other: &Self) -> bool {
    self.priority == other.priority
  }
}

impl Eq for FnTask {}

impl PartialOrd for FnTask {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for FnTask {
  fn cmp(&self, other: &Self) -> Ordering {
    self.priority.cmp(&other.priority)
  }
}
