//! Bounded worker pool built on rayon.
//!
//! The [`WorkerPool`] owns the only OS threads used for short-lived and
//! chained work; task masters and the processing pipeline submit into it.
//!
//! - `thread_pool()` hands out a [`PoolHandle`] (or `None` once shut down).
//! - `new_activity()` wraps work so that, while it runs, the thread carries a
//!   label, a priority and an open monitoring span. All three are restored by
//!   RAII guards on every exit path, including panics.
//! - `shutdown()` drains with a bounded wait, then cancels.
//!
//! # Usage
//!
//! ```ignore
//! let pool = WorkerPool::new(WorkerPoolConfig::new("chunk", 4))?;
//! let handle = pool.thread_pool().expect("running");
//!
//! let job = handle.submit(pool.new_activity(
//!     move || expensive_computation(),
//!     Some("chunk-gen-0"),
//!     ThreadPriority::NORM,
//!     Some("Generate"),
//! ));
//!
//! // Later, if the result is no longer wanted:
//! job.cancel();
//! ```
//!
//! rayon threads cannot be renamed or re-prioritised once started, so the
//! label and priority are thread-local metadata read through
//! [`current_thread_label`] and [`current_thread_priority`].

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use web_time::Instant;

use crate::config::WorkerPoolConfig;
use crate::error::{panic_message, TaskError};
use crate::monitor::{Activity, ActivityMonitor, NoopMonitor};

// =============================================================================
// Thread metadata
// =============================================================================

/// Scheduling hint carried by worker threads while they run an activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadPriority(u8);

impl ThreadPriority {
  pub const MIN: Self = Self(1);
  pub const NORM: Self = Self(5);
  pub const MAX: Self = Self(10);

  /// Clamped to `MIN..=MAX`.
  pub fn new(value: u8) -> Self {
    Self(value.clamp(Self::MIN.0, Self::MAX.0))
  }

  pub fn get(self) -> u8 {
    self.0
  }
}

impl Default for ThreadPriority {
  fn default() -> Self {
    Self::NORM
  }
}

thread_local! {
  static THREAD_LABEL: RefCell<Option<String>> = const { RefCell::new(None) };
  static THREAD_PRIORITY: Cell<ThreadPriority> = const { Cell::new(ThreadPriority::NORM) };
  static CURRENT_JOB: RefCell<Option<JobToken>> = const { RefCell::new(None) };
}

/// Label of the current thread: the activity override if one is active,
/// otherwise the OS thread name.
pub fn current_thread_label() -> String {
  THREAD_LABEL
    .with(|label| label.borrow().clone())
    .or_else(|| std::thread::current().name().map(str::to_string))
    .unwrap_or_else(|| "unnamed".to_string())
}

pub fn current_thread_priority() -> ThreadPriority {
  THREAD_PRIORITY.with(Cell::get)
}

/// True when the job running on this thread was cancelled, or its pool is
/// shutting down. Long-running work should poll this and return early.
pub fn is_current_job_cancelled() -> bool {
  CURRENT_JOB.with(|job| job.borrow().as_ref().is_some_and(JobToken::is_cancelled))
}

/// Overrides the thread label and priority until dropped.
pub struct ThreadScope {
  prev_label: Option<String>,
  prev_priority: ThreadPriority,
  // Thread-local state: must be dropped on the thread that created it.
  _not_send: PhantomData<*const ()>,
}

impl ThreadScope {
  pub fn enter(label: Option<&str>, priority: ThreadPriority) -> Self {
    let prev_label = THREAD_LABEL.with(|l| {
      let mut l = l.borrow_mut();
      match label {
        Some(label) => l.replace(label.to_string()),
        None => l.clone(),
      }
    });
    let prev_priority = THREAD_PRIORITY.with(|p| p.replace(priority));
    Self {
      prev_label,
      prev_priority,
      _not_send: PhantomData,
    }
  }
}

impl Drop for ThreadScope {
  fn drop(&mut self) {
    let prev_label = self.prev_label.take();
    THREAD_LABEL.with(|l| *l.borrow_mut() = prev_label);
    THREAD_PRIORITY.with(|p| p.set(self.prev_priority));
  }
}

// =============================================================================
// Jobs
// =============================================================================

#[derive(Clone)]
struct JobToken {
  cancelled: Arc<AtomicBool>,
  shared: Arc<PoolShared>,
}

impl JobToken {
  fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Acquire) || self.shared.cancelled.load(Ordering::Acquire)
  }
}

/// Installs the job token for the duration of a job.
struct JobScope {
  prev: Option<JobToken>,
}

impl JobScope {
  fn enter(token: JobToken) -> Self {
    let prev = CURRENT_JOB.with(|job| job.borrow_mut().replace(token));
    Self { prev }
  }
}

impl Drop for JobScope {
  fn drop(&mut self) {
    let prev = self.prev.take();
    CURRENT_JOB.with(|job| *job.borrow_mut() = prev);
  }
}

/// Handle to a submitted job.
#[derive(Clone, Debug)]
pub struct JobHandle {
  cancelled: Arc<AtomicBool>,
}

impl JobHandle {
  /// A job that has not started yet is skipped; a running job observes
  /// the cancellation through [`is_current_job_cancelled`].
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::Release);
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Acquire)
  }
}

/// State shared by every generation of one pool (survives resizes).
struct PoolShared {
  in_flight: Mutex<usize>,
  idle: Condvar,
  closed: AtomicBool,
  cancelled: AtomicBool,
}

impl PoolShared {
  fn new() -> Self {
    Self {
      in_flight: Mutex::new(0),
      idle: Condvar::new(),
      closed: AtomicBool::new(false),
      cancelled: AtomicBool::new(false),
    }
  }

  /// Wait until no job is queued or running. Returns false on timeout.
  fn wait_idle(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut in_flight = self.in_flight.lock();
    while *in_flight > 0 {
      let now = Instant::now();
      if now >= deadline {
        return false;
      }
      self.idle.wait_for(&mut in_flight, deadline - now);
    }
    true
  }

  fn in_flight(&self) -> usize {
    *self.in_flight.lock()
  }
}

struct InFlightGuard(Arc<PoolShared>);

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    let mut in_flight = self.0.in_flight.lock();
    *in_flight = in_flight.saturating_sub(1);
    if *in_flight == 0 {
      self.0.idle.notify_all();
    }
  }
}

/// Cloneable handle to a live rayon pool.
#[derive(Clone)]
pub struct PoolHandle {
  pool: Arc<rayon::ThreadPool>,
  shared: Arc<PoolShared>,
}

impl PoolHandle {
  /// Queue work on the pool (non-blocking).
  ///
  /// Work submitted after the pool was shut down is rejected up front and
  /// comes back as an already cancelled handle. Work cancelled before it
  /// started is dropped without running. Panics are caught and logged.
  pub fn submit<F>(&self, work: F) -> JobHandle
  where
    F: FnOnce() + Send + 'static,
  {
    let accepted = {
      let mut in_flight = self.shared.in_flight.lock();
      let open = !self.shared.closed.load(Ordering::Acquire);
      if open {
        *in_flight += 1;
      }
      open
    };
    if !accepted {
      // Dropped on a worker: the work may own guards that take the caller's locks.
      self.pool.spawn(move || drop(work));
      return JobHandle {
        cancelled: Arc::new(AtomicBool::new(true)),
      };
    }

    let cancelled = Arc::new(AtomicBool::new(false));

    let token = JobToken {
      cancelled: Arc::clone(&cancelled),
      shared: Arc::clone(&self.shared),
    };

    self.pool.spawn(move || {
      let _in_flight = InFlightGuard(Arc::clone(&token.shared));
      if token.is_cancelled() {
        drop(work);
        return;
      }

      let _job = JobScope::enter(token);
      if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
        tracing::error!(
          thread = %current_thread_label(),
          "Worker job panicked: {}",
          panic_message(payload.as_ref())
        );
      }
    });

    JobHandle { cancelled }
  }

  /// Worker threads in this pool.
  pub fn num_threads(&self) -> usize {
    self.pool.current_num_threads()
  }

  /// Jobs queued or running.
  pub fn pending_count(&self) -> usize {
    self.shared.in_flight()
  }
}

// =============================================================================
// WorkerPool
// =============================================================================

struct PoolState {
  config: WorkerPoolConfig,
  active: Option<PoolHandle>,
}

/// Owner of a resizable, restartable rayon thread pool.
pub struct WorkerPool {
  state: Mutex<PoolState>,
  monitor: Arc<dyn ActivityMonitor>,
}

impl WorkerPool {
  /// Create and start a pool.
  pub fn new(config: WorkerPoolConfig) -> Result<Self, TaskError> {
    Self::with_monitor(config, Arc::new(NoopMonitor))
  }

  /// Create and start a pool whose activities report to `monitor`.
  pub fn with_monitor(config: WorkerPoolConfig, monitor: Arc<dyn ActivityMonitor>) -> Result<Self, TaskError> {
    validate_size(config.num_threads)?;
    let pool = build_pool(&config, Arc::new(PoolShared::new()))?;
    Ok(Self {
      state: Mutex::new(PoolState {
        config,
        active: Some(pool),
      }),
      monitor,
    })
  }

  pub fn monitor(&self) -> &Arc<dyn ActivityMonitor> {
    &self.monitor
  }

  /// Wrap `work` so that it runs with the given thread label, priority and
  /// activity span. Everything is restored when the work returns or panics.
  pub fn new_activity<F, R>(
    &self,
    work: F,
    thread_name: Option<&str>,
    priority: ThreadPriority,
    activity_name: Option<&str>,
  ) -> impl FnOnce() -> R + Send + 'static
  where
    F: FnOnce() -> R + Send + 'static,
    R: 'static,
  {
    let thread_name = thread_name.map(str::to_string);
    let activity_name = activity_name.map(str::to_string);
    let monitor = Arc::clone(&self.monitor);
    move || {
      let _scope = ThreadScope::enter(thread_name.as_deref(), priority);
      let _activity = activity_name.map(|name| Activity::new(monitor, &name));
      work()
    }
  }

  /// The active pool, or `None` while shut down.
  pub fn thread_pool(&self) -> Option<PoolHandle> {
    self.state.lock().active.clone()
  }

  pub fn is_running(&self) -> bool {
    self.state.lock().active.is_some()
  }

  pub fn pool_size(&self) -> usize {
    self.state.lock().config.num_threads
  }

  /// Resize the pool.
  ///
  /// rayon pools have a fixed size, so a running pool is replaced by a new
  /// one; jobs already queued on the old pool still complete there.
  pub fn set_pool_size(&self, num_threads: usize) -> Result<(), TaskError> {
    validate_size(num_threads)?;
    let mut state = self.state.lock();
    if state.config.num_threads == num_threads {
      return Ok(());
    }
    let mut config = state.config.clone();
    config.num_threads = num_threads;
    if let Some(active) = &state.active {
      let replacement = build_pool(&config, Arc::clone(&active.shared))?;
      state.active = Some(replacement);
    }
    state.config = config;
    Ok(())
  }

  /// Stop accepting work and wait for in-flight jobs.
  ///
  /// Waits up to `graceful_wait`; then cancels (queued jobs are skipped,
  /// running jobs observe their token) and waits up to `extra_wait` more.
  /// Timeouts are logged, never raised. Returns `true` if the pool drained
  /// without cancellation.
  pub fn shutdown(&self, graceful_wait: Duration, extra_wait: Duration) -> bool {
    let (handle, prefix) = {
      let mut state = self.state.lock();
      match state.active.take() {
        Some(handle) => (handle, state.config.thread_name_prefix.clone()),
        None => return true,
      }
    };

    {
      let _in_flight = handle.shared.in_flight.lock();
      handle.shared.closed.store(true, Ordering::Release);
    }
    if handle.shared.wait_idle(graceful_wait) {
      return true;
    }

    handle.shared.cancelled.store(true, Ordering::Release);
    if !handle.shared.wait_idle(extra_wait) {
      tracing::warn!(
        pool = %prefix,
        remaining = handle.shared.in_flight(),
        "Timed out waiting for worker pool to terminate"
      );
    }
    false
  }

  /// Start a fresh pool if shut down. No-op while running.
  pub fn restart(&self) -> Result<(), TaskError> {
    let mut state = self.state.lock();
    if state.active.is_none() {
      let pool = build_pool(&state.config, Arc::new(PoolShared::new()))?;
      state.active = Some(pool);
    }
    Ok(())
  }
}

fn validate_size(num_threads: usize) -> Result<(), TaskError> {
  if num_threads == 0 {
    return Err(TaskError::InvalidArgument(
      "worker pool size must be positive".to_string(),
    ));
  }
  Ok(())
}

fn build_pool(config: &WorkerPoolConfig, shared: Arc<PoolShared>) -> Result<PoolHandle, TaskError> {
  let prefix = config.thread_name_prefix.clone();
  let pool = rayon::ThreadPoolBuilder::new()
    .num_threads(config.num_threads)
    .thread_name(move |index| format!("{prefix}-{index}"))
    .build()
    .map_err(|e| TaskError::PoolBuild(e.to_string()))?;
  Ok(PoolHandle {
    pool: Arc::new(pool),
    shared,
  })
}

#[cfg(test)]
#[path = "worker_pool_test.rs"]
mod worker_pool_test;
