//! Task masters: bounded submission of tasks into a shared worker pool.
//!
//! A [`TaskMaster`] owns N named slots (`"{name}-0"`..`"{name}-{N-1}"`) and a
//! pending queue. Every dispatched task occupies one slot until it finishes,
//! so at most N tasks of one master run on the pool at any time, no matter
//! how many other masters share that pool.
//!
//! ```text
//! offer/put ──► TaskQueue ──► free slot? ──► WorkerPool ──► task.run()
//!                  ▲                                          │
//!                  └──────────── slot returned, next ◄────────┘
//! ```
//!
//! Queue disciplines:
//! - `Fifo`: arrival order.
//! - `Priority`: comparator order, fixed at insertion.
//! - `DynamicPriority`: comparator order that can change over time; call
//!   [`TaskMaster::reprioritize`] to re-rank pending work.
//!
//! # Usage
//!
//! ```ignore
//! let pool = Arc::new(WorkerPool::new(WorkerPoolConfig::new("chunk", 4))?);
//! let unloader = TaskMaster::fifo("Chunk-Unloader", 4, Arc::clone(&pool))?;
//!
//! unloader.offer(FnTask::new("unload", move || store.save(chunk)));
//! unloader.shutdown(DEFAULT_COMPLETION_WAIT, false);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use web_time::Instant;

use crate::error::TaskError;
use crate::task::{natural_order, Comparator, Task};
use crate::worker_pool::{JobHandle, ThreadPriority, WorkerPool};

/// Default bound for orderly shutdown waits.
pub const DEFAULT_COMPLETION_WAIT: Duration = Duration::from_secs(20);

// =============================================================================
// Queue
// =============================================================================

enum Discipline<T> {
  Fifo,
  Priority(Comparator<T>),
  DynamicPriority(Comparator<T>),
}

struct TaskQueue<T> {
  items: VecDeque<T>,
  discipline: Discipline<T>,
  capacity: Option<usize>,
}

impl<T> TaskQueue<T> {
  fn new(discipline: Discipline<T>, capacity: Option<usize>) -> Self {
    Self {
      items: VecDeque::new(),
      discipline,
      capacity,
    }
  }

  fn len(&self) -> usize {
    self.items.len()
  }

  fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  fn is_full(&self) -> bool {
    self.capacity.is_some_and(|cap| self.items.len() >= cap)
  }

  /// Insert respecting the discipline. Hands the task back when full.
  fn push(&mut self, task: T) -> Result<(), T> {
    if self.is_full() {
      return Err(task);
    }
    self.insert(task);
    Ok(())
  }

  /// Put a task back after a failed dispatch, ignoring capacity.
  fn requeue(&mut self, task: T) {
    match self.discipline {
      Discipline::Fifo => self.items.push_front(task),
      _ => self.insert(task),
    }
  }

  fn insert(&mut self, task: T) {
    match &self.discipline {
      Discipline::Fifo => self.items.push_back(task),
      Discipline::Priority(cmp) | Discipline::DynamicPriority(cmp) => {
        // After all equal elements, so equal priorities stay FIFO.
        let idx = self
          .items
          .partition_point(|queued| cmp(queued, &task) != std::cmp::Ordering::Greater);
        self.items.insert(idx, task);
      }
    }
  }

  fn pop(&mut self) -> Option<T> {
    self.items.pop_front()
  }

  /// Re-sort after priorities changed. Stable.
  fn reorder(&mut self) -> bool {
    let Discipline::DynamicPriority(cmp) = &self.discipline else {
      return false;
    };
    let cmp = Arc::clone(cmp);
    self.items.make_contiguous().sort_by(|a, b| cmp(a, b));
    true
  }

  fn clear(&mut self) -> usize {
    let dropped = self.items.len();
    self.items.clear();
    dropped
  }
}

// =============================================================================
// Shared state
// =============================================================================

struct MasterState<T> {
  queue: TaskQueue<T>,
  free_slots: Vec<String>,
  submitted: HashMap<u64, (String, JobHandle)>,
  thread_priority: ThreadPriority,
  running: bool,
  shutting_down: bool,
  draining: bool,
  generation: u64,
  next_work_id: u64,
}

struct Shared<T> {
  name: String,
  slot_names: Vec<String>,
  pool: Arc<WorkerPool>,
  state: Mutex<MasterState<T>>,
  not_full: Condvar,
  tasks_done: Condvar,
}

/// Returns the slot and schedules follow-up work when a dispatched task ends.
///
/// Created before the job is submitted and moved into it, so it also fires
/// when the pool drops the job without running it.
struct WorkDone<T: Task> {
  shared: Arc<Shared<T>>,
  id: u64,
  generation: u64,
}

impl<T: Task> Drop for WorkDone<T> {
  fn drop(&mut self) {
    let mut state = self.shared.state.lock();
    if let Some((slot, _)) = state.submitted.remove(&self.id) {
      if !state.free_slots.contains(&slot) {
        state.free_slots.push(slot);
      }
    }
    if self.generation == state.generation {
      schedule(&self.shared, &mut state);
    }
    self.shared.tasks_done.notify_all();
  }
}

/// Dispatch queued tasks into free slots.
fn schedule<T: Task>(shared: &Arc<Shared<T>>, state: &mut MasterState<T>) {
  if !state.running || (state.shutting_down && !state.draining) {
    return;
  }

  while !state.free_slots.is_empty() {
    let Some(task) = state.queue.pop() else {
      break;
    };
    shared.not_full.notify_one();

    if task.is_terminate_signal() {
      continue;
    }

    let Some(handle) = shared.pool.thread_pool() else {
      state.queue.requeue(task);
      tracing::warn!(master = %shared.name, "Worker pool unavailable; task left queued");
      break;
    };

    let Some(slot) = state.free_slots.pop() else {
      state.queue.requeue(task);
      break;
    };
    let id = state.next_work_id;
    state.next_work_id += 1;

    let task_name = task.name().to_string();
    let done = WorkDone {
      shared: Arc::clone(shared),
      id,
      generation: state.generation,
    };
    let work = shared.pool.new_activity(
      move || {
        let _done = done;
        task.run();
      },
      Some(&slot),
      state.thread_priority,
      Some(&task_name),
    );
    let job = handle.submit(work);
    state.submitted.insert(id, (slot, job));
  }
}

// =============================================================================
// TaskMaster
// =============================================================================

/// Bounded, named-slot submitter for one purpose (requests, unloads, stages).
pub struct TaskMaster<T: Task> {
  shared: Arc<Shared<T>>,
}

impl<T: Task> TaskMaster<T> {
  /// First-in first-out, unbounded queue.
  pub fn fifo(name: &str, limit: usize, pool: Arc<WorkerPool>) -> Result<Self, TaskError> {
    Self::build(name, limit, pool, TaskQueue::new(Discipline::Fifo, None))
  }

  /// Fixed priority order (`Less` runs first), bounded queue.
  pub fn priority(
    name: &str,
    limit: usize,
    capacity: usize,
    comparator: Comparator<T>,
    pool: Arc<WorkerPool>,
  ) -> Result<Self, TaskError> {
    validate_capacity(capacity)?;
    let queue = TaskQueue::new(Discipline::Priority(comparator), Some(capacity));
    Self::build(name, limit, pool, queue)
  }

  /// Priority order whose keys may change; see [`Self::reprioritize`].
  pub fn dynamic_priority(
    name: &str,
    limit: usize,
    capacity: usize,
    comparator: Comparator<T>,
    pool: Arc<WorkerPool>,
  ) -> Result<Self, TaskError> {
    validate_capacity(capacity)?;
    let queue = TaskQueue::new(Discipline::DynamicPriority(comparator), Some(capacity));
    Self::build(name, limit, pool, queue)
  }

  fn build(name: &str, limit: usize, pool: Arc<WorkerPool>, queue: TaskQueue<T>) -> Result<Self, TaskError> {
    if limit == 0 {
      return Err(TaskError::InvalidArgument(format!(
        "task master '{name}' needs a positive submit limit"
      )));
    }
    let slot_names: Vec<String> = (0..limit).map(|i| format!("{name}-{i}")).collect();
    // Reversed so that `pop` hands out "{name}-0" first.
    let free_slots = slot_names.iter().rev().cloned().collect();

    Ok(Self {
      shared: Arc::new(Shared {
        name: name.to_string(),
        slot_names,
        pool,
        state: Mutex::new(MasterState {
          queue,
          free_slots,
          submitted: HashMap::new(),
          thread_priority: ThreadPriority::NORM,
          running: true,
          shutting_down: false,
          draining: false,
          generation: 0,
          next_work_id: 0,
        }),
        not_full: Condvar::new(),
        tasks_done: Condvar::new(),
      }),
    })
  }

  /// Thread priority applied while this master's tasks run.
  pub fn with_thread_priority(self, priority: ThreadPriority) -> Self {
    self.shared.state.lock().thread_priority = priority;
    self
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }

  pub fn submit_limit(&self) -> usize {
    self.shared.slot_names.len()
  }

  pub fn queued_len(&self) -> usize {
    self.shared.state.lock().queue.len()
  }

  /// Tasks currently holding a slot.
  pub fn active_count(&self) -> usize {
    self.shared.state.lock().submitted.len()
  }

  /// False between `shutdown` and `restart`.
  pub fn is_running(&self) -> bool {
    let state = self.shared.state.lock();
    state.running && !state.shutting_down
  }

  /// Queue a task without blocking.
  ///
  /// Returns false if a shutdown is in progress, the worker pool is down, or
  /// the queue is full. After a completed shutdown tasks are accepted and
  /// held until [`Self::restart`].
  pub fn offer(&self, task: T) -> bool {
    if self.shared.pool.thread_pool().is_none() {
      return false;
    }
    let mut state = self.shared.state.lock();
    if state.shutting_down {
      return false;
    }
    if state.queue.push(task).is_err() {
      return false;
    }
    schedule(&self.shared, &mut state);
    true
  }

  /// Queue follow-up work for a task that was already admitted.
  ///
  /// Ignores the queue bound so admitted work is never rejected halfway.
  /// Returns false only if a shutdown is in progress or the pool is down.
  pub fn requeue(&self, task: T) -> bool {
    if self.shared.pool.thread_pool().is_none() {
      return false;
    }
    let mut state = self.shared.state.lock();
    if state.shutting_down {
      return false;
    }
    state.queue.insert(task);
    schedule(&self.shared, &mut state);
    true
  }

  /// Queue a task, blocking while the queue is full.
  pub fn put(&self, task: T) -> Result<(), TaskError> {
    self.put_until(task, None)
  }

  /// Like [`Self::put`] but gives up after `timeout` with `QueueFull`.
  pub fn put_timeout(&self, task: T, timeout: Duration) -> Result<(), TaskError> {
    self.put_until(task, Some(Instant::now() + timeout))
  }

  fn put_until(&self, task: T, deadline: Option<Instant>) -> Result<(), TaskError> {
    if self.shared.pool.thread_pool().is_none() {
      return Err(TaskError::PoolUnavailable);
    }
    let mut state = self.shared.state.lock();
    if state.shutting_down {
      return Err(TaskError::ShuttingDown);
    }

    while state.queue.is_full() {
      match deadline {
        Some(deadline) => {
          let now = Instant::now();
          if now >= deadline {
            return Err(TaskError::QueueFull);
          }
          self.shared.not_full.wait_for(&mut state, deadline - now);
        }
        None => self.shared.not_full.wait(&mut state),
      }
      if state.shutting_down {
        return Err(TaskError::Interrupted);
      }
    }

    if state.queue.push(task).is_err() {
      return Err(TaskError::QueueFull);
    }
    schedule(&self.shared, &mut state);
    Ok(())
  }

  /// Re-rank pending tasks after their priorities changed.
  /// No-op unless the master was built with `dynamic_priority`.
  pub fn reprioritize(&self) {
    let mut state = self.shared.state.lock();
    if state.queue.reorder() {
      tracing::trace!(master = %self.shared.name, queued = state.queue.len(), "Reprioritized");
    }
  }

  /// Drop every queued task; in-flight tasks are unaffected.
  pub fn clear(&self) -> usize {
    let dropped = self.shared.state.lock().queue.clear();
    self.shared.not_full.notify_all();
    dropped
  }

  /// Stop dispatching and wait for work to finish.
  ///
  /// With `wait_for_scheduled_only`, queued tasks are discarded and only
  /// in-flight tasks are awaited. Otherwise the queue is drained first.
  /// Gives up after `wait`: stragglers are cancelled and a warning logged.
  /// Concurrent calls coalesce into the first one.
  pub fn shutdown(&self, wait: Duration, wait_for_scheduled_only: bool) {
    let deadline = Instant::now() + wait;
    let mut state = self.shared.state.lock();

    if state.shutting_down {
      if wait_for_scheduled_only {
        state.draining = false;
        state.queue.clear();
        self.shared.not_full.notify_all();
      }
      while state.shutting_down {
        let now = Instant::now();
        if now >= deadline {
          break;
        }
        self.shared.tasks_done.wait_for(&mut state, deadline - now);
      }
      return;
    }

    if !state.running {
      if wait_for_scheduled_only {
        state.queue.clear();
      }
      return;
    }

    state.shutting_down = true;
    state.draining = !wait_for_scheduled_only;
    self.shared.not_full.notify_all();

    if wait_for_scheduled_only {
      let dropped = state.queue.clear();
      if dropped > 0 {
        tracing::debug!(master = %self.shared.name, dropped, "Discarded queued tasks");
      }
    } else {
      state.queue.items.retain(|task| !task.is_terminate_signal());
      schedule(&self.shared, &mut state);
    }

    loop {
      let idle = state.submitted.is_empty() && (!state.draining || state.queue.is_empty());
      if idle {
        break;
      }
      let now = Instant::now();
      if now >= deadline {
        for (_, (_, job)) in state.submitted.iter() {
          job.cancel();
        }
        tracing::warn!(
          master = %self.shared.name,
          in_flight = state.submitted.len(),
          queued = state.queue.len(),
          "Timed out waiting for tasks to complete"
        );
        break;
      }
      self.shared.tasks_done.wait_for(&mut state, deadline - now);
    }

    state.shutting_down = false;
    state.draining = false;
    state.running = false;
    state.generation += 1;
    self.shared.tasks_done.notify_all();
  }

  /// Resume dispatching after a shutdown.
  ///
  /// Waits for an in-progress shutdown, rebuilds the free slots and
  /// schedules anything still queued. Safe to call on a running master.
  pub fn restart(&self) {
    let mut state = self.shared.state.lock();
    while state.shutting_down {
      self.shared.tasks_done.wait(&mut state);
    }

    let in_use: HashSet<&String> = state.submitted.values().map(|(slot, _)| slot).collect();
    let free_slots: Vec<String> = self
      .shared
      .slot_names
      .iter()
      .rev()
      .filter(|slot| !in_use.contains(slot))
      .cloned()
      .collect();
    state.free_slots = free_slots;
    state.running = true;
    schedule(&self.shared, &mut state);
  }
}

impl<T: Task + Ord> TaskMaster<T> {
  /// Priority queue ordered by `T`'s own ordering.
  pub fn priority_natural(
    name: &str,
    limit: usize,
    capacity: usize,
    pool: Arc<WorkerPool>,
  ) -> Result<Self, TaskError> {
    Self::priority(name, limit, capacity, natural_order(), pool)
  }
}

fn validate_capacity(capacity: usize) -> Result<(), TaskError> {
  if capacity == 0 {
    return Err(TaskError::InvalidArgument(
      "task queue capacity must be positive".to_string(),
    ));
  }
  Ok(())
}

#[cfg(test)]
#[path = "task_master_test.rs"]
mod task_master_test;
