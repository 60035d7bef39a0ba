//! Chunk Processing Pipeline
//!
//! Runs every chunk through an ordered list of stages on a dedicated worker
//! pool. Each stage invocation is its own job, so a chain never blocks a
//! thread while it waits for neighbours.
//!
//! ```text
//! invoke_generator_task(pos) ──► registry[pos] = Entry ──► [generation job]
//!                                                               │
//!       ┌───────────────────────────────────────────────────────┘
//!       ▼
//!  [stage 0 job] ──► [stage 1 job] ──► ... ──► [stage N-1 job] ──► future Ok
//!       │                  │
//!       │ Interrupt        └── error / panic ──► future Err, entry removed
//!       ▼
//!   parked in entry ◄── resume(pos) from the stage's provider
//! ```
//!
//! Per position, stages run strictly in order and at most one chain exists.
//! Across positions, order is only constrained by gated stages and by the
//! optional priority function.
//!
//! # Usage
//!
//! ```ignore
//! let pipeline = ChunkProcessingPipeline::new(PipelineConfig::DEFAULT)?
//!   .with_stage(Stage::consumer("Terrain", |data| fill_terrain(data)))
//!   .with_stage(Stage::gated(lighting_reactor));
//!
//! let future = pipeline.invoke_generator_task(pos, |pos| Ok(Arc::new(Chunk::new(pos))));
//! let chunk = future.wait()?;
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::chunk::{Chunk, ChunkPos};
use crate::config::{PipelineConfig, WorkerPoolConfig};
use crate::error::{panic_message, PipelineError, StageError, TaskError};
use crate::metrics::PipelineMetrics;
use crate::monitor::ActivityMonitor;
use crate::task::{Comparator, Task};
use crate::task_master::TaskMaster;
use crate::worker_pool::WorkerPool;

use super::future::ChunkFuture;
use super::stage::Stage;
use super::task::ChunkTaskOp;

/// Name of the generation step, as seen by listeners and metrics.
pub const GENERATION_STAGE: &str = "Chunk generation";

const EXECUTOR_NAME: &str = "Chunk-Processing";

/// Ordering key for queued jobs. Lower runs first.
pub type PriorityFn = dyn Fn(ChunkPos) -> i64 + Send + Sync;

/// Called after every completed stage with the stage name and the chunk.
pub type StageListener = dyn Fn(&str, &Arc<Chunk>) + Send + Sync;

type Supplier = Box<dyn FnOnce(ChunkPos) -> Result<Arc<Chunk>, StageError> + Send>;

// =============================================================================
// Registry
// =============================================================================

struct Entry {
  id: u64,
  future: ChunkFuture,
  chunk: Option<Arc<Chunk>>,
  /// Stage index waiting for its provider to resume it.
  parked: Option<usize>,
  /// Resume arrived before the job recorded `parked`.
  wake_pending: bool,
}

#[derive(Default)]
struct Registry {
  entries: HashMap<ChunkPos, Entry>,
  next_id: u64,
}

// =============================================================================
// Jobs
// =============================================================================

enum Step {
  Generate(Supplier),
  Stage { index: usize, chunk: Arc<Chunk> },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Admission {
  /// First job of a chain; subject to the queue bound.
  New,
  /// Next or resumed stage of a chain already registered.
  Continuation,
}

struct StageJob {
  name: String,
  pos: ChunkPos,
  entry_id: u64,
  step: Step,
  pipeline: Weak<PipelineInner>,
}

impl Task for StageJob {
  fn name(&self) -> &str {
    &self.name
  }

  fn run(self) {
    if let Some(inner) = self.pipeline.upgrade() {
      inner.run_job(self.pos, self.entry_id, self.step);
    }
  }
}

// =============================================================================
// Pipeline internals
// =============================================================================

struct PipelineInner {
  config: PipelineConfig,
  stages: RwLock<Vec<Arc<Stage>>>,
  listeners: RwLock<Vec<Arc<StageListener>>>,
  registry: Mutex<Registry>,
  priority: Arc<RwLock<Arc<PriorityFn>>>,
  executor: TaskMaster<StageJob>,
  pool: Arc<WorkerPool>,
  metrics: Arc<PipelineMetrics>,
}

impl PipelineInner {
  fn is_current(&self, pos: ChunkPos, id: u64) -> bool {
    self
      .registry
      .lock()
      .entries
      .get(&pos)
      .is_some_and(|entry| entry.id == id)
  }

  /// Insert a new entry, or hand back the future already registered.
  fn register(&self, pos: ChunkPos, chunk: Option<Arc<Chunk>>) -> Result<(ChunkFuture, u64), ChunkFuture> {
    let mut registry = self.registry.lock();
    if let Some(existing) = registry.entries.get(&pos) {
      return Err(existing.future.clone());
    }
    let id = registry.next_id;
    registry.next_id += 1;
    let future = ChunkFuture::new(pos);
    registry.entries.insert(
      pos,
      Entry {
        id,
        future: future.clone(),
        chunk,
        parked: None,
        wake_pending: false,
      },
    );
    Ok((future, id))
  }

  fn job(self: &Arc<Self>, name: String, pos: ChunkPos, id: u64, step: Step) -> StageJob {
    StageJob {
      name,
      pos,
      entry_id: id,
      step,
      pipeline: Arc::downgrade(self),
    }
  }

  /// Queue a job. New chains are bounded by the queue capacity; later
  /// steps of an admitted chain are not.
  fn submit(&self, job: StageJob, admission: Admission) {
    let (pos, id) = (job.pos, job.entry_id);
    let accepted = match admission {
      Admission::New => self.executor.offer(job),
      Admission::Continuation => self.executor.requeue(job),
    };
    if !accepted {
      tracing::error!(%pos, "Chunk processing queue rejected a task (full or shut down)");
      self.metrics.record_rejected();
      self.fail(pos, id, PipelineError::Rejected { pos });
    }
  }

  fn submit_stage(self: &Arc<Self>, pos: ChunkPos, id: u64, index: usize, chunk: Arc<Chunk>, admission: Admission) {
    let name = match self.stages.read().get(index) {
      Some(stage) => stage.name().to_string(),
      None => return,
    };
    self.submit(self.job(name, pos, id, Step::Stage { index, chunk }), admission);
  }

  /// Continue with stage `next`, or finish the chain.
  fn advance(self: &Arc<Self>, pos: ChunkPos, id: u64, next: usize, chunk: Arc<Chunk>) {
    if next >= self.stages.read().len() {
      self.finish(pos, id, chunk);
    } else {
      self.submit_stage(pos, id, next, chunk, Admission::Continuation);
    }
  }

  fn run_job(self: &Arc<Self>, pos: ChunkPos, id: u64, step: Step) {
    match step {
      Step::Generate(supplier) => self.run_generation(pos, id, supplier),
      Step::Stage { index, chunk } => self.run_stage(pos, id, index, chunk),
    }
  }

  fn run_generation(self: &Arc<Self>, pos: ChunkPos, id: u64, supplier: Supplier) {
    if !self.is_current(pos, id) {
      return;
    }

    let chunk = match catch_unwind(AssertUnwindSafe(|| supplier(pos))) {
      Ok(Ok(chunk)) => chunk,
      Ok(Err(source)) => {
        let stage = GENERATION_STAGE.to_string();
        return self.fail(pos, id, PipelineError::Stage { stage, pos, source });
      }
      Err(payload) => {
        let stage = GENERATION_STAGE.to_string();
        let message = panic_message(payload.as_ref());
        return self.fail(pos, id, PipelineError::Panicked { stage, pos, message });
      }
    };

    {
      let mut registry = self.registry.lock();
      match registry.entries.get_mut(&pos) {
        Some(entry) if entry.id == id => entry.chunk = Some(Arc::clone(&chunk)),
        _ => return,
      }
    }

    self.notify(GENERATION_STAGE, &chunk);
    self.advance(pos, id, 0, chunk);
  }

  fn run_stage(self: &Arc<Self>, pos: ChunkPos, id: u64, index: usize, chunk: Arc<Chunk>) {
    if !self.is_current(pos, id) {
      return;
    }
    if chunk.is_disposed() {
      return self.fail(pos, id, PipelineError::Cancelled { pos });
    }
    let Some(stage) = self.stages.read().get(index).cloned() else {
      return;
    };

    let task = stage.task_for(&chunk);
    match task.op() {
      ChunkTaskOp::Interrupt => {
        tracing::trace!(stage = %stage.name(), %pos, "Stage deferred");
        self.metrics.record_deferral();
        self.park(pos, id, index);
      }
      ChunkTaskOp::Shutdown => self.fail(pos, id, PipelineError::Cancelled { pos }),
      ChunkTaskOp::Process(work) => match catch_unwind(AssertUnwindSafe(|| work(Arc::clone(&chunk)))) {
        Ok(Ok(next)) => {
          if !self.is_current(pos, id) {
            return;
          }
          if next.is_disposed() {
            return self.fail(pos, id, PipelineError::Cancelled { pos });
          }
          self.notify(stage.name(), &next);
          self.advance(pos, id, index + 1, next);
        }
        Ok(Err(source)) => {
          let stage = stage.name().to_string();
          self.fail(pos, id, PipelineError::Stage { stage, pos, source });
        }
        Err(payload) => {
          let stage = stage.name().to_string();
          let message = panic_message(payload.as_ref());
          self.fail(pos, id, PipelineError::Panicked { stage, pos, message });
        }
      },
    }
  }

  fn park(self: &Arc<Self>, pos: ChunkPos, id: u64, index: usize) {
    let wake_now = {
      let mut registry = self.registry.lock();
      let Some(entry) = registry.entries.get_mut(&pos).filter(|e| e.id == id) else {
        return;
      };
      if entry.wake_pending {
        entry.wake_pending = false;
        entry.chunk.clone()
      } else {
        entry.parked = Some(index);
        None
      }
    };
    if let Some(chunk) = wake_now {
      self.metrics.record_resume();
      self.submit_stage(pos, id, index, chunk, Admission::Continuation);
    }
  }

  fn resume(self: &Arc<Self>, pos: ChunkPos) -> bool {
    let (id, index, chunk) = {
      let mut registry = self.registry.lock();
      let Some(entry) = registry.entries.get_mut(&pos) else {
        return false;
      };
      match (entry.parked, entry.chunk.clone()) {
        (Some(index), Some(chunk)) => {
          entry.parked = None;
          (entry.id, index, chunk)
        }
        _ => {
          entry.wake_pending = true;
          return false;
        }
      }
    };
    tracing::trace!(%pos, stage = index, "Resuming parked chunk");
    self.metrics.record_resume();
    self.submit_stage(pos, id, index, chunk, Admission::Continuation);
    true
  }

  fn notify(&self, stage: &str, chunk: &Arc<Chunk>) {
    let listeners = self.listeners.read().clone();
    for listener in listeners {
      if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(stage, chunk))) {
        tracing::error!(
          %stage,
          pos = %chunk.position(),
          "Stage listener panicked: {}",
          panic_message(payload.as_ref())
        );
      }
    }
  }

  fn take_entry(&self, pos: ChunkPos, id: u64) -> Option<Entry> {
    let mut registry = self.registry.lock();
    match registry.entries.get(&pos) {
      Some(entry) if entry.id == id => registry.entries.remove(&pos),
      _ => None,
    }
  }

  fn finish(&self, pos: ChunkPos, id: u64, chunk: Arc<Chunk>) {
    if let Some(entry) = self.take_entry(pos, id) {
      self.metrics.record_completed();
      entry.future.complete(Ok(chunk));
    }
  }

  fn fail(&self, pos: ChunkPos, id: u64, error: PipelineError) {
    let Some(entry) = self.take_entry(pos, id) else {
      return;
    };
    self.forget_in_providers(pos);
    match &error {
      PipelineError::Cancelled { .. } => {
        tracing::debug!(%pos, "Chunk processing cancelled");
        self.metrics.record_cancelled();
      }
      _ => {
        tracing::error!(%pos, "Chunk processing failed: {error}");
        self.metrics.record_failed();
      }
    }
    entry.future.complete(Err(Arc::new(error)));
  }

  fn forget_in_providers(&self, pos: ChunkPos) {
    for stage in self.stages.read().iter() {
      if let Some(provider) = stage.provider() {
        provider.forget(pos);
      }
    }
  }

  /// Cancel every chain and reset provider state.
  fn cancel_all(&self) -> usize {
    let entries: Vec<Entry> = {
      let mut registry = self.registry.lock();
      registry.entries.drain().map(|(_, entry)| entry).collect()
    };
    for stage in self.stages.read().iter() {
      if let Some(provider) = stage.provider() {
        provider.clear();
      }
    }
    for entry in &entries {
      if entry.future.cancel() {
        self.metrics.record_cancelled();
      }
    }
    entries.len()
  }
}

// =============================================================================
// Public API
// =============================================================================

/// Position-deduplicated, multi-stage chunk processor.
pub struct ChunkProcessingPipeline {
  inner: Arc<PipelineInner>,
}

impl ChunkProcessingPipeline {
  /// Create a pipeline with its own worker pool. Stages are added afterwards.
  pub fn new(config: PipelineConfig) -> Result<Self, TaskError> {
    let metrics = Arc::new(PipelineMetrics::new());
    let monitor: Arc<dyn ActivityMonitor> = metrics.clone();
    let pool = Arc::new(WorkerPool::with_monitor(
      WorkerPoolConfig::new(EXECUTOR_NAME, config.num_threads),
      monitor,
    )?);

    let default_priority: Arc<PriorityFn> = Arc::new(|_: ChunkPos| 0);
    let priority = Arc::new(RwLock::new(default_priority));
    let key = Arc::clone(&priority);
    let comparator: Comparator<StageJob> = Arc::new(move |a: &StageJob, b: &StageJob| {
      let key = key.read();
      key(a.pos).cmp(&key(b.pos))
    });

    let executor = TaskMaster::dynamic_priority(
      EXECUTOR_NAME,
      config.num_threads,
      config.queue_capacity,
      comparator,
      Arc::clone(&pool),
    )?;

    Ok(Self {
      inner: Arc::new(PipelineInner {
        config,
        stages: RwLock::new(Vec::new()),
        listeners: RwLock::new(Vec::new()),
        registry: Mutex::new(Registry::default()),
        priority,
        executor,
        pool,
        metrics,
      }),
    })
  }

  /// Append a stage. Gated stages get bound to this pipeline's resume hook.
  pub fn add_stage(&self, stage: Stage) {
    if let Some(provider) = stage.provider() {
      let pipeline = Arc::downgrade(&self.inner);
      provider.bind(Arc::new(move |pos: ChunkPos| {
        if let Some(inner) = pipeline.upgrade() {
          inner.resume(pos);
        }
      }));
    }
    self.inner.stages.write().push(Arc::new(stage));
  }

  pub fn with_stage(self, stage: Stage) -> Self {
    self.add_stage(stage);
    self
  }

  pub fn stage_names(&self) -> Vec<String> {
    self
      .inner
      .stages
      .read()
      .iter()
      .map(|stage| stage.name().to_string())
      .collect()
  }

  /// Observe completed stages (generation included, as [`GENERATION_STAGE`]).
  pub fn add_listener(&self, listener: impl Fn(&str, &Arc<Chunk>) + Send + Sync + 'static) {
    self.inner.listeners.write().push(Arc::new(listener));
  }

  /// Order queued jobs by `priority(pos)`, lowest first.
  pub fn set_priority(&self, priority: impl Fn(ChunkPos) -> i64 + Send + Sync + 'static) {
    *self.inner.priority.write() = Arc::new(priority);
    self.inner.executor.reprioritize();
  }

  /// Re-rank queued jobs after the priority function's inputs changed.
  pub fn reprioritize(&self) {
    self.inner.executor.reprioritize();
  }

  /// Produce a chunk with `supplier` on the executor, then run every stage.
  ///
  /// If `pos` is already in flight the existing future is returned and
  /// `supplier` is dropped unused.
  #[tracing::instrument(level = "trace", skip_all, fields(pos = %pos))]
  pub fn invoke_generator_task<F>(&self, pos: ChunkPos, supplier: F) -> ChunkFuture
  where
    F: FnOnce(ChunkPos) -> Result<Arc<Chunk>, StageError> + Send + 'static,
  {
    if self.inner.stages.read().is_empty() {
      return ChunkFuture::failed(pos, PipelineError::NoStages);
    }
    let (future, id) = match self.inner.register(pos, None) {
      Ok(registered) => registered,
      Err(existing) => return existing,
    };
    let job = self.inner.job(GENERATION_STAGE.to_string(), pos, id, Step::Generate(Box::new(supplier)));
    self.inner.submit(job, Admission::New);
    future
  }

  /// Run every stage on an existing chunk. Deduplicated like
  /// [`Self::invoke_generator_task`].
  #[tracing::instrument(level = "trace", skip_all, fields(pos = %chunk.position()))]
  pub fn invoke_pipeline(&self, chunk: Arc<Chunk>) -> ChunkFuture {
    let pos = chunk.position();
    if self.inner.stages.read().is_empty() {
      return ChunkFuture::failed(pos, PipelineError::NoStages);
    }
    match self.inner.register(pos, Some(Arc::clone(&chunk))) {
      Ok((future, id)) => {
        self.inner.submit_stage(pos, id, 0, chunk, Admission::New);
        future
      }
      Err(existing) => existing,
    }
  }

  /// Cancel the chain at `pos` and dispose its chunk.
  /// Returns false if nothing was in flight there.
  pub fn stop_processing_at(&self, pos: ChunkPos) -> bool {
    let Some(entry) = self.inner.registry.lock().entries.remove(&pos) else {
      return false;
    };
    self.inner.forget_in_providers(pos);
    if let Some(chunk) = &entry.chunk {
      chunk.dispose();
    }
    if entry.future.cancel() {
      self.inner.metrics.record_cancelled();
    }
    true
  }

  /// Re-submit the parked stage at `pos`. Returns false if the chain is not
  /// parked (a resume racing the park is remembered and applied then).
  pub fn resume(&self, pos: ChunkPos) -> bool {
    self.inner.resume(pos)
  }

  pub fn is_position_processing(&self, pos: ChunkPos) -> bool {
    self.inner.registry.lock().entries.contains_key(&pos)
  }

  pub fn processing_positions(&self) -> Vec<ChunkPos> {
    self.inner.registry.lock().entries.keys().copied().collect()
  }

  pub fn processing_count(&self) -> usize {
    self.inner.registry.lock().entries.len()
  }

  /// Stage jobs waiting for a worker.
  pub fn queued_len(&self) -> usize {
    self.inner.executor.queued_len()
  }

  pub fn metrics(&self) -> &Arc<PipelineMetrics> {
    &self.inner.metrics
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.inner.config
  }

  /// Cancel everything and stop the worker pool. Bounded by
  /// `PipelineConfig::shutdown_wait`.
  pub fn shutdown(&self) {
    let cancelled = self.inner.cancel_all();
    let wait = self.inner.config.shutdown_wait;
    self.inner.executor.shutdown(wait, true);
    self.inner.pool.shutdown(wait, wait);
    tracing::info!(cancelled, "Chunk processing pipeline shut down");
  }

  /// Cancel everything and start over with an empty registry and queue.
  /// Also revives a pipeline that was shut down.
  pub fn restart(&self) -> Result<(), TaskError> {
    let cancelled = self.inner.cancel_all();
    let dropped = self.inner.executor.clear();
    self.inner.pool.restart()?;
    self.inner.executor.restart();
    tracing::info!(cancelled, dropped, "Chunk processing pipeline restarted");
    Ok(())
  }
}

#[cfg(test)]
#[path = "processing_test.rs"]
mod processing_test;
