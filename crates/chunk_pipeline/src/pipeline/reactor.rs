//! Dependency reactor: defers a stage until neighbouring chunks are ready.
//!
//! ```text
//!   apply(chunk) ──► all neighbours available? ──yes──► real task
//!                          │ no
//!                          ▼
//!            pending[pos] = (chunk, missing)  ──► Interrupt (chain parked)
//!
//!   on_done(n) ──► remove n from every missing set
//!                  empty set ──► released + resume(pos) ──► apply ──► real task
//! ```
//!
//! `apply`, `on_done` and `review` share one lock over the requirement map,
//! so a neighbour finishing between "check" and "record" is never lost: the
//! predicate sees its new state or `on_done` sees the recorded entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chunk::{neighborhood, Chunk, ChunkPos};
use crate::config::ReactorConfig;
use crate::error::StageError;

use super::task::{ChunkTask, ChunkTaskProvider, ResumeFn, StageFn};

/// Availability predicate: true when a neighbour satisfies the requirement.
pub type AvailabilityFn = Arc<dyn Fn(ChunkPos) -> bool + Send + Sync>;

#[derive(Default)]
struct ReactorState {
  pending: HashMap<ChunkPos, (Arc<Chunk>, HashSet<ChunkPos>)>,
  released: HashSet<ChunkPos>,
}

/// [`ChunkTaskProvider`] gating a stage on neighbour availability.
pub struct DependencyReactor {
  name: String,
  config: ReactorConfig,
  is_available: AvailabilityFn,
  work: Arc<StageFn>,
  resume: Mutex<Option<ResumeFn>>,
  state: Mutex<ReactorState>,
}

impl DependencyReactor {
  pub fn new<F>(name: impl Into<String>, config: ReactorConfig, is_available: AvailabilityFn, work: F) -> Self
  where
    F: Fn(Arc<Chunk>) -> Result<Arc<Chunk>, StageError> + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      config,
      is_available,
      work: Arc::new(work),
      resume: Mutex::new(None),
      state: Mutex::new(ReactorState::default()),
    }
  }

  pub fn config(&self) -> &ReactorConfig {
    &self.config
  }

  /// Neighbours of `pos` the stage waits on. Out-of-world positions never
  /// load and are skipped.
  fn required(&self, pos: ChunkPos) -> impl Iterator<Item = ChunkPos> + '_ {
    neighborhood(pos, self.config.radius)
      .filter(move |n| self.config.bounds.map_or(true, |bounds| bounds.contains(*n)))
  }

  fn missing(&self, pos: ChunkPos) -> HashSet<ChunkPos> {
    self.required(pos).filter(|n| !(self.is_available)(*n)).collect()
  }

  fn real_task(&self, pos: ChunkPos) -> ChunkTask {
    ChunkTask::process(&self.name, pos, Arc::clone(&self.work))
  }

  /// A neighbour reached the required state. Releases every pending chunk
  /// for which `pos` was the last outstanding requirement.
  pub fn on_done(&self, pos: ChunkPos) {
    let released = {
      let mut state = self.state.lock();
      let mut released = Vec::new();
      state.pending.retain(|center, (_, missing)| {
        missing.remove(&pos);
        if missing.is_empty() {
          released.push(*center);
          false
        } else {
          true
        }
      });
      state.released.extend(released.iter().copied());
      released
    };
    self.release(released);
  }

  /// Re-check a pending chunk against the predicate. Returns true if this
  /// released it.
  pub fn review(&self, pos: ChunkPos) -> bool {
    let released = {
      let mut state = self.state.lock();
      let Some((_, missing)) = state.pending.get_mut(&pos) else {
        return false;
      };
      let is_available = &self.is_available;
      missing.retain(|n| !is_available(*n));
      if !missing.is_empty() {
        return false;
      }
      state.pending.remove(&pos);
      state.released.insert(pos);
      vec![pos]
    };
    self.release(released);
    true
  }

  fn release(&self, released: Vec<ChunkPos>) {
    if released.is_empty() {
      return;
    }
    let resume = self.resume.lock().clone();
    for pos in released {
      tracing::debug!(stage = %self.name, %pos, "Requirements met, resuming");
      match &resume {
        Some(resume) => resume(pos),
        None => tracing::warn!(stage = %self.name, %pos, "Released chunk but no pipeline is bound"),
      }
    }
  }

  /// Positions waiting on neighbours.
  pub fn pending_len(&self) -> usize {
    self.state.lock().pending.len()
  }

  pub fn is_pending(&self, pos: ChunkPos) -> bool {
    self.state.lock().pending.contains_key(&pos)
  }

  /// Outstanding neighbours of a pending position.
  pub fn missing_for(&self, pos: ChunkPos) -> Option<HashSet<ChunkPos>> {
    self.state.lock().pending.get(&pos).map(|(_, missing)| missing.clone())
  }
}

impl ChunkTaskProvider for DependencyReactor {
  fn name(&self) -> &str {
    &self.name
  }

  fn apply(&self, chunk: &Arc<Chunk>) -> ChunkTask {
    let pos = chunk.position();
    let mut state = self.state.lock();
    if state.released.remove(&pos) {
      return self.real_task(pos);
    }

    let missing = self.missing(pos);
    if missing.is_empty() {
      return self.real_task(pos);
    }

    tracing::trace!(stage = %self.name, %pos, missing = missing.len(), "Deferring");
    state.pending.insert(pos, (Arc::clone(chunk), missing));
    ChunkTask::interrupt(&self.name, pos)
  }

  fn bind(&self, resume: ResumeFn) {
    *self.resume.lock() = Some(resume);
  }

  fn forget(&self, pos: ChunkPos) {
    let mut state = self.state.lock();
    state.pending.remove(&pos);
    state.released.remove(&pos);
  }

  fn clear(&self) {
    let mut state = self.state.lock();
    state.pending.clear();
    state.released.clear();
  }
}

#[cfg(test)]
#[path = "reactor_test.rs"]
mod reactor_test;
