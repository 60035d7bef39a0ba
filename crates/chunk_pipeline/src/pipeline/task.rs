//! Chunk tasks: what a stage asks the pipeline to do for one position.

use std::fmt;
use std::sync::Arc;

use crate::chunk::{Chunk, ChunkPos};
use crate::error::StageError;

/// Stage function: takes the chunk, returns the chunk for the next stage.
pub type StageFn = dyn Fn(Arc<Chunk>) -> Result<Arc<Chunk>, StageError> + Send + Sync;

/// Called by a provider when a deferred position can run again.
pub type ResumeFn = Arc<dyn Fn(ChunkPos) + Send + Sync>;

/// Operation carried by a [`ChunkTask`].
#[derive(Clone)]
pub enum ChunkTaskOp {
  /// Run the stage function.
  Process(Arc<StageFn>),
  /// Requirements not met; park the chain until the provider resumes it.
  Interrupt,
  /// Terminate sentinel; never enacted on a chunk.
  Shutdown,
}

/// A stage invocation for one position.
#[derive(Clone)]
pub struct ChunkTask {
  name: String,
  pos: ChunkPos,
  op: ChunkTaskOp,
}

impl ChunkTask {
  pub fn process(name: impl Into<String>, pos: ChunkPos, work: Arc<StageFn>) -> Self {
    Self {
      name: name.into(),
      pos,
      op: ChunkTaskOp::Process(work),
    }
  }

  pub fn interrupt(name: impl Into<String>, pos: ChunkPos) -> Self {
    Self {
      name: name.into(),
      pos,
      op: ChunkTaskOp::Interrupt,
    }
  }

  pub fn shutdown(pos: ChunkPos) -> Self {
    Self {
      name: "Shutdown".to_string(),
      pos,
      op: ChunkTaskOp::Shutdown,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn position(&self) -> ChunkPos {
    self.pos
  }

  pub fn op(&self) -> &ChunkTaskOp {
    &self.op
  }

  pub fn is_interrupt(&self) -> bool {
    matches!(self.op, ChunkTaskOp::Interrupt)
  }

  pub fn is_terminate_signal(&self) -> bool {
    matches!(self.op, ChunkTaskOp::Shutdown)
  }
}

impl fmt::Debug for ChunkTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let op = match self.op {
      ChunkTaskOp::Process(_) => "process",
      ChunkTaskOp::Interrupt => "interrupt",
      ChunkTaskOp::Shutdown => "shutdown",
    };
    write!(f, "ChunkTask({} @ {}, {op})", self.name, self.pos)
  }
}

/// A stage whose work depends on more than the chunk itself.
///
/// `apply` decides per invocation whether the real task runs now or the
/// chain is parked ([`ChunkTaskOp::Interrupt`]). A provider that parks a
/// chain must later call the bound [`ResumeFn`] for that position exactly
/// once, and its next `apply` must return the real task.
pub trait ChunkTaskProvider: Send + Sync {
  /// Stage name, used in logs and listener notifications.
  fn name(&self) -> &str;

  fn apply(&self, chunk: &Arc<Chunk>) -> ChunkTask;

  /// Receive the pipeline's resume hook. Called once when the stage is added.
  fn bind(&self, _resume: ResumeFn) {}

  /// Drop all state held for `pos` (processing stopped).
  fn forget(&self, _pos: ChunkPos) {}

  /// Drop all state (pipeline restart).
  fn clear(&self) {}
}
