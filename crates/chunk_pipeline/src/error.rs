//! Error types for task scheduling and chunk processing.

use thiserror::Error;

use crate::chunk::ChunkPos;

/// Boxed error returned by stage functions and collaborators.
pub type StageError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Rejections and failures reported by the worker pool and task masters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
  /// Submission attempted while the task master is shutting down.
  #[error("task master is shutting down")]
  ShuttingDown,

  /// The pending queue is at capacity.
  #[error("task queue is full")]
  QueueFull,

  /// The underlying worker pool has been shut down.
  #[error("worker pool is not running")]
  PoolUnavailable,

  /// A blocking wait was cut short (shutdown started while waiting).
  #[error("interrupted while waiting")]
  Interrupted,

  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("failed to build thread pool: {0}")]
  PoolBuild(String),
}

/// Outcome of a failed chunk processing chain.
#[derive(Debug, Error)]
pub enum PipelineError {
  /// `invoke_generator_task` called on a pipeline with no stages.
  #[error("chunk processing pipeline has no stages")]
  NoStages,

  /// The executor queue refused the next step of the chain.
  #[error("chunk task at {pos} rejected: executor queue is full or shut down")]
  Rejected { pos: ChunkPos },

  /// Processing was stopped via `stop_processing_at`, `restart` or `shutdown`.
  #[error("chunk processing at {pos} was cancelled")]
  Cancelled { pos: ChunkPos },

  /// A stage (or the generator) returned an error.
  #[error("stage [{stage}] failed at {pos}: {source}")]
  Stage {
    stage: String,
    pos: ChunkPos,
    #[source]
    source: StageError,
  },

  /// A stage (or the generator) panicked.
  #[error("stage [{stage}] panicked at {pos}: {message}")]
  Panicked {
    stage: String,
    pos: ChunkPos,
    message: String,
  },
}

impl PipelineError {
  /// True when the chain ended because someone stopped it.
  pub fn is_cancelled(&self) -> bool {
    matches!(self, PipelineError::Cancelled { .. })
  }
}

/// Extract a readable message from a `catch_unwind` payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
