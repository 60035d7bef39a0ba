//! Pipeline stages.

use std::fmt;
use std::sync::Arc;

use crate::chunk::{Chunk, ChunkData};
use crate::error::StageError;

use super::task::{ChunkTask, ChunkTaskProvider, StageFn};

enum StageKind {
  Direct(Arc<StageFn>),
  Gated(Arc<dyn ChunkTaskProvider>),
}

/// One named step of a chunk processing chain.
pub struct Stage {
  name: String,
  kind: StageKind,
}

impl Stage {
  /// Stage from a function over the chunk.
  pub fn new<F>(name: impl Into<String>, work: F) -> Self
  where
    F: Fn(Arc<Chunk>) -> Result<Arc<Chunk>, StageError> + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      kind: StageKind::Direct(Arc::new(work)),
    }
  }

  /// Stage that mutates the chunk data under its lock.
  /// Skipped if the chunk was disposed.
  pub fn consumer<F>(name: impl Into<String>, work: F) -> Self
  where
    F: Fn(&mut ChunkData) + Send + Sync + 'static,
  {
    Self::new(name, move |chunk: Arc<Chunk>| {
      {
        let mut data = chunk.lock();
        if !chunk.is_disposed() {
          work(&mut data);
        }
      }
      Ok(chunk)
    })
  }

  /// Stage whose task is decided per chunk by `provider`.
  pub fn gated(provider: Arc<dyn ChunkTaskProvider>) -> Self {
    Self {
      name: provider.name().to_string(),
      kind: StageKind::Gated(provider),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub(crate) fn provider(&self) -> Option<&Arc<dyn ChunkTaskProvider>> {
    match &self.kind {
      StageKind::Gated(provider) => Some(provider),
      StageKind::Direct(_) => None,
    }
  }

  /// The task to run for `chunk` right now.
  pub(crate) fn task_for(&self, chunk: &Arc<Chunk>) -> ChunkTask {
    match &self.kind {
      StageKind::Direct(work) => ChunkTask::process(&self.name, chunk.position(), Arc::clone(work)),
      StageKind::Gated(provider) => provider.apply(chunk),
    }
  }
}

impl fmt::Debug for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let kind = match self.kind {
      StageKind::Direct(_) => "direct",
      StageKind::Gated(_) => "gated",
    };
    f.debug_struct("Stage")
      .field("name", &self.name)
      .field("kind", &kind)
      .finish()
  }
}
