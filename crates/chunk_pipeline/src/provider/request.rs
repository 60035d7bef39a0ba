//! Background requests run by the provider's task masters.

use std::sync::{Arc, Weak};

use crate::chunk::{Chunk, ChunkPos};
use crate::collaborators::ChunkStore;
use crate::task::Task;

use super::LocalChunkProvider;

/// Batch of positions handed to the "Chunk-Requests" task master.
pub enum ChunkRequest {
  /// Create or load every position; review those already in flight.
  Produce {
    positions: Vec<ChunkPos>,
    provider: Weak<LocalChunkProvider>,
  },
  /// Re-check parked chunks whose neighbours may have changed.
  Review {
    positions: Vec<ChunkPos>,
    provider: Weak<LocalChunkProvider>,
  },
  /// End of the request stream.
  Exit,
}

impl ChunkRequest {
  pub fn positions(&self) -> &[ChunkPos] {
    match self {
      Self::Produce { positions, .. } | Self::Review { positions, .. } => positions,
      Self::Exit => &[],
    }
  }
}

impl Task for ChunkRequest {
  fn name(&self) -> &str {
    match self {
      Self::Produce { .. } => "Produce chunks",
      Self::Review { .. } => "Review chunks",
      Self::Exit => "Exit",
    }
  }

  fn run(self) {
    match self {
      Self::Produce { positions, provider } => {
        let Some(provider) = provider.upgrade() else {
          return;
        };
        for pos in positions {
          provider.produce(pos);
        }
      }
      Self::Review { positions, provider } => {
        let Some(provider) = provider.upgrade() else {
          return;
        };
        let released = positions.into_iter().filter(|pos| provider.review(*pos)).count();
        tracing::trace!(released, "Reviewed parked chunks");
      }
      Self::Exit => {}
    }
  }

  fn is_terminate_signal(&self) -> bool {
    matches!(self, Self::Exit)
  }
}

/// Persists one unloaded chunk. Runs on the "Chunk-Unloader" task master.
pub struct ChunkUnloadRequest {
  target: Option<(Arc<Chunk>, Arc<dyn ChunkStore>)>,
}

impl ChunkUnloadRequest {
  pub fn new(chunk: Arc<Chunk>, store: Arc<dyn ChunkStore>) -> Self {
    Self {
      target: Some((chunk, store)),
    }
  }

  /// Terminate signal for the unloader.
  pub fn shutdown() -> Self {
    Self { target: None }
  }

  pub fn position(&self) -> Option<ChunkPos> {
    self.target.as_ref().map(|(chunk, _)| chunk.position())
  }
}

impl Task for ChunkUnloadRequest {
  fn name(&self) -> &str {
    "Unload chunk"
  }

  fn run(self) {
    if let Some((chunk, store)) = self.target {
      let data = chunk.lock();
      store.store(chunk.position(), &data);
    }
  }

  fn is_terminate_signal(&self) -> bool {
    self.target.is_none()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chunk::ChunkData;
  use crate::collaborators::MemoryChunkStore;

  #[test]
  fn test_unload_request_stores_chunk_data() {
    let store = Arc::new(MemoryChunkStore::new());
    let mut data = ChunkData::new();
    data.set_block(0, 0, 0, 3);
    let chunk = Arc::new(Chunk::with_data(ChunkPos::new(2, 0, 1), data));
    chunk.dispose();

    let request = ChunkUnloadRequest::new(chunk, store.clone());
    assert_eq!(request.position(), Some(ChunkPos::new(2, 0, 1)));
    assert!(!request.is_terminate_signal());
    request.run();

    let stored = store.load(ChunkPos::new(2, 0, 1)).expect("stored on unload");
    assert_eq!(stored.block(0, 0, 0), 3);
  }

  #[test]
  fn test_sentinels_are_terminate_signals() {
    assert!(ChunkUnloadRequest::shutdown().is_terminate_signal());
    assert!(ChunkRequest::Exit.is_terminate_signal());
    assert!(ChunkRequest::Exit.positions().is_empty());
  }

  #[test]
  fn test_requests_for_a_dropped_provider_do_nothing() {
    let request = ChunkRequest::Produce {
      positions: vec![ChunkPos::ZERO],
      provider: Weak::new(),
    };
    assert_eq!(request.name(), "Produce chunks");
    assert!(!request.is_terminate_signal());
    request.run();
  }
}
