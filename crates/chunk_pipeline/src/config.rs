//! Configuration for worker pools, the processing pipeline, dependency
//! reactors and the local chunk provider.

use std::time::Duration;

use crate::chunk::ChunkPos;

/// Configuration for a [`crate::worker_pool::WorkerPool`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerPoolConfig {
  /// Prefix for OS thread names (`"{prefix}-{index}"`).
  pub thread_name_prefix: String,

  /// Number of worker threads. Must be positive.
  pub num_threads: usize,
}

impl WorkerPoolConfig {
  pub fn new(thread_name_prefix: impl Into<String>, num_threads: usize) -> Self {
    Self {
      thread_name_prefix: thread_name_prefix.into(),
      num_threads,
    }
  }

  pub fn with_num_threads(mut self, num_threads: usize) -> Self {
    self.num_threads = num_threads;
    self
  }
}

impl Default for WorkerPoolConfig {
  fn default() -> Self {
    Self {
      thread_name_prefix: "worker".to_string(),
      num_threads: std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4),
    }
  }
}

/// Configuration for [`crate::pipeline::ChunkProcessingPipeline`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
  /// Worker threads dedicated to chunk processing.
  /// Deliberately small and independent of view distance.
  pub num_threads: usize,

  /// Bound of the pending stage-job queue. Roughly the number of chunks
  /// inside the largest supported view distance.
  pub queue_capacity: usize,

  /// How long `shutdown` waits for running stage jobs.
  pub shutdown_wait: Duration,
}

impl PipelineConfig {
  /// Four threads, 800 queued jobs.
  pub const DEFAULT: Self = Self {
    num_threads: 4,
    queue_capacity: 800,
    shutdown_wait: Duration::from_secs(5),
  };

  pub fn with_num_threads(mut self, num_threads: usize) -> Self {
    self.num_threads = num_threads;
    self
  }

  pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
    self.queue_capacity = queue_capacity;
    self
  }

  pub fn with_shutdown_wait(mut self, shutdown_wait: Duration) -> Self {
    self.shutdown_wait = shutdown_wait;
    self
  }
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self::DEFAULT
  }
}

/// Inclusive box of chunk positions that exist in the world.
///
/// Neighbours outside the bounds can never load, so dependency reactors
/// treat them as satisfied instead of waiting forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorldBounds {
  pub min: ChunkPos,
  pub max: ChunkPos,
}

impl WorldBounds {
  pub fn new(min: ChunkPos, max: ChunkPos) -> Self {
    Self {
      min: min.min(max),
      max: min.max(max),
    }
  }

  #[inline]
  pub fn contains(&self, pos: ChunkPos) -> bool {
    pos.cmpge(self.min).all() && pos.cmple(self.max).all()
  }
}

/// Configuration for a [`crate::pipeline::DependencyReactor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReactorConfig {
  /// Chebyshev radius of the required neighbourhood (centre excluded).
  pub radius: i32,

  /// Optional world limits; out-of-bounds neighbours count as satisfied.
  pub bounds: Option<WorldBounds>,
}

impl ReactorConfig {
  /// The 26 direct neighbours, unbounded world.
  pub const DEFAULT: Self = Self {
    radius: 1,
    bounds: None,
  };

  pub fn with_radius(mut self, radius: i32) -> Self {
    self.radius = radius;
    self
  }

  pub fn with_bounds(mut self, bounds: WorldBounds) -> Self {
    self.bounds = Some(bounds);
    self
  }
}

impl Default for ReactorConfig {
  fn default() -> Self {
    Self::DEFAULT
  }
}

/// Configuration for [`crate::provider::LocalChunkProvider`].
#[derive(Clone, Debug)]
pub struct ProviderConfig {
  pub pipeline: PipelineConfig,

  /// Neighbourhood rules shared by all gated stages.
  pub reactor: ReactorConfig,

  /// When true, internal lighting waits for neighbours to finish their
  /// second pass. Without authority only their presence is required.
  pub authority: bool,

  /// Concurrent request (produce/review) tasks.
  pub request_threads: usize,

  /// Concurrent unload tasks.
  pub unload_threads: usize,

  /// Time budget for publishing ready chunks in one `update` call.
  pub ready_budget: Duration,

  /// How long shutdown waits for request/unload tasks to drain.
  pub shutdown_wait: Duration,
}

impl Default for ProviderConfig {
  fn default() -> Self {
    Self {
      pipeline: PipelineConfig::DEFAULT,
      reactor: ReactorConfig::DEFAULT,
      authority: true,
      request_threads: 2,
      unload_threads: 4,
      ready_budget: Duration::from_millis(20),
      shutdown_wait: Duration::from_secs(5),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_world_bounds_normalizes_corners() {
    let bounds = WorldBounds::new(ChunkPos::new(2, 2, 2), ChunkPos::new(-2, 0, -2));
    assert_eq!(bounds.min, ChunkPos::new(-2, 0, -2));
    assert_eq!(bounds.max, ChunkPos::new(2, 2, 2));
    assert!(bounds.contains(ChunkPos::new(0, 1, 0)));
    assert!(bounds.contains(ChunkPos::new(2, 2, -2)));
    assert!(!bounds.contains(ChunkPos::new(0, -1, 0)));
  }

  #[test]
  fn test_pipeline_builders() {
    let config = PipelineConfig::default()
      .with_num_threads(2)
      .with_queue_capacity(16);
    assert_eq!(config.num_threads, 2);
    assert_eq!(config.queue_capacity, 16);
    assert_eq!(PipelineConfig::default(), PipelineConfig::DEFAULT);
  }
}
