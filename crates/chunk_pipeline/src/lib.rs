//! chunk_pipeline - Dependency-aware chunk processing for voxel worlds
//!
//! Chunks are produced (generated or loaded) and then pushed through an
//! ordered list of stages on a bounded worker pool. Stages that need
//! neighbouring chunks to have reached some state park the chunk until those
//! neighbours report in, then resume it exactly once.
//!
//! # Layers
//!
//! - **Worker pool** ([`worker_pool`]): named, restartable rayon pool with
//!   cancellable jobs and per-activity thread labels.
//! - **Task masters** ([`task_master`]): FIFO / priority / dynamic-priority
//!   queues that cap how many tasks run at once on a shared pool.
//! - **Pipeline** ([`pipeline`]): position-deduplicated chains of stages with
//!   completion futures and dependency reactors.
//! - **Provider** ([`provider`]): owns the loaded chunks, wires the standard
//!   stages (second pass, internal lighting, light merging) and handles
//!   requests and unloading.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use chunk_pipeline::{
//!   ChunkPos, FlatGenerator, LocalChunkProvider, MaxLightMerger, MemoryChunkStore,
//!   ProviderConfig, SunlightProcessor,
//! };
//!
//! let provider = LocalChunkProvider::new(
//!   ProviderConfig::default(),
//!   Arc::new(FlatGenerator::default()),
//!   Arc::new(SunlightProcessor),
//!   Arc::new(MaxLightMerger),
//!   Arc::new(MemoryChunkStore::new()),
//! )?;
//! provider.request_chunks(chunk_pipeline::chunk::neighborhood(ChunkPos::ZERO, 3));
//!
//! loop {
//!   for chunk in provider.update() {
//!     println!("chunk {} ready", chunk.position());
//!   }
//! }
//! ```

pub mod chunk;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod provider;
pub mod task;
pub mod task_master;
pub mod worker_pool;

// Re-export commonly used items
pub use chunk::{Chunk, ChunkData, ChunkPos, ChunkState, ChunkView, ChunkViewGuard};
pub use collaborators::{
  ChunkStore, FlatGenerator, LightMerger, LightingProcessor, MaxLightMerger, MemoryChunkStore, SunlightProcessor,
  WorldGenerator,
};
pub use config::{PipelineConfig, ProviderConfig, ReactorConfig, WorkerPoolConfig, WorldBounds};
pub use error::{PipelineError, StageError, TaskError};
pub use metrics::PipelineMetrics;
pub use monitor::{ActivityMonitor, NoopMonitor};
pub use pipeline::{ChunkFuture, ChunkProcessingPipeline, ChunkTaskProvider, DependencyReactor, Stage};
pub use provider::{ChunkProvider, LocalChunkProvider};
pub use task::{Comparator, Task};
pub use task_master::TaskMaster;
pub use worker_pool::{ThreadPriority, WorkerPool};
