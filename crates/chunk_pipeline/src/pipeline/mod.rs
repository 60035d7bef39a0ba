//! Chunk Processing Pipeline
//!
//! Position-keyed, deduplicated processing of chunks through ordered stages,
//! with stages that can wait on neighbouring chunks.
//!
//! ```text
//! ┌────────────┐     ┌─────────────┐     ┌───────────────────┐     ┌───────────────┐     ┌─────────────┐
//! │ Generation ├────►│ Second pass ├────►│ Internal lighting ├────►│ Light merging ├────►│ Chunk ready │
//! └────────────┘     └─────────────┘     └───────────────────┘     └───────────────┘     └─────────────┘
//!       │                   │                      │                        │
//!   supplier        neighbours exist      neighbours past 2nd pass   neighbours lit
//!                   (DependencyReactor)   (DependencyReactor)        (DependencyReactor)
//! ```
//!
//! # Pieces
//!
//! - [`ChunkProcessingPipeline`]: registry of in-flight chains and the
//!   dedicated executor.
//! - [`Stage`]: a named step; plain function, data consumer, or gated on a
//!   [`ChunkTaskProvider`].
//! - [`DependencyReactor`]: the provider that defers a stage until neighbours
//!   are available and resumes it exactly once.
//! - [`ChunkFuture`]: shared completion handle per chain.

pub mod future;
pub mod processing;
pub mod reactor;
pub mod stage;
pub mod task;

pub use future::{ChunkFuture, ChunkResult};
pub use processing::{ChunkProcessingPipeline, PriorityFn, StageListener, GENERATION_STAGE};
pub use reactor::{AvailabilityFn, DependencyReactor};
pub use stage::Stage;
pub use task::{ChunkTask, ChunkTaskOp, ChunkTaskProvider, ResumeFn, StageFn};
