//! Local chunk provider: owns the loaded chunks and drives them through the
//! processing pipeline.
//!
//! ```text
//!   request_chunks ──► [Chunk-Requests] ──► create_or_load_chunk
//!                                                 │
//!        ┌────────────────────────────────────────┘
//!        ▼
//!   ChunkProcessingPipeline
//!     generation ─► second pass ─► internal lighting ─► light merging ─► chunk ready
//!       (store or     (reactor)        (reactor)           (reactor)        │
//!        generator)                                                         ▼
//!                                                            ready channel ─► update()
//!
//!   unload / check_for_unload ──► dispose ──► [Chunk-Unloader] ──► ChunkStore
//! ```
//!
//! Every chunk produced by the pipeline is kept in the chunk map, whatever
//! its state, so neighbours can see it. A chunk becomes visible through
//! [`LocalChunkProvider::get_chunk`] only after [`LocalChunkProvider::update`]
//! has published it.
//!
//! # Usage
//!
//! ```ignore
//! let provider = LocalChunkProvider::new(
//!   ProviderConfig::default(),
//!   Arc::new(FlatGenerator::default()),
//!   Arc::new(SunlightProcessor),
//!   Arc::new(MaxLightMerger),
//!   Arc::new(MemoryChunkStore::new()),
//! )?;
//! provider.request_chunks(neighborhood(player_chunk, 4));
//!
//! // Once per frame:
//! for chunk in provider.update() {
//!   upload_mesh(&chunk);
//! }
//! provider.check_for_unload(|pos| chebyshev_distance(pos, player_chunk) <= 6);
//! ```

pub mod request;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use web_time::Instant;

use crate::chunk::{distance_squared, neighborhood, Chunk, ChunkData, ChunkPos, ChunkState, ChunkView};
use crate::collaborators::{ChunkStore, LightMerger, LightingProcessor, WorldGenerator};
use crate::config::{ProviderConfig, WorkerPoolConfig};
use crate::error::{StageError, TaskError};
use crate::metrics::PipelineMetrics;
use crate::pipeline::{AvailabilityFn, ChunkFuture, ChunkProcessingPipeline, DependencyReactor, Stage, GENERATION_STAGE};
use crate::task_master::TaskMaster;
use crate::worker_pool::WorkerPool;

pub use request::{ChunkRequest, ChunkUnloadRequest};

pub const SECOND_PASS_STAGE: &str = "Second pass";
pub const INTERNAL_LIGHTING_STAGE: &str = "Internal lighting";
pub const LIGHT_MERGING_STAGE: &str = "Light merging";
pub const READY_STAGE: &str = "Chunk ready";

/// Most chunks `check_for_unload` touches per call.
pub const UNLOAD_PER_UPDATE: usize = 64;

const TASKS_POOL_NAME: &str = "Chunk-Tasks";
const REQUESTS_NAME: &str = "Chunk-Requests";
const UNLOADER_NAME: &str = "Chunk-Unloader";

type ChunkMap = Arc<RwLock<HashMap<ChunkPos, Arc<Chunk>>>>;

// =============================================================================
// ChunkProvider
// =============================================================================

/// What the processing stages need from whoever owns the chunks.
pub trait ChunkProvider: Send + Sync {
  /// The chunk at `pos` in any state, if it has been produced.
  fn chunk_for_processing(&self, pos: ChunkPos) -> Option<Arc<Chunk>>;

  /// Start producing `pos`. Returns `None` if a ready chunk is already
  /// loaded there; a chain already in flight returns its future.
  fn create_or_load_chunk(&self, pos: ChunkPos) -> Option<ChunkFuture>;

  /// `pos` and whichever neighbours within `radius` are loaded.
  fn view_around(&self, pos: ChunkPos, radius: i32) -> Option<ChunkView>;

  /// Hand a fully processed chunk over for publishing.
  fn on_chunk_is_ready(&self, chunk: Arc<Chunk>);
}

// =============================================================================
// LocalChunkProvider
// =============================================================================

pub struct LocalChunkProvider {
  config: ProviderConfig,
  generator: Arc<dyn WorldGenerator>,
  store: Arc<dyn ChunkStore>,
  chunks: ChunkMap,
  published: RwLock<HashSet<ChunkPos>>,
  viewer: Arc<RwLock<ChunkPos>>,
  pipeline: ChunkProcessingPipeline,
  reactors: [Arc<DependencyReactor>; 3],
  ready_tx: Sender<Arc<Chunk>>,
  ready_rx: Receiver<Arc<Chunk>>,
  tasks_pool: Arc<WorkerPool>,
  requests: TaskMaster<ChunkRequest>,
  unloader: TaskMaster<ChunkUnloadRequest>,
}

impl LocalChunkProvider {
  pub fn new(
    config: ProviderConfig,
    generator: Arc<dyn WorldGenerator>,
    lighting: Arc<dyn LightingProcessor>,
    merger: Arc<dyn LightMerger>,
    store: Arc<dyn ChunkStore>,
  ) -> Result<Arc<Self>, TaskError> {
    let pipeline = ChunkProcessingPipeline::new(config.pipeline.clone())?;
    let tasks_pool = Arc::new(WorkerPool::new(WorkerPoolConfig::new(
      TASKS_POOL_NAME,
      config.request_threads + config.unload_threads,
    ))?);
    let requests = TaskMaster::fifo(REQUESTS_NAME, config.request_threads, Arc::clone(&tasks_pool))?;
    let unloader = TaskMaster::fifo(UNLOADER_NAME, config.unload_threads, Arc::clone(&tasks_pool))?;

    let chunks: ChunkMap = Arc::new(RwLock::new(HashMap::new()));
    let reactors = build_reactors(&config, &chunks, &generator, lighting, merger);
    for reactor in &reactors {
      pipeline.add_stage(Stage::gated(reactor.clone()));
    }
    route_completions(&pipeline, &reactors, config.authority);

    let viewer = Arc::new(RwLock::new(ChunkPos::ZERO));
    let origin = Arc::clone(&viewer);
    pipeline.set_priority(move |pos: ChunkPos| distance_squared(pos, *origin.read()));

    let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
    let provider = Arc::new(Self {
      config,
      generator,
      store,
      chunks,
      published: RwLock::new(HashSet::new()),
      viewer,
      pipeline,
      reactors,
      ready_tx,
      ready_rx,
      tasks_pool,
      requests,
      unloader,
    });

    let weak = Arc::downgrade(&provider);
    provider.pipeline.add_stage(Stage::new(READY_STAGE, move |chunk: Arc<Chunk>| {
      if !chunk.is_ready() {
        return Err(format!("chunk left processing in state {:?}", chunk.state()).into());
      }
      let Some(provider) = weak.upgrade() else {
        return Err("chunk provider dropped".into());
      };
      provider.on_chunk_is_ready(Arc::clone(&chunk));
      Ok(chunk)
    }));

    info!(stages = ?provider.pipeline.stage_names(), "Local chunk provider started");
    Ok(provider)
  }

  pub fn config(&self) -> &ProviderConfig {
    &self.config
  }

  pub fn pipeline(&self) -> &ChunkProcessingPipeline {
    &self.pipeline
  }

  pub fn metrics(&self) -> &Arc<PipelineMetrics> {
    self.pipeline.metrics()
  }

  // ---------------------------------------------------------------------------
  // Requests
  // ---------------------------------------------------------------------------

  /// Queue production of `positions`, nearest to the viewer first.
  /// Returns false if the request queue is not accepting work.
  pub fn request_chunks(self: &Arc<Self>, positions: impl IntoIterator<Item = ChunkPos>) -> bool {
    let positions = self.nearest_first(positions);
    self.requests.offer(ChunkRequest::Produce {
      positions,
      provider: Arc::downgrade(self),
    })
  }

  /// Queue a review of parked chunks at `positions`.
  pub fn review_chunks(self: &Arc<Self>, positions: impl IntoIterator<Item = ChunkPos>) -> bool {
    let positions = self.nearest_first(positions);
    self.requests.offer(ChunkRequest::Review {
      positions,
      provider: Arc::downgrade(self),
    })
  }

  /// Re-check the dependencies of a parked chunk in every gated stage.
  /// Returns true if any stage released it.
  pub fn review(&self, pos: ChunkPos) -> bool {
    self
      .reactors
      .iter()
      .fold(false, |released, reactor| reactor.review(pos) || released)
  }

  /// Create or load `pos`. A position already in flight is reviewed
  /// instead, so a parked chunk can pick up neighbours that arrived quietly.
  pub(crate) fn produce(&self, pos: ChunkPos) {
    if self.pipeline.is_position_processing(pos) {
      self.review(pos);
    } else {
      self.create_or_load_chunk(pos);
    }
  }

  /// Move the viewer; queued work is re-ranked by distance to it.
  pub fn set_viewer(&self, pos: ChunkPos) {
    *self.viewer.write() = pos;
    self.pipeline.reprioritize();
  }

  pub fn viewer(&self) -> ChunkPos {
    *self.viewer.read()
  }

  fn nearest_first(&self, positions: impl IntoIterator<Item = ChunkPos>) -> Vec<ChunkPos> {
    let viewer = self.viewer();
    let mut positions: Vec<ChunkPos> = positions.into_iter().collect();
    positions.sort_by_key(|pos| distance_squared(*pos, viewer));
    positions
  }

  // ---------------------------------------------------------------------------
  // Publishing
  // ---------------------------------------------------------------------------

  /// Publish chunks that finished processing, within the configured time
  /// budget. Returns the newly published chunks.
  pub fn update(&self) -> Vec<Arc<Chunk>> {
    let start = Instant::now();
    let mut ready = Vec::new();
    while let Ok(chunk) = self.ready_rx.try_recv() {
      let pos = chunk.position();
      let current = self
        .chunks
        .read()
        .get(&pos)
        .is_some_and(|loaded| Arc::ptr_eq(loaded, &chunk));
      if chunk.is_disposed() || !current || !self.published.write().insert(pos) {
        continue;
      }
      ready.push(chunk);

      if start.elapsed() > self.config.ready_budget {
        let remaining = self.ready_rx.len();
        if remaining > 0 {
          warn!(
            published = ready.len(),
            remaining,
            budget_ms = self.config.ready_budget.as_millis() as u64,
            "Chunk publishing exceeded its time budget"
          );
        }
        break;
      }
    }
    ready
  }

  /// A published chunk.
  pub fn get_chunk(&self, pos: ChunkPos) -> Option<Arc<Chunk>> {
    if !self.published.read().contains(&pos) {
      return None;
    }
    self.chunks.read().get(&pos).cloned()
  }

  pub fn is_chunk_ready(&self, pos: ChunkPos) -> bool {
    self.published.read().contains(&pos)
  }

  /// Every published chunk.
  pub fn all_chunks(&self) -> Vec<Arc<Chunk>> {
    let published = self.published.read();
    let chunks = self.chunks.read();
    published.iter().filter_map(|pos| chunks.get(pos).cloned()).collect()
  }

  /// Chunks in the map, published or not.
  pub fn loaded_count(&self) -> usize {
    self.chunks.read().len()
  }

  pub fn processing_count(&self) -> usize {
    self.pipeline.processing_count()
  }

  // ---------------------------------------------------------------------------
  // Unloading
  // ---------------------------------------------------------------------------

  /// Unload the chunk at `pos`.
  ///
  /// A chunk still in the pipeline is stopped and dropped, and false is
  /// returned. A loaded chunk is disposed and, if ready, queued for storing;
  /// true is returned.
  pub fn unload(&self, pos: ChunkPos) -> bool {
    if self.pipeline.stop_processing_at(pos) {
      self.chunks.write().remove(&pos);
      self.published.write().remove(&pos);
      debug!(%pos, "Stopped processing of unloaded chunk");
      return false;
    }
    let Some(chunk) = self.detach(pos) else {
      return false;
    };
    if chunk.is_ready() {
      if let Err(err) = self.unloader.put(ChunkUnloadRequest::new(chunk, Arc::clone(&self.store))) {
        warn!(%pos, "Chunk unload request rejected: {err}");
      }
    }
    true
  }

  /// Unload up to [`UNLOAD_PER_UPDATE`] chunks for which `keep` is false.
  /// Returns how many loaded chunks were unloaded.
  pub fn check_for_unload(&self, keep: impl Fn(ChunkPos) -> bool) -> usize {
    let candidates: Vec<ChunkPos> = self
      .chunks
      .read()
      .keys()
      .copied()
      .filter(|pos| !keep(*pos))
      .take(UNLOAD_PER_UPDATE)
      .collect();
    candidates.into_iter().filter(|pos| self.unload(*pos)).count()
  }

  /// Store and drop the loaded chunk at `pos`, then produce it again.
  /// Returns false if nothing was loaded there.
  pub fn reload_chunk(&self, pos: ChunkPos) -> bool {
    if !self.chunks.read().contains_key(&pos) {
      return false;
    }
    if self.pipeline.is_position_processing(pos) {
      self.unload(pos);
    } else if let Some(chunk) = self.detach(pos) {
      if chunk.is_ready() {
        self.store.store(pos, &chunk.lock());
      }
    }
    self.create_or_load_chunk(pos);
    true
  }

  /// Remove a chunk from the map and dispose it.
  fn detach(&self, pos: ChunkPos) -> Option<Arc<Chunk>> {
    let chunk = self.chunks.write().remove(&pos)?;
    self.published.write().remove(&pos);
    chunk.dispose();
    Some(chunk)
  }

  // ---------------------------------------------------------------------------
  // Lifecycle
  // ---------------------------------------------------------------------------

  /// Cancel all processing and start over. Loaded chunks are kept; chunks
  /// that were still in flight are dropped.
  pub fn restart(&self) -> Result<(), TaskError> {
    self.pipeline.restart()?;
    self.tasks_pool.restart()?;
    self.requests.restart();
    self.unloader.restart();
    info!(loaded = self.loaded_count(), "Local chunk provider restarted");
    Ok(())
  }

  /// Stop request handling and processing, then let pending unloads finish.
  pub fn shutdown(&self) {
    let wait = self.config.shutdown_wait;
    self.requests.shutdown(wait, true);
    self.pipeline.shutdown();
    self.unloader.shutdown(wait, false);
    self.tasks_pool.shutdown(wait, wait);
    info!("Local chunk provider shut down");
  }

  /// Shut down, store every ready chunk and drop all chunks.
  pub fn dispose(&self) {
    self.shutdown();
    let chunks: Vec<Arc<Chunk>> = self.chunks.write().drain().map(|(_, chunk)| chunk).collect();
    self.published.write().clear();
    while self.ready_rx.try_recv().is_ok() {}

    let mut stored = 0usize;
    for chunk in &chunks {
      if chunk.is_ready() {
        self.store.store(chunk.position(), &chunk.lock());
        stored += 1;
      }
      chunk.dispose();
    }
    info!(dropped = chunks.len(), stored, "Local chunk provider disposed");
  }
}

impl ChunkProvider for LocalChunkProvider {
  fn chunk_for_processing(&self, pos: ChunkPos) -> Option<Arc<Chunk>> {
    self.chunks.read().get(&pos).cloned()
  }

  fn create_or_load_chunk(&self, pos: ChunkPos) -> Option<ChunkFuture> {
    let loaded = self.chunks.read().get(&pos).cloned();
    if let Some(chunk) = loaded {
      if !self.pipeline.is_position_processing(pos) {
        if chunk.is_ready() {
          return None;
        }
        // Left behind by a chain that was cancelled mid-generation.
        discard_unfinished(&self.chunks, pos);
      }
    }

    let generator = Arc::clone(&self.generator);
    let store = Arc::clone(&self.store);
    let chunks = Arc::clone(&self.chunks);
    let future = self
      .pipeline
      .invoke_generator_task(pos, move |pos| produce_chunk(pos, &*generator, &*store, &chunks));

    let chunks = Arc::clone(&self.chunks);
    future.on_complete(move |result| {
      if result.is_err() {
        discard_unfinished(&chunks, pos);
      }
    });
    Some(future)
  }

  fn view_around(&self, pos: ChunkPos, radius: i32) -> Option<ChunkView> {
    let center = self.chunk_for_processing(pos)?;
    assemble_view(&self.chunks, &center, radius)
  }

  fn on_chunk_is_ready(&self, chunk: Arc<Chunk>) {
    if self.ready_tx.send(chunk).is_err() {
      warn!("Ready chunk channel disconnected");
    }
  }
}

// =============================================================================
// Stages
// =============================================================================

/// The three gated stages, in pipeline order.
fn build_reactors(
  config: &ProviderConfig,
  chunks: &ChunkMap,
  generator: &Arc<dyn WorldGenerator>,
  lighting: Arc<dyn LightingProcessor>,
  merger: Arc<dyn LightMerger>,
) -> [Arc<DependencyReactor>; 3] {
  let radius = config.reactor.radius;

  let second_pass = {
    let generator = Arc::clone(generator);
    let map = Arc::clone(chunks);
    DependencyReactor::new(SECOND_PASS_STAGE, config.reactor, exists(chunks), move |chunk| {
      if let Some(view) = assemble_view(&map, &chunk, radius) {
        let mut guard = view.lock();
        if guard.is_valid() && guard.center_data().state() == ChunkState::AdjacencyGenerationPending {
          generator.apply_second_pass(chunk.position(), &mut guard);
          guard.center_data().advance(
            ChunkState::AdjacencyGenerationPending,
            ChunkState::InternalLightGenerationPending,
          );
        }
      }
      Ok(chunk)
    })
  };

  let lighting_ready = if config.authority {
    reached(chunks, ChunkState::InternalLightGenerationPending)
  } else {
    exists(chunks)
  };
  let internal_lighting =
    DependencyReactor::new(INTERNAL_LIGHTING_STAGE, config.reactor, lighting_ready, move |chunk| {
      {
        let mut data = chunk.lock();
        if !chunk.is_disposed() && data.state() == ChunkState::InternalLightGenerationPending {
          lighting.generate_internal_lighting(&mut data);
          data.advance(ChunkState::InternalLightGenerationPending, ChunkState::LightPropagationPending);
        }
      }
      Ok(chunk)
    });

  let light_merging = {
    let map = Arc::clone(chunks);
    DependencyReactor::new(
      LIGHT_MERGING_STAGE,
      config.reactor,
      reached(chunks, ChunkState::LightPropagationPending),
      move |chunk| {
        if let Some(view) = assemble_view(&map, &chunk, radius) {
          let mut guard = view.lock();
          if guard.is_valid() && guard.center_data().state() == ChunkState::LightPropagationPending {
            merger.merge(&mut guard);
            guard.center_data().advance(ChunkState::LightPropagationPending, ChunkState::Ready);
          }
        }
        Ok(chunk)
      },
    )
  };

  [Arc::new(second_pass), Arc::new(internal_lighting), Arc::new(light_merging)]
}

/// Tell each reactor when the stage its neighbours wait on completes.
fn route_completions(pipeline: &ChunkProcessingPipeline, reactors: &[Arc<DependencyReactor>; 3], authority: bool) {
  let [second_pass, internal_lighting, light_merging] = reactors.clone();
  pipeline.add_listener(move |stage: &str, chunk: &Arc<Chunk>| {
    let pos = chunk.position();
    match stage {
      GENERATION_STAGE => {
        second_pass.on_done(pos);
        if !authority {
          internal_lighting.on_done(pos);
        }
      }
      SECOND_PASS_STAGE if authority => internal_lighting.on_done(pos),
      INTERNAL_LIGHTING_STAGE => light_merging.on_done(pos),
      _ => {}
    }
  });
}

fn exists(chunks: &ChunkMap) -> AvailabilityFn {
  let chunks = Arc::clone(chunks);
  Arc::new(move |pos: ChunkPos| chunks.read().contains_key(&pos))
}

fn reached(chunks: &ChunkMap, state: ChunkState) -> AvailabilityFn {
  let chunks = Arc::clone(chunks);
  Arc::new(move |pos: ChunkPos| {
    let chunk = chunks.read().get(&pos).cloned();
    chunk.is_some_and(|chunk| chunk.state() >= state)
  })
}

/// View centred on `center` itself (not whatever the map holds at its
/// position) with the loaded neighbours around it.
fn assemble_view(chunks: &ChunkMap, center: &Arc<Chunk>, radius: i32) -> Option<ChunkView> {
  let pos = center.position();
  let neighbours: Vec<Arc<Chunk>> = {
    let map = chunks.read();
    neighborhood(pos, radius).filter_map(|n| map.get(&n).cloned()).collect()
  };
  ChunkView::new(pos, radius, std::iter::once(Arc::clone(center)).chain(neighbours))
}

/// Generation step: load from the store or run the generator's first pass.
fn produce_chunk(
  pos: ChunkPos,
  generator: &dyn WorldGenerator,
  store: &dyn ChunkStore,
  chunks: &ChunkMap,
) -> Result<Arc<Chunk>, StageError> {
  let (data, loaded) = match store.load(pos) {
    Some(mut data) => {
      let state = data.state().min(ChunkState::InternalLightGenerationPending);
      data.restore_state(state);
      (data, true)
    }
    None => {
      let mut data = ChunkData::new();
      generator.create_chunk(pos, &mut data)?;
      data.advance(ChunkState::Created, ChunkState::AdjacencyGenerationPending);
      (data, false)
    }
  };
  let chunk = Arc::new(Chunk::with_data(pos, data));
  chunks.write().insert(pos, Arc::clone(&chunk));
  tracing::trace!(%pos, loaded, "Chunk produced");
  Ok(chunk)
}

/// Drop a chunk whose chain failed or was cancelled before reaching Ready.
fn discard_unfinished(chunks: &ChunkMap, pos: ChunkPos) {
  let mut map = chunks.write();
  if map.get(&pos).is_some_and(|chunk| !chunk.is_ready()) {
    if let Some(chunk) = map.remove(&pos) {
      chunk.dispose();
    }
  }
}
