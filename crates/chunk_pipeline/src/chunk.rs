//! Chunk model: positions, processing state, lockable voxel data and
//! locked neighbourhood views.
//!
//! A [`Chunk`] is shared between the pipeline, dependency reactors and
//! external readers. All reads and writes of [`ChunkData`] (including the
//! processing state) happen under the chunk's lock. After acquiring the lock a
//! task must check [`Chunk::is_disposed`] and abort if the chunk was removed
//! from the world in the meantime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

/// Position of a chunk in the world grid.
pub type ChunkPos = glam::IVec3;

/// Blocks per chunk edge.
pub const CHUNK_SIZE: usize = 16;
/// Blocks per chunk layer.
pub const CHUNK_AREA: usize = CHUNK_SIZE * CHUNK_SIZE;
/// Blocks per chunk.
pub const CHUNK_VOLUME: usize = CHUNK_AREA * CHUNK_SIZE;

/// Maximum light value.
pub const MAX_LIGHT: u8 = 15;

/// Block identifier. `AIR` is zero.
pub type BlockId = u16;
pub const AIR: BlockId = 0;

/// Neighbour offsets of the 3x3x3 neighbourhood, centre excluded.
pub const NEIGHBOR_OFFSETS: [ChunkPos; 26] = {
  let mut offsets = [ChunkPos::ZERO; 26];
  let mut i = 0;
  let mut x = -1;
  while x <= 1 {
    let mut y = -1;
    while y <= 1 {
      let mut z = -1;
      while z <= 1 {
        if !(x == 0 && y == 0 && z == 0) {
          offsets[i] = ChunkPos::new(x, y, z);
          i += 1;
        }
        z += 1;
      }
      y += 1;
    }
    x += 1;
  }
  offsets
};

/// Positions within `radius` (Chebyshev) of `center`, centre excluded.
pub fn neighborhood(center: ChunkPos, radius: i32) -> impl Iterator<Item = ChunkPos> {
  let r = radius.max(0);
  (-r..=r).flat_map(move |x| {
    (-r..=r).flat_map(move |y| {
      (-r..=r).filter_map(move |z| {
        let offset = ChunkPos::new(x, y, z);
        (offset != ChunkPos::ZERO).then_some(center + offset)
      })
    })
  })
}

/// Chebyshev distance between two chunk positions.
#[inline]
pub fn chebyshev_distance(a: ChunkPos, b: ChunkPos) -> i32 {
  (a - b).abs().max_element()
}

/// Squared euclidean distance, the usual relevance metric for ordering work.
#[inline]
pub fn distance_squared(a: ChunkPos, b: ChunkPos) -> i64 {
  let d = (a - b).as_i64vec3();
  d.x * d.x + d.y * d.y + d.z * d.z
}

/// Index of a block inside the chunk (x slowest, z fastest).
#[inline]
pub fn block_index(x: usize, y: usize, z: usize) -> usize {
  debug_assert!(x < CHUNK_SIZE && y < CHUNK_SIZE && z < CHUNK_SIZE);
  x * CHUNK_AREA + y * CHUNK_SIZE + z
}

// =============================================================================
// ChunkState
// =============================================================================

/// How far a chunk has progressed. Ordered and monotonic: a chunk only ever
/// moves forward through these states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChunkState {
  /// Allocated, generator first pass not applied yet.
  Created,
  /// First pass done; waiting for neighbours to exist for the second pass.
  AdjacencyGenerationPending,
  /// Second pass done; waiting to compute internal lighting.
  InternalLightGenerationPending,
  /// Internal lighting done; waiting to merge light with neighbours.
  LightPropagationPending,
  /// Fully processed.
  Ready,
}

// =============================================================================
// ChunkData
// =============================================================================

/// Voxel payload and processing state of a chunk. Only reachable through the
/// chunk lock.
#[derive(Clone)]
pub struct ChunkData {
  state: ChunkState,
  blocks: Box<[BlockId]>,
  sunlight: Box<[u8]>,
  light: Box<[u8]>,
}

impl std::fmt::Debug for ChunkData {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ChunkData")
      .field("state", &self.state)
      .field("solid_blocks", &self.solid_count())
      .finish()
  }
}

impl Default for ChunkData {
  fn default() -> Self {
    Self::new()
  }
}

impl ChunkData {
  /// Empty (all air, unlit) chunk in the `Created` state.
  pub fn new() -> Self {
    Self {
      state: ChunkState::Created,
      blocks: vec![AIR; CHUNK_VOLUME].into_boxed_slice(),
      sunlight: vec![0; CHUNK_VOLUME].into_boxed_slice(),
      light: vec![0; CHUNK_VOLUME].into_boxed_slice(),
    }
  }

  #[inline]
  pub fn state(&self) -> ChunkState {
    self.state
  }

  /// Advance from `from` to `to`.
  ///
  /// Returns `false` (and changes nothing) when the chunk is no longer in
  /// `from` or when `to` would not move it forward. This is what turns stale
  /// or duplicate work into a no-op.
  pub fn advance(&mut self, from: ChunkState, to: ChunkState) -> bool {
    if self.state != from || to <= from {
      return false;
    }
    self.state = to;
    true
  }

  /// Overwrite the state. Used when a stored chunk is loaded back: its
  /// lighting is recomputed, so it re-enters the pipeline below `Ready`.
  pub(crate) fn restore_state(&mut self, state: ChunkState) {
    self.state = state;
  }

  #[inline]
  pub fn block(&self, x: usize, y: usize, z: usize) -> BlockId {
    self.blocks[block_index(x, y, z)]
  }

  #[inline]
  pub fn set_block(&mut self, x: usize, y: usize, z: usize, block: BlockId) {
    self.blocks[block_index(x, y, z)] = block;
  }

  #[inline]
  pub fn sunlight(&self, x: usize, y: usize, z: usize) -> u8 {
    self.sunlight[block_index(x, y, z)]
  }

  #[inline]
  pub fn set_sunlight(&mut self, x: usize, y: usize, z: usize, value: u8) {
    self.sunlight[block_index(x, y, z)] = value.min(MAX_LIGHT);
  }

  #[inline]
  pub fn light(&self, x: usize, y: usize, z: usize) -> u8 {
    self.light[block_index(x, y, z)]
  }

  #[inline]
  pub fn set_light(&mut self, x: usize, y: usize, z: usize, value: u8) {
    self.light[block_index(x, y, z)] = value.min(MAX_LIGHT);
  }

  pub fn solid_count(&self) -> usize {
    self.blocks.iter().filter(|b| **b != AIR).count()
  }
}

// =============================================================================
// Chunk
// =============================================================================

/// A lockable chunk at a fixed position.
pub struct Chunk {
  pos: ChunkPos,
  data: Mutex<ChunkData>,
  disposed: AtomicBool,
}

impl std::fmt::Debug for Chunk {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Chunk")
      .field("pos", &self.pos)
      .field("disposed", &self.is_disposed())
      .finish()
  }
}

impl Chunk {
  pub fn new(pos: ChunkPos) -> Self {
    Self::with_data(pos, ChunkData::new())
  }

  pub fn with_data(pos: ChunkPos, data: ChunkData) -> Self {
    Self {
      pos,
      data: Mutex::new(data),
      disposed: AtomicBool::new(false),
    }
  }

  #[inline]
  pub fn position(&self) -> ChunkPos {
    self.pos
  }

  /// Acquire the chunk lock. Blocks the calling thread until free.
  pub fn lock(&self) -> MutexGuard<'_, ChunkData> {
    self.data.lock()
  }

  pub fn try_lock(&self) -> Option<MutexGuard<'_, ChunkData>> {
    self.data.try_lock()
  }

  /// Snapshot of the processing state (takes the lock briefly).
  pub fn state(&self) -> ChunkState {
    self.data.lock().state()
  }

  pub fn is_ready(&self) -> bool {
    self.state() == ChunkState::Ready
  }

  /// Mark the chunk as removed from the world. Irreversible.
  pub fn dispose(&self) {
    self.disposed.store(true, Ordering::Release);
  }

  #[inline]
  pub fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::Acquire)
  }
}

// =============================================================================
// ChunkView
// =============================================================================

/// A chunk together with its loaded neighbourhood.
///
/// Locking a view locks every chunk in ascending position order, which is the
/// only order multi-chunk locks may be taken in.
#[derive(Clone, Debug)]
pub struct ChunkView {
  center: ChunkPos,
  radius: i32,
  chunks: Vec<Arc<Chunk>>,
}

impl ChunkView {
  /// Build a view from the centre chunk and whatever neighbours are given.
  /// Returns `None` if the centre chunk is missing.
  pub fn new(center: ChunkPos, radius: i32, chunks: impl IntoIterator<Item = Arc<Chunk>>) -> Option<Self> {
    let mut chunks: Vec<Arc<Chunk>> = chunks
      .into_iter()
      .filter(|c| chebyshev_distance(c.position(), center) <= radius)
      .collect();
    chunks.sort_by_key(|c| c.position().to_array());
    chunks.dedup_by_key(|c| c.position());
    if !chunks.iter().any(|c| c.position() == center) {
      return None;
    }
    Some(Self {
      center,
      radius,
      chunks,
    })
  }

  #[inline]
  pub fn center(&self) -> ChunkPos {
    self.center
  }

  #[inline]
  pub fn radius(&self) -> i32 {
    self.radius
  }

  /// True when every position of the neighbourhood is present.
  pub fn is_complete(&self) -> bool {
    let side = (2 * self.radius + 1) as usize;
    self.chunks.len() == side * side * side
  }

  pub fn chunks(&self) -> &[Arc<Chunk>] {
    &self.chunks
  }

  pub fn chunk(&self, pos: ChunkPos) -> Option<&Arc<Chunk>> {
    self
      .chunks
      .binary_search_by_key(&pos.to_array(), |c| c.position().to_array())
      .ok()
      .map(|i| &self.chunks[i])
  }

  /// Lock all chunks of the view.
  pub fn lock(&self) -> ChunkViewGuard<'_> {
    let guards = self
      .chunks
      .iter()
      .map(|c| (c.position(), c.lock()))
      .collect::<SmallVec<[_; 27]>>();
    ChunkViewGuard {
      view: self,
      guards,
    }
  }
}

/// All chunk locks of a [`ChunkView`]; released on drop.
pub struct ChunkViewGuard<'a> {
  view: &'a ChunkView,
  guards: SmallVec<[(ChunkPos, MutexGuard<'a, ChunkData>); 27]>,
}

impl<'a> ChunkViewGuard<'a> {
  /// False if any chunk of the view was disposed while we waited for locks.
  pub fn is_valid(&self) -> bool {
    self.view.chunks.iter().all(|c| !c.is_disposed())
  }

  pub fn center(&self) -> ChunkPos {
    self.view.center
  }

  fn index(&self, pos: ChunkPos) -> Option<usize> {
    self
      .guards
      .binary_search_by_key(&pos.to_array(), |(p, _)| p.to_array())
      .ok()
  }

  pub fn get(&self, pos: ChunkPos) -> Option<&ChunkData> {
    self.index(pos).map(|i| &*self.guards[i].1)
  }

  pub fn get_mut(&mut self, pos: ChunkPos) -> Option<&mut ChunkData> {
    self.index(pos).map(move |i| &mut *self.guards[i].1)
  }

  /// The centre chunk's data. Always present by construction.
  pub fn center_data(&mut self) -> &mut ChunkData {
    let center = self.view.center;
    let i = self.index(center).unwrap_or(0);
    &mut self.guards[i].1
  }

  /// Iterate `(position, data)` over the locked neighbourhood.
  pub fn iter(&self) -> impl Iterator<Item = (ChunkPos, &ChunkData)> {
    self.guards.iter().map(|(p, g)| (*p, &**g))
  }
}

#[cfg(test)]
#[path = "chunk_test.rs"]
mod chunk_test;
