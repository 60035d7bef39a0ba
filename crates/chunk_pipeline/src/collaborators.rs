//! World collaborators driven by the chunk provider's stages.
//!
//! The provider only sequences work; what a chunk contains and how light
//! flows through it comes from these traits:
//!
//! | Stage             | Collaborator                              |
//! |-------------------|-------------------------------------------|
//! | Chunk generation  | [`ChunkStore::load`] or [`WorldGenerator::create_chunk`] |
//! | Second pass       | [`WorldGenerator::apply_second_pass`]     |
//! | Internal lighting | [`LightingProcessor`]                     |
//! | Light merging     | [`LightMerger`]                           |
//! | Unload            | [`ChunkStore::store`]                     |
//!
//! Simple implementations are provided for tests, benches and demos.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::chunk::{BlockId, ChunkData, ChunkPos, ChunkViewGuard, AIR, CHUNK_SIZE, MAX_LIGHT};
use crate::error::StageError;

// =============================================================================
// Traits
// =============================================================================

/// Produces chunk content.
pub trait WorldGenerator: Send + Sync {
  /// First pass: fill a fresh chunk from nothing but its position.
  fn create_chunk(&self, pos: ChunkPos, data: &mut ChunkData) -> Result<(), StageError>;

  /// Second pass: features that need the neighbourhood to exist. Called
  /// with every loaded neighbour locked.
  fn apply_second_pass(&self, pos: ChunkPos, view: &mut ChunkViewGuard<'_>);
}

/// Computes lighting that only depends on the chunk's own blocks.
pub trait LightingProcessor: Send + Sync {
  fn generate_internal_lighting(&self, data: &mut ChunkData);
}

/// Propagates light across chunk borders into the view's centre.
pub trait LightMerger: Send + Sync {
  fn merge(&self, view: &mut ChunkViewGuard<'_>);
}

/// Persistence for unloaded chunks.
pub trait ChunkStore: Send + Sync {
  fn load(&self, pos: ChunkPos) -> Option<ChunkData>;
  fn store(&self, pos: ChunkPos, data: &ChunkData);
}

// =============================================================================
// FlatGenerator
// =============================================================================

/// Flat terrain: `fill` below `ground_level` (in world blocks), topped by
/// `surface` wherever the block above is air.
#[derive(Clone, Copy, Debug)]
pub struct FlatGenerator {
  pub ground_level: i32,
  pub fill: BlockId,
  pub surface: BlockId,
}

impl FlatGenerator {
  pub const fn new(ground_level: i32, fill: BlockId, surface: BlockId) -> Self {
    Self {
      ground_level,
      fill,
      surface,
    }
  }
}

impl Default for FlatGenerator {
  fn default() -> Self {
    Self::new(8, 1, 2)
  }
}

impl WorldGenerator for FlatGenerator {
  fn create_chunk(&self, pos: ChunkPos, data: &mut ChunkData) -> Result<(), StageError> {
    let base_y = pos.y * CHUNK_SIZE as i32;
    for y in 0..CHUNK_SIZE {
      if base_y + y as i32 >= self.ground_level {
        break;
      }
      for z in 0..CHUNK_SIZE {
        for x in 0..CHUNK_SIZE {
          data.set_block(x, y, z, self.fill);
        }
      }
    }
    Ok(())
  }

  fn apply_second_pass(&self, pos: ChunkPos, view: &mut ChunkViewGuard<'_>) {
    // Air flags of the bottom layer of the chunk above. A missing neighbour
    // counts as air.
    let above = pos + ChunkPos::Y;
    let mut air_above = [true; CHUNK_SIZE * CHUNK_SIZE];
    if let Some(data) = view.get(above) {
      for z in 0..CHUNK_SIZE {
        for x in 0..CHUNK_SIZE {
          air_above[z * CHUNK_SIZE + x] = data.block(x, 0, z) == AIR;
        }
      }
    }

    let data = view.center_data();
    for z in 0..CHUNK_SIZE {
      for x in 0..CHUNK_SIZE {
        for y in 0..CHUNK_SIZE {
          if data.block(x, y, z) != self.fill {
            continue;
          }
          let open = if y + 1 < CHUNK_SIZE {
            data.block(x, y + 1, z) == AIR
          } else {
            air_above[z * CHUNK_SIZE + x]
          };
          if open {
            data.set_block(x, y, z, self.surface);
          }
        }
      }
    }
  }
}

// =============================================================================
// SunlightProcessor
// =============================================================================

/// Straight-down sunlight: full strength until the first solid block of each
/// column, dark below it.
#[derive(Clone, Copy, Debug, Default)]
pub struct SunlightProcessor;

impl LightingProcessor for SunlightProcessor {
  fn generate_internal_lighting(&self, data: &mut ChunkData) {
    for z in 0..CHUNK_SIZE {
      for x in 0..CHUNK_SIZE {
        let mut light = MAX_LIGHT;
        for y in (0..CHUNK_SIZE).rev() {
          if data.block(x, y, z) != AIR {
            light = 0;
          }
          data.set_sunlight(x, y, z, light);
        }
      }
    }
  }
}

// =============================================================================
// MaxLightMerger
// =============================================================================

/// One step of sunlight across each face: an air block on the centre's border
/// takes `max(own, neighbour - 1)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MaxLightMerger;

const FACES: [(usize, i32); 6] = [(0, 1), (0, -1), (1, 1), (1, -1), (2, 1), (2, -1)];

impl LightMerger for MaxLightMerger {
  fn merge(&self, view: &mut ChunkViewGuard<'_>) {
    let center = view.center();
    let last = CHUNK_SIZE - 1;
    let mut updates: Vec<([usize; 3], u8)> = Vec::new();

    for (axis, dir) in FACES {
      let mut offset = [0i32; 3];
      offset[axis] = dir;
      let Some(neighbour) = view.get(center + ChunkPos::from_array(offset)) else {
        continue;
      };
      let (own_layer, their_layer) = if dir > 0 { (last, 0) } else { (0, last) };
      for a in 0..CHUNK_SIZE {
        for b in 0..CHUNK_SIZE {
          let mut own = [0usize; 3];
          own[axis] = own_layer;
          own[(axis + 1) % 3] = a;
          own[(axis + 2) % 3] = b;
          let mut theirs = own;
          theirs[axis] = their_layer;
          let value = neighbour.sunlight(theirs[0], theirs[1], theirs[2]).saturating_sub(1);
          if value > 0 {
            updates.push((own, value));
          }
        }
      }
    }

    let data = view.center_data();
    for ([x, y, z], value) in updates {
      if data.block(x, y, z) == AIR && value > data.sunlight(x, y, z) {
        data.set_sunlight(x, y, z, value);
      }
    }
  }
}

// =============================================================================
// MemoryChunkStore
// =============================================================================

/// In-memory [`ChunkStore`].
#[derive(Default)]
pub struct MemoryChunkStore {
  chunks: Mutex<HashMap<ChunkPos, ChunkData>>,
}

impl MemoryChunkStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.chunks.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.chunks.lock().is_empty()
  }

  pub fn contains(&self, pos: ChunkPos) -> bool {
    self.chunks.lock().contains_key(&pos)
  }
}

impl ChunkStore for MemoryChunkStore {
  fn load(&self, pos: ChunkPos) -> Option<ChunkData> {
    self.chunks.lock().get(&pos).cloned()
  }

  fn store(&self, pos: ChunkPos, data: &ChunkData) {
    self.chunks.lock().insert(pos, data.clone());
  }
}
