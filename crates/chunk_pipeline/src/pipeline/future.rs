//! Shared completion handle for one chunk processing chain.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::chunk::{Chunk, ChunkPos};
use crate::error::PipelineError;

/// Final outcome of a chain. Errors are shared because every clone of the
/// future observes the same failure.
pub type ChunkResult = Result<Arc<Chunk>, Arc<PipelineError>>;

type Callback = Box<dyn FnOnce(&ChunkResult) + Send>;

struct FutureState {
  result: Option<ChunkResult>,
  callbacks: Vec<Callback>,
}

struct FutureInner {
  pos: ChunkPos,
  state: Mutex<FutureState>,
  ready: Condvar,
}

/// Cloneable handle that completes once, with a chunk or an error.
///
/// Returned by `invoke_generator_task` and `invoke_pipeline`; duplicate
/// requests for a position in flight receive clones of the same handle
/// (see [`ChunkFuture::ptr_eq`]).
#[derive(Clone)]
pub struct ChunkFuture {
  inner: Arc<FutureInner>,
}

impl ChunkFuture {
  pub(crate) fn new(pos: ChunkPos) -> Self {
    Self {
      inner: Arc::new(FutureInner {
        pos,
        state: Mutex::new(FutureState {
          result: None,
          callbacks: Vec::new(),
        }),
        ready: Condvar::new(),
      }),
    }
  }

  /// Already failed with `error`.
  pub(crate) fn failed(pos: ChunkPos, error: PipelineError) -> Self {
    let future = Self::new(pos);
    future.complete(Err(Arc::new(error)));
    future
  }

  pub fn position(&self) -> ChunkPos {
    self.inner.pos
  }

  /// Set the outcome. Only the first completion counts.
  pub(crate) fn complete(&self, result: ChunkResult) -> bool {
    let callbacks = {
      let mut state = self.inner.state.lock();
      if state.result.is_some() {
        return false;
      }
      state.result = Some(result.clone());
      std::mem::take(&mut state.callbacks)
    };
    self.inner.ready.notify_all();
    for callback in callbacks {
      callback(&result);
    }
    true
  }

  /// Complete with [`PipelineError::Cancelled`] unless already done.
  pub(crate) fn cancel(&self) -> bool {
    self.complete(Err(Arc::new(PipelineError::Cancelled { pos: self.inner.pos })))
  }

  pub fn is_done(&self) -> bool {
    self.inner.state.lock().result.is_some()
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(&self.inner.state.lock().result, Some(Err(e)) if e.is_cancelled())
  }

  /// The outcome, if complete.
  pub fn try_result(&self) -> Option<ChunkResult> {
    self.inner.state.lock().result.clone()
  }

  /// Block until complete.
  pub fn wait(&self) -> ChunkResult {
    let mut state = self.inner.state.lock();
    loop {
      if let Some(result) = &state.result {
        return result.clone();
      }
      self.inner.ready.wait(&mut state);
    }
  }

  /// Block until complete or `timeout` elapses.
  pub fn wait_timeout(&self, timeout: Duration) -> Option<ChunkResult> {
    let mut state = self.inner.state.lock();
    if state.result.is_none() {
      self
        .inner
        .ready
        .wait_while_for(&mut state, |s| s.result.is_none(), timeout);
    }
    state.result.clone()
  }

  /// Run `callback` on completion; immediately if already complete.
  /// Callbacks run on the completing thread and must not block.
  pub fn on_complete(&self, callback: impl FnOnce(&ChunkResult) + Send + 'static) {
    let result = {
      let mut state = self.inner.state.lock();
      match &state.result {
        Some(result) => result.clone(),
        None => {
          state.callbacks.push(Box::new(callback));
          return;
        }
      }
    };
    callback(&result);
  }

  /// True if both handles refer to the same chain.
  pub fn ptr_eq(&self, other: &ChunkFuture) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}

impl fmt::Debug for ChunkFuture {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ChunkFuture")
      .field("pos", &self.inner.pos)
      .field("done", &self.is_done())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn test_first_completion_wins() {
    let pos = ChunkPos::new(1, 2, 3);
    let future = ChunkFuture::new(pos);
    assert!(!future.is_done());
    assert!(future.try_result().is_none());

    let chunk = Arc::new(Chunk::new(pos));
    assert!(future.complete(Ok(Arc::clone(&chunk))));
    assert!(!future.cancel());

    let result = future.wait().expect("completed with chunk");
    assert!(Arc::ptr_eq(&result, &chunk));
    assert!(!future.is_cancelled());
  }

  #[test]
  fn test_callbacks_fire_once() {
    let future = ChunkFuture::new(ChunkPos::ZERO);
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    future.on_complete(move |result| {
      assert!(result.is_err());
      counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(future.cancel());
    assert!(future.is_cancelled());

    // Late registration runs immediately.
    let counter = Arc::clone(&calls);
    future.on_complete(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_wait_timeout_and_cross_thread_completion() {
    let future = ChunkFuture::new(ChunkPos::X);
    assert!(future.wait_timeout(Duration::from_millis(5)).is_none());

    let remote = future.clone();
    assert!(remote.ptr_eq(&future));
    let handle = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(10));
      remote.complete(Ok(Arc::new(Chunk::new(ChunkPos::X))));
    });
    let result = future.wait_timeout(Duration::from_secs(5));
    assert!(matches!(result, Some(Ok(_))));
    handle.join().expect("completer thread");

    let failed = ChunkFuture::failed(ChunkPos::Y, PipelineError::NoStages);
    assert!(matches!(failed.try_result(), Some(Err(e)) if matches!(*e, PipelineError::NoStages)));
    assert!(!failed.ptr_eq(&future));
  }
}
