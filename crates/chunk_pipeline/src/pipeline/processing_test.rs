use super::*;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::unbounded;

use crate::chunk::{neighborhood, ChunkState};
use crate::config::ReactorConfig;
use crate::pipeline::reactor::DependencyReactor;

const WAIT: Duration = Duration::from_secs(5);

fn pipeline(threads: usize) -> ChunkProcessingPipeline {
  let config = PipelineConfig::DEFAULT
    .with_num_threads(threads)
    .with_shutdown_wait(Duration::from_secs(1));
  ChunkProcessingPipeline::new(config).expect("pipeline builds")
}

fn fresh(pos: ChunkPos) -> Result<Arc<Chunk>, StageError> {
  Ok(Arc::new(Chunk::new(pos)))
}

fn passthrough(name: &str) -> Stage {
  Stage::new(name, |chunk| Ok(chunk))
}

#[test]
fn test_no_stages() {
  let pipeline = pipeline(1);
  let future = pipeline.invoke_generator_task(ChunkPos::ZERO, fresh);
  let error = future.wait().expect_err("no stages");
  assert!(matches!(*error, PipelineError::NoStages));
  assert!(!pipeline.is_position_processing(ChunkPos::ZERO));
}

#[test]
fn test_dedup_returns_same_future() {
  let pipeline = pipeline(2).with_stage(passthrough("Only"));
  let calls = Arc::new(AtomicUsize::new(0));
  let (release_tx, release_rx) = unbounded::<()>();

  let supplier = {
    let calls = Arc::clone(&calls);
    move |pos| {
      calls.fetch_add(1, Ordering::SeqCst);
      release_rx.recv_timeout(WAIT).ok();
      fresh(pos)
    }
  };
  let first = pipeline.invoke_generator_task(ChunkPos::ONE, supplier);

  let second_calls = Arc::clone(&calls);
  let second = pipeline.invoke_generator_task(ChunkPos::ONE, move |pos| {
    second_calls.fetch_add(1, Ordering::SeqCst);
    fresh(pos)
  });

  assert!(first.ptr_eq(&second));
  assert!(pipeline.is_position_processing(ChunkPos::ONE));
  release_tx.send(()).ok();

  let chunk = first.wait().expect("chain completes");
  assert_eq!(chunk.position(), ChunkPos::ONE);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert!(!pipeline.is_position_processing(ChunkPos::ONE));
}

#[test]
fn test_concurrent_invocations_share_one_chain() {
  let pipeline = Arc::new(pipeline(4).with_stage(passthrough("Only")));
  let calls = Arc::new(AtomicUsize::new(0));
  let (release_tx, release_rx) = unbounded::<()>();

  let invokers: Vec<_> = (0..8)
    .map(|_| {
      let pipeline = Arc::clone(&pipeline);
      let calls = Arc::clone(&calls);
      let release_rx = release_rx.clone();
      std::thread::spawn(move || {
        pipeline.invoke_generator_task(ChunkPos::Z, move |pos| {
          calls.fetch_add(1, Ordering::SeqCst);
          release_rx.recv_timeout(WAIT).ok();
          fresh(pos)
        })
      })
    })
    .collect();
  let futures: Vec<ChunkFuture> = invokers
    .into_iter()
    .map(|handle| handle.join().expect("invoker thread"))
    .collect();

  drop(release_tx);
  for future in &futures {
    assert!(future.ptr_eq(&futures[0]));
    assert!(future.wait_timeout(WAIT).is_some_and(|r| r.is_ok()));
  }
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stage_order_per_chunk() {
  let logs: Arc<parking_lot::Mutex<HashMap<ChunkPos, Vec<&'static str>>>> = Arc::default();
  let logging_stage = |name: &'static str| {
    let logs = Arc::clone(&logs);
    Stage::new(name, move |chunk: Arc<Chunk>| {
      logs.lock().entry(chunk.position()).or_default().push(name);
      Ok(chunk)
    })
  };
  let pipeline = pipeline(4)
    .with_stage(logging_stage("A"))
    .with_stage(logging_stage("B"))
    .with_stage(logging_stage("C"));
  assert_eq!(pipeline.stage_names(), vec!["A", "B", "C"]);

  let futures: Vec<ChunkFuture> = neighborhood(ChunkPos::ZERO, 1)
    .map(|pos| pipeline.invoke_generator_task(pos, fresh))
    .collect();
  for future in futures {
    future.wait_timeout(WAIT).expect("done").expect("ok");
  }

  let logs = logs.lock();
  assert_eq!(logs.len(), 26);
  for log in logs.values() {
    assert_eq!(*log, vec!["A", "B", "C"]);
  }
}

#[test]
fn test_consumer_stage_mutates_chunk() {
  let pipeline = pipeline(1).with_stage(Stage::consumer("Advance", |data| {
    data.advance(ChunkState::Created, ChunkState::AdjacencyGenerationPending);
  }));
  let chunk = Arc::new(Chunk::new(ChunkPos::X));
  let result = pipeline.invoke_pipeline(Arc::clone(&chunk)).wait().expect("ok");
  assert!(Arc::ptr_eq(&result, &chunk));
  assert_eq!(chunk.state(), ChunkState::AdjacencyGenerationPending);
}

#[test]
fn test_failing_stage_cleans_registry() {
  let attempts = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&attempts);
  let pipeline = pipeline(2).with_stage(Stage::new("Explode at origin", move |chunk: Arc<Chunk>| {
    if chunk.position() == ChunkPos::ZERO && counter.fetch_add(1, Ordering::SeqCst) == 0 {
      return Err("generator exploded".into());
    }
    Ok(chunk)
  }));

  let failed = pipeline.invoke_generator_task(ChunkPos::ZERO, fresh);
  let error = failed.wait_timeout(WAIT).expect("done").expect_err("stage failed");
  match &*error {
    PipelineError::Stage { stage, pos, .. } => {
      assert_eq!(stage, "Explode at origin");
      assert_eq!(*pos, ChunkPos::ZERO);
    }
    other => panic!("unexpected error {other:?}"),
  }
  assert!(!pipeline.is_position_processing(ChunkPos::ZERO));

  // A fresh attempt starts over.
  let retry = pipeline.invoke_generator_task(ChunkPos::ZERO, fresh);
  assert!(!retry.ptr_eq(&failed));
  assert!(retry.wait_timeout(WAIT).expect("done").is_ok());
  assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn test_panicking_supplier_and_stage() {
  let pipeline = pipeline(1).with_stage(Stage::new("Panics", |chunk: Arc<Chunk>| {
    if chunk.position() == ChunkPos::X {
      panic!("stage went wrong");
    }
    Ok(chunk)
  }));

  let from_supplier = pipeline.invoke_generator_task(ChunkPos::ZERO, |_| panic!("supplier went wrong"));
  let error = from_supplier.wait_timeout(WAIT).expect("done").expect_err("panicked");
  assert!(matches!(&*error, PipelineError::Panicked { stage, .. } if stage == GENERATION_STAGE));

  let from_stage = pipeline.invoke_generator_task(ChunkPos::X, fresh);
  let error = from_stage.wait_timeout(WAIT).expect("done").expect_err("panicked");
  assert!(matches!(&*error, PipelineError::Panicked { message, .. } if message == "stage went wrong"));
  assert_eq!(pipeline.processing_count(), 0);
}

#[test]
fn test_listeners_see_every_stage() {
  let pipeline = pipeline(1)
    .with_stage(passthrough("First"))
    .with_stage(passthrough("Second"));
  let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
  let sink = Arc::clone(&seen);
  pipeline.add_listener(move |stage, chunk| sink.lock().push((stage.to_string(), chunk.position())));

  pipeline
    .invoke_generator_task(ChunkPos::Y, fresh)
    .wait_timeout(WAIT)
    .expect("done")
    .expect("ok");

  let seen = seen.lock();
  let names: Vec<&str> = seen.iter().map(|(name, _)| name.as_str()).collect();
  assert_eq!(names, vec![GENERATION_STAGE, "First", "Second"]);
  assert!(seen.iter().all(|(_, pos)| *pos == ChunkPos::Y));
}

/// Pipeline whose second stage waits for all 26 neighbours to be marked done.
fn gated_pipeline(done: &Arc<parking_lot::Mutex<HashSet<ChunkPos>>>) -> (ChunkProcessingPipeline, Arc<DependencyReactor>, Arc<AtomicUsize>) {
  let runs = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&runs);
  let available = Arc::clone(done);
  let reactor = Arc::new(DependencyReactor::new(
    "Gated",
    ReactorConfig::DEFAULT,
    Arc::new(move |pos: ChunkPos| available.lock().contains(&pos)),
    move |chunk| {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(chunk)
    },
  ));
  let pipeline = pipeline(2)
    .with_stage(passthrough("Before"))
    .with_stage(Stage::gated(reactor.clone()));
  (pipeline, reactor, runs)
}

#[test]
fn test_gated_stage_runs_once_after_last_neighbour() {
  let done = Arc::new(parking_lot::Mutex::new(HashSet::new()));
  let (pipeline, reactor, runs) = gated_pipeline(&done);

  let future = pipeline.invoke_generator_task(ChunkPos::ZERO, fresh);
  let start = web_time::Instant::now();
  while !reactor.is_pending(ChunkPos::ZERO) && start.elapsed() < WAIT {
    std::thread::sleep(Duration::from_millis(1));
  }
  assert!(reactor.is_pending(ChunkPos::ZERO));
  assert!(!future.is_done());
  assert!(pipeline.is_position_processing(ChunkPos::ZERO));

  let neighbours: Vec<ChunkPos> = neighborhood(ChunkPos::ZERO, 1).collect();
  for n in &neighbours[..25] {
    done.lock().insert(*n);
    reactor.on_done(*n);
  }
  std::thread::sleep(Duration::from_millis(20));
  assert_eq!(runs.load(Ordering::SeqCst), 0);
  assert!(!future.is_done());

  done.lock().insert(neighbours[25]);
  reactor.on_done(neighbours[25]);
  reactor.on_done(neighbours[25]);

  future.wait_timeout(WAIT).expect("done").expect("ok");
  assert_eq!(runs.load(Ordering::SeqCst), 1);
  assert_eq!(pipeline.processing_count(), 0);
}

#[test]
fn test_stop_processing_at_cancels_parked_chain() {
  let done = Arc::new(parking_lot::Mutex::new(HashSet::new()));
  let (pipeline, reactor, runs) = gated_pipeline(&done);

  let future = pipeline.invoke_generator_task(ChunkPos::ZERO, fresh);
  let start = web_time::Instant::now();
  while !reactor.is_pending(ChunkPos::ZERO) && start.elapsed() < WAIT {
    std::thread::sleep(Duration::from_millis(1));
  }

  assert!(pipeline.stop_processing_at(ChunkPos::ZERO));
  assert!(!pipeline.stop_processing_at(ChunkPos::ZERO));
  assert!(future.is_cancelled());
  assert!(!reactor.is_pending(ChunkPos::ZERO));
  assert!(!pipeline.is_position_processing(ChunkPos::ZERO));

  // Late notifications do not resurrect the chain.
  for n in neighborhood(ChunkPos::ZERO, 1) {
    reactor.on_done(n);
  }
  std::thread::sleep(Duration::from_millis(20));
  assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[test]
fn test_stop_disposes_chunk() {
  let done = Arc::new(parking_lot::Mutex::new(HashSet::new()));
  let (pipeline, reactor, _runs) = gated_pipeline(&done);
  let (chunk_tx, chunk_rx) = unbounded();

  let future = pipeline.invoke_generator_task(ChunkPos::ZERO, move |pos| {
    let chunk = Arc::new(Chunk::new(pos));
    chunk_tx.send(Arc::clone(&chunk)).ok();
    Ok(chunk)
  });
  let chunk = chunk_rx.recv_timeout(WAIT).expect("supplier ran");
  let start = web_time::Instant::now();
  while !reactor.is_pending(ChunkPos::ZERO) && start.elapsed() < WAIT {
    std::thread::sleep(Duration::from_millis(1));
  }

  assert!(!chunk.is_disposed());
  assert!(pipeline.stop_processing_at(ChunkPos::ZERO));
  assert!(chunk.is_disposed());
  assert!(future.is_cancelled());
}

#[test]
fn test_priority_orders_queued_generation() {
  let pipeline = pipeline(1).with_stage(passthrough("Only"));
  pipeline.set_priority(|pos: ChunkPos| i64::from(pos.x.abs()));

  let (release_tx, release_rx) = unbounded::<()>();
  let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

  let blocker = pipeline.invoke_generator_task(ChunkPos::ZERO, move |pos| {
    release_rx.recv_timeout(WAIT).ok();
    fresh(pos)
  });

  let futures: Vec<ChunkFuture> = [5, 1, 3, 2]
    .into_iter()
    .map(|x| {
      let order = Arc::clone(&order);
      pipeline.invoke_generator_task(ChunkPos::new(x, 0, 0), move |pos| {
        order.lock().push(pos.x);
        fresh(pos)
      })
    })
    .collect();

  release_tx.send(()).ok();
  blocker.wait_timeout(WAIT).expect("done").expect("ok");
  for future in futures {
    future.wait_timeout(WAIT).expect("done").expect("ok");
  }
  assert_eq!(*order.lock(), vec![1, 2, 3, 5]);
}

#[test]
fn test_restart_cancels_and_recovers() {
  let done = Arc::new(parking_lot::Mutex::new(HashSet::new()));
  let (pipeline, reactor, _runs) = gated_pipeline(&done);

  let parked = pipeline.invoke_generator_task(ChunkPos::ZERO, fresh);
  let start = web_time::Instant::now();
  while !reactor.is_pending(ChunkPos::ZERO) && start.elapsed() < WAIT {
    std::thread::sleep(Duration::from_millis(1));
  }

  pipeline.restart().expect("restart");
  assert!(parked.is_cancelled());
  assert_eq!(pipeline.processing_count(), 0);
  assert_eq!(reactor.pending_len(), 0);

  done.lock().extend(neighborhood(ChunkPos::ZERO, 1));
  let again = pipeline.invoke_generator_task(ChunkPos::ZERO, fresh);
  assert!(!again.ptr_eq(&parked));
  assert!(again.wait_timeout(WAIT).expect("done").is_ok());
}

#[test]
fn test_shutdown_rejects_new_work() {
  let pipeline = pipeline(2).with_stage(passthrough("Only"));
  pipeline
    .invoke_generator_task(ChunkPos::ONE, fresh)
    .wait_timeout(WAIT)
    .expect("done")
    .expect("ok");

  pipeline.shutdown();
  let rejected = pipeline.invoke_generator_task(ChunkPos::ZERO, fresh);
  let error = rejected.wait_timeout(WAIT).expect("done").expect_err("rejected");
  assert!(matches!(*error, PipelineError::Rejected { .. }));
  assert!(!pipeline.is_position_processing(ChunkPos::ZERO));

  pipeline.restart().expect("restart after shutdown");
  assert!(pipeline
    .invoke_generator_task(ChunkPos::ZERO, fresh)
    .wait_timeout(WAIT)
    .expect("done")
    .is_ok());
}

#[test]
fn test_full_queue_rejects() {
  let config = PipelineConfig::DEFAULT.with_num_threads(1).with_queue_capacity(1);
  let pipeline = ChunkProcessingPipeline::new(config)
    .expect("pipeline")
    .with_stage(passthrough("Only"));
  let (release_tx, release_rx) = unbounded::<()>();

  let running = pipeline.invoke_generator_task(ChunkPos::ZERO, move |pos| {
    release_rx.recv_timeout(WAIT).ok();
    fresh(pos)
  });
  assert_eq!(pipeline.queued_len(), 0);
  let queued = pipeline.invoke_generator_task(ChunkPos::X, fresh);
  let rejected = pipeline.invoke_generator_task(ChunkPos::Y, fresh);

  let error = rejected.wait_timeout(WAIT).expect("done").expect_err("queue full");
  assert!(matches!(*error, PipelineError::Rejected { pos } if pos == ChunkPos::Y));

  release_tx.send(()).ok();
  assert!(running.wait_timeout(WAIT).expect("done").is_ok());
  assert!(queued.wait_timeout(WAIT).expect("done").is_ok());
}

#[test]
fn test_full_queue_never_rejects_admitted_chains() {
  let config = PipelineConfig::DEFAULT.with_num_threads(1).with_queue_capacity(4);
  let pipeline = ChunkProcessingPipeline::new(config)
    .expect("pipeline")
    .with_stage(passthrough("A"))
    .with_stage(passthrough("B"));

  // First generation runs at once, the other four fill the queue exactly.
  let futures: Vec<_> = (0..5)
    .map(|x| {
      pipeline.invoke_generator_task(ChunkPos::new(x, 0, 0), |pos| {
        std::thread::sleep(Duration::from_millis(20));
        fresh(pos)
      })
    })
    .collect();

  for future in &futures {
    let chunk = future.wait_timeout(WAIT).expect("done").expect("admitted chain completes");
    assert_eq!(chunk.position(), future.position());
  }
  assert_eq!(pipeline.processing_count(), 0);
}
