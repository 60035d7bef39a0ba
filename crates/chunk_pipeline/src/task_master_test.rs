use super::*;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::{unbounded, Receiver};

use crate::config::WorkerPoolConfig;
use crate::task::{comparator_by_key, FnTask};

fn pool(threads: usize) -> Arc<WorkerPool> {
  Arc::new(WorkerPool::new(WorkerPoolConfig::new("tm-test", threads)).expect("pool builds"))
}

/// Task that blocks its slot until the returned sender fires (or is dropped).
fn gate(name: &str) -> (FnTask, crossbeam_channel::Sender<()>) {
  let (tx, rx): (_, Receiver<()>) = unbounded();
  let task = FnTask::new(name, move || {
    rx.recv_timeout(Duration::from_secs(5)).ok();
  });
  (task, tx)
}

fn wait_for(condition: impl Fn() -> bool) -> bool {
  let start = Instant::now();
  while start.elapsed() < Duration::from_secs(5) {
    if condition() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(1));
  }
  false
}

#[test]
fn test_invalid_limits() {
  let pool = pool(1);
  assert!(matches!(
    TaskMaster::<FnTask>::fifo("zero", 0, Arc::clone(&pool)),
    Err(TaskError::InvalidArgument(_))
  ));
  assert!(matches!(
    TaskMaster::<FnTask>::priority_natural("zero-cap", 1, 0, pool),
    Err(TaskError::InvalidArgument(_))
  ));
}

#[test]
fn test_at_most_n_concurrent() {
  let pool = pool(8);
  let master = TaskMaster::fifo("Limited", 3, pool).expect("master");
  let running = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));
  let finished = Arc::new(AtomicUsize::new(0));

  for i in 0..20 {
    let running = Arc::clone(&running);
    let peak = Arc::clone(&peak);
    let finished = Arc::clone(&finished);
    assert!(master.offer(FnTask::new(format!("task-{i}"), move || {
      let now = running.fetch_add(1, Ordering::SeqCst) + 1;
      peak.fetch_max(now, Ordering::SeqCst);
      std::thread::sleep(Duration::from_millis(5));
      running.fetch_sub(1, Ordering::SeqCst);
      finished.fetch_add(1, Ordering::SeqCst);
    })));
    assert!(master.active_count() <= 3);
  }

  assert!(wait_for(|| finished.load(Ordering::SeqCst) == 20));
  assert!(peak.load(Ordering::SeqCst) <= 3);
  assert!(peak.load(Ordering::SeqCst) >= 2);
}

#[test]
fn test_two_slot_fifo_waves() {
  let pool = pool(4);
  let master = TaskMaster::fifo("Waves", 2, pool).expect("master");
  let (tx, rx) = unbounded();

  let start = Instant::now();
  for i in 0..5 {
    let tx = tx.clone();
    assert!(master.offer(FnTask::new(format!("wave-{i}"), move || {
      std::thread::sleep(Duration::from_millis(50));
      tx.send((i, Instant::now())).ok();
    })));
  }

  let mut completions = Vec::new();
  for _ in 0..5 {
    completions.push(rx.recv_timeout(Duration::from_secs(5)).expect("task completed"));
  }
  let elapsed = start.elapsed();

  assert!(elapsed >= Duration::from_millis(140), "too fast: {elapsed:?}");
  assert!(elapsed < Duration::from_millis(400), "too slow: {elapsed:?}");

  // Two waves of two, then the last task alone.
  let mut first_wave: Vec<usize> = completions[..2].iter().map(|(i, _)| *i).collect();
  first_wave.sort_unstable();
  assert_eq!(first_wave, vec![0, 1]);
  assert_eq!(completions[4].0, 4);
}

#[test]
fn test_slot_names_label_threads() {
  let pool = pool(2);
  let master = TaskMaster::fifo("Chunk-Requests", 1, pool).expect("master");
  let (tx, rx) = unbounded();
  master.offer(FnTask::new("label", move || {
    tx.send(crate::worker_pool::current_thread_label()).ok();
  }));
  assert_eq!(
    rx.recv_timeout(Duration::from_secs(5)).expect("ran"),
    "Chunk-Requests-0"
  );
  assert_eq!(master.name(), "Chunk-Requests");
  assert_eq!(master.submit_limit(), 1);
}

#[test]
fn test_priority_order() {
  let pool = pool(2);
  let master = TaskMaster::priority_natural("Prio", 1, 16, pool).expect("master");
  let (blocker, release) = gate("blocker");
  assert!(master.offer(blocker));

  let (tx, rx) = unbounded();
  for priority in [5i64, 1, 3, 1, 4] {
    let tx = tx.clone();
    master.offer(FnTask::new(format!("p{priority}"), move || {
      tx.send(priority).ok();
    })
    .with_priority(priority));
  }
  assert_eq!(master.queued_len(), 5);
  release.send(()).ok();

  let order: Vec<i64> = (0..5)
    .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("ran"))
    .collect();
  assert_eq!(order, vec![1, 1, 3, 4, 5]);
}

#[test]
fn test_dynamic_reprioritize() {
  let pool = pool(2);
  let ranks: Arc<parking_lot::Mutex<HashMap<String, i64>>> = Arc::default();
  let table = Arc::clone(&ranks);
  let comparator = comparator_by_key(move |task: &FnTask| {
    table.lock().get(task.name()).copied().unwrap_or(i64::MAX)
  });
  let master = TaskMaster::dynamic_priority("Dynamic", 1, 16, comparator, pool).expect("master");

  let (blocker, release) = gate("blocker");
  ranks.lock().insert("blocker".into(), 0);
  assert!(master.offer(blocker));

  let (tx, rx) = unbounded();
  for (name, rank) in [("near", 1), ("mid", 2), ("far", 3)] {
    ranks.lock().insert(name.into(), rank);
    let tx = tx.clone();
    master.offer(FnTask::new(name, move || {
      tx.send(name).ok();
    }));
  }

  // Viewer moved: "far" is now the closest.
  ranks.lock().insert("far".into(), -1);
  master.reprioritize();
  release.send(()).ok();

  let order: Vec<&str> = (0..3)
    .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("ran"))
    .collect();
  assert_eq!(order, vec!["far", "near", "mid"]);
}

#[test]
fn test_terminate_signal_never_runs() {
  let pool = pool(2);
  let master = TaskMaster::fifo("Sentinel", 1, pool).expect("master");
  let (blocker, release) = gate("blocker");
  master.offer(blocker);
  master.offer(FnTask::terminate("exit"));

  let ran = Arc::new(AtomicBool::new(false));
  let flag = Arc::clone(&ran);
  master.offer(FnTask::new("after", move || flag.store(true, Ordering::SeqCst)));
  release.send(()).ok();

  assert!(wait_for(|| ran.load(Ordering::SeqCst)));
  assert_eq!(master.queued_len(), 0);
}

#[test]
fn test_put_timeout_on_full_queue() {
  let pool = pool(2);
  let master = TaskMaster::priority_natural("Full", 1, 1, pool).expect("master");
  let (blocker, release) = gate("blocker");
  master.offer(blocker);
  assert!(master.offer(FnTask::new("queued", || {})));
  assert!(!master.offer(FnTask::new("rejected", || {})));

  let result = master.put_timeout(FnTask::new("late", || {}), Duration::from_millis(20));
  assert_eq!(result, Err(TaskError::QueueFull));

  release.send(()).ok();
  assert!(master
    .put_timeout(FnTask::new("fits", || {}), Duration::from_secs(5))
    .is_ok());
}

#[test]
fn test_requeue_ignores_capacity() {
  let pool = pool(2);
  let master = TaskMaster::priority_natural("Follow-up", 1, 1, pool).expect("master");
  let (blocker, release) = gate("blocker");
  master.offer(blocker);
  assert!(master.offer(FnTask::new("queued", || {})));
  assert!(!master.offer(FnTask::new("rejected", || {})));

  let ran = Arc::new(AtomicBool::new(false));
  let flag = Arc::clone(&ran);
  assert!(master.requeue(FnTask::new("continuation", move || flag.store(true, Ordering::SeqCst))));
  assert_eq!(master.queued_len(), 2);

  release.send(()).ok();
  assert!(wait_for(|| ran.load(Ordering::SeqCst)));

  // Like `offer`, a stopped master holds follow-up work until restart.
  master.shutdown(Duration::from_secs(5), true);
  assert!(master.requeue(FnTask::new("held", || {})));
  assert_eq!(master.queued_len(), 1);
}

#[test]
fn test_put_interrupted_by_shutdown() {
  let pool = pool(2);
  let master = Arc::new(TaskMaster::priority_natural("Interrupt", 1, 1, pool).expect("master"));
  let (blocker, release) = gate("blocker");
  master.offer(blocker);
  master.offer(FnTask::new("queued", || {}));

  let putter = {
    let master = Arc::clone(&master);
    std::thread::spawn(move || master.put(FnTask::new("blocked", || {})))
  };
  std::thread::sleep(Duration::from_millis(20));

  let stopper = {
    let master = Arc::clone(&master);
    std::thread::spawn(move || master.shutdown(Duration::from_secs(5), true))
  };
  let result = putter.join().expect("putter thread");
  assert_eq!(result, Err(TaskError::Interrupted));

  release.send(()).ok();
  stopper.join().expect("stopper thread");
  assert!(!master.is_running());
}

#[test]
fn test_shutdown_drains_queue_within_bound() {
  let pool = pool(4);
  let master = TaskMaster::fifo("Drain", 2, pool).expect("master");
  let finished = Arc::new(AtomicUsize::new(0));

  // Six tasks of 25 ms on two slots: ~75 ms of work against a 200 ms bound.
  for i in 0..6 {
    let finished = Arc::clone(&finished);
    master.offer(FnTask::new(format!("drain-{i}"), move || {
      std::thread::sleep(Duration::from_millis(25));
      finished.fetch_add(1, Ordering::SeqCst);
    }));
  }

  let start = Instant::now();
  master.shutdown(Duration::from_millis(200), false);
  assert!(start.elapsed() < Duration::from_millis(200));
  assert_eq!(finished.load(Ordering::SeqCst), 6);
  assert_eq!(master.active_count(), 0);

  // Stopped masters hold new work until restart.
  assert!(master.offer(FnTask::new("held", || {})));
  assert_eq!(master.queued_len(), 1);
}

#[test]
fn test_shutdown_times_out_on_slow_tasks() {
  let pool = pool(2);
  let master = TaskMaster::fifo("Slow", 1, pool).expect("master");
  master.offer(FnTask::new("slow", || {
    std::thread::sleep(Duration::from_millis(400));
  }));
  std::thread::sleep(Duration::from_millis(10));

  let start = Instant::now();
  master.shutdown(Duration::from_millis(100), false);
  let elapsed = start.elapsed();
  assert!(elapsed >= Duration::from_millis(95));
  assert!(elapsed < Duration::from_millis(300), "shutdown overran: {elapsed:?}");
}

#[test]
fn test_scheduled_only_discards_queue() {
  let pool = pool(2);
  let master = TaskMaster::fifo("Discard", 1, pool).expect("master");
  let (blocker, release) = gate("blocker");
  master.offer(blocker);

  let ran = Arc::new(AtomicUsize::new(0));
  for _ in 0..3 {
    let ran = Arc::clone(&ran);
    master.offer(FnTask::new("queued", move || {
      ran.fetch_add(1, Ordering::SeqCst);
    }));
  }
  release.send(()).ok();
  master.shutdown(Duration::from_secs(5), true);

  assert_eq!(master.queued_len(), 0);
  std::thread::sleep(Duration::from_millis(20));
  assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_restart_is_idempotent() {
  let pool = pool(4);
  let master = TaskMaster::fifo("Restart", 2, pool).expect("master");

  // Restart on a running master must not mint extra slots.
  master.restart();
  master.restart();

  let running = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));
  let finished = Arc::new(AtomicUsize::new(0));
  let spawn = |master: &TaskMaster<FnTask>| {
    for _ in 0..6 {
      let running = Arc::clone(&running);
      let peak = Arc::clone(&peak);
      let finished = Arc::clone(&finished);
      master.offer(FnTask::new("work", move || {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        running.fetch_sub(1, Ordering::SeqCst);
        finished.fetch_add(1, Ordering::SeqCst);
      }));
    }
  };

  spawn(&master);
  assert!(wait_for(|| finished.load(Ordering::SeqCst) == 6));

  master.shutdown(Duration::from_secs(5), false);
  assert!(!master.is_running());

  // Held while stopped, dispatched on restart.
  spawn(&master);
  std::thread::sleep(Duration::from_millis(20));
  assert_eq!(finished.load(Ordering::SeqCst), 6);
  master.restart();
  master.restart();
  assert!(master.is_running());

  assert!(wait_for(|| finished.load(Ordering::SeqCst) == 12));
  assert!(peak.load(Ordering::SeqCst) <= 2);
}
