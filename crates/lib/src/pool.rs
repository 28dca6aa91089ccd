//! Fixed-size worker pool for fan-out work.
//!
//! `N` OS threads drain one shared FIFO queue. Jobs have no result channel:
//! a job that produces a value writes it to a caller-owned slot (for example
//! an indexed `Vec` behind a `parking_lot::Mutex`). Shutdown enqueues one
//! sentinel per worker, so every job scheduled before it still runs.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
  Run(Job),
  Shutdown,
}

/// A fixed-size pool of worker threads pulling from one FIFO queue.
///
/// `shutdown` consumes the pool, so nothing can be scheduled afterwards.
/// Dropping a pool without calling `shutdown` performs the same drain.
pub struct ConcurrencyPool {
  sender: Sender<Message>,
  workers: Vec<JoinHandle<()>>,
}

impl ConcurrencyPool {
  /// Start a pool with `size` workers. A size of zero is raised to one.
  ///
  /// Fails only if the OS refuses to spawn a thread; workers that did start
  /// are shut down again before the error is returned.
  pub fn new(size: usize) -> io::Result<Self> {
    let size = size.max(1);
    let (sender, receiver) = unbounded::<Message>();
    let mut pool = Self {
      sender,
      workers: Vec::with_capacity(size),
    };

    for index in 0..size {
      let receiver = receiver.clone();
      let handle = thread::Builder::new()
        .name(format!("stackwright-worker-{}", index))
        .spawn(move || worker_loop(index, receiver))?;
      pool.workers.push(handle);
    }

    debug!(size, "started concurrency pool");
    Ok(pool)
  }

  /// Number of worker threads.
  pub fn size(&self) -> usize {
    self.workers.len()
  }

  /// Enqueue a job. It runs on whichever worker becomes free first.
  pub fn schedule<F>(&self, job: F)
  where
    F: FnOnce() + Send + 'static,
  {
    // Receivers live as long as the workers, and workers only exit after a
    // sentinel, which is only sent once `self` is being consumed or dropped.
    if self.sender.send(Message::Run(Box::new(job))).is_err() {
      warn!("concurrency pool queue closed, job dropped");
    }
  }

  /// Drain the queue and wait for every worker to exit.
  pub fn shutdown(mut self) {
    self.stop();
  }

  fn stop(&mut self) {
    if self.workers.is_empty() {
      return;
    }

    for _ in 0..self.workers.len() {
      let _ = self.sender.send(Message::Shutdown);
    }

    for handle in self.workers.drain(..) {
      if handle.join().is_err() {
        warn!("pool worker exited abnormally");
      }
    }
    debug!("concurrency pool shut down");
  }
}

impl Drop for ConcurrencyPool {
  fn drop(&mut self) {
    self.stop();
  }
}

fn worker_loop(index: usize, receiver: Receiver<Message>) {
  while let Ok(message) = receiver.recv() {
    match message {
      Message::Run(job) => {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
          warn!(worker = index, "pool job panicked");
        }
      }
      Message::Shutdown => break,
    }
  }
}
