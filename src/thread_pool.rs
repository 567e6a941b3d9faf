//! Worker threads for work that should stay off the render thread.
//!
//! Tasks go through an unbounded channel to a fixed set of workers. Pausing
//! holds each worker before it runs its next task; stopping closes the
//! channel and joins every worker once the queue has drained.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::error::{RenderError, RenderResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PauseGate {
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl PauseGate {
    fn set(&self, paused: bool) {
        match self.paused.lock() {
            Ok(mut guard) => *guard = paused,
            Err(poisoned) => *poisoned.into_inner() = paused,
        }
        if !paused {
            self.resumed.notify_all();
        }
    }

    fn wait_while_paused(&self) {
        let guard = match self.paused.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _guard = self
            .resumed
            .wait_while(guard, |paused| *paused)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }
}

pub struct ThreadPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    gate: Arc<PauseGate>,
}

impl ThreadPool {
    /// Starts `thread_count` workers (at least one).
    pub fn new(thread_count: usize) -> RenderResult<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let gate = Arc::new(PauseGate::default());

        let mut workers = Vec::with_capacity(thread_count.max(1));
        for index in 0..thread_count.max(1) {
            let receiver: Receiver<Task> = receiver.clone();
            let gate = Arc::clone(&gate);
            let worker = thread::Builder::new()
                .name(format!("realware-worker-{index}"))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        gate.wait_while_paused();
                        task();
                    }
                })
                .map_err(|e| {
                    log::error!("Failed to spawn worker thread {}: {}", index, e);
                    RenderError::ResourceInitFailure(format!("worker thread: {e}"))
                })?;
            workers.push(worker);
        }
        log::debug!("Thread pool started with {} workers", workers.len());

        Ok(Self {
            sender: Some(sender),
            workers,
            gate,
        })
    }

    /// One worker per available core.
    pub fn with_available_parallelism() -> RenderResult<Self> {
        let count = thread::available_parallelism().map_or(1, |n| n.get());
        Self::new(count)
    }

    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> RenderResult<()> {
        let Some(sender) = &self.sender else {
            log::error!("Task submitted to a stopped thread pool");
            return Err(RenderError::WorkerPoolStopped);
        };
        sender.send(Box::new(task)).map_err(|_| {
            log::error!("Thread pool channel is closed");
            RenderError::WorkerPoolStopped
        })
    }

    /// Workers finish their current task and wait before running another.
    pub fn pause(&self) {
        self.gate.set(true);
    }

    pub fn resume(&self) {
        self.gate.set(false);
    }

    /// Runs every queued task, then joins the workers. Later submissions fail.
    pub fn stop(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        // Paused workers would never see the closed channel.
        self.gate.set(false);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Worker thread panicked");
            }
        }
        log::debug!("Thread pool stopped");
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.is_none()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_every_task_before_stopping() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new(3).unwrap();
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
        assert!(pool.is_stopped());
    }

    #[test]
    fn submit_after_stop_fails() {
        let mut pool = ThreadPool::new(1).unwrap();
        pool.stop();
        assert!(matches!(
            pool.submit(|| {}),
            Err(RenderError::WorkerPoolStopped)
        ));
    }

    #[test]
    fn paused_pool_holds_tasks_until_resumed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(2).unwrap();
        pool.pause();
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        pool.resume();
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
