//! Small fixed-size job pool backing the processor's parallel mode.
//!
//! Submission is non-blocking: a saturated queue rejects the job and the
//! caller decides (the processor falls back to running inline).

use crossbeam_channel::{bounded, Sender, TrySendError};
use std::thread;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    threads: usize,
}

impl WorkerPool {
    /// Spawn `threads` named workers draining a queue of `capacity` jobs.
    pub fn new(threads: usize, capacity: usize, name: &str) -> Self {
        let (tx, rx) = bounded::<Job>(capacity);
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn worker");
            handles.push(handle);
        }
        debug!(threads, capacity, name, "worker pool started");
        WorkerPool {
            tx: Some(tx),
            handles,
            threads,
        }
    }

    /// Try to enqueue a job. `false` means the queue was full or the pool
    /// is shutting down; the job is returned to the caller unexecuted.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(Box::new(job)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends every worker's recv loop.
        drop(self.tx.take());
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
