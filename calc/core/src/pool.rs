//! Fixed-size worker pool for chunk closures.
//!
//! Work items are independent and stateless; a panicking job is contained
//! and logged without taking its worker down. The executed-job counter is
//! observable so tests can assert that cached results skip the pool.

use crossbeam_channel::{unbounded, Receiver, Sender};
use photon::logging::{self, Logger};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    injector: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    executed: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawns `size` worker threads (at least one).
    pub fn new(size: usize, log: &Logger) -> WorkerPool {
        let size = size.max(1);
        let (injector, feed) = unbounded::<Job>();
        let executed = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let feed: Receiver<Job> = feed.clone();
            let executed = Arc::clone(&executed);
            let log = log.new(logging::o!("worker" => index));
            let handle = thread::Builder::new()
                .name(format!("calc-worker-{}", index))
                .spawn(move || {
                    while let Ok(job) = feed.recv() {
                        executed.fetch_add(1, Ordering::SeqCst);
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            logging::error!(log, "job panicked");
                        }
                    }
                })
                .expect("worker thread spawn failed");
            workers.push(handle);
        }

        WorkerPool {
            injector: Some(injector),
            workers,
            executed,
        }
    }

    /// Pool sized to the host's logical processor count.
    pub fn with_host_size(log: &Logger) -> WorkerPool {
        WorkerPool::new(num_cpus::get(), log)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn submit(&self, job: Job) {
        if let Some(injector) = &self.injector {
            let _ = injector.send(job);
        }
    }

    /// Number of jobs the pool has picked up (panicked ones included).
    #[inline]
    pub fn executed_jobs(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// Shared handle to the executed-job counter, usable after the pool
    /// owner has moved to another thread.
    pub fn executed_probe(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.executed)
    }
}

impl Drop for WorkerPool {
    /// Disconnects the feed and waits for in-flight jobs to finish.
    fn drop(&mut self) {
        self.injector.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use photon::logging::{Discard, Logger};

    fn test_log() -> Logger {
        Logger::root(Discard, photon::logging::o!())
    }

    #[test]
    fn test_runs_submitted_jobs() {
        let pool = WorkerPool::new(4, &test_log());
        let (done_tx, done_rx) = unbounded();

        for value in 0..32 {
            let done_tx = done_tx.clone();
            pool.submit(Box::new(move || {
                let _ = done_tx.send(value);
            }));
        }

        let mut seen: Vec<i32> = (0..32).map(|_| done_rx.recv().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<i32>>());
    }

    #[test]
    fn test_counts_executed_jobs() {
        let pool = WorkerPool::new(2, &test_log());
        let probe = pool.executed_probe();

        for _ in 0..8 {
            pool.submit(Box::new(|| {}));
        }
        drop(pool); // joins workers, so every count landed
        assert_eq!(probe.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_survives_panicking_job() {
        let pool = WorkerPool::new(1, &test_log());
        let probe = pool.executed_probe();
        let (done_tx, done_rx) = unbounded();

        pool.submit(Box::new(|| panic!("deliberate")));
        pool.submit(Box::new(move || {
            let _ = done_tx.send(());
        }));

        done_rx.recv().unwrap();
        drop(pool);
        assert_eq!(probe.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_minimum_one_worker() {
        let pool = WorkerPool::new(0, &test_log());
        assert_eq!(pool.size(), 1);
    }
}
