use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::thread::JoinHandle;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of worker threads draining a job channel. One pool exists
/// per kind of background work (compact, check, view-map, view-reduce);
/// closing the channel is the shutdown signal.
pub(crate) struct Pool {
    name: &'static str,
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    pub fn new(name: &'static str, size: usize) -> Pool {
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..size.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            job();
                        }
                    })
                    .expect("spawning pool worker")
            })
            .collect();
        Pool {
            name,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job. After shutdown the job is silently dropped; background
    /// work has nowhere to report to once the engine is closing.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Box::new(job));
        }
    }

    /// Close the channel and join every worker. Queued jobs run to
    /// completion first.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        debug!(pool = self.name, workers = workers.len(), "draining pool");
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn jobs_run_and_shutdown_drains() {
        let pool = Pool::new("test", 2);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let hits = hits.clone();
            pool.spawn(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn spawn_after_shutdown_is_dropped() {
        let pool = Pool::new("test", 1);
        pool.shutdown();
        pool.spawn(|| panic!("must not run"));
    }
}
