use std::{
    thread::JoinHandle,
    time::{Duration, Instant},
};

use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool \"{pool}\" is full ({max_threads} threads)")]
    Full { pool: String, max_threads: usize },
    #[error("no worker named \"{0}\"")]
    UnknownWorker(String),
    #[error("worker \"{0}\" panicked")]
    Panicked(String),
    #[error("failed to spawn worker thread: {source}")]
    Spawn {
        #[from]
        source: std::io::Error,
    },
}

struct Worker {
    name: String,
    control: thread_control::Control,
    handle: JoinHandle<()>,
}

/// A fixed-size set of named, long-lived worker threads.
///
/// Each pipeline stage runs as one task for the whole recording. Asking for
/// more tasks than `max_threads` is an error rather than a silent backlog.
/// Every task receives a [thread_control::Flag] and should return once the
/// flag is no longer alive.
pub struct WorkerPool {
    name: String,
    max_threads: usize,
    workers: Vec<Worker>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("max_threads", &self.max_threads)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(name: &str, max_threads: usize) -> Self {
        Self {
            name: name.to_string(),
            max_threads,
            workers: Vec::new(),
        }
    }

    /// Start `task` on a new thread named `{pool}-{name}`.
    pub fn spawn<F>(&mut self, name: &str, task: F) -> Result<(), PoolError>
    where
        F: FnOnce(thread_control::Flag) + Send + 'static,
    {
        if self.active_count() >= self.max_threads {
            return Err(PoolError::Full {
                pool: self.name.clone(),
                max_threads: self.max_threads,
            });
        }
        let (flag, control) = thread_control::make_pair();
        let handle = std::thread::Builder::new()
            .name(format!("{}-{}", self.name, name))
            .spawn(move || task(flag))?;
        debug!("started worker {}-{}", self.name, name);
        self.workers.push(Worker {
            name: name.to_string(),
            control,
            handle,
        });
        Ok(())
    }

    /// Number of workers whose task has not yet returned.
    pub fn active_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| !w.control.is_done())
            .count()
    }

    /// Ask every worker called `name` to stop.
    pub fn stop_worker(&self, name: &str) -> Result<(), PoolError> {
        let mut found = false;
        for worker in self.workers.iter().filter(|w| w.name == name) {
            worker.control.stop();
            found = true;
        }
        if !found {
            return Err(PoolError::UnknownWorker(name.to_string()));
        }
        Ok(())
    }

    /// Ask every worker to stop.
    pub fn stop_all(&self) {
        for worker in self.workers.iter() {
            worker.control.stop();
        }
    }

    /// Wait up to `timeout` for every worker called `name` to return.
    ///
    /// Returns `false` if any is still running at the deadline.
    pub fn wait_for_done(&self, name: &str, timeout: Duration) -> Result<bool, PoolError> {
        let controls: Vec<&thread_control::Control> = self
            .workers
            .iter()
            .filter(|w| w.name == name)
            .map(|w| &w.control)
            .collect();
        if controls.is_empty() {
            return Err(PoolError::UnknownWorker(name.to_string()));
        }
        let deadline = Instant::now() + timeout;
        while !controls.iter().all(|c| c.is_done()) {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(true)
    }

    /// Wait for every worker called `name` to return.
    pub fn join_worker(&mut self, name: &str) -> Result<(), PoolError> {
        let (matching, rest): (Vec<Worker>, Vec<Worker>) =
            self.workers.drain(..).partition(|w| w.name == name);
        self.workers = rest;
        if matching.is_empty() {
            return Err(PoolError::UnknownWorker(name.to_string()));
        }
        join_workers(&self.name, matching)
    }

    /// Wait for every worker to return. All workers are joined even if one
    /// of them panicked; the first panic is reported.
    pub fn join_all(&mut self) -> Result<(), PoolError> {
        let workers: Vec<Worker> = self.workers.drain(..).collect();
        join_workers(&self.name, workers)
    }
}

fn join_workers(pool: &str, workers: Vec<Worker>) -> Result<(), PoolError> {
    let mut result = Ok(());
    for worker in workers {
        if worker.handle.join().is_err() && result.is_ok() {
            result = Err(PoolError::Panicked(format!("{}-{}", pool, worker.name)));
        }
        debug!("joined worker {}-{}", pool, worker.name);
    }
    result
}
