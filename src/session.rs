//! One sequential worker per live session key.
//!
//! Jobs submitted under the same key run one at a time in submission order;
//! different keys run on different threads. Ending a session drops its queue:
//! jobs that have not started complete with [`SessionError::Cancelled`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::SessionError;

type Job = Box<dyn FnOnce() + Send>;

struct Worker {
    queue: Sender<Job>,
    cancelled: Arc<AtomicBool>,
}

/// The eventual result of one submitted job.
pub struct Completion<T> {
    rx: Receiver<Result<T, SessionError>>,
}

impl<T> Completion<T> {
    fn failed(error: SessionError) -> Self {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(Err(error));
        Self { rx }
    }

    pub fn wait(self) -> Result<T, SessionError> {
        self.rx.recv().unwrap_or(Err(SessionError::Disconnected))
    }

    /// `None` if the job has not finished within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, SessionError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(SessionError::Disconnected)),
        }
    }

    pub fn try_take(&self) -> Option<Result<T, SessionError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(SessionError::Disconnected)),
        }
    }
}

pub struct SessionExecutors<K> {
    workers: Mutex<HashMap<K, Worker>>,
}

impl<K> Default for SessionExecutors<K> {
    fn default() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> SessionExecutors<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a worker for `key`. Returns `false` if one is already running.
    pub fn start(&self, key: K) -> std::io::Result<bool> {
        let mut workers = self.workers.lock();
        if workers.contains_key(&key) {
            return Ok(false);
        }
        let worker = spawn_worker(&key)?;
        debug!(session = ?key, "session started");
        workers.insert(key, worker);
        Ok(true)
    }

    /// Queues `job` on the session's worker, starting the session if needed.
    pub fn submit<T, F>(&self, key: K, job: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let mut workers = self.workers.lock();
        if !workers.contains_key(&key) {
            match spawn_worker(&key) {
                Ok(worker) => {
                    debug!(session = ?key, "session started");
                    workers.insert(key.clone(), worker);
                }
                Err(e) => {
                    warn!(session = ?key, error = %e, "failed to start session worker");
                    return Completion::failed(SessionError::Failed(e.to_string()));
                }
            }
        }
        let Some(worker) = workers.get(&key) else {
            return Completion::failed(SessionError::Disconnected);
        };

        let (tx, rx) = mpsc::channel();
        let cancelled = Arc::clone(&worker.cancelled);
        let wrapped: Job = Box::new(move || {
            if cancelled.load(Ordering::SeqCst) {
                let _ = tx.send(Err(SessionError::Cancelled));
                return;
            }
            let result = catch_unwind(AssertUnwindSafe(job))
                .map_err(|panic| SessionError::Failed(panic_message(panic.as_ref())));
            let _ = tx.send(result);
        });
        if worker.queue.send(wrapped).is_err() {
            return Completion::failed(SessionError::Disconnected);
        }
        Completion { rx }
    }

    /// Ends the session. A job already running finishes; queued jobs are
    /// cancelled. Returns `false` if the key had no session.
    pub fn end(&self, key: &K) -> bool {
        let Some(worker) = self.workers.lock().remove(key) else {
            return false;
        };
        worker.cancelled.store(true, Ordering::SeqCst);
        debug!(session = ?key, "session ended");
        true
    }

    pub fn active(&self) -> Vec<K> {
        self.workers.lock().keys().cloned().collect()
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.workers.lock().contains_key(key)
    }

    pub fn shutdown(&self) {
        let workers: Vec<(K, Worker)> = self.workers.lock().drain().collect();
        for (key, worker) in workers {
            worker.cancelled.store(true, Ordering::SeqCst);
            debug!(session = ?key, "session ended");
        }
    }
}

impl<K> Drop for SessionExecutors<K> {
    fn drop(&mut self) {
        for (_, worker) in self.workers.get_mut().drain() {
            worker.cancelled.store(true, Ordering::SeqCst);
        }
    }
}

fn spawn_worker<K: Debug>(key: &K) -> std::io::Result<Worker> {
    let (queue, jobs) = mpsc::channel::<Job>();
    thread::Builder::new()
        .name(format!("session-{key:?}"))
        .spawn(move || {
            for job in jobs {
                job();
            }
        })?;
    Ok(Worker {
        queue,
        cancelled: Arc::new(AtomicBool::new(false)),
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}
