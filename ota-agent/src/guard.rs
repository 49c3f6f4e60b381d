//! Makes sure at most one update runs at a time.

use std::{
    io,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, info};

use crate::{
    error::UpdateError, orchestrator::UpdateAgent, restart::Restart, storage::Storage,
    transport::Transport,
};

pub const WORKER_THREAD_NAME: &str = "ota-update";

type Worker = JoinHandle<Result<(), UpdateError>>;

/// Answer to [`UpdateGuard::request_update`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requested {
    /// A worker was started for the request.
    Accepted,
    /// Another update is in progress; the request was dropped.
    AlreadyRunning,
}

/// Starts updates on a background worker thread, refusing new requests while one
/// is in progress. Requests are never queued.
pub struct UpdateGuard<T, S, R> {
    agent: Arc<UpdateAgent<T, S, R>>,
    in_progress: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
}

impl<T, S, R> UpdateGuard<T, S, R>
where
    T: Transport,
    S: Storage,
    R: Restart,
{
    pub fn new(agent: UpdateAgent<T, S, R>) -> Self {
        Self {
            agent: Arc::new(agent),
            in_progress: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn agent(&self) -> &UpdateAgent<T, S, R> {
        &self.agent
    }

    /// Starts an update from `url`, or from the configured default URL if `url` is
    /// `None` or empty. Returns without waiting for the update.
    ///
    /// The in-progress flag stays set after an update that requested a restart, so
    /// nothing else is started while the device goes down.
    pub fn request_update(&self, url: Option<&str>) -> io::Result<Requested> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("update already in progress, ignoring request");
            return Ok(Requested::AlreadyRunning);
        }
        let flag = InProgress::new(Arc::clone(&self.in_progress));
        let url = self.agent.resolve_url(url);
        let agent = Arc::clone(&self.agent);

        // Held across the spawn so handles are stored in the order workers started.
        let mut worker = lock(&self.worker);
        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || {
                let mut flag = flag;
                let result = agent.run(&url);
                if result.is_ok() {
                    flag.keep();
                }
                result
            });
        match spawned {
            Ok(handle) => {
                debug!("spawned update worker");
                *worker = Some(handle);
                Ok(Requested::Accepted)
            }
            Err(err) => {
                self.in_progress.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Whether an update is in progress or has requested a restart.
    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Waits for the most recently started worker. `None` if there is none left to
    /// wait for; `Some(Err(_))` if the worker panicked.
    pub fn wait(&self) -> Option<thread::Result<Result<(), UpdateError>>> {
        let handle = lock(&self.worker).take()?;
        Some(handle.join())
    }
}

/// Clears the in-progress flag when dropped, which includes a worker unwinding.
struct InProgress {
    flag: Arc<AtomicBool>,
    keep: bool,
}

impl InProgress {
    fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag, keep: false }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        if !self.keep {
            self.flag.store(false, Ordering::Release);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
