//! Single-writer queue.
//!
//! One worker thread owns the [`StateManager`] and runs submitted jobs one at
//! a time in FIFO order, each to completion (including its commit) before
//! the next is dequeued. The channel is bounded so a saturated writer pushes
//! back on callers instead of letting them contend on the store lock.

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Result, StateError};
use crate::manager::StateManager;

type Job = Box<dyn FnOnce(&mut StateManager) + Send>;

/// Handle to the result of an enqueued job.
#[must_use = "a ticket must be waited on to observe the job's result"]
pub struct Ticket<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Ticket<T> {
    /// Block until the job has run.
    ///
    /// # Errors
    ///
    /// The job's own error, or [`StateError::QueueClosed`] if the worker
    /// exited without running it.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().map_err(|_| StateError::QueueClosed)?
    }
}

pub struct WriteQueue {
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<StateManager>>,
    capacity: usize,
}

impl WriteQueue {
    /// Move `manager` onto a dedicated worker thread. Capacity comes from
    /// the manager's `[queue]` config.
    ///
    /// # Errors
    ///
    /// [`StateError::Internal`] if the thread cannot be spawned.
    pub fn start(manager: StateManager) -> Result<Self> {
        let capacity = manager.config().queue.capacity.max(1);
        let (tx, rx) = channel::bounded::<Job>(capacity);
        let worker = std::thread::Builder::new()
            .name("lockstep-writer".to_string())
            .spawn(move || run_worker(manager, &rx))
            .map_err(|err| StateError::Internal(format!("spawn writer thread: {err}")))?;
        info!(capacity, "write queue started");
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            capacity,
        })
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs waiting to be dequeued.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tx.as_ref().map_or(0, Sender::len)
    }

    /// Enqueue `work`, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// [`StateError::QueueClosed`] after shutdown.
    pub fn enqueue<T, F>(&self, work: F) -> Result<Ticket<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut StateManager) -> Result<T> + Send + 'static,
    {
        let (job, ticket) = package(work, None);
        self.sender()?
            .send(job)
            .map_err(|_| StateError::QueueClosed)?;
        Ok(ticket)
    }

    /// Enqueue `work` without blocking.
    ///
    /// # Errors
    ///
    /// [`StateError::QueueFull`] when saturated, [`StateError::QueueClosed`]
    /// after shutdown.
    pub fn try_enqueue<T, F>(&self, work: F) -> Result<Ticket<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut StateManager) -> Result<T> + Send + 'static,
    {
        let (job, ticket) = package(work, None);
        match self.sender()?.try_send(job) {
            Ok(()) => Ok(ticket),
            Err(TrySendError::Full(_)) => Err(StateError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(StateError::QueueClosed),
        }
    }

    /// Run `work` on the writer and wait for its result.
    ///
    /// # Errors
    ///
    /// See [`WriteQueue::enqueue`] and [`Ticket::wait`].
    pub fn submit<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StateManager) -> Result<T> + Send + 'static,
    {
        self.enqueue(work)?.wait()
    }

    /// [`WriteQueue::submit`] that fails fast with
    /// [`StateError::QueueFull`] instead of blocking.
    ///
    /// # Errors
    ///
    /// See [`WriteQueue::try_enqueue`] and [`Ticket::wait`].
    pub fn try_submit<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StateManager) -> Result<T> + Send + 'static,
    {
        self.try_enqueue(work)?.wait()
    }

    /// Run `work` with a wall-clock budget covering queueing and execution.
    ///
    /// The budget becomes the transaction deadline, so a unit that overruns
    /// rolls back before the result is returned. A job still queued when the
    /// budget runs out is never started.
    ///
    /// # Errors
    ///
    /// [`StateError::DeadlineExceeded`] if the job could not be enqueued or
    /// started in time, or [`StateError::TransactionFailed`] wrapping it if
    /// the deadline passed mid-unit.
    pub fn submit_timeout<T, F>(&self, timeout: Duration, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StateManager) -> Result<T> + Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        let (job, ticket) = package(work, Some(deadline));
        match self.sender()?.send_timeout(job, timeout) {
            Ok(()) => ticket.wait(),
            Err(SendTimeoutError::Timeout(_)) => Err(StateError::DeadlineExceeded("enqueue")),
            Err(SendTimeoutError::Disconnected(_)) => Err(StateError::QueueClosed),
        }
    }

    /// Stop accepting jobs, drain what is queued, and hand the manager back.
    ///
    /// # Errors
    ///
    /// [`StateError::Internal`] if the worker thread panicked.
    pub fn shutdown(mut self) -> Result<StateManager> {
        self.tx.take();
        let worker = self.worker.take().ok_or(StateError::QueueClosed)?;
        worker
            .join()
            .map_err(|_| StateError::Internal("writer thread panicked".to_string()))
    }

    fn sender(&self) -> Result<&Sender<Job>> {
        self.tx.as_ref().ok_or(StateError::QueueClosed)
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("writer thread panicked");
            }
        }
    }
}

fn package<T, F>(work: F, deadline: Option<Instant>) -> (Job, Ticket<T>)
where
    T: Send + 'static,
    F: FnOnce(&mut StateManager) -> Result<T> + Send + 'static,
{
    let (respond, rx) = channel::bounded(1);
    let job: Job = Box::new(move |manager: &mut StateManager| {
        let result = match deadline {
            Some(deadline) if Instant::now() >= deadline => {
                debug!("job expired in queue; not started");
                Err(StateError::DeadlineExceeded("dequeue"))
            }
            _ => {
                manager.set_deadline(deadline);
                let result = work(manager);
                manager.set_deadline(None);
                result
            }
        };
        if respond.send(result).is_err() {
            debug!("caller dropped its ticket");
        }
    });
    (job, Ticket { rx })
}

fn run_worker(mut manager: StateManager, rx: &Receiver<Job>) -> StateManager {
    let mut processed = 0_u64;
    for job in rx {
        job(&mut manager);
        processed += 1;
    }
    info!(processed, "write queue drained");
    manager
}
