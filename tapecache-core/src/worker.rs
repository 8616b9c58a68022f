//! Background thread that runs every mutation of the topic caches.
//!
//! Jobs are closures sent over a channel. Blocking calls wait for the reply on a
//! bounded(1) channel; delayed jobs sit in a heap on the worker until they are due
//! or their [`ScheduledTask`] handle is cancelled.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use once_cell::sync::Lazy;

use crate::error::{Result, TapeError};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Schedule(Delayed),
    Shutdown,
}

struct Delayed {
    due: Instant,
    sequence: u64,
    done: Arc<AtomicBool>,
    job: Job,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // Reversed so the BinaryHeap pops the earliest job first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Handle to a delayed job.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    done: Arc<AtomicBool>,
}

impl ScheduledTask {
    /// Prevents the job from running. Returns false if it already ran or was cancelled.
    pub fn cancel(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    /// Whether the job ran or was cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

static SHARED: Lazy<Mutex<Weak<CacheWorker>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// Single background thread executing cache jobs in submission order.
pub struct CacheWorker {
    sender: Sender<Message>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    sequence: std::sync::atomic::AtomicU64,
}

impl CacheWorker {
    /// Worker shared by every cache in the process. The thread starts on first use
    /// and stops once the last handle is dropped.
    pub fn shared() -> Result<Arc<Self>> {
        let mut slot = SHARED.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = slot.upgrade() {
            return Ok(worker);
        }
        let worker = Arc::new(Self::spawn("tapecache-worker")?);
        *slot = Arc::downgrade(&worker);
        Ok(worker)
    }

    /// Starts a dedicated worker thread.
    pub fn spawn(name: &str) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&receiver))?;
        let thread_id = handle.thread().id();
        tracing::info!(worker = name, "started cache worker");
        Ok(Self {
            sender,
            thread: Mutex::new(Some(handle)),
            thread_id,
            sequence: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Whether the caller is running on this worker's thread.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Queues a job without waiting for it.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.sender
            .send(Message::Run(Box::new(job)))
            .map_err(|_| TapeError::WorkerStopped)
    }

    /// Runs `job` on the worker and waits for its result. Called from the worker
    /// itself, the job runs inline.
    pub fn call<R: Send + 'static>(&self, job: impl FnOnce() -> R + Send + 'static) -> Result<R> {
        if self.is_current() {
            return call_job(job);
        }
        let (reply, result) = bounded(1);
        self.execute(move || {
            let _ = reply.send(call_job(job));
        })?;
        result.recv().map_err(|_| TapeError::WorkerStopped)?
    }

    /// Runs `job` once `delay` has passed, unless the returned handle is cancelled first.
    pub fn schedule(
        &self,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<ScheduledTask> {
        let done = Arc::new(AtomicBool::new(false));
        let delayed = Delayed {
            due: Instant::now() + delay,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            done: Arc::clone(&done),
            job: Box::new(job),
        };
        self.sender
            .send(Message::Schedule(delayed))
            .map_err(|_| TapeError::WorkerStopped)?;
        Ok(ScheduledTask { done })
    }
}

impl Drop for CacheWorker {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
        let handle = self
            .thread
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Dropped from inside one of its own jobs: the loop exits after that job.
        if let Some(handle) = handle.filter(|_| !self.is_current()) {
            if handle.join().is_err() {
                tracing::error!("cache worker panicked");
            }
        }
        tracing::info!("stopped cache worker");
    }
}

impl std::fmt::Debug for CacheWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWorker")
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

fn call_job<R>(job: impl FnOnce() -> R) -> Result<R> {
    catch_unwind(AssertUnwindSafe(job)).map_err(|_| {
        tracing::error!("cache job panicked");
        TapeError::JobPanicked
    })
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("cache job panicked");
    }
}

fn run(receiver: &Receiver<Message>) {
    let mut delayed: BinaryHeap<Delayed> = BinaryHeap::new();
    loop {
        let now = Instant::now();
        while delayed.peek().is_some_and(|next| next.due <= now) {
            if let Some(task) = delayed.pop() {
                if !task.done.swap(true, Ordering::AcqRel) {
                    run_job(task.job);
                }
            }
        }
        delayed.retain(|task| !task.done.load(Ordering::Acquire));

        let message = match delayed.peek() {
            Some(next) => match receiver.recv_timeout(next.due.saturating_duration_since(now)) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => match receiver.recv() {
                Ok(message) => message,
                Err(_) => return,
            },
        };
        match message {
            Message::Run(job) => run_job(job),
            Message::Schedule(task) => delayed.push(task),
            Message::Shutdown => return,
        }
    }
}
