//! Fixed-size worker pool over a single FIFO task queue.
//!
//! Workers are OS threads that pop tasks from the front of a shared queue.
//! One mutex guards the queue, the lifecycle state and the worker handles; a
//! condition variable signals that work arrived or that the pool is closing,
//! a second one that the workers have been joined.
//!
//! Shutdown closes the queue instead of pushing sentinel tasks: workers keep
//! draining queued work and exit once the pool is closing and the queue is
//! empty. Every task owns the sending half of a one-shot channel. A task that
//! is dropped without running (cancelled, or still queued when the pool goes
//! away) sends [`TaskError::Cancelled`] from its destructor.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::HbstError;

/// Outcome of a task that did not produce a value.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task panicked while running on a worker.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The task was removed from the queue before a worker picked it up.
    #[error("task was cancelled before it started")]
    Cancelled,
    /// The task was submitted after the pool began shutting down.
    #[error("worker pool is shut down")]
    PoolStopped,
    /// The caller stopped waiting before the task finished.
    #[error("timed out waiting for the task result")]
    Timeout,
}

/// Lifecycle of a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

type Job = Box<dyn Runnable>;

trait Runnable: Send {
    fn run(self: Box<Self>);
}

/// A queued closure together with the sender its outcome goes to.
struct PendingTask<F, R> {
    task: Option<F>,
    sender: Sender<Result<R, TaskError>>,
}

impl<F, R> Runnable for PendingTask<F, R>
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    fn run(mut self: Box<Self>) {
        let Some(task) = self.task.take() else {
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(task))
            .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));
        if let Err(TaskError::Panicked(message)) = &outcome {
            debug!(%message, "task panicked");
        }
        // The caller may have dropped the handle; nobody is left to tell.
        let _ = self.sender.try_send(outcome);
    }
}

impl<F, R> Drop for PendingTask<F, R> {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.sender.try_send(Err(TaskError::Cancelled));
        }
    }
}

struct Queue {
    tasks: VecDeque<Job>,
    state: PoolState,
    workers: Vec<JoinHandle<()>>,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    stopped: Condvar,
}

/// Handle through which the outcome of a submitted task is observed.
#[must_use = "a task outcome is only observable through its handle"]
pub struct TaskHandle<R> {
    receiver: Receiver<Result<R, TaskError>>,
}

impl<R> TaskHandle<R> {
    fn resolved(outcome: Result<R, TaskError>) -> Self {
        let (sender, receiver) = channel::bounded(1);
        // The receiver is alive, so the send cannot fail.
        let _ = sender.send(outcome);
        Self { receiver }
    }

    /// Block until the task has finished, failed or been cancelled.
    pub fn wait(self) -> Result<R, TaskError> {
        self.receiver.recv().unwrap_or(Err(TaskError::Cancelled))
    }

    /// Like [`TaskHandle::wait`], giving up after `timeout`.
    ///
    /// The task itself keeps running; only its outcome is discarded.
    pub fn wait_timeout(self, timeout: Duration) -> Result<R, TaskError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(TaskError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TaskError::Cancelled),
        }
    }

    /// Whether [`TaskHandle::wait`] would return without blocking.
    pub fn is_ready(&self) -> bool {
        !self.receiver.is_empty()
    }
}

/// A fixed set of background workers consuming one FIFO queue.
pub struct WorkerPool {
    worker_count: usize,
    stack_size: Option<usize>,
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Create a pool of `worker_count` workers. No thread is spawned until
    /// [`WorkerPool::start`].
    pub fn new(worker_count: usize) -> Result<Self, HbstError> {
        if worker_count == 0 {
            return Err(HbstError::InvalidConfig(
                "worker pool needs at least one worker",
            ));
        }
        Ok(Self {
            worker_count,
            stack_size: None,
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    tasks: VecDeque::new(),
                    state: PoolState::NotStarted,
                    workers: Vec::with_capacity(worker_count),
                }),
                available: Condvar::new(),
                stopped: Condvar::new(),
            }),
        })
    }

    /// Stack size, in bytes, of the worker threads spawned by `start`.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Configured number of workers.
    pub fn size(&self) -> usize {
        self.worker_count
    }

    pub fn state(&self) -> PoolState {
        self.shared.queue.lock().state
    }

    /// Number of tasks waiting for a worker.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Number of worker threads that have been spawned and not yet joined.
    pub fn worker_threads(&self) -> usize {
        self.shared.queue.lock().workers.len()
    }

    /// Spawn the workers. Tasks submitted before this call start running now.
    ///
    /// If a worker cannot be spawned, the workers already running are
    /// finished and the pool ends up `Stopped`.
    pub fn start(&self) -> Result<(), HbstError> {
        let mut queue = self.shared.queue.lock();
        match queue.state {
            PoolState::NotStarted => {}
            PoolState::Running => return Err(HbstError::Pool("pool is already running")),
            PoolState::Stopping | PoolState::Stopped => {
                return Err(HbstError::Pool("pool has been shut down"))
            }
        }

        // Workers block on the queue lock until it is released below, so the
        // state is already `Running` when they first look at it.
        queue.state = PoolState::Running;
        for worker in 0..self.worker_count {
            let shared = Arc::clone(&self.shared);
            let mut builder = thread::Builder::new().name(format!("hbst-worker-{worker}"));
            if let Some(bytes) = self.stack_size {
                builder = builder.stack_size(bytes);
            }
            let handle = builder.spawn(move || worker_loop(&shared, worker));
            match handle {
                Ok(handle) => queue.workers.push(handle),
                Err(err) => {
                    warn!(
                        worker,
                        spawned = queue.workers.len(),
                        "failed to spawn worker thread: {err}"
                    );
                    drop(queue);
                    self.finish();
                    return Err(err.into());
                }
            }
        }
        let pending = queue.tasks.len();
        drop(queue);

        self.shared.available.notify_all();
        info!(workers = self.worker_count, pending, "worker pool started");
        Ok(())
    }

    /// Queue `task` and return a handle to its outcome.
    ///
    /// A panic inside the task is captured and delivered through the handle.
    pub fn submit<F, R>(&self, task: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        if matches!(queue.state, PoolState::Stopping | PoolState::Stopped) {
            return TaskHandle::resolved(Err(TaskError::PoolStopped));
        }

        let (sender, receiver) = channel::bounded(1);
        queue.tasks.push_back(Box::new(PendingTask {
            task: Some(task),
            sender,
        }));
        drop(queue);

        self.shared.available.notify_one();
        TaskHandle { receiver }
    }

    /// Discard every queued task that has not started yet.
    ///
    /// The handles of discarded tasks resolve with [`TaskError::Cancelled`].
    /// Returns the number of discarded tasks.
    pub fn cancel_pending(&self) -> usize {
        let cancelled = std::mem::take(&mut self.shared.queue.lock().tasks);
        let count = cancelled.len();
        // Dropped outside the lock: each task reports its cancellation.
        drop(cancelled);
        if count > 0 {
            debug!(count, "cancelled pending tasks");
        }
        count
    }

    /// Close the queue, let the workers drain it and join them.
    ///
    /// Does nothing if the pool was never started or is already finished.
    /// A caller that arrives while another one is joining the workers
    /// blocks until the pool is `Stopped`.
    pub fn finish(&self) {
        let workers = {
            let mut queue = self.shared.queue.lock();
            match queue.state {
                PoolState::NotStarted | PoolState::Stopped => return,
                PoolState::Stopping => {
                    while queue.state != PoolState::Stopped {
                        self.shared.stopped.wait(&mut queue);
                    }
                    return;
                }
                PoolState::Running => {}
            }
            queue.state = PoolState::Stopping;
            std::mem::take(&mut queue.workers)
        };
        self.shared.available.notify_all();

        let count = workers.len();
        for handle in workers {
            if handle.join().is_err() {
                warn!("worker thread terminated abnormally");
            }
        }

        // Only a pool whose workers failed to spawn can still hold tasks here.
        let leftover = {
            let mut queue = self.shared.queue.lock();
            queue.state = PoolState::Stopped;
            std::mem::take(&mut queue.tasks)
        };
        drop(leftover);
        self.shared.stopped.notify_all();
        info!(workers = count, "worker pool finished");
    }

    /// Cancel pending tasks, then finish.
    pub fn abort(&self) {
        self.cancel_pending();
        self.finish();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.shared.queue.lock();
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field("stack_size", &self.stack_size)
            .field("state", &queue.state)
            .field("pending", &queue.tasks.len())
            .finish()
    }
}

fn worker_loop(shared: &Shared, worker: usize) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.tasks.pop_front() {
                    break job;
                }
                if queue.state != PoolState::Running {
                    debug!(worker, "worker exiting");
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };
        job.run();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Start a task that blocks its worker until the returned sender fires,
    /// and wait until a worker has actually picked it up.
    fn occupy_worker(pool: &WorkerPool) -> (channel::Sender<()>, TaskHandle<()>) {
        let (started_tx, started_rx) = channel::bounded(1);
        let (release_tx, release_rx) = channel::bounded::<()>(1);
        let handle = pool.submit(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        started_rx.recv().unwrap();
        (release_tx, handle)
    }

    #[test]
    fn results_flow_through_handles() {
        let pool = WorkerPool::new(2).unwrap();
        pool.start().unwrap();

        let handle = pool.submit(|| 21 * 2);
        assert_eq!(handle.wait(), Ok(42));
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.worker_threads(), 2);
    }

    #[test]
    fn single_worker_completes_tasks_in_submission_order() {
        let pool = WorkerPool::new(1).unwrap();
        pool.start().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let order = Arc::clone(&order);
                pool.submit(move || order.lock().push(i))
            })
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }

        assert_eq!(*order.lock(), (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn tasks_queued_before_start_run_after_start() {
        let pool = WorkerPool::new(3).unwrap();
        let handle = pool.submit(|| "queued");
        assert_eq!(pool.pending(), 1);
        assert!(!handle.is_ready());

        pool.start().unwrap();
        assert_eq!(handle.wait(), Ok("queued"));
    }

    #[test]
    fn panics_are_delivered_to_the_handle() {
        let pool = WorkerPool::new(1).unwrap();
        pool.start().unwrap();

        let failed = pool.submit(|| -> u32 { panic!("slice exploded") });
        match failed.wait() {
            Err(TaskError::Panicked(message)) => assert!(message.contains("slice exploded")),
            other => panic!("expected a captured panic, got {other:?}"),
        }

        // The worker survives the panic.
        assert_eq!(pool.submit(|| 7).wait(), Ok(7));
    }

    #[test]
    fn finish_is_idempotent_and_joins_every_worker() {
        let pool = WorkerPool::new(4).unwrap();
        pool.start().unwrap();
        assert_eq!(pool.state(), PoolState::Running);

        pool.finish();
        pool.finish();

        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(pool.worker_threads(), 0);
    }

    #[test]
    fn finish_without_start_is_a_no_op() {
        let pool = WorkerPool::new(2).unwrap();
        pool.finish();
        assert_eq!(pool.state(), PoolState::NotStarted);

        pool.start().unwrap();
        assert_eq!(pool.submit(|| 1).wait(), Ok(1));
    }

    #[test]
    fn finish_drains_queued_work() {
        let pool = WorkerPool::new(1).unwrap();
        pool.start().unwrap();
        let (release, blocker) = occupy_worker(&pool);

        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.submit(move || counter.fetch_add(1, Ordering::SeqCst))
            })
            .collect();

        release.send(()).unwrap();
        pool.finish();

        blocker.wait().unwrap();
        for handle in handles {
            assert!(handle.wait().is_ok());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancelled_tasks_never_run_and_resolve_as_cancelled() {
        let pool = WorkerPool::new(1).unwrap();
        pool.start().unwrap();
        let (release, blocker) = occupy_worker(&pool);

        let counter = Arc::new(AtomicUsize::new(0));
        let cancelled: Vec<_> = (0..5)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.submit(move || counter.fetch_add(1, Ordering::SeqCst))
            })
            .collect();

        assert_eq!(pool.cancel_pending(), 5);

        let survivor = {
            let counter = Arc::clone(&counter);
            pool.submit(move || counter.fetch_add(100, Ordering::SeqCst))
        };
        release.send(()).unwrap();

        blocker.wait().unwrap();
        survivor.wait().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        for handle in cancelled {
            assert_eq!(handle.wait(), Err(TaskError::Cancelled));
        }
    }

    #[test]
    fn abort_discards_queued_work() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        pool.start().unwrap();
        let (release, blocker) = occupy_worker(&pool);

        let queued: Vec<_> = (0..3).map(|i| pool.submit(move || i)).collect();

        // Unblock the worker only once abort has emptied the queue.
        let watcher = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                while pool.pending() > 0 {
                    thread::sleep(Duration::from_millis(1));
                }
                release.send(()).unwrap();
            })
        };
        pool.abort();
        watcher.join().unwrap();

        blocker.wait().unwrap();
        for handle in queued {
            assert_eq!(handle.wait(), Err(TaskError::Cancelled));
        }
        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[test]
    fn submitting_to_a_finished_pool_fails_fast() {
        let pool = WorkerPool::new(2).unwrap();
        pool.start().unwrap();
        pool.finish();

        let handle = pool.submit(|| 5);
        assert!(handle.is_ready());
        assert_eq!(handle.wait(), Err(TaskError::PoolStopped));
        assert!(matches!(pool.start(), Err(HbstError::Pool(_))));
    }

    #[test]
    fn dropping_an_unstarted_pool_cancels_its_queue() {
        let pool = WorkerPool::new(2).unwrap();
        let handle = pool.submit(|| 1);
        drop(pool);
        assert_eq!(handle.wait(), Err(TaskError::Cancelled));
    }

    #[test]
    fn wait_timeout_lets_callers_bound_their_wait() {
        let pool = WorkerPool::new(1).unwrap();
        pool.start().unwrap();
        let (release, blocker) = occupy_worker(&pool);

        let queued = pool.submit(|| 3);
        assert_eq!(
            queued.wait_timeout(Duration::from_millis(10)),
            Err(TaskError::Timeout)
        );

        release.send(()).unwrap();
        blocker.wait().unwrap();
    }

    #[test]
    fn cancelled_handles_report_ready() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool.submit(|| 1);
        assert!(!handle.is_ready());

        assert_eq!(pool.cancel_pending(), 1);
        assert!(handle.is_ready());
        assert_eq!(handle.wait(), Err(TaskError::Cancelled));
    }

    #[test]
    fn concurrent_finish_waits_until_workers_are_joined() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        pool.start().unwrap();
        let (release, blocker) = occupy_worker(&pool);

        let done = Arc::new(AtomicBool::new(false));
        let slow = {
            let done = Arc::clone(&done);
            pool.submit(move || {
                thread::sleep(Duration::from_millis(100));
                done.store(true, Ordering::SeqCst);
            })
        };

        let first = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.finish())
        };
        while pool.state() != PoolState::Stopping {
            thread::sleep(Duration::from_millis(1));
        }
        release.send(()).unwrap();

        pool.finish();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(pool.worker_threads(), 0);

        first.join().unwrap();
        blocker.wait().unwrap();
        slow.wait().unwrap();
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn failed_spawn_leaves_the_pool_stopped() {
        // No address space can hold a stack this large.
        let pool = WorkerPool::new(2)
            .unwrap()
            .with_stack_size(usize::MAX / 8);
        let queued = pool.submit(|| 1);

        assert!(matches!(pool.start(), Err(HbstError::Io(_))));
        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(pool.worker_threads(), 0);
        assert_eq!(queued.wait(), Err(TaskError::Cancelled));
        assert_eq!(pool.submit(|| 2).wait(), Err(TaskError::PoolStopped));
    }

    #[test]
    fn double_start_is_rejected() {
        let pool = WorkerPool::new(1).unwrap();
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(HbstError::Pool(_))));
        assert!(WorkerPool::new(0).is_err());
    }
}
