//! Background task executor with per-device serialization.
//!
//! Each device gets a [`DeviceLane`]: a FIFO queue drained by one lane task
//! that owns the device resource (usually a [`Connection`](crate::device::Connection)).
//! Operations on the same lane run one at a time, in submission order;
//! lanes run concurrently, bounded by a shared pool of worker permits.
//! The blocking call itself runs on tokio's blocking thread pool, never on
//! the interactive thread and never on an async worker.
//!
//! # Task lifecycle
//!
//! ```text
//! Queued --dequeued--> Running --op returns--> Finished(Completed | Failed)
//!   |                     |
//!   +--cancel--> Finished(Cancelled)    +--cancel--> flag set, op sees it at its next safe point
//! ```
//!
//! - An operation runs exactly once unless it is cancelled while queued; a
//!   task cancelled while queued never reaches the device.
//! - An operation that exceeds the call timeout finishes as a transient
//!   [`DeviceError`]. The executor itself never retries. The lane starts
//!   nothing else until the stuck call returns; queued tasks that wait
//!   longer than the call timeout for it fail the same way. A hung device
//!   therefore holds at most one worker permit.
//! - Completion callbacks are posted to the [`EventSender`] and run on the
//!   consumer thread.

use crate::bus::{Component, ErrorReport, Event, EventSender, Producer, Publisher};
use crate::device::DeviceId;
use crate::error::DeviceError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Identifier of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    /// The operation returned a value.
    Completed(T),
    /// The operation returned an error or timed out.
    Failed(DeviceError),
    /// Cancelled before it started, or it observed the cancel flag.
    Cancelled,
}

impl<T> TaskOutcome<T> {
    /// True for [`TaskOutcome::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Converts to a `Result`, mapping cancellation to `None`.
    pub fn into_result(self) -> Option<Result<T, DeviceError>> {
        match self {
            Self::Completed(value) => Some(Ok(value)),
            Self::Failed(err) => Some(Err(err)),
            Self::Cancelled => None,
        }
    }
}

/// Result of [`TaskHandle::cancel`].
#[derive(Debug, Clone, PartialEq)]
pub enum CancelResult<T> {
    /// The task was still queued and will never run.
    Discarded,
    /// The task is running; it stops at its next safe point.
    Requested,
    /// No-op: the task had already finished with this outcome.
    AlreadyFinished(TaskOutcome<T>),
}

/// Summary of a finished task that was submitted with a [`Completion`].
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    /// Task the event reports on.
    pub task: TaskId,
    /// Lane the task ran on.
    pub device: DeviceId,
    /// Label given at submission.
    pub label: String,
    /// How the task ended.
    pub status: TaskStatus,
}

/// [`TaskOutcome`] without the value, as carried on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    /// Finished with a value.
    Completed,
    /// Finished with an error.
    Failed(DeviceError),
    /// Cancelled while queued or running.
    Cancelled,
}

/// Cooperative cancellation flag checked by operations at safe points.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag and wakes every [`cancelled`](Self::cancelled) waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// True once [`cancel`](Self::cancel) was called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

type CompleteFn<T> = Box<dyn FnOnce(T) + Send>;
type ErrorFn = Box<dyn FnOnce(DeviceError) + Send>;
type CancelFn = Box<dyn FnOnce() + Send>;

/// Callbacks run on the consumer thread when a task finishes.
pub struct Completion<T> {
    on_complete: Option<CompleteFn<T>>,
    on_error: Option<ErrorFn>,
    on_cancel: Option<CancelFn>,
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self {
            on_complete: None,
            on_error: None,
            on_cancel: None,
        }
    }
}

impl<T> Completion<T> {
    /// No callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with the value when the task completes.
    pub fn on_complete(mut self, f: impl FnOnce(T) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Runs `f` with the error when the task fails.
    pub fn on_error(mut self, f: impl FnOnce(DeviceError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Runs `f` when the task is cancelled.
    pub fn on_cancel(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }

    fn deliver(self, outcome: TaskOutcome<T>) {
        match outcome {
            TaskOutcome::Completed(value) => {
                if let Some(f) = self.on_complete {
                    f(value)
                }
            }
            TaskOutcome::Failed(err) => {
                if let Some(f) = self.on_error {
                    f(err)
                }
            }
            TaskOutcome::Cancelled => {
                if let Some(f) = self.on_cancel {
                    f()
                }
            }
        }
    }
}

enum TaskState<T> {
    Queued,
    Running,
    Finished(TaskOutcome<T>),
}

struct TaskCell<T> {
    id: TaskId,
    device: DeviceId,
    label: String,
    state: Mutex<TaskState<T>>,
    token: CancelToken,
    done: Notify,
    completion: Mutex<Option<Completion<T>>>,
    bus: EventSender,
    events: Publisher,
}

impl<T: Clone + Send + 'static> TaskCell<T> {
    fn lock_state(&self) -> MutexGuard<'_, TaskState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outcome(&self) -> Option<TaskOutcome<T>> {
        match &*self.lock_state() {
            TaskState::Finished(outcome) => Some(outcome.clone()),
            TaskState::Queued | TaskState::Running => None,
        }
    }

    /// Records the outcome once; later calls are ignored.
    fn finish(&self, outcome: TaskOutcome<T>) {
        {
            let mut state = self.lock_state();
            if matches!(*state, TaskState::Finished(_)) {
                return;
            }
            *state = TaskState::Finished(outcome.clone());
        }
        self.announce(outcome);
    }

    /// Wakes waiters and hands the outcome to the completion, if any.
    fn announce(&self, outcome: TaskOutcome<T>) {
        trace!(task = %self.id, device = %self.device, label = %self.label, "task finished");
        self.done.notify_waiters();

        let completion = self
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(completion) = completion {
            let status = match &outcome {
                TaskOutcome::Completed(_) => TaskStatus::Completed,
                TaskOutcome::Failed(err) => TaskStatus::Failed(err.clone()),
                TaskOutcome::Cancelled => TaskStatus::Cancelled,
            };
            if let TaskStatus::Failed(err) = &status {
                self.events.error(ErrorReport::from_device(Component::Executor, err));
            }
            self.bus.post(move || completion.deliver(outcome));
            self.events.publish(Event::Task(TaskEvent {
                task: self.id,
                device: self.device.clone(),
                label: self.label.clone(),
                status,
            }));
        }
    }
}

/// Type-erased view of a task used by the lane loop.
trait TaskControl: Send + Sync {
    fn id(&self) -> TaskId;
    /// Queued -> Running. False if the task already finished (cancelled).
    fn begin(&self) -> bool;
    fn fail(&self, err: DeviceError);
}

impl<T: Clone + Send + 'static> TaskControl for TaskCell<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn begin(&self) -> bool {
        let mut state = self.lock_state();
        match *state {
            TaskState::Queued => {
                *state = TaskState::Running;
                true
            }
            TaskState::Running | TaskState::Finished(_) => false,
        }
    }

    fn fail(&self, err: DeviceError) {
        self.finish(TaskOutcome::Failed(err));
    }
}

struct Job<D> {
    control: Arc<dyn TaskControl>,
    run: Box<dyn FnOnce(&mut D) + Send>,
}

/// Caller's handle on one submitted operation.
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.cell.id)
            .field("device", &self.cell.device)
            .field("label", &self.cell.label)
            .finish()
    }
}

impl<T: Clone + Send + 'static> TaskHandle<T> {
    /// Executor-wide task id.
    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    /// Cancellation flag seen by the operation.
    pub fn token(&self) -> &CancelToken {
        &self.cell.token
    }

    /// Best-effort cancel. Never blocks.
    pub fn cancel(&self) -> CancelResult<T> {
        let mut state = self.cell.lock_state();
        if let TaskState::Finished(outcome) = &*state {
            return CancelResult::AlreadyFinished(outcome.clone());
        }
        self.cell.token.cancel();
        if matches!(*state, TaskState::Running) {
            return CancelResult::Requested;
        }
        // Still queued: finishing under the lock keeps the lane from starting it.
        *state = TaskState::Finished(TaskOutcome::Cancelled);
        drop(state);
        debug!(task = %self.cell.id, device = %self.cell.device, "queued task discarded");
        self.cell.announce(TaskOutcome::Cancelled);
        CancelResult::Discarded
    }

    /// Outcome if the task has finished. Never waits.
    pub fn outcome(&self) -> Option<TaskOutcome<T>> {
        self.cell.outcome()
    }

    /// True once an outcome is set.
    pub fn is_finished(&self) -> bool {
        self.outcome().is_some()
    }

    /// Waits for the task to finish.
    pub async fn wait(&self) -> TaskOutcome<T> {
        loop {
            let notified = self.cell.done.notified();
            if let Some(outcome) = self.cell.outcome() {
                return outcome;
            }
            notified.await;
        }
    }
}

/// Executor sizing.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum device calls in flight across all lanes.
    pub pool_size: usize,
    /// Maximum wait for one device call.
    pub call_timeout: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            call_timeout: Duration::from_secs(5),
        }
    }
}

struct Shared {
    next_id: AtomicU64,
    bus: EventSender,
    events: Publisher,
}

/// Registers devices and hands out their lanes.
#[derive(Clone)]
pub struct TaskExecutor {
    runtime: Handle,
    options: ExecutorOptions,
    permits: Arc<Semaphore>,
    shared: Arc<Shared>,
    registered: Arc<Mutex<HashSet<DeviceId>>>,
}

impl TaskExecutor {
    /// Executor spawning its lanes on `runtime` and reporting to `bus`.
    pub fn new(runtime: Handle, bus: EventSender, options: ExecutorOptions) -> Self {
        let events = bus.publisher(Producer::Executor);
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(options.pool_size.max(1))),
            options,
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                bus,
                events,
            }),
            registered: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Pool size and call timeout in effect.
    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Runtime that drives lanes and background sessions.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Shared bus sender.
    pub fn bus(&self) -> &EventSender {
        &self.shared.bus
    }

    /// Hands `resource` to a new lane.
    ///
    /// Fails if `device` already has a live lane: a device has one owner.
    pub fn register<D: Send + 'static>(&self, device: DeviceId, resource: D) -> Result<DeviceLane<D>, DeviceError> {
        {
            let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
            if !registered.insert(device.clone()) {
                return Err(DeviceError::fatal(&device, "device is already registered with the executor"));
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.runtime.spawn(run_lane(
            device.clone(),
            resource,
            rx,
            self.permits.clone(),
            self.options.call_timeout,
            self.registered.clone(),
        ));
        debug!(device = %device, "device lane started");
        Ok(DeviceLane {
            device,
            jobs: tx,
            shared: self.shared.clone(),
        })
    }

    /// True while `device` has a live lane.
    pub fn is_registered(&self, device: &DeviceId) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(device)
    }
}

/// Submission side of one device's FIFO queue. Clones share the queue.
pub struct DeviceLane<D> {
    device: DeviceId,
    jobs: mpsc::UnboundedSender<Job<D>>,
    shared: Arc<Shared>,
}

impl<D> Clone for DeviceLane<D> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            jobs: self.jobs.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<D: Send + 'static> DeviceLane<D> {
    /// Device this lane serializes.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Queues `op`; the outcome is read through the returned handle.
    pub fn submit<T, F>(&self, label: impl Into<String>, op: F) -> TaskHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&mut D, &CancelToken) -> Result<T, DeviceError> + Send + 'static,
    {
        self.enqueue(label.into(), op, None)
    }

    /// Queues `op` and delivers its outcome to `completion` on the consumer thread.
    pub fn submit_with<T, F>(&self, label: impl Into<String>, op: F, completion: Completion<T>) -> TaskHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&mut D, &CancelToken) -> Result<T, DeviceError> + Send + 'static,
    {
        self.enqueue(label.into(), op, Some(completion))
    }

    fn enqueue<T, F>(&self, label: String, op: F, completion: Option<Completion<T>>) -> TaskHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&mut D, &CancelToken) -> Result<T, DeviceError> + Send + 'static,
    {
        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let cell = Arc::new(TaskCell {
            id,
            device: self.device.clone(),
            label,
            state: Mutex::new(TaskState::Queued),
            token: CancelToken::new(),
            done: Notify::new(),
            completion: Mutex::new(completion),
            bus: self.shared.bus.clone(),
            events: self.shared.events.clone(),
        });

        let runner = cell.clone();
        let job = Job {
            control: cell.clone(),
            run: Box::new(move |resource: &mut D| {
                let result = op(resource, &runner.token);
                let outcome = match result {
                    _ if runner.token.is_cancelled() => TaskOutcome::Cancelled,
                    Ok(value) => TaskOutcome::Completed(value),
                    Err(err) => TaskOutcome::Failed(err),
                };
                runner.finish(outcome);
            }),
        };

        trace!(task = %id, device = %self.device, label = %cell.label, "task queued");
        if self.jobs.send(job).is_err() {
            cell.finish(TaskOutcome::Failed(DeviceError::fatal(&self.device, "device lane is closed")));
        }
        TaskHandle { cell }
    }

    /// True once the lane task has stopped.
    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }
}

async fn run_lane<D: Send + 'static>(
    device: DeviceId,
    resource: D,
    mut jobs: mpsc::UnboundedReceiver<Job<D>>,
    permits: Arc<Semaphore>,
    call_timeout: Duration,
    registered: Arc<Mutex<HashSet<DeviceId>>>,
) {
    let resource = Arc::new(Mutex::new(resource));
    // A call that outlived its timeout. It keeps its permit and the device
    // until it returns, and nothing else on this lane starts before then.
    let mut stalled: Option<JoinHandle<()>> = None;

    while let Some(job) = jobs.recv().await {
        if !job.control.begin() {
            trace!(task = %job.control.id(), device = %device, "skipping cancelled task");
            continue;
        }
        if let Some(pending) = stalled.as_mut() {
            if tokio::time::timeout(call_timeout, pending).await.is_err() {
                debug!(task = %job.control.id(), device = %device, "device still stuck in a timed-out call");
                job.control.fail(DeviceError::timeout(&device, call_timeout));
                continue;
            }
            debug!(device = %device, "timed-out call returned");
            stalled = None;
        }
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                job.control.fail(DeviceError::fatal(&device, "executor shut down"));
                continue;
            }
        };

        let slot = resource.clone();
        let run = job.run;
        let mut blocking = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            run(&mut *guard);
        });

        match tokio::time::timeout(call_timeout, &mut blocking).await {
            Ok(Ok(())) => {}
            Ok(Err(join_err)) => {
                warn!(task = %job.control.id(), device = %device, "device operation panicked");
                job.control
                    .fail(DeviceError::fatal(&device, format!("operation aborted: {}", join_err)));
            }
            Err(_) => {
                warn!(task = %job.control.id(), device = %device, timeout = ?call_timeout, "device call timed out");
                job.control.fail(DeviceError::timeout(&device, call_timeout));
                stalled = Some(blocking);
            }
        }
    }

    registered
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&device);
    debug!(device = %device, "device lane stopped");
    // Dropping the resource may close the device, which can block.
    let _ = tokio::task::spawn_blocking(move || drop(resource)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Delivery, EventBus};
    use std::sync::atomic::AtomicUsize;

    fn executor() -> (TaskExecutor, crate::bus::EventReceiver) {
        let (tx, rx) = EventBus::new();
        let exec = TaskExecutor::new(
            Handle::current(),
            tx,
            ExecutorOptions {
                pool_size: 2,
                call_timeout: Duration::from_millis(500),
            },
        );
        (exec, rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lane_runs_in_submission_order() {
        let (exec, _rx) = executor();
        let lane = exec.register(DeviceId::from("dev"), Vec::<u32>::new()).unwrap();

        let handles: Vec<_> = (0..20u32)
            .map(|i| {
                lane.submit(format!("push {}", i), move |log: &mut Vec<u32>, _| {
                    log.push(i);
                    Ok(log.clone())
                })
            })
            .collect();

        let last = handles.last().unwrap().wait().await;
        assert_eq!(last, TaskOutcome::Completed((0..20).collect::<Vec<_>>()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_before_start_never_runs() {
        let (exec, _rx) = executor();
        let lane = exec.register(DeviceId::from("dev"), ()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let blocker = lane.submit("block", |_, _| {
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        });
        let counter = ran.clone();
        let victim = lane.submit("victim", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(victim.cancel(), CancelResult::Discarded);
        assert_eq!(blocker.wait().await, TaskOutcome::Completed(()));
        let after = lane.submit("after", |_, _| Ok(()));
        after.wait().await;

        assert_eq!(victim.outcome(), Some(TaskOutcome::Cancelled));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_after_completion_is_noop() {
        let (exec, _rx) = executor();
        let lane = exec.register(DeviceId::from("dev"), ()).unwrap();
        let task = lane.submit("answer", |_, _| Ok(42));
        assert_eq!(task.wait().await, TaskOutcome::Completed(42));
        assert_eq!(task.cancel(), CancelResult::AlreadyFinished(TaskOutcome::Completed(42)));
        assert_eq!(task.outcome(), Some(TaskOutcome::Completed(42)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_running_task_observes_cancel_flag() {
        let (exec, _rx) = executor();
        let lane = exec.register(DeviceId::from("dev"), ()).unwrap();
        let task = lane.submit("poll", |_, token: &CancelToken| {
            for _ in 0..200 {
                if token.is_cancelled() {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(task.cancel(), CancelResult::Requested);
        assert_eq!(task.wait().await, TaskOutcome::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_call_timeout_is_transient() {
        let (exec, _rx) = executor();
        let lane = exec.register(DeviceId::from("slow"), ()).unwrap();
        let task = lane.submit("hang", |_, _| {
            std::thread::sleep(Duration::from_millis(800));
            Ok(())
        });
        match task.wait().await {
            TaskOutcome::Failed(err) => assert!(err.is_transient()),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hung_device_holds_one_permit_at_most() {
        let (tx, _rx) = EventBus::new();
        let exec = TaskExecutor::new(
            Handle::current(),
            tx,
            ExecutorOptions {
                pool_size: 2,
                call_timeout: Duration::from_millis(100),
            },
        );
        let camera = exec.register(DeviceId::from("cam0"), ()).unwrap();
        let unit = exec.register(DeviceId::from("ct400"), ()).unwrap();
        let hang = |_: &mut (), _: &CancelToken| {
            std::thread::sleep(Duration::from_millis(1500));
            Ok(())
        };

        let first = camera.submit("read frame", hang);
        let second = camera.submit("read frame", hang);
        for task in [first, second] {
            match task.wait().await {
                TaskOutcome::Failed(err) => assert!(err.message.contains("timed out")),
                other => panic!("expected a timeout, got {:?}", other),
            }
        }

        let started = std::time::Instant::now();
        let power = unit.submit("get power", |_, _| Ok(1.0));
        assert_eq!(power.wait().await, TaskOutcome::Completed(1.0));
        assert!(started.elapsed() < Duration::from_millis(500));

        // Once the stuck call returns the lane serves again.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let ping = camera.submit("ping", |_, _| Ok(()));
        assert_eq!(ping.wait().await, TaskOutcome::Completed(()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_registration_rejected() {
        let (exec, _rx) = executor();
        let _lane = exec.register(DeviceId::from("dev"), ()).unwrap();
        assert!(exec.register(DeviceId::from("dev"), ()).is_err());
        assert!(exec.is_registered(&DeviceId::from("dev")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_completion_delivered_through_bus() {
        let (exec, mut rx) = executor();
        let lane = exec.register(DeviceId::from("dev"), ()).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();

        let task = lane.submit_with(
            "value",
            |_, _| Ok(7usize),
            Completion::new().on_complete(move |v| {
                sink.store(v, Ordering::SeqCst);
            }),
        );
        task.wait().await;
        // Not delivered until the consumer drains the bus.
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        let deliveries = rx.drain();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert!(deliveries.iter().any(|d| matches!(
            d,
            Delivery::Event(env) if matches!(&env.event, Event::Task(ev) if ev.status == TaskStatus::Completed)
        )));
    }
}
