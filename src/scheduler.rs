//! C4 — the cooperative work scheduler (spec.md §4.4). Replaces the
//! source's "timer + binary semaphore" pattern with the explicit
//! per-handle state machine spec.md §9 prescribes:
//! `Idle | Queued | Running | Retiring`. This implementation names the
//! states `Created | Active | Running | Dormant` to match the lifecycle
//! diagram in spec.md §4.4 exactly; `Queued`/`Retiring` collapse into
//! the atomic `Active -> Running` compare-and-swap and the
//! `deactivate` wait loop respectively.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{AgentError, AgentResult, WorkOutcome};

const CREATED: u8 = 0;
const ACTIVE: u8 = 1;
const RUNNING: u8 = 2;
const DORMANT: u8 = 3;

pub type WorkFuture = Pin<Box<dyn Future<Output = AgentResult<WorkOutcome>> + Send>>;
pub type WorkFn = Arc<dyn Fn() -> WorkFuture + Send + Sync>;

struct WorkItemInner {
    name: String,
    state: AtomicU8,
    period: tokio::sync::Mutex<Duration>,
    function: WorkFn,
    timer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    idle_notify: Notify,
    deactivating: AtomicBool,
}

/// A handle to a created work item. Cheap to clone; all clones refer to
/// the same underlying item.
#[derive(Clone)]
pub struct WorkHandle(Arc<WorkItemInner>);

impl WorkHandle {
    pub fn name(&self) -> &str {
        &self.0.name
    }
}

/// Parameters for [`WorkScheduler::create`].
pub struct WorkParams {
    pub name: String,
    /// `Duration::ZERO` means on-demand only (spec.md §3 "period_seconds,
    /// 0 = on-demand only").
    pub period: Duration,
    pub function: WorkFn,
}

/// The scheduler itself: one ready queue, one worker task, driving
/// every work item's function to completion serially (spec.md §4.4 "a
/// conforming implementation MAY provide a single global queue").
pub struct WorkScheduler {
    ready_tx: mpsc::UnboundedSender<Arc<WorkItemInner>>,
    _worker: JoinHandle<()>,
}

impl WorkScheduler {
    pub fn new() -> Self {
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<Arc<WorkItemInner>>();
        let worker = tokio::spawn(async move {
            while let Some(item) = ready_rx.recv().await {
                run_claimed_item(item).await;
            }
        });
        Self {
            ready_tx,
            _worker: worker,
        }
    }

    /// Creates a new work item in the `Created` state.
    pub fn create(&self, params: WorkParams) -> WorkHandle {
        let inner = Arc::new(WorkItemInner {
            name: params.name,
            state: AtomicU8::new(CREATED),
            period: tokio::sync::Mutex::new(params.period),
            function: params.function,
            timer: tokio::sync::Mutex::new(None),
            idle_notify: Notify::new(),
            deactivating: AtomicBool::new(false),
        });
        WorkHandle(inner)
    }

    /// Enables the timer; an immediate execution is scheduled if the
    /// item's period is non-zero.
    pub async fn activate(&self, handle: &WorkHandle) {
        let inner = handle.0.clone();
        inner.deactivating.store(false, Ordering::SeqCst);
        let _ = inner
            .state
            .compare_exchange(CREATED, ACTIVE, Ordering::SeqCst, Ordering::SeqCst)
            .or_else(|_| {
                inner
                    .state
                    .compare_exchange(DORMANT, ACTIVE, Ordering::SeqCst, Ordering::SeqCst)
            });

        let period = *inner.period.lock().await;
        self.spawn_timer(inner.clone(), period).await;

        if period > Duration::ZERO {
            self.execute(handle).await;
        }
    }

    /// 0 disables periodic firing.
    pub async fn set_period(&self, handle: &WorkHandle, period: Duration) {
        let inner = handle.0.clone();
        *inner.period.lock().await = period;
        self.spawn_timer(inner, period).await;
    }

    async fn spawn_timer(&self, inner: Arc<WorkItemInner>, period: Duration) {
        let mut timer_guard = inner.timer.lock().await;
        if let Some(old) = timer_guard.take() {
            old.abort();
        }
        if period == Duration::ZERO {
            return;
        }
        let tx = self.ready_tx.clone();
        let timer_inner = inner.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately; skip, activate() already fired one
            loop {
                interval.tick().await;
                try_enqueue(&timer_inner, &tx);
            }
        });
        *timer_guard = Some(handle);
    }

    /// Requests a one-shot firing; dropped silently if already busy.
    pub async fn execute(&self, handle: &WorkHandle) {
        try_enqueue(&handle.0, &self.ready_tx);
    }

    /// Cancels the timer and awaits any in-flight execution before
    /// returning (spec.md §9 Open Question: the waiting variant is
    /// mandated).
    pub async fn deactivate(&self, handle: &WorkHandle) {
        let inner = &handle.0;
        inner.deactivating.store(true, Ordering::SeqCst);
        if let Some(old) = inner.timer.lock().await.take() {
            old.abort();
        }
        loop {
            let state = inner.state.load(Ordering::SeqCst);
            if state != RUNNING {
                break;
            }
            inner.idle_notify.notified().await;
        }
        inner.state.store(DORMANT, Ordering::SeqCst);
    }

    /// Deactivated precondition, per spec.md §4.4.
    pub async fn delete(&self, handle: WorkHandle) -> AgentResult<()> {
        if handle.0.state.load(Ordering::SeqCst) != DORMANT {
            return Err(AgentError::Fatal(
                "delete requires a deactivated work item".into(),
            ));
        }
        drop(handle);
        Ok(())
    }
}

impl Default for WorkScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn try_enqueue(inner: &Arc<WorkItemInner>, tx: &mpsc::UnboundedSender<Arc<WorkItemInner>>) {
    match inner
        .state
        .compare_exchange(ACTIVE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
    {
        Ok(_) => {
            let _ = tx.send(inner.clone());
        }
        Err(_) => {
            debug!(work_item = %inner.name, "tick dropped: work item busy or inactive");
        }
    }
}

#[tracing::instrument(skip(item), fields(work_item = %item.name))]
async fn run_claimed_item(item: Arc<WorkItemInner>) {
    let outcome = (item.function)().await;
    match outcome {
        Ok(WorkOutcome::Done) => {
            if let Some(timer) = item.timer.lock().await.take() {
                timer.abort();
            }
        }
        Ok(WorkOutcome::KeepScheduled) => {}
        Err(ref err) => {
            tracing::warn!(work_item = %item.name, error = %err, "work item returned an error");
        }
    }
    if !item.deactivating.load(Ordering::SeqCst) {
        item.state.store(ACTIVE, Ordering::SeqCst);
    }
    // `notify_one` (not `notify_waiters`) so the permit is buffered if
    // `deactivate`'s waiter hasn't started waiting yet — avoids the
    // lost-wakeup race `notify_waiters` has with a single waiter.
    item.idle_notify.notify_one();
}

/// The mutex primitive spec.md §4.4 exposes for serializing reader/
/// writer access to shared keystores (inventory, configuration)
/// between a work function and user-initiated setters.
pub struct WorkMutex(tokio::sync::Mutex<()>);

pub struct WorkMutexGuard<'a>(#[allow(dead_code)] tokio::sync::MutexGuard<'a, ()>);

impl Default for WorkMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkMutex {
    pub fn new() -> Self {
        Self(tokio::sync::Mutex::new(()))
    }

    /// `timeout = None` waits indefinitely; `Some(d)` fails with
    /// `AgentError::LockFailed` if not acquired within `d`.
    pub async fn acquire(&self, timeout: Option<Duration>) -> AgentResult<WorkMutexGuard<'_>> {
        match timeout {
            Some(d) => match tokio::time::timeout(d, self.0.lock()).await {
                Ok(guard) => Ok(WorkMutexGuard(guard)),
                Err(_) => Err(AgentError::LockFailed),
            },
            None => Ok(WorkMutexGuard(self.0.lock().await)),
        }
    }

    /// Releases the guard early. Dropping the guard does the same
    /// thing; this exists to mirror spec.md §4.4's explicit
    /// `acquire`/`release` pair.
    pub fn release(&self, guard: WorkMutexGuard<'_>) {
        drop(guard);
    }
}
