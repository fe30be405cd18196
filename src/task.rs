use crate::{defer::defer, job::Work};
use async_trait::async_trait;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock, PoisonError,
    },
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Identifies a task for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// The lifecycle of a task. Each transition happens at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Constructed, not yet started.
    Idle,
    /// Started; the work is in progress.
    Executing,
    /// Terminal, whether the work succeeded, failed or was cancelled.
    Finished,
}

/// What a running [Work] knows about the task executing it.
#[derive(Debug, Clone)]
pub struct Context {
    id: TaskId,
    token: CancellationToken,
}

impl Context {
    #[cfg(test)]
    pub(crate) fn detached(id: TaskId) -> Self {
        Self {
            id,
            token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task was cancelled. Work with side effects should check
    /// this right before applying them.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the task is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// The lifecycle surface of a task, independent of the work it performs.
///
/// This is what a [Scheduler](crate::Scheduler) drives, so that tasks with
/// different kinds of [Work] can depend on each other.
#[async_trait]
pub trait Job: Send + Sync {
    fn id(&self) -> TaskId;

    fn state(&self) -> TaskState;

    fn is_cancelled(&self) -> bool;

    /// Cancels the task. Safe to call any number of times, from any thread.
    fn cancel(&self);

    /// The tasks that must finish before this one may start.
    fn predecessors(&self) -> Vec<Arc<dyn Job>>;

    /// Runs the task to completion. A no-op unless the task is idle.
    async fn start(&self);

    /// Completes once the task has finished.
    async fn finished(&self);

    /// Completes once the task is cancelled.
    async fn cancelled(&self);
}

/// A cancellable unit of asynchronous work with an observable lifecycle.
///
/// A task is created [idle](TaskState::Idle). [Task::start] moves it to
/// [executing](TaskState::Executing) before doing anything else, runs its
/// [Work], and moves it to [finished](TaskState::Finished) on every exit
/// path. A failed or cancelled task finishes with no output.
///
/// Cloning a task yields another handle to the same task.
pub struct Task<W: Work> {
    inner: Arc<Inner<W>>,
}

struct Inner<W: Work> {
    id: TaskId,
    work: W,
    state: watch::Sender<TaskState>,
    token: CancellationToken,
    output: OnceLock<W::Output>,
    predecessors: Mutex<Vec<Arc<dyn Job>>>,
}

impl<W: Work> Task<W> {
    pub fn new(work: W) -> Self {
        let (state, _) = watch::channel(TaskState::Idle);
        Self {
            inner: Arc::new(Inner {
                id: TaskId::next(),
                work,
                state,
                token: CancellationToken::new(),
                output: OnceLock::new(),
                predecessors: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn state(&self) -> TaskState {
        *self.inner.state.borrow()
    }

    pub fn work(&self) -> &W {
        &self.inner.work
    }

    /// The result of the work. Only set once the task has finished after a
    /// successful, uncancelled run.
    pub fn output(&self) -> Option<&W::Output> {
        self.inner.output.get()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Declares that `other` must finish before this task may be started by
    /// a [Scheduler](crate::Scheduler).
    ///
    /// Dependencies added after the task was handed to a scheduler are not
    /// taken into account.
    pub fn add_dependency<O: Work>(&self, other: &Task<O>) {
        self.add_dependency_job(other.as_job());
    }

    pub fn add_dependency_job(&self, other: Arc<dyn Job>) {
        self.inner
            .predecessors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(other);
    }

    /// Returns a type-erased handle to this task.
    pub fn as_job(&self) -> Arc<dyn Job> {
        Arc::new(self.clone())
    }

    /// Cancels the task.
    ///
    /// An idle task will finish without running its work once started. An
    /// executing task has its work aborted and its result discarded, and
    /// then finishes.
    pub fn cancel(&self) {
        if !self.inner.token.is_cancelled() {
            tracing::debug!(task = %self.id(), state = ?self.state(), "cancelling task");
        }
        self.inner.token.cancel();
    }

    /// Runs the task to completion.
    ///
    /// Does nothing if the task was already started.
    pub async fn start(&self) {
        let id = self.id();
        let started = self.inner.state.send_if_modified(|state| {
            if *state == TaskState::Idle {
                *state = TaskState::Executing;
                true
            } else {
                false
            }
        });
        if !started {
            tracing::debug!(task = %id, "task was already started");
            return;
        }
        tracing::trace!(task = %id, "task executing");
        let _finish = defer(|| self.finish());

        if self.inner.token.is_cancelled() {
            tracing::debug!(task = %id, "task was cancelled before it started");
            return;
        }

        let cx = Context {
            id,
            token: self.inner.token.clone(),
        };
        tokio::select! {
            biased;
            () = self.inner.token.cancelled() => {
                tracing::debug!(task = %id, "task was cancelled in flight");
            }
            result = self.inner.work.run(&cx) => self.complete(result),
        }
    }

    /// Completes once the task has finished.
    pub async fn finished(&self) {
        let mut state = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this only returns once
        // the state matches.
        let _ = state.wait_for(|state| *state == TaskState::Finished).await;
    }

    fn complete(&self, result: Result<Option<W::Output>, W::Error>) {
        let id = self.id();
        if self.inner.token.is_cancelled() {
            tracing::debug!(task = %id, "discarding result of cancelled task");
            return;
        }
        match result {
            Ok(Some(output)) => {
                if self.inner.output.set(output).is_err() {
                    tracing::error!(task = %id, "task output was already set");
                }
            }
            Ok(None) => tracing::trace!(task = %id, "task produced no output"),
            Err(error) => tracing::warn!(task = %id, %error, "task failed"),
        }
    }

    fn finish(&self) {
        let finished = self.inner.state.send_if_modified(|state| {
            if *state == TaskState::Executing {
                *state = TaskState::Finished;
                true
            } else {
                false
            }
        });
        if finished {
            tracing::trace!(task = %self.id(), "task finished");
        } else {
            tracing::error!(task = %self.id(), "task finished more than once");
        }
    }
}

impl<W: Work> Clone for Task<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Work> fmt::Debug for Task<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .field("has_output", &self.output().is_some())
            .finish()
    }
}

#[async_trait]
impl<W: Work> Job for Task<W> {
    fn id(&self) -> TaskId {
        Task::id(self)
    }

    fn state(&self) -> TaskState {
        Task::state(self)
    }

    fn is_cancelled(&self) -> bool {
        Task::is_cancelled(self)
    }

    fn cancel(&self) {
        Task::cancel(self)
    }

    fn predecessors(&self) -> Vec<Arc<dyn Job>> {
        self.inner
            .predecessors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn start(&self) {
        Task::start(self).await
    }

    async fn finished(&self) {
        Task::finished(self).await
    }

    async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }
}
