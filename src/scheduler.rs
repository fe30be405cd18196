use crate::{
    config::Config,
    defer::defer,
    graph::DependencyGraph,
    job::Work,
    task::{Job, Task, TaskId},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::{
    runtime::Handle,
    sync::{Notify, Semaphore},
};
use tracing::Instrument;

/// A queue that runs [Task]s on a tokio runtime once their predecessors have
/// finished.
///
/// Scheduled tasks are kept in a dependency graph. A task is launched as soon
/// as none of its predecessors is left unfinished, and is released from the
/// graph once it has finished itself. The number of tasks executing at once
/// can be bounded with [Config::max_concurrent_tasks].
///
/// Cloning a scheduler yields another handle to the same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Shared>,
}

struct Shared {
    graph: Mutex<DependencyGraph>,
    permits: Option<Arc<Semaphore>>,
    runtime: Handle,
    drained: Notify,
}

impl Scheduler {
    /// Creates a scheduler that runs tasks on the current tokio runtime.
    pub fn new(config: &Config) -> Result<Self, SchedulerError> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        Ok(Self::with_handle(runtime, config))
    }

    /// Creates a scheduler that runs tasks on the given runtime.
    pub fn with_handle(runtime: Handle, config: &Config) -> Self {
        let permits = config
            .max_concurrent_tasks
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        Self {
            inner: Arc::new(Shared {
                graph: Mutex::default(),
                permits,
                runtime,
                drained: Notify::new(),
            }),
        }
    }

    /// Schedules a task. It starts once all of its predecessors have
    /// finished.
    pub fn add<W: Work>(&self, task: &Task<W>) -> Result<TaskId, SchedulerError> {
        self.add_job(task.as_job())
    }

    pub fn add_job(&self, job: Arc<dyn Job>) -> Result<TaskId, SchedulerError> {
        let id = job.id();
        let insertion = self.graph().insert(Arc::clone(&job))?;
        tracing::debug!(
            task = %id,
            ready = insertion.ready,
            external = insertion.external.len(),
            "task scheduled"
        );

        for predecessor in insertion.external {
            let this = self.clone();
            self.inner.runtime.spawn(async move {
                predecessor.finished().await;
                this.satisfy(id);
            });
        }
        if insertion.ready {
            self.launch(job);
        }
        Ok(id)
    }

    /// Cancels a scheduled task. Returns `false` if the task is not, or no
    /// longer, scheduled here.
    pub fn cancel(&self, id: TaskId) -> bool {
        let job = self.graph().get(id).cloned();
        match job {
            Some(job) => {
                job.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every scheduled task.
    pub fn cancel_all(&self) {
        let jobs: Vec<_> = self.graph().jobs().cloned().collect();
        tracing::debug!(count = jobs.len(), "cancelling all tasks");
        for job in jobs {
            job.cancel();
        }
    }

    /// The number of scheduled tasks that have not finished yet.
    pub fn len(&self) -> usize {
        self.graph().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completes once every scheduled task has finished.
    pub async fn wait_idle(&self) {
        loop {
            let drained = self.inner.drained.notified();
            if self.is_empty() {
                return;
            }
            drained.await;
        }
    }

    fn graph(&self) -> MutexGuard<'_, DependencyGraph> {
        self.inner
            .graph
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn launch(&self, job: Arc<dyn Job>) {
        let this = self.clone();
        let id = job.id();
        let span = tracing::debug_span!("task", task = %id);
        self.inner.runtime.spawn(
            async move {
                let _release = defer(|| this.release(id));
                // Tasks cancelled before they start finish right away and
                // do not need a slot, even if cancelled while queued for one.
                let permit = match &this.inner.permits {
                    Some(permits) => tokio::select! {
                        biased;
                        () = job.cancelled() => None,
                        permit = Arc::clone(permits).acquire_owned() => permit.ok(),
                    },
                    None => None,
                };
                job.start().await;
                drop(permit);
                // The task may have been started elsewhere, in which case
                // `start` returns at once. Dependents wait for the real end.
                job.finished().await;
            }
            .instrument(span),
        );
    }

    /// Called once a predecessor outside the graph has finished.
    fn satisfy(&self, id: TaskId) {
        let ready = self.graph().satisfy(id);
        if let Some(job) = ready {
            self.launch(job);
        }
    }

    /// Called once a launched task has finished.
    fn release(&self, id: TaskId) {
        let (ready, empty) = {
            let mut graph = self.graph();
            let ready = graph.remove(id);
            (ready, graph.len() == 0)
        };
        tracing::trace!(task = %id, unblocked = ready.len(), "task released");
        for job in ready {
            self.launch(job);
        }
        if empty {
            self.inner.drained.notify_waiters();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("scheduled", &self.len())
            .field(
                "available_permits",
                &self.inner.permits.as_ref().map(|p| p.available_permits()),
            )
            .finish()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("{0} is already scheduled")]
    AlreadyScheduled(TaskId),
    #[error("{0} has already been started")]
    AlreadyStarted(TaskId),
    #[error("{0} depends on itself")]
    SelfDependency(TaskId),
    #[error("{0} is part of a dependency cycle")]
    Cycle(TaskId),
    #[error("no tokio runtime to schedule tasks on")]
    NoRuntime,
}
