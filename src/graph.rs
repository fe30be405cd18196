use crate::{
    scheduler::SchedulerError,
    task::{Job, TaskId, TaskState},
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// A node of the [DependencyGraph].
struct Node {
    job: Arc<dyn Job>,
    /// Number of predecessors that have not finished yet.
    pending: usize,
    /// Nodes waiting on this one.
    dependents: Vec<TaskId>,
}

/// The outcome of inserting a job into the [DependencyGraph].
pub(crate) struct Insertion {
    /// Whether the job has no unfinished predecessors and may start now.
    pub ready: bool,
    /// Unfinished predecessors that are not part of the graph. The graph must
    /// be told when each of them finishes, via [DependencyGraph::satisfy].
    pub external: Vec<Arc<dyn Job>>,
}

/// The arena of scheduled jobs and the edges between them.
///
/// Every node counts its unfinished predecessors. A node becomes ready when
/// that count drops to zero, regardless of whether the predecessors
/// succeeded, failed or were cancelled.
#[derive(Default)]
pub(crate) struct DependencyGraph {
    nodes: HashMap<TaskId, Node>,
}

impl DependencyGraph {
    pub fn insert(&mut self, job: Arc<dyn Job>) -> Result<Insertion, SchedulerError> {
        let id = job.id();
        if self.nodes.contains_key(&id) {
            return Err(SchedulerError::AlreadyScheduled(id));
        }
        if job.state() != TaskState::Idle {
            return Err(SchedulerError::AlreadyStarted(id));
        }

        let mut seen = HashSet::new();
        let mut internal = Vec::new();
        let mut external = Vec::new();
        for predecessor in job.predecessors() {
            let pid = predecessor.id();
            if pid == id {
                return Err(SchedulerError::SelfDependency(id));
            }
            if !seen.insert(pid) {
                continue;
            }
            if self.nodes.contains_key(&pid) {
                internal.push(pid);
            } else if predecessor.state() != TaskState::Finished {
                if predecessor.state() == TaskState::Idle {
                    tracing::debug!(
                        task = %id,
                        dependency = %pid,
                        "waiting on a dependency that is not scheduled here"
                    );
                }
                external.push(predecessor);
            }
        }
        if reaches(&job, id) {
            return Err(SchedulerError::Cycle(id));
        }

        for pid in &internal {
            if let Some(node) = self.nodes.get_mut(pid) {
                node.dependents.push(id);
            }
        }
        let pending = internal.len() + external.len();
        self.nodes.insert(
            id,
            Node {
                job,
                pending,
                dependents: Vec::new(),
            },
        );
        Ok(Insertion {
            ready: pending == 0,
            external,
        })
    }

    /// Records that one predecessor of `id` has finished. Returns the job if
    /// it has thereby become ready.
    pub fn satisfy(&mut self, id: TaskId) -> Option<Arc<dyn Job>> {
        let node = self.nodes.get_mut(&id)?;
        node.pending = node.pending.saturating_sub(1);
        (node.pending == 0).then(|| Arc::clone(&node.job))
    }

    /// Releases a finished job. Returns the dependents that have thereby
    /// become ready.
    pub fn remove(&mut self, id: TaskId) -> Vec<Arc<dyn Job>> {
        let Some(node) = self.nodes.remove(&id) else {
            return Vec::new();
        };
        node.dependents
            .into_iter()
            .filter_map(|dependent| self.satisfy(dependent))
            .collect()
    }

    pub fn get(&self, id: TaskId) -> Option<&Arc<dyn Job>> {
        self.nodes.get(&id).map(|node| &node.job)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Arc<dyn Job>> {
        self.nodes.values().map(|node| &node.job)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// Whether `target` is among the transitive predecessors of `job`.
fn reaches(job: &Arc<dyn Job>, target: TaskId) -> bool {
    let mut visited = HashSet::new();
    let mut stack = job.predecessors();
    while let Some(next) = stack.pop() {
        let id = next.id();
        if id == target {
            return true;
        }
        if next.state() == TaskState::Finished || !visited.insert(id) {
            continue;
        }
        stack.extend(next.predecessors());
    }
    false
}
