use crate::protocol::{JobId, NodeIdentity, TaskReport, TaskStatus};
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    path::PathBuf,
};
use tracing::{debug, info, warn};

pub type TaskId = u64;

/// Where a master is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    /// at least one task is pending
    Dispatching,
    /// nothing pending, waiting for dispatched tasks to finish
    Draining,
    /// every task completed or failed for good
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initializing => "initializing",
            Self::Dispatching => "dispatching",
            Self::Draining => "draining",
            Self::Done => "done",
        })
    }
}

#[derive(Debug, Clone)]
pub struct SubproblemTask {
    pub id: TaskId,
    pub stub: PathBuf,
    pub status: TaskStatus,
    /// failed dispatches so far
    pub attempts: u32,
    pub last_reason: Option<String>,
}

impl SubproblemTask {
    pub fn report(&self) -> TaskReport {
        TaskReport {
            stub: self.stub.clone(),
            status: self.status.clone(),
            attempts: self.attempts,
            last_reason: self.last_reason.clone(),
        }
    }

    fn is_dispatched_as(&self, job: &JobId) -> bool {
        matches!(&self.status, TaskStatus::Dispatched { job_id, .. } if job_id == job)
    }
}

/// The master's subproblems, in submission order
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: BTreeMap<TaskId, SubproblemTask>,
    /// stubs with an unfinished task
    queued: HashSet<PathBuf>,
    next_id: TaskId,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one pending task per stub. A stub that already has an unfinished task is skipped
    /// so two workers never write the same solution file; returns how many were added.
    pub fn submit(&mut self, stubs: impl IntoIterator<Item = PathBuf>) -> usize {
        let mut added = 0;

        for stub in stubs {
            if !self.queued.insert(stub.clone()) {
                warn!(stub = ?stub, "Stub already queued, skipping");
                continue;
            }

            let id = self.next_id;
            self.next_id += 1;
            self.tasks.insert(
                id,
                SubproblemTask {
                    id,
                    stub,
                    status: TaskStatus::Pending,
                    attempts: 0,
                    last_reason: None,
                },
            );
            added += 1;
        }

        added
    }

    pub fn get(&self, id: TaskId) -> Option<&SubproblemTask> {
        self.tasks.get(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Pending tasks in submission order
    pub fn pending(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .map(|task| task.id)
            .collect()
    }

    pub fn mark_dispatched(&mut self, id: TaskId, slave: NodeIdentity, job_id: JobId) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Dispatched { slave, job_id };
                true
            }
            _ => false,
        }
    }

    /// Record a success notice for the job `id` was dispatched as
    pub fn complete(&mut self, id: TaskId, job_id: &JobId, result: PathBuf) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) if task.is_dispatched_as(job_id) => {
                info!(stub = ?task.stub, result = ?result, "Subproblem solved");
                task.status = TaskStatus::Completed { result };
                self.queued.remove(&task.stub);
                true
            }
            _ => false,
        }
    }

    /// Record a failed dispatch. The task goes back to pending until it has failed more
    /// than `retry_limit` times, after which it stays failed. Returns the new status, `None`
    /// if the task was not dispatched as `job_id`.
    pub fn fail(
        &mut self,
        id: TaskId,
        job_id: &JobId,
        reason: String,
        retry_limit: u32,
    ) -> Option<&TaskStatus> {
        let task = self
            .tasks
            .get_mut(&id)
            .filter(|task| task.is_dispatched_as(job_id))?;

        task.attempts += 1;
        task.last_reason = Some(reason.clone());

        if task.attempts > retry_limit {
            warn!(
                stub = ?task.stub,
                attempts = task.attempts,
                reason = %reason,
                "Subproblem failed for good"
            );
            task.status = TaskStatus::Failed { reason };
            self.queued.remove(&task.stub);
        } else {
            debug!(
                stub = ?task.stub,
                attempts = task.attempts,
                reason = %reason,
                "Subproblem failed, requeued"
            );
            task.status = TaskStatus::Pending;
        }

        Some(&task.status)
    }

    /// Phase implied by the tasks' states; an empty table is done
    pub fn phase(&self) -> Phase {
        let statuses = || self.tasks.values().map(|task| &task.status);

        if statuses().any(|status| *status == TaskStatus::Pending) {
            Phase::Dispatching
        } else if statuses().any(|status| matches!(status, TaskStatus::Dispatched { .. })) {
            Phase::Draining
        } else {
            Phase::Done
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase() == Phase::Done
    }

    pub fn report(&self) -> Vec<TaskReport> {
        self.tasks.values().map(SubproblemTask::report).collect()
    }
}
