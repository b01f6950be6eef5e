use super::{
    slots::{SlotError, SlotPool},
    worker::{self, SolverCommand},
};
use crate::protocol::{
    JobFinished, JobId, JobOutcome, NodeIdentity, Rejection, SlaveMessage, SolveRequest,
    StartReply,
};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, path::PathBuf};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound channel of one master session
pub type MasterSink = mpsc::UnboundedSender<SlaveMessage>;

/// Bookkeeping for one job in flight
#[derive(Debug)]
pub struct JobRecord {
    pub job_id: JobId,
    pub stub: PathBuf,
    pub options: Vec<String>,
    pub pid: Option<u32>,
    pub requester: NodeIdentity,
    pub slots_held: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
    pub total_slots: u32,
    pub free_slots: u32,
    pub running: Vec<(JobId, PathBuf)>,
}

#[derive(Debug)]
pub enum AgentCommand {
    /// a master session opened, `session` tells apart reconnects of the same master
    Attach {
        master: NodeIdentity,
        session: u64,
        sink: MasterSink,
        reply: oneshot::Sender<u32>,
    },
    Detach {
        master: NodeIdentity,
        session: u64,
    },
    /// answered through the requesting master's sink, ahead of any notice for the job
    StartSolver {
        master: NodeIdentity,
        request_id: u64,
        request: SolveRequest,
    },
    WorkerExited {
        job_id: JobId,
        outcome: JobOutcome,
    },
    Status {
        reply: oneshot::Sender<AgentStatus>,
    },
}

/// Mailbox address of a slave agent
#[derive(Debug, Clone)]
pub struct AgentHandle {
    tx: mpsc::UnboundedSender<AgentCommand>,
}

impl AgentHandle {
    /// Attach a master session and learn the agent's total slots, `None` once the agent
    /// is gone
    pub async fn attach(
        &self,
        master: NodeIdentity,
        session: u64,
        sink: MasterSink,
    ) -> Option<u32> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(AgentCommand::Attach {
                master,
                session,
                sink,
                reply,
            })
            .ok()?;

        response.await.ok()
    }

    pub fn detach(&self, master: NodeIdentity, session: u64) {
        let _ = self.tx.send(AgentCommand::Detach { master, session });
    }

    pub fn start_solver(
        &self,
        master: NodeIdentity,
        request_id: u64,
        request: SolveRequest,
    ) -> bool {
        self.tx
            .send(AgentCommand::StartSolver {
                master,
                request_id,
                request,
            })
            .is_ok()
    }

    pub async fn status(&self) -> Option<AgentStatus> {
        let (reply, response) = oneshot::channel();
        self.tx.send(AgentCommand::Status { reply }).ok()?;

        response.await.ok()
    }
}

struct MasterLink {
    session: u64,
    sink: MasterSink,
}

/// The slave agent actor: owns the slot pool and the job table, launches and supervises
/// solver workers, and reports every job's end to the master that requested it.
pub struct SlaveAgent {
    identity: NodeIdentity,
    command: SolverCommand,
    pool: SlotPool,
    jobs: HashMap<JobId, JobRecord>,
    masters: HashMap<NodeIdentity, MasterLink>,
    tx: mpsc::UnboundedSender<AgentCommand>,
    rx: mpsc::UnboundedReceiver<AgentCommand>,
}

impl SlaveAgent {
    pub fn new(
        identity: NodeIdentity,
        total_slots: u32,
        command: SolverCommand,
    ) -> (Self, AgentHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                identity,
                command,
                pool: SlotPool::new(total_slots),
                jobs: HashMap::new(),
                masters: HashMap::new(),
                tx: tx.clone(),
                rx,
            },
            AgentHandle { tx },
        )
    }

    pub fn spawn(
        identity: NodeIdentity,
        total_slots: u32,
        command: SolverCommand,
        shutdown: CancellationToken,
    ) -> (AgentHandle, JoinHandle<()>) {
        let (agent, handle) = Self::new(identity, total_slots, command);

        (handle, tokio::spawn(agent.run(shutdown)))
    }

    /// Process commands until `shutdown` fires. Workers still running at that point are
    /// left alone, their results are never reported.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            slave = %self.identity,
            slots = self.pool.total(),
            "Slave agent started"
        );

        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.rx.recv() => command,
            };

            match command {
                Some(command) => self.handle(command),
                None => break,
            }
        }

        if !self.jobs.is_empty() {
            warn!(
                slave = %self.identity,
                running = self.jobs.len(),
                "Slave agent stopped with solvers still running"
            );
        }
        debug!(slave = %self.identity, "Slave agent stopped");
    }

    fn handle(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::Attach {
                master,
                session,
                sink,
                reply,
            } => {
                info!(slave = %self.identity, master = %master, session, "Master attached");
                self.masters.insert(master, MasterLink { session, sink });
                let _ = reply.send(self.pool.total());
            }
            AgentCommand::Detach { master, session } => {
                if self
                    .masters
                    .get(&master)
                    .map_or(false, |link| link.session == session)
                {
                    self.masters.remove(&master);
                    info!(slave = %self.identity, master = %master, session, "Master detached");
                }
            }
            AgentCommand::StartSolver {
                master,
                request_id,
                request,
            } => {
                let (reply, launch_failure) = self.start_solver(&master, request);
                self.notify(&master, SlaveMessage::Started { request_id, reply });

                // the acceptance goes out first, the failure notice right behind it
                if let Some(notice) = launch_failure {
                    self.notify(&master, SlaveMessage::JobFinished(notice));
                }
            }
            AgentCommand::WorkerExited { job_id, outcome } => self.worker_exited(job_id, outcome),
            AgentCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// Reserve slots and launch a worker in one step. A worker that cannot be launched
    /// still yields an acceptance, followed by the failure notice returned alongside it.
    fn start_solver(
        &mut self,
        master: &NodeIdentity,
        request: SolveRequest,
    ) -> (StartReply, Option<JobFinished>) {
        let job_id = Uuid::new_v4();

        match self.pool.reserve(job_id, request.slots) {
            Ok(()) => {}
            Err(SlotError::Exhausted { free, requested }) => {
                debug!(
                    slave = %self.identity,
                    master = %master,
                    stub = ?request.stub,
                    free,
                    "No free capacity"
                );

                return (
                    StartReply::Rejected {
                        reason: Rejection::NoFreeCapacity {
                            free_slots: free,
                            requested,
                        },
                    },
                    None,
                );
            }
            Err(error) => {
                warn!(
                    slave = %self.identity,
                    master = %master,
                    error = %error,
                    "Rejecting start request"
                );

                return (
                    StartReply::Rejected {
                        reason: Rejection::InvalidRequest {
                            message: error.to_string(),
                        },
                    },
                    None,
                );
            }
        }

        let launch_failure = match self.command.launch(&request.stub, &request.options) {
            Ok(worker) => {
                let pid = worker.pid();
                let mailbox = self.tx.clone();
                let _watcher = worker::watch(job_id, worker, move |job_id, outcome| {
                    let _ = mailbox.send(AgentCommand::WorkerExited { job_id, outcome });
                });

                info!(
                    slave = %self.identity,
                    master = %master,
                    job = %job_id,
                    pid = ?pid,
                    stub = ?request.stub,
                    free = self.pool.free(),
                    "Solver started"
                );

                self.jobs.insert(
                    job_id,
                    JobRecord {
                        job_id,
                        stub: request.stub,
                        options: request.options,
                        pid,
                        requester: master.clone(),
                        slots_held: request.slots,
                        started_at: Utc::now(),
                    },
                );

                None
            }
            Err(error) => {
                self.pool.release(&job_id);
                warn!(
                    slave = %self.identity,
                    stub = ?request.stub,
                    error = %error,
                    "Failed to launch solver"
                );

                Some(JobFinished {
                    job_id,
                    stub: request.stub,
                    outcome: JobOutcome::Failure {
                        reason: format!("failed to launch solver: {error}"),
                    },
                })
            }
        };

        (
            StartReply::Accepted {
                job_id,
                free_slots: self.pool.free(),
            },
            launch_failure,
        )
    }

    fn worker_exited(&mut self, job_id: JobId, outcome: JobOutcome) {
        let (requester, stub) = match self.jobs.remove(&job_id) {
            Some(record) => {
                let released = self.pool.release(&job_id);
                debug_assert_eq!(released, Some(record.slots_held));
                let runtime = Utc::now() - record.started_at;
                info!(
                    slave = %self.identity,
                    job = %job_id,
                    success = outcome.is_success(),
                    runtime_ms = runtime.num_milliseconds(),
                    free = self.pool.free(),
                    "Solver finished"
                );

                (record.requester, record.stub)
            }
            None => {
                debug!(
                    slave = %self.identity,
                    job = %job_id,
                    "Ignoring exit of a job that is no longer tracked"
                );
                return;
            }
        };

        self.notify(
            &requester,
            SlaveMessage::JobFinished(JobFinished {
                job_id,
                stub,
                outcome,
            }),
        );
    }

    fn notify(&self, master: &NodeIdentity, message: SlaveMessage) {
        match self.masters.get(master) {
            Some(link) => {
                if link.sink.send(message).is_err() {
                    warn!(
                        slave = %self.identity,
                        master = %master,
                        "Master session closed, dropping message"
                    );
                }
            }
            None => warn!(
                slave = %self.identity,
                master = %master,
                "Master not attached, dropping message"
            ),
        }
    }

    fn status(&self) -> AgentStatus {
        let mut running = self
            .jobs
            .values()
            .map(|record| (record.job_id, record.stub.clone()))
            .collect::<Vec<_>>();
        running.sort();

        AgentStatus {
            total_slots: self.pool.total(),
            free_slots: self.pool.free(),
            running,
        }
    }
}
