use super::{
    ledger::DispatchLedger,
    session::{LinkSettings, SlaveLink},
    task::{Phase, TaskId, TaskTable},
    MasterError,
};
#[cfg(feature = "rusqlite")]
use crate::database::ResultStore;
use crate::{
    config::MasterConfig,
    liveness,
    protocol::{
        JobFinished, JobId, JobOutcome, NodeIdentity, Rejection, Role, SolveRequest, StartReply,
        TaskReport, TaskStatus,
    },
    registry::RegistryClient,
};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum MasterCommand {
    Submit {
        stubs: Vec<PathBuf>,
        reply: oneshot::Sender<usize>,
    },
    Status {
        reply: oneshot::Sender<Vec<TaskReport>>,
    },
    JobFinished {
        slave: NodeIdentity,
        finished: JobFinished,
    },
    /// posted once by a slave session when its slave stopped responding
    SlaveLost { slave: NodeIdentity, generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// stop once every task is done
    SolveOnce,
    /// stay resident and accept further batches
    Standing,
}

/// Where a master learns about slaves
#[derive(Debug, Clone)]
pub enum Discovery {
    Registry(RegistryClient),
    Static(Vec<NodeIdentity>),
}

#[derive(Debug, Clone)]
pub struct MasterSettings {
    pub identity: NodeIdentity,
    /// handed to every solver after the stub
    pub options: Vec<String>,
    pub retry_limit: u32,
    pub link: LinkSettings,
    pub dispatch_interval: Duration,
    pub discovery_interval: Duration,
}

impl MasterSettings {
    pub fn new(identity: NodeIdentity, config: &MasterConfig, options: Vec<String>) -> Self {
        Self {
            identity,
            options,
            retry_limit: config.retry_limit,
            link: LinkSettings {
                request_timeout: config.request_timeout(),
                heartbeat_interval: config.heartbeat_interval(),
                liveness_timeout: config.liveness_timeout(),
            },
            dispatch_interval: config.dispatch_interval(),
            discovery_interval: config.discovery_interval(),
        }
    }
}

/// Mailbox address of a running master
#[derive(Debug, Clone)]
pub struct MasterHandle {
    tx: mpsc::UnboundedSender<MasterCommand>,
}

impl MasterHandle {
    /// Queue further stubs, returns how many new tasks were created
    pub async fn submit(&self, stubs: Vec<PathBuf>) -> Result<usize, MasterError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(MasterCommand::Submit { stubs, reply })
            .map_err(|_| MasterError::Stopped)?;

        response.await.map_err(|_| MasterError::Stopped)
    }

    pub async fn status(&self) -> Result<Vec<TaskReport>, MasterError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(MasterCommand::Status { reply })
            .map_err(|_| MasterError::Stopped)?;

        response.await.map_err(|_| MasterError::Stopped)
    }
}

/// The master actor: owns the task table and the dispatch ledger, and is the only one
/// changing either
pub struct Master {
    settings: MasterSettings,
    mode: RunMode,
    discovery: Discovery,
    tasks: TaskTable,
    ledger: DispatchLedger,
    phase: Phase,
    // last known slaves, in dispatch order
    known: Vec<NodeIdentity>,
    // slaves that refused a connection since the last discovery
    unreachable: HashSet<NodeIdentity>,
    links: HashMap<NodeIdentity, SlaveLink>,
    cursor: usize,
    next_generation: u64,
    shutdown: CancellationToken,
    #[cfg(feature = "rusqlite")]
    store: Option<ResultStore>,
    tx: mpsc::UnboundedSender<MasterCommand>,
    rx: mpsc::UnboundedReceiver<MasterCommand>,
}

impl Master {
    pub fn new(
        settings: MasterSettings,
        mode: RunMode,
        discovery: Discovery,
        shutdown: CancellationToken,
    ) -> (Self, MasterHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                settings,
                mode,
                discovery,
                tasks: TaskTable::new(),
                ledger: DispatchLedger::new(),
                phase: Phase::Initializing,
                known: Vec::new(),
                unreachable: HashSet::new(),
                links: HashMap::new(),
                cursor: 0,
                next_generation: 0,
                shutdown,
                #[cfg(feature = "rusqlite")]
                store: None,
                tx: tx.clone(),
                rx,
            },
            MasterHandle { tx },
        )
    }

    /// Record every terminal outcome in `store`
    #[cfg(feature = "rusqlite")]
    pub fn with_store(mut self, store: ResultStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Queue the initial batch, before the master starts running
    pub fn submit(&mut self, stubs: impl IntoIterator<Item = PathBuf>) -> usize {
        self.tasks.submit(stubs)
    }

    /// Dispatch until every task is done (solve-once) or until shutdown (standing), then
    /// report the final state of every task
    pub async fn run(mut self) -> Vec<TaskReport> {
        info!(
            master = %self.settings.identity,
            tasks = self.tasks.len(),
            mode = ?self.mode,
            "Master started"
        );
        self.discover().await;

        let mut dispatch_tick = liveness::heartbeat(self.settings.dispatch_interval);
        let mut discovery_tick = liveness::heartbeat(self.settings.discovery_interval);
        let shutdown = self.shutdown.clone();

        loop {
            self.dispatch().await;
            self.update_phase();

            if self.mode == RunMode::SolveOnce && self.phase == Phase::Done {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(
                        master = %self.settings.identity,
                        in_flight = self.ledger.total(),
                        "Master shutting down"
                    );
                    break;
                }
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = dispatch_tick.tick() => {}
                _ = discovery_tick.tick() => self.discover().await,
            }
        }

        self.tasks.report()
    }

    fn update_phase(&mut self) {
        let phase = self.tasks.phase();

        if phase != self.phase {
            info!(
                master = %self.settings.identity,
                from = %self.phase,
                to = %phase,
                in_flight = self.ledger.total(),
                "Master phase changed"
            );
            self.phase = phase;
        }
    }

    fn handle(&mut self, command: MasterCommand) {
        match command {
            MasterCommand::Submit { stubs, reply } => {
                let added = self.tasks.submit(stubs);
                info!(master = %self.settings.identity, added, "Accepted batch");
                let _ = reply.send(added);
            }
            MasterCommand::Status { reply } => {
                let _ = reply.send(self.tasks.report());
            }
            MasterCommand::JobFinished { slave, finished } => self.job_finished(slave, finished),
            MasterCommand::SlaveLost { slave, generation } => self.slave_lost(slave, generation),
        }
    }

    fn job_finished(&mut self, slave: NodeIdentity, finished: JobFinished) {
        let task = match self.ledger.settle(&slave, &finished.job_id) {
            Some(task) => task,
            None => {
                warn!(
                    slave = %slave,
                    job = %finished.job_id,
                    stub = ?finished.stub,
                    "Notice for a job not in the ledger, ignoring"
                );
                return;
            }
        };

        match finished.outcome {
            JobOutcome::Success { result } => {
                if self.tasks.complete(task, &finished.job_id, result) {
                    self.persist(task, &slave);
                }
            }
            JobOutcome::Failure { reason } => {
                warn!(
                    slave = %slave,
                    stub = ?finished.stub,
                    reason = %reason,
                    "Subproblem failed on slave"
                );
                self.failed(task, &finished.job_id, reason, &slave);
            }
        }
    }

    /// Fail every job the master had outstanding on a lost slave
    fn slave_lost(&mut self, slave: NodeIdentity, generation: u64) {
        match self.links.get(&slave) {
            Some(link) if link.generation == generation => {
                self.links.remove(&slave);
            }
            _ => {
                debug!(slave = %slave, generation, "Loss of a superseded session, ignoring");
                return;
            }
        }
        self.unreachable.insert(slave.clone());

        let lost = self.ledger.drain(&slave);
        warn!(slave = %slave, jobs = lost.len(), "Lost slave, requeueing its jobs");

        for (job_id, task) in lost {
            self.failed(task, &job_id, format!("slave {slave} lost"), &slave);
        }
    }

    fn failed(&mut self, task: TaskId, job_id: &JobId, reason: String, slave: &NodeIdentity) {
        let terminal = self
            .tasks
            .fail(task, job_id, reason, self.settings.retry_limit)
            .map_or(false, TaskStatus::is_terminal);

        if terminal {
            self.persist(task, slave);
        }
    }

    #[cfg(feature = "rusqlite")]
    fn persist(&self, task: TaskId, slave: &NodeIdentity) {
        if let (Some(store), Some(task)) = (&self.store, self.tasks.get(task)) {
            if let Err(error) = store.record(&task.report(), slave) {
                warn!(stub = ?task.stub, error = %error, "Failed to store outcome");
            }
        }
    }

    #[cfg(not(feature = "rusqlite"))]
    fn persist(&self, _task: TaskId, _slave: &NodeIdentity) {}

    async fn discover(&mut self) {
        let mut slaves = match &self.discovery {
            Discovery::Registry(client) => match client.list_by_role(Role::Slave).await {
                Ok(slaves) => slaves,
                Err(error) => {
                    warn!(
                        error = %error,
                        known = self.known.len(),
                        "Discovery failed, keeping known slaves"
                    );
                    return;
                }
            },
            Discovery::Static(slaves) => slaves.clone(),
        };
        slaves.sort();

        if slaves != self.known {
            info!(master = %self.settings.identity, slaves = ?slaves, "Slave list changed");
            self.known = slaves;
            self.cursor = 0;
        }
        self.unreachable.clear();
    }

    /// Hand pending tasks to slaves in submission order, stopping at the first task nobody
    /// accepts
    async fn dispatch(&mut self) {
        for task in self.tasks.pending() {
            if !self.dispatch_task(task).await {
                break;
            }
        }
    }

    /// Round-robin first fit, starting after the slave that accepted last
    async fn dispatch_task(&mut self, task: TaskId) -> bool {
        let stub = match self.tasks.get(task) {
            Some(task) => task.stub.clone(),
            None => return false,
        };
        let request = SolveRequest {
            stub,
            options: self.settings.options.clone(),
            slots: 1,
        };
        let count = self.known.len();

        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            let slave = self.known[index].clone();

            let link = match self.link(&slave).await {
                Some(link) => link,
                None => continue,
            };
            if self.ledger.in_flight(&slave) >= link.total_slots as usize {
                continue;
            }

            match link.start_solver(request.clone(), self.settings.link.request_timeout).await {
                Ok(StartReply::Accepted { job_id, free_slots }) => {
                    self.tasks.mark_dispatched(task, slave.clone(), job_id);
                    self.ledger.record(slave.clone(), job_id, task);
                    self.cursor = index + 1;
                    info!(
                        slave = %slave,
                        job = %job_id,
                        stub = ?request.stub,
                        free_slots,
                        "Dispatched subproblem"
                    );

                    return true;
                }
                Ok(StartReply::Rejected {
                    reason: Rejection::NoFreeCapacity { .. },
                }) => {
                    debug!(slave = %slave, stub = ?request.stub, "Slave has no free capacity");
                }
                Ok(StartReply::Rejected { reason }) => {
                    warn!(
                        slave = %slave,
                        stub = ?request.stub,
                        reason = %reason,
                        "Slave rejected subproblem"
                    );
                }
                Err(error) => {
                    warn!(
                        slave = %slave,
                        stub = ?request.stub,
                        error = %error,
                        "Start request failed"
                    );
                }
            }
        }

        false
    }

    /// The session to `slave`, opened on first use
    async fn link(&mut self, slave: &NodeIdentity) -> Option<SlaveLink> {
        if let Some(link) = self.links.get(slave) {
            return Some(link.clone());
        }
        if self.unreachable.contains(slave) {
            return None;
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        match SlaveLink::connect(
            slave.clone(),
            self.settings.identity.clone(),
            generation,
            self.settings.link,
            self.tx.clone(),
            self.shutdown.clone(),
        )
        .await
        {
            Ok(link) => {
                self.links.insert(slave.clone(), link.clone());
                Some(link)
            }
            Err(error) => {
                warn!(slave = %slave, error = %error, "Slave unreachable until the next discovery");
                self.unreachable.insert(slave.clone());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn master(mode: RunMode) -> (Master, MasterHandle) {
        let mut config = MasterConfig::default();
        config.retry_limit = 1;

        Master::new(
            MasterSettings::new(NodeIdentity::from("master-1"), &config, Vec::new()),
            mode,
            Discovery::Static(Vec::new()),
            CancellationToken::new(),
        )
    }

    /// Pretend a session to `slave` is up
    fn fake_link(master: &mut Master, slave: &str, generation: u64) -> NodeIdentity {
        let slave = NodeIdentity::from(slave);
        master
            .links
            .insert(slave.clone(), SlaveLink::detached(slave.clone(), 2, generation));

        slave
    }

    fn dispatch(master: &mut Master, task: TaskId, slave: &NodeIdentity) -> JobId {
        let job = Uuid::new_v4();
        assert!(master.tasks.mark_dispatched(task, slave.clone(), job));
        master.ledger.record(slave.clone(), job, task);
        job
    }

    #[test]
    fn slave_loss_requeues_exactly_its_jobs() {
        let (mut master, _handle) = master(RunMode::SolveOnce);
        master.submit(["a.nl", "b.nl", "c.nl"].into_iter().map(PathBuf::from));
        let lost = fake_link(&mut master, "s1:7171", 0);
        let kept = fake_link(&mut master, "s2:7171", 1);

        dispatch(&mut master, 0, &lost);
        let kept_job = dispatch(&mut master, 1, &kept);
        dispatch(&mut master, 2, &lost);

        master.handle(MasterCommand::SlaveLost {
            slave: lost.clone(),
            generation: 0,
        });

        assert_eq!(master.tasks.pending(), vec![0, 2]);
        assert_eq!(
            master.tasks.get(1).unwrap().status,
            TaskStatus::Dispatched {
                slave: kept.clone(),
                job_id: kept_job
            }
        );
        assert_eq!(master.ledger.in_flight(&lost), 0);
        assert_eq!(master.ledger.in_flight(&kept), 1);
        assert!(!master.links.contains_key(&lost));
        assert_eq!(
            master.tasks.get(0).unwrap().last_reason.as_deref(),
            Some("slave s1:7171 lost")
        );
    }

    #[test]
    fn superseded_session_loss_is_ignored() {
        let (mut master, _handle) = master(RunMode::SolveOnce);
        master.submit([PathBuf::from("a.nl")]);
        let slave = fake_link(&mut master, "s1:7171", 5);
        dispatch(&mut master, 0, &slave);

        master.handle(MasterCommand::SlaveLost {
            slave: slave.clone(),
            generation: 4,
        });

        assert!(master.tasks.pending().is_empty());
        assert_eq!(master.ledger.in_flight(&slave), 1);
    }

    #[test]
    fn notices_settle_tasks_and_unknown_jobs_are_ignored() {
        let (mut master, _handle) = master(RunMode::SolveOnce);
        master.submit(["a.nl", "b.nl"].into_iter().map(PathBuf::from));
        let slave = fake_link(&mut master, "s1:7171", 0);
        let a = dispatch(&mut master, 0, &slave);
        let b = dispatch(&mut master, 1, &slave);

        master.handle(MasterCommand::JobFinished {
            slave: slave.clone(),
            finished: JobFinished {
                job_id: Uuid::new_v4(),
                stub: PathBuf::from("x.nl"),
                outcome: JobOutcome::Failure {
                    reason: "stray".to_string(),
                },
            },
        });
        assert_eq!(master.ledger.total(), 2);

        master.handle(MasterCommand::JobFinished {
            slave: slave.clone(),
            finished: JobFinished {
                job_id: a,
                stub: PathBuf::from("a.nl"),
                outcome: JobOutcome::Success {
                    result: PathBuf::from("a.sol"),
                },
            },
        });

        // retry_limit 1: the second failure is final
        master.handle(MasterCommand::JobFinished {
            slave: slave.clone(),
            finished: JobFinished {
                job_id: b,
                stub: PathBuf::from("b.nl"),
                outcome: JobOutcome::Failure {
                    reason: "exit 3".to_string(),
                },
            },
        });
        assert_eq!(master.tasks.pending(), vec![1]);
        let b = dispatch(&mut master, 1, &slave);
        master.handle(MasterCommand::JobFinished {
            slave,
            finished: JobFinished {
                job_id: b,
                stub: PathBuf::from("b.nl"),
                outcome: JobOutcome::Failure {
                    reason: "exit 3".to_string(),
                },
            },
        });

        let report = master.tasks.report();
        assert_eq!(
            report[0].status,
            TaskStatus::Completed {
                result: PathBuf::from("a.sol")
            }
        );
        assert_eq!(
            report[1].status,
            TaskStatus::Failed {
                reason: "exit 3".to_string()
            }
        );
        assert_eq!(report[1].attempts, 2);
        assert!(master.tasks.is_done());
    }

    #[tokio::test]
    async fn solve_once_with_nothing_to_do_finishes() {
        let (master, _handle) = master(RunMode::SolveOnce);
        assert!(master.run().await.is_empty());
    }

    #[tokio::test]
    async fn standing_master_accepts_batches_and_reports() {
        let (master, handle) = master(RunMode::Standing);
        let shutdown = master.shutdown.clone();
        let running = tokio::spawn(master.run());

        assert_eq!(
            handle
                .submit(vec![PathBuf::from("a.nl"), PathBuf::from("a.nl")])
                .await
                .unwrap(),
            1
        );
        let report = handle.status().await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].status, TaskStatus::Pending);

        shutdown.cancel();
        assert_eq!(running.await.unwrap().len(), 1);
        assert!(matches!(handle.status().await, Err(MasterError::Stopped)));
    }
}
