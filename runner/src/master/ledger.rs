use super::task::TaskId;
use crate::protocol::{JobId, NodeIdentity};
use std::collections::HashMap;

/// Jobs in flight per slave, as the master believes them to be
///
/// Mirrors every task in the `Dispatched` state. It decides how much capacity a slave is
/// believed to have left and which tasks to requeue when the slave is lost, without ever
/// asking the slave.
#[derive(Debug, Default)]
pub struct DispatchLedger {
    slaves: HashMap<NodeIdentity, HashMap<JobId, TaskId>>,
}

impl DispatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, slave: NodeIdentity, job_id: JobId, task: TaskId) {
        self.slaves.entry(slave).or_default().insert(job_id, task);
    }

    /// Remove a finished job, returning the task it belongs to
    pub fn settle(&mut self, slave: &NodeIdentity, job_id: &JobId) -> Option<TaskId> {
        let jobs = self.slaves.get_mut(slave)?;
        let task = jobs.remove(job_id);
        if jobs.is_empty() {
            self.slaves.remove(slave);
        }

        task
    }

    pub fn in_flight(&self, slave: &NodeIdentity) -> usize {
        self.slaves.get(slave).map_or(0, HashMap::len)
    }

    /// Clear everything listed under a lost slave, returning the affected tasks in order
    pub fn drain(&mut self, slave: &NodeIdentity) -> Vec<(JobId, TaskId)> {
        let mut jobs = self
            .slaves
            .remove(slave)
            .map(|jobs| jobs.into_iter().collect::<Vec<_>>())
            .unwrap_or_default();
        jobs.sort_by_key(|(_, task)| *task);

        jobs
    }

    pub fn total(&self) -> usize {
        self.slaves.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn drain_returns_exactly_the_lost_slaves_jobs() {
        let mut ledger = DispatchLedger::new();
        let (lost, kept) = (NodeIdentity::from("s1:7171"), NodeIdentity::from("s2:7171"));
        let jobs = (0..3).map(|_| Uuid::new_v4()).collect::<Vec<_>>();

        ledger.record(lost.clone(), jobs[0], 2);
        ledger.record(kept.clone(), jobs[1], 0);
        ledger.record(lost.clone(), jobs[2], 1);
        assert_eq!(ledger.in_flight(&lost), 2);
        assert_eq!(ledger.total(), 3);

        assert_eq!(ledger.drain(&lost), vec![(jobs[2], 1), (jobs[0], 2)]);
        assert_eq!(ledger.in_flight(&lost), 0);
        assert_eq!(ledger.in_flight(&kept), 1);
        assert!(ledger.drain(&lost).is_empty());
    }

    #[test]
    fn settle_only_matches_the_owning_slave() {
        let mut ledger = DispatchLedger::new();
        let (s1, s2) = (NodeIdentity::from("s1:7171"), NodeIdentity::from("s2:7171"));
        let job = Uuid::new_v4();
        ledger.record(s1.clone(), job, 4);

        assert_eq!(ledger.settle(&s2, &job), None);
        assert_eq!(ledger.settle(&s1, &job), Some(4));
        assert_eq!(ledger.settle(&s1, &job), None);
        assert_eq!(ledger.total(), 0);
    }
}
