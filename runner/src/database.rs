//! SQLite record of every subproblem that reached a terminal state, so a run can be
//! audited after the master exits

use crate::protocol::{NodeIdentity, TaskReport, TaskStatus};
use chrono::Utc;
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection};
use std::{path::Path, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("SQLite error: {0}")]
    SQLite(#[from] rusqlite::Error),
}

pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists runs (
    id integer primary key,
    master text not null,
    started_at text not null
);",
    "create table if not exists outcomes (
    id integer primary key,
    run integer not null references runs (id),
    stub text not null,
    status text not null,
    slave text,
    attempts integer not null,
    result text,
    reason text,
    recorded_at text not null
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

/// One stored row of the `outcomes` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOutcome {
    pub stub: String,
    pub status: String,
    pub slave: Option<String>,
    pub attempts: u32,
    pub result: Option<String>,
    pub reason: Option<String>,
}

/// Transparent, thread safe handle on the result database, scoped to one master run
#[derive(Debug, Clone)]
pub struct ResultStore {
    connection: Arc<FairMutex<Connection>>,
    run: i64,
}

impl ResultStore {
    /// Open (or create) the database at `path` and start a new run for `master`
    pub fn open(path: &Path, master: &NodeIdentity) -> Result<Self, ConnectionError> {
        Self::init(Connection::open(path)?, master)
    }

    pub fn in_memory(master: &NodeIdentity) -> Result<Self, ConnectionError> {
        Self::init(Connection::open_in_memory()?, master)
    }

    fn init(connection: Connection, master: &NodeIdentity) -> Result<Self, ConnectionError> {
        for (counter, table) in SQL_SCHEMA.iter().enumerate() {
            if let Err(error) = connection.execute(table, []) {
                error!(
                    error = ?error,
                    "Failed to apply SQL schema ({}/{SQL_SCHEMA_NUMBER}): {error}",
                    counter + 1
                );

                return Err(ConnectionError::SQLite(error));
            }
            debug!("Applied SQL schema ({}/{SQL_SCHEMA_NUMBER})", counter + 1);
        }

        connection
            .prepare_cached("insert into runs (master, started_at) values (?, ?)")?
            .execute(params![master.as_str(), Utc::now().to_rfc3339()])?;
        let run = connection.last_insert_rowid();
        info!(run, master = %master, "Recording outcomes");

        Ok(Self {
            connection: Arc::new(FairMutex::new(connection)),
            run,
        })
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, Connection> {
        self.connection.lock_arc()
    }

    pub fn run(&self) -> i64 {
        self.run
    }

    /// Store the terminal state of one task; `slave` ran its last attempt
    pub fn record(&self, report: &TaskReport, slave: &NodeIdentity) -> Result<(), ConnectionError> {
        let (status, result) = match &report.status {
            TaskStatus::Completed { result } => {
                ("completed", Some(result.to_string_lossy().into_owned()))
            }
            TaskStatus::Failed { .. } => ("failed", None),
            other => {
                debug!(stub = ?report.stub, status = %other, "Not storing unfinished task");
                return Ok(());
            }
        };

        self.lock()
            .prepare_cached(
                "insert into outcomes
                 (run, stub, status, slave, attempts, result, reason, recorded_at)
                 values (?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                self.run,
                report.stub.to_string_lossy().as_ref(),
                status,
                slave.as_str(),
                report.attempts,
                result,
                report.last_reason,
                Utc::now().to_rfc3339()
            ])?;

        debug!(stub = ?report.stub, status, "Stored outcome");

        Ok(())
    }

    /// Outcomes stored for this run, oldest first
    pub fn outcomes(&self) -> Result<Vec<StoredOutcome>, ConnectionError> {
        let connection = self.lock();
        let mut statement = connection.prepare_cached(
            "select stub, status, slave, attempts, result, reason
             from outcomes where run = ? order by id",
        )?;

        let outcomes = statement
            .query_map(params![self.run], |row| {
                Ok(StoredOutcome {
                    stub: row.get(0)?,
                    status: row.get(1)?,
                    slave: row.get(2)?,
                    attempts: row.get(3)?,
                    result: row.get(4)?,
                    reason: row.get(5)?,
                })
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<StoredOutcome>, ConnectionError>(init)
            })?;

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn stores_terminal_outcomes_only() {
        let store = ResultStore::in_memory(&NodeIdentity::from("master-1")).unwrap();
        let slave = NodeIdentity::from("s1:7171");

        store
            .record(
                &TaskReport {
                    stub: PathBuf::from("/work/a.nl"),
                    status: TaskStatus::Completed {
                        result: PathBuf::from("/work/a.sol"),
                    },
                    attempts: 1,
                    last_reason: Some("solver exited with status 3".to_string()),
                },
                &slave,
            )
            .unwrap();
        store
            .record(
                &TaskReport {
                    stub: PathBuf::from("/work/b.nl"),
                    status: TaskStatus::Pending,
                    attempts: 0,
                    last_reason: None,
                },
                &slave,
            )
            .unwrap();
        store
            .record(
                &TaskReport {
                    stub: PathBuf::from("/work/c.nl"),
                    status: TaskStatus::Failed {
                        reason: "slave s1:7171 lost".to_string(),
                    },
                    attempts: 4,
                    last_reason: Some("slave s1:7171 lost".to_string()),
                },
                &slave,
            )
            .unwrap();

        let outcomes = store.outcomes().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].stub, "/work/a.nl");
        assert_eq!(outcomes[0].status, "completed");
        assert_eq!(outcomes[0].result.as_deref(), Some("/work/a.sol"));
        assert_eq!(outcomes[1].status, "failed");
        assert_eq!(outcomes[1].attempts, 4);
        assert_eq!(outcomes[1].slave.as_deref(), Some("s1:7171"));
        assert_eq!(outcomes[1].reason.as_deref(), Some("slave s1:7171 lost"));
    }

    #[test]
    fn runs_are_kept_apart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let report = TaskReport {
            stub: PathBuf::from("a.nl"),
            status: TaskStatus::Completed {
                result: PathBuf::from("a.sol"),
            },
            attempts: 0,
            last_reason: None,
        };

        let first = ResultStore::open(&path, &NodeIdentity::from("master-1")).unwrap();
        first.record(&report, &NodeIdentity::from("s1:7171")).unwrap();
        let second = ResultStore::open(&path, &NodeIdentity::from("master-2")).unwrap();

        assert_ne!(first.run(), second.run());
        assert_eq!(first.outcomes().unwrap().len(), 1);
        assert!(second.outcomes().unwrap().is_empty());
    }
}
