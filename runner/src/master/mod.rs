//! Master: discovers slaves, hands them subproblems and requeues whatever fails.
//!
//! [`actor::Master`] is the sole owner of the task table and the dispatch ledger. Each
//! slave it talks to gets a [`session::SlaveLink`], whose background task reports job
//! notices and the loss of the slave back to the master's mailbox.

pub mod actor;
pub mod control;
pub mod ledger;
pub mod session;
pub mod task;

pub use actor::{Discovery, Master, MasterHandle, MasterSettings, RunMode};

#[cfg(feature = "rusqlite")]
use crate::database::{ConnectionError, ResultStore};
use crate::{
    config::{ClusterConfig, HOSTNAME},
    protocol::{NodeIdentity, Role, TaskReport},
    registry::{RegistryClient, RegistryError},
    transport::TransportError,
};
use std::{path::PathBuf, time::Duration};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("slave {slave} is unreachable: {source}")]
    Unreachable {
        slave: NodeIdentity,
        source: TransportError,
    },
    #[error("handshake with slave {slave} failed: {reason}")]
    Handshake { slave: NodeIdentity, reason: String },
    #[error("slave {slave} did not answer within {timeout:?}")]
    Timeout {
        slave: NodeIdentity,
        timeout: Duration,
    },
    #[error("session with slave {0} is closed")]
    LinkClosed(NodeIdentity),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("control request failed: {0}")]
    Control(#[from] TransportError),
    #[error("master refused the request: {0}")]
    Refused(String),
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[cfg(feature = "rusqlite")]
    #[error("result store failed: {0}")]
    Store(#[from] ConnectionError),
    #[error("master has stopped")]
    Stopped,
}

/// A master's identity, unique per process on this host
pub fn master_identity() -> NodeIdentity {
    NodeIdentity::new(format!("{}:master-{}", *HOSTNAME, std::process::id()))
}

/// Solve `stubs` on the cluster and report every task's final state. In standing mode the
/// master keeps running after the first batch, serving the control endpoint, until
/// `shutdown` fires.
pub async fn run(
    config: ClusterConfig,
    mode: RunMode,
    stubs: Vec<PathBuf>,
    options: Vec<String>,
    shutdown: CancellationToken,
) -> Result<Vec<TaskReport>, MasterError> {
    let identity = master_identity();

    let control = match (mode, config.master.control.as_deref()) {
        (RunMode::Standing, Some(addr)) => Some(TcpListener::bind(addr).await.map_err(|source| {
            MasterError::Bind {
                addr: addr.to_string(),
                source,
            }
        })?),
        (RunMode::Standing, None) => {
            warn!("Standing master without a control address, it cannot take further batches");
            None
        }
        (RunMode::SolveOnce, _) => None,
    };

    let registry_shutdown = CancellationToken::new();
    let (registry, registry_task) = RegistryClient::spawn(
        config.registry.address.clone(),
        Some((identity.clone(), Role::Master)),
        config.registry.request_timeout(),
        config.master.heartbeat_interval(),
        registry_shutdown.clone(),
    );

    let (mut master, handle) = Master::new(
        MasterSettings::new(identity.clone(), &config.master, options),
        mode,
        Discovery::Registry(registry.clone()),
        shutdown.clone(),
    );

    #[cfg(feature = "rusqlite")]
    if let Some(path) = &config.database.path {
        master = master.with_store(ResultStore::open(path, &identity)?);
    }

    let queued = master.submit(stubs);
    info!(master = %identity, queued, registry = %config.registry.address, "Master up");

    if let Some(listener) = control {
        tokio::spawn(control::serve(listener, handle, shutdown.clone()));
    }

    let report = master.run().await;

    if let Err(error) = registry.unregister().await {
        warn!(master = %identity, error = %error, "Failed to unregister from registry");
    }
    registry_shutdown.cancel();
    let _ = registry_task.await;

    Ok(report)
}
