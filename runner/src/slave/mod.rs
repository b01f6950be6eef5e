//! Slave agent: owns this host's slots and runs solver workers on behalf of masters.
//!
//! [`agent::SlaveAgent`] is the single writer of the slot pool and job table, so a
//! reservation and the worker launch that follows it happen as one step relative to any
//! other start request. [`server`] accepts master sessions and relays their requests.

pub mod agent;
pub mod server;
pub mod slots;
pub mod worker;

use crate::{
    config::{ClusterConfig, HOSTNAME},
    protocol::{NodeIdentity, Role},
    registry::RegistryClient,
};
use agent::SlaveAgent;
use server::SessionSettings;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use worker::SolverCommand;

#[derive(Debug, Error)]
pub enum SlaveError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity a slave announces: the configured advertise address, the bound address if it
/// names a specific interface, or this host's name with the bound port
pub fn advertised_identity(advertise: Option<&str>, bound: SocketAddr) -> NodeIdentity {
    match advertise {
        Some(address) => NodeIdentity::new(address),
        None if bound.ip().is_unspecified() => {
            NodeIdentity::new(format!("{}:{}", *HOSTNAME, bound.port()))
        }
        None => NodeIdentity::from(bound),
    }
}

/// Run a slave on its configured listen address until `shutdown` fires
pub async fn run(config: ClusterConfig, shutdown: CancellationToken) -> Result<(), SlaveError> {
    let listener = TcpListener::bind(&config.slave.listen)
        .await
        .map_err(|source| SlaveError::Bind {
            addr: config.slave.listen.clone(),
            source,
        })?;

    run_with_listener(listener, config, shutdown).await
}

/// Run a slave on an already bound listener, withdrawing it from the registry on shutdown
pub async fn run_with_listener(
    listener: TcpListener,
    config: ClusterConfig,
    shutdown: CancellationToken,
) -> Result<(), SlaveError> {
    let identity = advertised_identity(config.slave.advertise.as_deref(), listener.local_addr()?);
    let total_slots = config.slave.total_slots();

    let (agent, agent_task) = SlaveAgent::spawn(
        identity.clone(),
        total_slots,
        SolverCommand::from(&config.solver),
        shutdown.clone(),
    );

    // the registry session outlives `shutdown` so the slave can still unregister
    let registry_shutdown = CancellationToken::new();
    let (registry, registry_task) = RegistryClient::spawn(
        config.registry.address.clone(),
        Some((identity.clone(), Role::Slave)),
        config.registry.request_timeout(),
        config.slave.heartbeat_interval(),
        registry_shutdown.clone(),
    );

    info!(slave = %identity, slots = total_slots, registry = %config.registry.address, "Slave up");
    server::serve(
        listener,
        agent,
        SessionSettings {
            identity: identity.clone(),
            liveness_timeout: config.slave.liveness_timeout(),
            handshake_timeout: config.registry.request_timeout(),
        },
        shutdown,
    )
    .await;

    if let Err(error) = registry.unregister().await {
        warn!(
            slave = %identity,
            error = %error,
            "Failed to unregister, the registry will notice the lost session"
        );
    }
    registry_shutdown.cancel();
    let _ = registry_task.await;
    let _ = agent_task.await;
    info!(slave = %identity, "Slave stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_prefers_advertise_then_bound_address() {
        let wildcard: SocketAddr = "0.0.0.0:7171".parse().unwrap();
        let loopback: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        assert_eq!(
            advertised_identity(Some("10.0.0.5:7171"), wildcard).as_str(),
            "10.0.0.5:7171"
        );
        assert_eq!(advertised_identity(None, loopback).as_str(), "127.0.0.1:40000");
        assert_eq!(
            advertised_identity(None, wildcard).as_str(),
            format!("{}:7171", *HOSTNAME)
        );
    }
}
