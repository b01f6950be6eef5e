//! Node registry: the directory of live slaves and masters, used purely for discovery.
//!
//! The [`Registry`] actor owns the [`Directory`] and processes one [`RegistryCommand`] at
//! a time. [`server`] exposes it over TCP and turns lost connections into
//! [`RegistryCommand::SessionLost`]; [`client`] is the node-side session that registers,
//! heartbeats and answers discovery queries.

pub mod client;
pub mod server;
pub mod state;

pub use client::RegistryClient;
pub use state::{Directory, SessionId};

use crate::{
    config::RegistryConfig,
    protocol::{NodeIdentity, RegistryEntry, Role},
    transport::TransportError,
};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry is unavailable: {0}")]
    Unavailable(#[from] TransportError),
    #[error("registry rejected the request: {0}")]
    Rejected(String),
    #[error("unexpected response from registry")]
    UnexpectedResponse,
    #[error("registry has shut down")]
    Stopped,
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// Serve the registry on its configured address until `shutdown` fires
pub async fn run(config: RegistryConfig, shutdown: CancellationToken) -> Result<(), RegistryError> {
    let listener = TcpListener::bind(&config.address)
        .await
        .map_err(|source| RegistryError::Bind {
            addr: config.address.clone(),
            source,
        })?;
    let (registry, actor) = Registry::spawn();

    server::serve(listener, registry, config, shutdown).await;
    // sessions still hold handles until they notice the shutdown
    actor.abort();
    info!("Registry stopped");

    Ok(())
}

#[derive(Debug)]
pub enum RegistryCommand {
    Register {
        identity: NodeIdentity,
        role: Role,
        session: SessionId,
        reply: oneshot::Sender<RegistryEntry>,
    },
    Unregister {
        identity: NodeIdentity,
        reply: oneshot::Sender<bool>,
    },
    ListByRole {
        role: Role,
        reply: oneshot::Sender<Vec<NodeIdentity>>,
    },
    /// liveness signal of a registered connection was lost
    SessionLost {
        identity: NodeIdentity,
        session: SessionId,
    },
}

/// Mailbox address of the registry actor
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<RegistryCommand>,
}

impl RegistryHandle {
    pub async fn register(
        &self,
        identity: NodeIdentity,
        role: Role,
        session: SessionId,
    ) -> Result<RegistryEntry, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.send(RegistryCommand::Register {
            identity,
            role,
            session,
            reply,
        })?;

        response.await.map_err(|_| RegistryError::Stopped)
    }

    pub async fn unregister(&self, identity: NodeIdentity) -> Result<bool, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.send(RegistryCommand::Unregister { identity, reply })?;

        response.await.map_err(|_| RegistryError::Stopped)
    }

    pub async fn list_by_role(&self, role: Role) -> Result<Vec<NodeIdentity>, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.send(RegistryCommand::ListByRole { role, reply })?;

        response.await.map_err(|_| RegistryError::Stopped)
    }

    pub fn session_lost(&self, identity: NodeIdentity, session: SessionId) {
        if self
            .send(RegistryCommand::SessionLost { identity, session })
            .is_err()
        {
            debug!("Registry stopped before a session loss could be delivered");
        }
    }

    fn send(&self, command: RegistryCommand) -> Result<(), RegistryError> {
        self.tx.send(command).map_err(|_| RegistryError::Stopped)
    }
}

/// The registry actor
#[derive(Debug)]
pub struct Registry {
    directory: Directory,
    rx: mpsc::UnboundedReceiver<RegistryCommand>,
}

impl Registry {
    pub fn new() -> (Self, RegistryHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                directory: Directory::new(),
                rx,
            },
            RegistryHandle { tx },
        )
    }

    /// Start the actor on its own task, it stops once every handle is dropped
    pub fn spawn() -> (RegistryHandle, JoinHandle<()>) {
        let (registry, handle) = Self::new();

        (handle, tokio::spawn(registry.run()))
    }

    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            self.handle(command);
        }

        debug!(nodes = self.directory.len(), "Registry mailbox closed");
    }

    fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Register {
                identity,
                role,
                session,
                reply,
            } => {
                let entry = self.directory.register(identity, role, session);
                let _ = reply.send(entry);
            }
            RegistryCommand::Unregister { identity, reply } => {
                let _ = reply.send(self.directory.unregister(&identity));
            }
            RegistryCommand::ListByRole { role, reply } => {
                let _ = reply.send(self.directory.list_by_role(role));
            }
            RegistryCommand::SessionLost { identity, session } => {
                self.directory.session_lost(&identity, session);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn actor_serves_directory_operations() {
        let (handle, _task) = Registry::spawn();
        let slave = NodeIdentity::from("s1:7171");

        handle.register(slave.clone(), Role::Slave, 1).await.unwrap();
        handle.register(slave.clone(), Role::Slave, 1).await.unwrap();
        assert_eq!(
            handle.list_by_role(Role::Slave).await.unwrap(),
            vec![slave.clone()]
        );

        handle.session_lost(slave.clone(), 1);
        assert!(handle.list_by_role(Role::Slave).await.unwrap().is_empty());
        assert!(!handle.unregister(slave).await.unwrap());
    }
}
