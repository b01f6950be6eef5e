use super::RegistryError;
use crate::{
    liveness,
    protocol::{NodeIdentity, RegistryRequest, RegistryResponse, Role},
    transport::Connection,
};
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
enum ClientCommand {
    ListByRole {
        role: Role,
        reply: oneshot::Sender<Result<Vec<NodeIdentity>, RegistryError>>,
    },
    Unregister {
        reply: oneshot::Sender<Result<bool, RegistryError>>,
    },
}

/// Node-side registry session
///
/// A background task owns the connection: it registers the node, heartbeats, and
/// reconnects (registering again) whenever the registry was lost. Queries go through the
/// same task so requests and responses never interleave on the wire.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    tx: mpsc::UnboundedSender<ClientCommand>,
}

impl RegistryClient {
    /// `registration` is the identity and role this node announces, `None` for nodes that
    /// only query
    pub fn spawn(
        address: String,
        registration: Option<(NodeIdentity, Role)>,
        request_timeout: Duration,
        heartbeat_interval: Duration,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = RegistrySession {
            address,
            registration,
            timeout: request_timeout,
            connection: None,
            reachable: true,
        };

        (
            Self { tx },
            tokio::spawn(session.run(rx, heartbeat_interval, shutdown)),
        )
    }

    pub async fn list_by_role(&self, role: Role) -> Result<Vec<NodeIdentity>, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ClientCommand::ListByRole { role, reply })
            .map_err(|_| RegistryError::Stopped)?;

        response.await.map_err(|_| RegistryError::Stopped)?
    }

    /// Withdraw this node's registration, later reconnects will not register it again
    pub async fn unregister(&self) -> Result<bool, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ClientCommand::Unregister { reply })
            .map_err(|_| RegistryError::Stopped)?;

        response.await.map_err(|_| RegistryError::Stopped)?
    }
}

struct RegistrySession {
    address: String,
    registration: Option<(NodeIdentity, Role)>,
    timeout: Duration,
    connection: Option<Connection>,
    // last known state, only transitions are logged
    reachable: bool,
}

impl RegistrySession {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ClientCommand>,
        heartbeat_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = liveness::heartbeat(heartbeat_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.keep_alive().await,
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        debug!(registry = %self.address, "Registry session closed");
    }

    async fn handle(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::ListByRole { role, reply } => {
                let result = match self.request(RegistryRequest::ListByRole { role }).await {
                    Ok(RegistryResponse::Nodes { nodes, .. }) => Ok(nodes),
                    Ok(RegistryResponse::Error { message }) => {
                        Err(RegistryError::Rejected(message))
                    }
                    Ok(_) => Err(RegistryError::UnexpectedResponse),
                    Err(error) => Err(error),
                };
                let _ = reply.send(result);
            }
            ClientCommand::Unregister { reply } => {
                let result = match self.registration.take() {
                    Some((identity, role)) => {
                        let request = RegistryRequest::Unregister {
                            identity: identity.clone(),
                        };
                        match self.request(request).await {
                            Ok(RegistryResponse::Unregistered { removed, .. }) => {
                                info!(node = %identity, role = %role, "Unregistered from registry");
                                Ok(removed)
                            }
                            Ok(RegistryResponse::Error { message }) => {
                                Err(RegistryError::Rejected(message))
                            }
                            Ok(_) => Err(RegistryError::UnexpectedResponse),
                            Err(error) => Err(error),
                        }
                    }
                    None => Ok(false),
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Heartbeat an open connection or try to (re)establish a lost one
    async fn keep_alive(&mut self) {
        let result = if self.connection.is_some() {
            match self.request(RegistryRequest::Ping).await {
                Ok(RegistryResponse::Pong) => Ok(()),
                Ok(_) => Err(RegistryError::UnexpectedResponse),
                Err(error) => Err(error),
            }
        } else {
            self.connected().await.map(|_| ())
        };

        match result {
            Ok(()) if !self.reachable => {
                info!(registry = %self.address, "Registry reachable again");
                self.reachable = true;
            }
            Err(error) if self.reachable => {
                warn!(
                    registry = %self.address,
                    error = %error,
                    "Registry unreachable, known nodes keep operating"
                );
                self.reachable = false;
            }
            _ => {}
        }
    }

    async fn request(
        &mut self,
        request: RegistryRequest,
    ) -> Result<RegistryResponse, RegistryError> {
        let timeout = self.timeout;
        let result = self.connected().await?.request(&request, timeout).await;

        if result.is_err() {
            self.connection = None;
        }

        Ok(result?)
    }

    /// The open connection, connecting and registering first if needed
    async fn connected(&mut self) -> Result<&mut Connection, RegistryError> {
        if self.connection.is_none() {
            let connection = self.open().await?;
            self.connection = Some(connection);
        }

        self.connection
            .as_mut()
            .ok_or_else(|| RegistryError::Rejected("connection dropped".to_string()))
    }

    async fn open(&self) -> Result<Connection, RegistryError> {
        let mut connection = Connection::connect(&self.address, self.timeout).await?;

        if let Some((identity, role)) = &self.registration {
            let response: RegistryResponse = connection
                .request(
                    &RegistryRequest::Register {
                        identity: identity.clone(),
                        role: *role,
                    },
                    self.timeout,
                )
                .await?;

            match response {
                RegistryResponse::Registered { entry } => {
                    info!(
                        node = %entry.identity,
                        role = %entry.role,
                        registry = %self.address,
                        "Registered with registry"
                    );
                }
                RegistryResponse::Error { message } => return Err(RegistryError::Rejected(message)),
                _ => return Err(RegistryError::UnexpectedResponse),
            }
        }

        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RegistryConfig,
        registry::{server, Registry},
    };
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn registers_queries_and_unregisters() {
        let shutdown = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (registry, _actor) = Registry::spawn();
        tokio::spawn(server::serve(
            listener,
            registry.clone(),
            RegistryConfig::default(),
            shutdown.clone(),
        ));

        let slave = NodeIdentity::from("worker-1:7171");
        let (client, _session) = RegistryClient::spawn(
            address.clone(),
            Some((slave.clone(), Role::Slave)),
            Duration::from_secs(1),
            Duration::from_millis(50),
            shutdown.clone(),
        );
        let (observer, _observer_session) = RegistryClient::spawn(
            address,
            None,
            Duration::from_secs(1),
            Duration::from_millis(50),
            shutdown.clone(),
        );

        let mut seen = Vec::new();
        for _ in 0..50 {
            seen = observer.list_by_role(Role::Slave).await.unwrap();
            if !seen.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen, vec![slave]);

        assert!(client.unregister().await.unwrap());
        assert!(observer.list_by_role(Role::Slave).await.unwrap().is_empty());

        shutdown.cancel();
    }
}
