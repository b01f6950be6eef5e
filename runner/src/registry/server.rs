use super::{RegistryHandle, SessionId};
use crate::{
    config::RegistryConfig,
    liveness::Liveness,
    protocol::{NodeIdentity, RegistryRequest, RegistryResponse},
    transport::{Connection, TransportError},
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Accept node sessions until `shutdown` fires
#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn serve(
    listener: TcpListener,
    registry: RegistryHandle,
    config: RegistryConfig,
    shutdown: CancellationToken,
) {
    let mut next_session: SessionId = 1;
    info!("Registry accepting nodes");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let session = next_session;
                next_session += 1;
                let registry = registry.clone();
                let config = config.clone();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    match Connection::from_stream(stream) {
                        Ok(connection) => {
                            node_session(connection, peer, session, registry, config, shutdown)
                                .await
                        }
                        Err(error) => warn!(
                            peer = %peer,
                            error = %error,
                            "Failed to set up session"
                        ),
                    }
                });
            }
            Err(error) => error!(error = %error, "Failed to accept connection"),
        }
    }

    info!("Registry stopped accepting nodes");
}

/// One connected node. The node registered on this connection is dropped from the
/// directory when the connection closes or stays silent past the liveness timeout.
async fn node_session(
    mut connection: Connection,
    peer: SocketAddr,
    session: SessionId,
    registry: RegistryHandle,
    config: RegistryConfig,
    shutdown: CancellationToken,
) {
    let mut liveness = Liveness::new(config.liveness_timeout());
    let mut registered: Option<NodeIdentity> = None;
    debug!(peer = %peer, session, "Node connected");

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(liveness.deadline()) => {
                warn!(peer = %peer, node = ?registered, "Node missed its liveness deadline");
                break;
            }
            received = connection.receive::<RegistryRequest>() => received,
        };

        let response = match received {
            Ok(Some(request)) => {
                liveness.touch();

                match respond(request, session, &registry, &mut registered).await {
                    Ok(response) => response,
                    // the actor is gone, nothing left to serve
                    Err(_) => break,
                }
            }
            Ok(None) => {
                debug!(peer = %peer, node = ?registered, "Node closed the connection");
                break;
            }
            Err(error) if error.is_protocol_error() => {
                warn!(peer = %peer, error = %error, "Rejecting malformed request");
                liveness.touch();

                rejected(&error)
            }
            Err(error) => {
                warn!(peer = %peer, error = %error, "Lost connection to node");
                break;
            }
        };

        if let Err(error) = connection.send(&response).await {
            warn!(peer = %peer, error = %error, "Failed to answer node");
            break;
        }
    }

    if let Some(identity) = registered {
        registry.session_lost(identity, session);
    }
}

async fn respond(
    request: RegistryRequest,
    session: SessionId,
    registry: &RegistryHandle,
    registered: &mut Option<NodeIdentity>,
) -> Result<RegistryResponse, super::RegistryError> {
    Ok(match request {
        RegistryRequest::Register { identity, role } => {
            if let Some(previous) = registered.as_ref().filter(|previous| **previous != identity) {
                // a connection carries a single node, the old name goes away with it
                registry.session_lost(previous.clone(), session);
            }
            let entry = registry.register(identity.clone(), role, session).await?;
            *registered = Some(identity);

            RegistryResponse::Registered { entry }
        }
        RegistryRequest::Unregister { identity } => {
            let removed = registry.unregister(identity.clone()).await?;
            if registered.as_ref() == Some(&identity) {
                *registered = None;
            }

            RegistryResponse::Unregistered { identity, removed }
        }
        RegistryRequest::ListByRole { role } => RegistryResponse::Nodes {
            role,
            nodes: registry.list_by_role(role).await?,
        },
        RegistryRequest::Ping => RegistryResponse::Pong,
    })
}

/// Answer to a request that could not be understood
fn rejected(error: &TransportError) -> RegistryResponse {
    RegistryResponse::Error {
        message: error.to_string(),
    }
}
