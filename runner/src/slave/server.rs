use super::agent::AgentHandle;
use crate::{
    liveness::Liveness,
    protocol::{MasterMessage, NodeIdentity, SlaveMessage},
    transport::{Connection, FrameWriter},
};
use std::{net::SocketAddr, time::Duration};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub identity: NodeIdentity,
    /// how long a master may stay silent before its session is dropped
    pub liveness_timeout: Duration,
    /// how long a freshly connected master has to introduce itself
    pub handshake_timeout: Duration,
}

/// Accept master sessions until `shutdown` fires
#[instrument(skip_all, fields(slave = %settings.identity))]
pub async fn serve(
    listener: TcpListener,
    agent: AgentHandle,
    settings: SessionSettings,
    shutdown: CancellationToken,
) {
    let mut next_session = 1u64;
    info!(addr = ?listener.local_addr().ok(), "Slave accepting masters");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let session = next_session;
                next_session += 1;
                let agent = agent.clone();
                let settings = settings.clone();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    match Connection::from_stream(stream) {
                        Ok(connection) => {
                            master_session(connection, peer, session, agent, settings, shutdown)
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

    info!("Slave stopped accepting masters");
}

/// One connected master: handshake, then relay its start requests to the agent while a
/// writer task drains the agent's replies and notices back onto the wire
async fn master_session(
    mut connection: Connection,
    peer: SocketAddr,
    session: u64,
    agent: AgentHandle,
    settings: SessionSettings,
    shutdown: CancellationToken,
) {
    let master = match connection.expect::<MasterMessage>(settings.handshake_timeout).await {
        Ok(MasterMessage::Hello { master }) => master,
        Ok(other) => {
            warn!(peer = %peer, message = ?other, "Expected a hello, closing session");
            return;
        }
        Err(error) => {
            warn!(peer = %peer, error = %error, "Master handshake failed");
            return;
        }
    };

    let (sink, outbound) = mpsc::unbounded_channel();
    let total_slots = match agent.attach(master.clone(), session, sink.clone()).await {
        Some(total_slots) => total_slots,
        None => {
            warn!(master = %master, "Slave agent is gone, refusing master");
            return;
        }
    };

    // the welcome goes first, everything after it flows through the sink
    if let Err(error) = connection
        .send(&SlaveMessage::Welcome {
            slave: settings.identity.clone(),
            total_slots,
        })
        .await
    {
        warn!(master = %master, error = %error, "Failed to welcome master");
        agent.detach(master, session);
        return;
    }
    info!(master = %master, peer = %peer, session, "Master session established");

    let (mut reader, writer) = connection.split();
    let writer_task = spawn_writer(writer, outbound, master.clone());
    let mut liveness = Liveness::new(settings.liveness_timeout);

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(liveness.deadline()) => {
                warn!(master = %master, "Master missed its liveness deadline");
                break;
            }
            received = reader.receive::<MasterMessage>() => received,
        };

        match received {
            Ok(Some(message)) => {
                liveness.touch();

                match message {
                    MasterMessage::StartSolver {
                        request_id,
                        request,
                    } => {
                        if !agent.start_solver(master.clone(), request_id, request) {
                            warn!(master = %master, "Slave agent is gone, closing session");
                            break;
                        }
                    }
                    MasterMessage::Ping => {
                        if sink.send(SlaveMessage::Pong).is_err() {
                            break;
                        }
                    }
                    MasterMessage::Hello { master: other } => {
                        debug!(master = %master, repeated = %other, "Ignoring repeated hello");
                    }
                }
            }
            Ok(None) => {
                debug!(master = %master, "Master closed the connection");
                break;
            }
            Err(error) if error.is_protocol_error() => {
                warn!(master = %master, error = %error, "Skipping malformed frame");
                liveness.touch();
            }
            Err(error) => {
                warn!(master = %master, error = %error, "Lost connection to master");
                break;
            }
        }
    }

    agent.detach(master.clone(), session);
    writer_task.abort();
    info!(master = %master, session, "Master session closed");
}

fn spawn_writer(
    mut writer: FrameWriter,
    mut outbound: mpsc::UnboundedReceiver<SlaveMessage>,
    master: NodeIdentity,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Err(error) = writer.send(&message).await {
                warn!(master = %master, error = %error, "Failed to write to master");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{JobOutcome, SolveRequest, StartReply},
        slave::{agent::SlaveAgent, worker::SolverCommand},
    };

    async fn slave(
        script: &str,
        slots: u32,
        liveness_timeout: Duration,
    ) -> (String, CancellationToken) {
        let shutdown = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let identity = NodeIdentity::new(address.clone());
        let command = SolverCommand::new("/bin/sh", vec!["-c".to_string(), script.to_string()]);
        let (agent, _task) = SlaveAgent::spawn(identity.clone(), slots, command, shutdown.clone());

        tokio::spawn(serve(
            listener,
            agent,
            SessionSettings {
                identity,
                liveness_timeout,
                handshake_timeout: Duration::from_secs(1),
            },
            shutdown.clone(),
        ));

        (address, shutdown)
    }

    #[tokio::test]
    async fn handshake_start_and_finish() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("a.nl");
        let (address, shutdown) = slave("touch \"${0%.nl}.sol\"", 2, Duration::from_secs(5)).await;

        let mut connection = Connection::connect(&address, Duration::from_secs(1)).await.unwrap();
        connection
            .send(&MasterMessage::Hello {
                master: NodeIdentity::from("master-1"),
            })
            .await
            .unwrap();

        match connection.expect::<SlaveMessage>(Duration::from_secs(1)).await.unwrap() {
            SlaveMessage::Welcome { slave, total_slots } => {
                assert_eq!(slave.as_str(), address);
                assert_eq!(total_slots, 2);
            }
            other => panic!("expected a welcome, got {other:?}"),
        }

        connection
            .send(&MasterMessage::StartSolver {
                request_id: 7,
                request: SolveRequest {
                    stub: stub.clone(),
                    options: Vec::new(),
                    slots: 1,
                },
            })
            .await
            .unwrap();

        let started = connection
            .expect::<SlaveMessage>(Duration::from_secs(5))
            .await
            .unwrap();
        let job_id = match started {
            SlaveMessage::Started {
                request_id: 7,
                reply: StartReply::Accepted { job_id, .. },
            } => job_id,
            other => panic!("expected an acceptance, got {other:?}"),
        };

        match connection.expect::<SlaveMessage>(Duration::from_secs(5)).await.unwrap() {
            SlaveMessage::JobFinished(notice) => {
                assert_eq!(notice.job_id, job_id);
                assert_eq!(notice.stub, stub);
                assert_eq!(
                    notice.outcome,
                    JobOutcome::Success {
                        result: dir.path().join("a.sol")
                    }
                );
            }
            other => panic!("expected a job notice, got {other:?}"),
        }

        connection.send(&MasterMessage::Ping).await.unwrap();
        assert!(matches!(
            connection.expect::<SlaveMessage>(Duration::from_secs(1)).await.unwrap(),
            SlaveMessage::Pong
        ));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn silent_master_is_dropped() {
        let (address, shutdown) = slave("exit 0", 1, Duration::from_millis(200)).await;

        let mut connection = Connection::connect(&address, Duration::from_secs(1)).await.unwrap();
        connection
            .send(&MasterMessage::Hello {
                master: NodeIdentity::from("master-1"),
            })
            .await
            .unwrap();
        assert!(matches!(
            connection.expect::<SlaveMessage>(Duration::from_secs(1)).await.unwrap(),
            SlaveMessage::Welcome { .. }
        ));

        // no heartbeats: the slave closes the session after its liveness timeout
        assert!(matches!(
            connection.expect::<SlaveMessage>(Duration::from_secs(5)).await,
            Err(crate::transport::TransportError::ConnectionClosed)
        ));

        shutdown.cancel();
    }
}
