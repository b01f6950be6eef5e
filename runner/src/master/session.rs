use super::{actor::MasterCommand, MasterError};
use crate::{
    liveness::{self, Liveness},
    protocol::{MasterMessage, NodeIdentity, SlaveMessage, SolveRequest, StartReply},
    transport::{Connection, FrameReader, FrameWriter},
};
use std::{collections::HashMap, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub liveness_timeout: Duration,
}

#[derive(Debug)]
struct StartCommand {
    request: SolveRequest,
    reply: oneshot::Sender<StartReply>,
}

/// The master's end of one slave session
///
/// The session task behind it owns the connection: it heartbeats the slave, matches start
/// replies to their requests and forwards job notices to the master's mailbox. When the
/// slave goes silent or the connection drops, the task posts exactly one
/// [`MasterCommand::SlaveLost`] carrying the link's `generation`.
#[derive(Debug, Clone)]
pub struct SlaveLink {
    pub slave: NodeIdentity,
    pub total_slots: u32,
    pub generation: u64,
    tx: mpsc::UnboundedSender<StartCommand>,
}

impl SlaveLink {
    /// Open a session: connect, say hello and wait for the slave's welcome
    pub async fn connect(
        slave: NodeIdentity,
        master: NodeIdentity,
        generation: u64,
        settings: LinkSettings,
        events: mpsc::UnboundedSender<MasterCommand>,
        shutdown: CancellationToken,
    ) -> Result<Self, MasterError> {
        let unreachable = |source| MasterError::Unreachable {
            slave: slave.clone(),
            source,
        };

        let mut connection = Connection::connect(slave.as_str(), settings.request_timeout)
            .await
            .map_err(unreachable)?;
        connection
            .send(&MasterMessage::Hello { master })
            .await
            .map_err(unreachable)?;

        let total_slots = match connection
            .expect::<SlaveMessage>(settings.request_timeout)
            .await
            .map_err(unreachable)?
        {
            SlaveMessage::Welcome {
                slave: announced,
                total_slots,
            } => {
                if announced != slave {
                    debug!(
                        slave = %slave,
                        announced = %announced,
                        "Slave announces a different identity"
                    );
                }
                total_slots
            }
            other => {
                return Err(MasterError::Handshake {
                    slave,
                    reason: format!("expected a welcome, got {other:?}"),
                })
            }
        };

        info!(slave = %slave, total_slots, generation, "Connected to slave");
        let (tx, rx) = mpsc::unbounded_channel();
        let (reader, writer) = connection.split();
        let session = LinkSession {
            slave: slave.clone(),
            generation,
            reader,
            writer,
            events,
            pending: HashMap::new(),
            next_request: 0,
            liveness: Liveness::new(settings.liveness_timeout),
        };
        tokio::spawn(session.run(rx, settings.heartbeat_interval, shutdown));

        Ok(Self {
            slave,
            total_slots,
            generation,
            tx,
        })
    }

    /// A link without a session behind it, every request fails
    #[cfg(test)]
    pub(crate) fn detached(slave: NodeIdentity, total_slots: u32, generation: u64) -> Self {
        let (tx, _) = mpsc::unbounded_channel();

        Self {
            slave,
            total_slots,
            generation,
            tx,
        }
    }

    /// Ask the slave to start a solver; no reply within `timeout` counts as a failed request
    pub async fn start_solver(
        &self,
        request: SolveRequest,
        timeout: Duration,
    ) -> Result<StartReply, MasterError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(StartCommand { request, reply })
            .map_err(|_| MasterError::LinkClosed(self.slave.clone()))?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(MasterError::LinkClosed(self.slave.clone())),
            Err(_) => Err(MasterError::Timeout {
                slave: self.slave.clone(),
                timeout,
            }),
        }
    }
}

struct LinkSession {
    slave: NodeIdentity,
    generation: u64,
    reader: FrameReader,
    writer: FrameWriter,
    events: mpsc::UnboundedSender<MasterCommand>,
    pending: HashMap<u64, oneshot::Sender<StartReply>>,
    next_request: u64,
    liveness: Liveness,
}

impl LinkSession {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<StartCommand>,
        heartbeat_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = liveness::heartbeat(heartbeat_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep_until(self.liveness.deadline()) => {
                    warn!(slave = %self.slave, "Slave missed its liveness deadline");
                    break;
                }
                _ = ticker.tick() => {
                    self.forget_abandoned();
                    if let Err(error) = self.writer.send(&MasterMessage::Ping).await {
                        warn!(slave = %self.slave, error = %error, "Failed to heartbeat slave");
                        break;
                    }
                }
                command = rx.recv() => match command {
                    Some(command) => {
                        if !self.start(command).await {
                            break;
                        }
                    }
                    // every link handle is gone, the master no longer cares
                    None => return,
                },
                received = self.reader.receive::<SlaveMessage>() => match received {
                    Ok(Some(message)) => {
                        self.liveness.touch();
                        self.dispatch(message);
                    }
                    Ok(None) => {
                        warn!(slave = %self.slave, "Slave closed the connection");
                        break;
                    }
                    Err(error) if error.is_protocol_error() => {
                        warn!(slave = %self.slave, error = %error, "Skipping malformed frame");
                        self.liveness.touch();
                    }
                    Err(error) => {
                        warn!(slave = %self.slave, error = %error, "Lost connection to slave");
                        break;
                    }
                },
            }
        }

        // pending start requests fail with their dropped reply channels
        let _ = self.events.send(MasterCommand::SlaveLost {
            slave: self.slave,
            generation: self.generation,
        });
    }

    /// Drop reply channels of requests the master stopped waiting for
    fn forget_abandoned(&mut self) {
        self.pending.retain(|_, reply| !reply.is_closed());
    }

    async fn start(&mut self, command: StartCommand) -> bool {
        self.forget_abandoned();
        if command.reply.is_closed() {
            debug!(slave = %self.slave, "Start request abandoned before it was sent");
            return true;
        }

        let request_id = self.next_request;
        self.next_request += 1;

        match self
            .writer
            .send(&MasterMessage::StartSolver {
                request_id,
                request: command.request,
            })
            .await
        {
            Ok(()) => {
                self.pending.insert(request_id, command.reply);
                true
            }
            Err(error) => {
                warn!(slave = %self.slave, error = %error, "Failed to send start request");
                false
            }
        }
    }

    fn dispatch(&mut self, message: SlaveMessage) {
        match message {
            SlaveMessage::Started { request_id, reply } => {
                let delivered = self
                    .pending
                    .remove(&request_id)
                    .map_or(false, |waiting| waiting.send(reply).is_ok());
                if !delivered {
                    debug!(
                        slave = %self.slave,
                        request_id,
                        "Start reply arrived after the master gave up"
                    );
                }
            }
            SlaveMessage::JobFinished(finished) => {
                let _ = self.events.send(MasterCommand::JobFinished {
                    slave: self.slave.clone(),
                    finished,
                });
            }
            SlaveMessage::Pong => {}
            SlaveMessage::Welcome { .. } => {
                debug!(slave = %self.slave, "Ignoring repeated welcome");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::{TcpListener, TcpStream};

    async fn session() -> (LinkSession, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, accepted) =
            tokio::join!(TcpStream::connect(listener.local_addr().unwrap()), listener.accept());
        let (reader, writer) = Connection::from_stream(client.unwrap()).unwrap().split();
        let (events, _) = mpsc::unbounded_channel();

        let session = LinkSession {
            slave: NodeIdentity::from("s1:7171"),
            generation: 1,
            reader,
            writer,
            events,
            pending: HashMap::new(),
            next_request: 0,
            liveness: Liveness::new(Duration::from_secs(1)),
        };

        (session, Connection::from_stream(accepted.unwrap().0).unwrap())
    }

    fn command() -> (StartCommand, oneshot::Receiver<StartReply>) {
        let (reply, response) = oneshot::channel();
        let request = SolveRequest {
            stub: PathBuf::from("/work/a.nl"),
            options: Vec::new(),
            slots: 1,
        };

        (StartCommand { request, reply }, response)
    }

    #[tokio::test]
    async fn abandoned_requests_are_forgotten() {
        let (mut session, mut slave) = session().await;

        let (first, gave_up) = command();
        let (second, _waiting) = command();
        assert!(session.start(first).await);
        assert!(session.start(second).await);
        assert_eq!(session.pending.len(), 2);

        drop(gave_up);
        session.forget_abandoned();
        assert_eq!(session.pending.keys().copied().collect::<Vec<_>>(), vec![1]);

        // a late reply to the forgotten request is dropped quietly
        session.dispatch(SlaveMessage::Started {
            request_id: 0,
            reply: StartReply::Accepted {
                job_id: uuid::Uuid::nil(),
                free_slots: 0,
            },
        });
        assert_eq!(session.pending.len(), 1);

        for request_id in [0, 1] {
            let sent: MasterMessage = slave.expect(Duration::from_secs(1)).await.unwrap();
            assert!(matches!(
                sent,
                MasterMessage::StartSolver { request_id: sent_id, .. } if sent_id == request_id
            ));
        }
    }

    #[tokio::test]
    async fn requests_abandoned_before_sending_are_not_sent() {
        let (mut session, _slave) = session().await;

        let (command, gave_up) = command();
        drop(gave_up);

        assert!(session.start(command).await);
        assert!(session.pending.is_empty());
        assert_eq!(session.next_request, 0);
    }
}
