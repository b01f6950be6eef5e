//! Control endpoint of a standing master: operators submit further batches and ask for
//! the state of every task

use super::{MasterError, MasterHandle};
use crate::{
    protocol::{ControlRequest, ControlResponse, TaskReport},
    transport::Connection,
};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn serve(listener: TcpListener, master: MasterHandle, shutdown: CancellationToken) {
    info!("Control endpoint listening");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let master = master.clone();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    match Connection::from_stream(stream) {
                        Ok(connection) => {
                            operator_session(connection, peer, master, shutdown).await
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
}

async fn operator_session(
    mut connection: Connection,
    peer: SocketAddr,
    master: MasterHandle,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = connection.receive::<ControlRequest>() => received,
        };

        let response = match received {
            Ok(Some(ControlRequest::Submit { stubs })) => match master.submit(stubs).await {
                Ok(count) => ControlResponse::Submitted { count },
                Err(error) => ControlResponse::Error {
                    message: error.to_string(),
                },
            },
            Ok(Some(ControlRequest::Status)) => match master.status().await {
                Ok(tasks) => ControlResponse::Report { tasks },
                Err(error) => ControlResponse::Error {
                    message: error.to_string(),
                },
            },
            Ok(None) => break,
            Err(error) if error.is_protocol_error() => {
                warn!(peer = %peer, error = %error, "Rejecting malformed control request");
                ControlResponse::Error {
                    message: error.to_string(),
                }
            }
            Err(error) => {
                debug!(peer = %peer, error = %error, "Operator connection lost");
                break;
            }
        };

        if let Err(error) = connection.send(&response).await {
            debug!(peer = %peer, error = %error, "Failed to answer operator");
            break;
        }
    }
}

async fn request(
    addr: &str,
    request: ControlRequest,
    timeout: Duration,
) -> Result<ControlResponse, MasterError> {
    let mut connection = Connection::connect(addr, timeout).await?;

    Ok(connection.request(&request, timeout).await?)
}

/// Queue `stubs` on the standing master at `addr`, returns how many new tasks it created
pub async fn submit(
    addr: &str,
    stubs: Vec<PathBuf>,
    timeout: Duration,
) -> Result<usize, MasterError> {
    match request(addr, ControlRequest::Submit { stubs }, timeout).await? {
        ControlResponse::Submitted { count } => Ok(count),
        ControlResponse::Error { message } => Err(MasterError::Refused(message)),
        other => Err(MasterError::Refused(format!("unexpected response {other:?}"))),
    }
}

/// Current state of every task of the standing master at `addr`
pub async fn status(addr: &str, timeout: Duration) -> Result<Vec<TaskReport>, MasterError> {
    match request(addr, ControlRequest::Status, timeout).await? {
        ControlResponse::Report { tasks } => Ok(tasks),
        ControlResponse::Error { message } => Err(MasterError::Refused(message)),
        other => Err(MasterError::Refused(format!("unexpected response {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MasterConfig,
        master::{Discovery, Master, MasterSettings, RunMode},
        protocol::{NodeIdentity, TaskStatus},
    };

    #[tokio::test]
    async fn submit_then_status_over_tcp() {
        let shutdown = CancellationToken::new();
        let (master, handle) = Master::new(
            MasterSettings::new(
                NodeIdentity::from("master-1"),
                &MasterConfig::default(),
                Vec::new(),
            ),
            RunMode::Standing,
            Discovery::Static(Vec::new()),
            shutdown.clone(),
        );
        tokio::spawn(master.run());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve(listener, handle, shutdown.clone()));

        let timeout = Duration::from_secs(1);
        assert_eq!(
            submit(&addr, vec![PathBuf::from("a.nl"), PathBuf::from("b.nl")], timeout)
                .await
                .unwrap(),
            2
        );

        let tasks = status(&addr, timeout).await.unwrap();
        assert_eq!(
            tasks.iter().map(|task| task.stub.clone()).collect::<Vec<_>>(),
            vec![PathBuf::from("a.nl"), PathBuf::from("b.nl")]
        );
        assert!(tasks.iter().all(|task| task.status == TaskStatus::Pending));

        shutdown.cancel();
    }
}
