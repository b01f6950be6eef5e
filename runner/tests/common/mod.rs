#![allow(dead_code)]

use bnb_runner::{
    config::ClusterConfig,
    protocol::{NodeIdentity, Role},
    registry::{server, Registry, RegistryClient, RegistryHandle},
    slave::{
        agent::{AgentHandle, SlaveAgent},
        server::{serve, SessionSettings},
        worker::SolverCommand,
    },
};
use std::{future::Future, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Waits until the file named by the first option exists (at most ten seconds), then
/// writes the solution next to the stub
pub const GATED_SOLVER: &str = "i=0; \
    while [ ! -e \"$1\" ] && [ $i -lt 500 ]; do sleep 0.02; i=$((i+1)); done; \
    touch \"${0%.nl}.sol\"";

pub const INSTANT_SOLVER: &str = "touch \"${0%.nl}.sol\"";

/// Fails the first run for every stub, solves it on the second
pub const FLAKY_SOLVER: &str = "if [ -e \"${0%.nl}.tried\" ]; then touch \"${0%.nl}.sol\"; \
    else touch \"${0%.nl}.tried\"; echo 'transient failure' >&2; exit 3; fi";

pub const BROKEN_SOLVER: &str = "echo 'bad model' >&2; exit 2";

pub fn sh(script: &str) -> SolverCommand {
    SolverCommand::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
}

/// Config with intervals short enough for tests
pub fn fast_config(registry: &str) -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.registry.address = registry.to_string();
    config.registry.liveness_timeout_ms = 1000;
    config.registry.request_timeout_ms = 2000;
    config.slave.heartbeat_interval_ms = 50;
    config.slave.liveness_timeout_ms = 1000;
    config.master.heartbeat_interval_ms = 50;
    config.master.liveness_timeout_ms = 1000;
    config.master.request_timeout_ms = 2000;
    config.master.dispatch_interval_ms = 50;
    config.master.discovery_interval_ms = 100;

    config
}

pub struct TestRegistry {
    pub address: String,
    pub handle: RegistryHandle,
    pub shutdown: CancellationToken,
}

impl TestRegistry {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (handle, _actor) = Registry::spawn();
        let shutdown = CancellationToken::new();
        tokio::spawn(server::serve(
            listener,
            handle.clone(),
            fast_config(&address).registry,
            shutdown.clone(),
        ));

        Self {
            address,
            handle,
            shutdown,
        }
    }

    pub async fn slaves(&self) -> Vec<NodeIdentity> {
        self.handle.list_by_role(Role::Slave).await.unwrap()
    }
}

impl Drop for TestRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A slave assembled from its parts so a test can look at its agent and kill it without
/// a goodbye to anyone
pub struct TestSlave {
    pub identity: NodeIdentity,
    pub agent: AgentHandle,
    pub registry: RegistryClient,
    pub shutdown: CancellationToken,
}

impl TestSlave {
    pub async fn start(registry: &str, slots: u32, script: &str) -> Self {
        let config = fast_config(registry);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let identity = NodeIdentity::from(listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();

        let (agent, _task) =
            SlaveAgent::spawn(identity.clone(), slots, sh(script), shutdown.clone());
        let (registry_client, _registry_task) = RegistryClient::spawn(
            registry.to_string(),
            Some((identity.clone(), Role::Slave)),
            config.registry.request_timeout(),
            config.slave.heartbeat_interval(),
            shutdown.clone(),
        );
        tokio::spawn(serve(
            listener,
            agent.clone(),
            SessionSettings {
                identity: identity.clone(),
                liveness_timeout: config.slave.liveness_timeout(),
                handshake_timeout: config.registry.request_timeout(),
            },
            shutdown.clone(),
        ));

        Self {
            identity,
            agent,
            registry: registry_client,
            shutdown,
        }
    }

    /// Drop every connection at once, as a killed process would
    pub fn kill(&self) {
        self.shutdown.cancel();
    }

    pub async fn free_slots(&self) -> u32 {
        self.agent.status().await.unwrap().free_slots
    }
}

impl Drop for TestSlave {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Poll `check` until it holds, panicking after ten seconds
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    panic!("timed out waiting for {what}");
}
