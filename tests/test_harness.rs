//! Test harness for single- and multi-party control plane tests.
//!
//! Provides utilities for building controllers over temporary data
//! directories, spawning live nodes that route to each other, and waiting
//! on asynchronous propagation.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use partyflow::api::{self, Envelope};
use partyflow::config::NodeConfig;
use partyflow::federation::ANY_ROLE;
use partyflow::node::Node;
use partyflow::scheduler::{JobController, JobSubmission};

/// Node configuration rooted in `data_dir` with a short propagation timeout.
pub fn test_node_config(party_id: u64, addr: SocketAddr, data_dir: &TempDir) -> NodeConfig {
    let mut config = NodeConfig::new(party_id, addr).with_data_dir(data_dir.path());
    config.propagation_timeout_ms = 1_000;
    config
}

/// Controller for `party_id` over a fresh temporary data directory. The
/// directory lives as long as the returned guard.
pub async fn test_controller(party_id: u64) -> (Arc<JobController>, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = test_node_config(party_id, "127.0.0.1:0".parse().unwrap(), &dir);
    let node = Node::new(config).await.unwrap();
    (node.controller, dir)
}

pub fn job_dsl(components: &[&str]) -> Value {
    let components: serde_json::Map<String, Value> = components
        .iter()
        .map(|c| (c.to_string(), json!({"module": "Reader"})))
        .collect();
    json!({ "components": components })
}

/// Runtime conf with `initiator` and every party in `parties`.
pub fn runtime_conf(initiator: (&str, u64), parties: &[(&str, u64)]) -> Value {
    let mut roles: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
    for (role, id) in parties {
        roles.entry(*role).or_default().push(*id);
    }
    json!({
        "initiator": {"role": initiator.0, "party_id": initiator.1},
        "role": roles,
        "job_parameters": {"work_mode": 1},
    })
}

/// The two-party job used across tests: guest 2 initiates, host 1 joins.
pub fn two_party_submission(components: &[&str]) -> JobSubmission {
    JobSubmission {
        job_dsl: job_dsl(components),
        job_runtime_conf: runtime_conf(("guest", 2), &[("host", 1), ("guest", 2)]),
    }
}

/// Handle to a running node
pub struct TestParty {
    pub party_id: u64,
    pub addr: SocketAddr,
    pub controller: Arc<JobController>,
    pub data_dir: TempDir,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestParty {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// POST a JSON body and decode the envelope, whatever its retcode.
    pub async fn post(&self, path: &str, body: Value) -> Envelope {
        reqwest::Client::new()
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

/// Several nodes on ephemeral ports, each routing to all the others.
pub struct TestFederation {
    pub parties: BTreeMap<u64, TestParty>,
}

impl TestFederation {
    pub async fn new(party_ids: &[u64]) -> Self {
        let mut listeners = Vec::new();
        for id in party_ids {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            listeners.push((*id, addr, listener));
        }

        let mut parties = BTreeMap::new();
        for (id, addr, _) in &listeners {
            let dir = TempDir::new().unwrap();
            let mut config = test_node_config(*id, *addr, &dir);
            for (peer_id, peer_addr, _) in &listeners {
                if peer_id != id {
                    config = config.with_route(ANY_ROLE, *peer_id, peer_addr.to_string());
                }
            }
            let node = Node::new(config).await.unwrap();
            parties.insert(*id, (node, dir));
        }

        let mut running = BTreeMap::new();
        for (id, addr, listener) in listeners {
            let Some((node, dir)) = parties.remove(&id) else {
                continue;
            };
            let shutdown = CancellationToken::new();
            let state = node.api_state();
            let token = shutdown.clone();
            let handle = tokio::spawn(async move {
                let _ = api::serve(listener, state, token).await;
            });
            running.insert(
                id,
                TestParty {
                    party_id: id,
                    addr,
                    controller: node.controller,
                    data_dir: dir,
                    shutdown,
                    handle,
                },
            );
        }

        Self { parties: running }
    }

    pub fn party(&self, party_id: u64) -> &TestParty {
        &self.parties[&party_id]
    }

    pub async fn shutdown(&mut self) {
        for party in self.parties.values_mut() {
            party.shutdown.cancel();
        }
        for (_, party) in std::mem::take(&mut self.parties) {
            let _ = tokio::time::timeout(Duration::from_secs(2), party.handle).await;
        }
    }
}

/// An address nothing listens on.
pub fn dead_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(25)).await;
    assert!(result, "{}", message);
}
