use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::api::envelope::Envelope;
use crate::error::{FlowError, Result};
use crate::federation::{Endpoint, PartyResolver};
use crate::scheduler::PartyRef;

const MAX_RECORDED_FAILURES: usize = 64;

enum SendError {
    /// The request never produced a readable envelope.
    Delivery(String),
    /// The remote party answered with a non-zero retcode.
    Rejected { retcode: i32, retmsg: String },
}

/// HTTP client for the control plane of other parties.
#[derive(Clone)]
pub struct PartyClient {
    http: reqwest::Client,
    resolver: Arc<PartyResolver>,
}

impl PartyClient {
    pub fn new(resolver: Arc<PartyResolver>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FlowError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, resolver })
    }

    pub fn resolver(&self) -> &Arc<PartyResolver> {
        &self.resolver
    }

    /// POST `body` to `path` on `party`.
    ///
    /// A delivery failure drops the cached endpoint and retries once against
    /// a fresh resolution. A rejection by the remote party is not retried.
    pub async fn post(&self, party: &PartyRef, path: &str, body: &Value) -> Result<()> {
        let endpoint = self.resolver.resolve(party).await?;
        match self.send(&endpoint, path, body).await {
            Ok(()) => return Ok(()),
            Err(SendError::Rejected { retcode, retmsg }) => {
                return Err(rejected(party, retcode, retmsg));
            }
            Err(SendError::Delivery(reason)) => {
                tracing::debug!(party = %party, endpoint = %endpoint, reason, "Delivery failed, re-resolving");
                self.resolver.invalidate(party).await;
            }
        }

        let endpoint = self.resolver.resolve(party).await?;
        match self.send(&endpoint, path, body).await {
            Ok(()) => Ok(()),
            Err(SendError::Rejected { retcode, retmsg }) => Err(rejected(party, retcode, retmsg)),
            Err(SendError::Delivery(reason)) => Err(FlowError::Propagation {
                party: party.clone(),
                reason,
            }),
        }
    }

    async fn send(
        &self,
        endpoint: &Endpoint,
        path: &str,
        body: &Value,
    ) -> std::result::Result<(), SendError> {
        let response = self
            .http
            .post(endpoint.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| SendError::Delivery(e.to_string()))?;
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| SendError::Delivery(format!("unreadable response: {}", e)))?;
        if envelope.retcode == 0 {
            Ok(())
        } else {
            Err(SendError::Rejected {
                retcode: envelope.retcode,
                retmsg: envelope.retmsg,
            })
        }
    }
}

fn rejected(party: &PartyRef, retcode: i32, retmsg: String) -> FlowError {
    FlowError::Propagation {
        party: party.clone(),
        reason: format!("retcode {}: {}", retcode, retmsg),
    }
}

/// A propagation that did not reach its party.
#[derive(Debug, Clone, Serialize)]
pub struct PropagationFailure {
    pub party: PartyRef,
    pub path: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Fire-and-forget fan-out of control messages to remote parties.
///
/// The caller's local state change is authoritative; failures are logged and
/// kept in a bounded list for later inspection.
#[derive(Clone)]
pub struct Propagator {
    client: PartyClient,
    local_party_id: u64,
    failures: Arc<Mutex<VecDeque<PropagationFailure>>>,
}

impl Propagator {
    pub fn new(client: PartyClient, local_party_id: u64) -> Self {
        Self {
            client,
            local_party_id,
            failures: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Whether `party` is served by this node.
    pub fn is_local(&self, party: &PartyRef) -> bool {
        party.party_id == self.local_party_id
    }

    pub fn local_party_id(&self) -> u64 {
        self.local_party_id
    }

    /// Send `body` to `path` on `party` in the background.
    pub fn dispatch(&self, party: PartyRef, path: String, body: Value) -> JoinHandle<()> {
        let client = self.client.clone();
        let failures = self.failures.clone();
        tokio::spawn(async move {
            match client.post(&party, &path, &body).await {
                Ok(()) => {
                    tracing::debug!(party = %party, path, "Propagated to party");
                }
                Err(e) => {
                    tracing::warn!(party = %party, path, error = %e, "Propagation failed");
                    let mut failures = failures.lock().await;
                    if failures.len() == MAX_RECORDED_FAILURES {
                        failures.pop_front();
                    }
                    failures.push_back(PropagationFailure {
                        party,
                        path,
                        error: e.to_string(),
                        at: Utc::now(),
                    });
                }
            }
        })
    }

    /// Dispatch to every remote party in `parties`; local ones are skipped.
    pub fn broadcast<F>(&self, parties: &[PartyRef], path_for: F, body: Value) -> Vec<JoinHandle<()>>
    where
        F: Fn(&PartyRef) -> String,
    {
        parties
            .iter()
            .filter(|p| !self.is_local(p))
            .map(|p| self.dispatch(p.clone(), path_for(p), body.clone()))
            .collect()
    }

    pub async fn recent_failures(&self) -> Vec<PropagationFailure> {
        self.failures.lock().await.iter().cloned().collect()
    }
}
