use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{FlowError, Result};
use crate::scheduler::PartyRef;
use crate::storage::run_blocking;

/// Role wildcard: a route that applies to every role of a party.
pub const ANY_ROLE: &str = "*";

/// Static mapping from a party to the address of the node serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRoute {
    #[serde(default = "any_role")]
    pub role: String,
    pub party_id: u64,
    /// host:port, or a full `http(s)://` base URL
    pub addr: String,
}

fn any_role() -> String {
    ANY_ROLE.to_string()
}

impl PartyRoute {
    pub fn new(role: impl Into<String>, party_id: u64, addr: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            party_id,
            addr: addr.into(),
        }
    }
}

/// Where to reach a party's control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base_url: String,
}

impl Endpoint {
    pub fn new(addr: &str) -> Self {
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        Self {
            base_url: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url)
    }
}

/// Picks the best route for `party`: an exact role match beats a wildcard.
fn pick<'a>(routes: &'a [PartyRoute], party: &PartyRef) -> Option<&'a PartyRoute> {
    routes
        .iter()
        .filter(|r| r.party_id == party.party_id)
        .find(|r| r.role == party.role)
        .or_else(|| {
            routes
                .iter()
                .find(|r| r.party_id == party.party_id && r.role == ANY_ROLE)
        })
}

/// A source of party routes.
pub trait RouteSource: Send + Sync {
    fn lookup(&self, party: &PartyRef) -> Result<Option<Endpoint>>;
}

/// Routes fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticRoutes {
    routes: Vec<PartyRoute>,
}

impl StaticRoutes {
    pub fn new(routes: Vec<PartyRoute>) -> Self {
        Self { routes }
    }
}

impl RouteSource for StaticRoutes {
    fn lookup(&self, party: &PartyRef) -> Result<Option<Endpoint>> {
        Ok(pick(&self.routes, party).map(|r| Endpoint::new(&r.addr)))
    }
}

/// JSON route table re-read on every lookup, so operators can re-point
/// parties without a restart.
#[derive(Debug, Clone)]
pub struct RouteFile {
    path: PathBuf,
}

impl RouteFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RouteSource for RouteFile {
    fn lookup(&self, party: &PartyRef) -> Result<Option<Endpoint>> {
        let bytes = match run_blocking(|| std::fs::read(&self.path)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let routes: Vec<PartyRoute> = serde_json::from_slice(&bytes)?;
        Ok(pick(&routes, party).map(|r| Endpoint::new(&r.addr)))
    }
}

/// Resolves parties to endpoints, caching what it found.
///
/// Cached entries can go stale when routes change; senders call
/// [`PartyResolver::invalidate`] after a delivery failure and resolve again.
pub struct PartyResolver {
    sources: Vec<Box<dyn RouteSource>>,
    cache: RwLock<HashMap<PartyRef, Endpoint>>,
}

impl PartyResolver {
    /// Sources are consulted in order; the first hit wins.
    pub fn new(sources: Vec<Box<dyn RouteSource>>) -> Self {
        Self {
            sources,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_routes(routes: Vec<PartyRoute>) -> Self {
        Self::new(vec![Box::new(StaticRoutes::new(routes))])
    }

    pub async fn resolve(&self, party: &PartyRef) -> Result<Endpoint> {
        if let Some(endpoint) = self.cache.read().await.get(party) {
            return Ok(endpoint.clone());
        }

        for source in &self.sources {
            if let Some(endpoint) = source.lookup(party)? {
                tracing::debug!(party = %party, endpoint = %endpoint, "Resolved party endpoint");
                self.cache
                    .write()
                    .await
                    .insert(party.clone(), endpoint.clone());
                return Ok(endpoint);
            }
        }
        Err(FlowError::NotFound(format!("no route to party {}", party)))
    }

    pub async fn invalidate(&self, party: &PartyRef) {
        self.cache.write().await.remove(party);
    }
}
