//! Multi-party addressing: resolving (role, party_id) to a node and
//! delivering control messages to it.

pub mod client;
pub mod resolver;

pub use client::{PartyClient, PropagationFailure, Propagator};
pub use resolver::{Endpoint, PartyResolver, PartyRoute, RouteFile, RouteSource, StaticRoutes, ANY_ROLE};

use crate::scheduler::PartyRef;

/// Path of a job-scoped control route on a party, e.g. `/{job_id}/host/1/kill`.
pub fn job_path(job_id: &str, party: &PartyRef, verb: &str) -> String {
    format!("/{}/{}/{}/{}", job_id, party.role, party.party_id, verb)
}

/// Path of a task-scoped control route on a party.
pub fn task_path(
    job_id: &str,
    component_name: &str,
    task_id: &str,
    party: &PartyRef,
    verb: &str,
) -> String {
    format!(
        "/{}/{}/{}/{}/{}/{}",
        job_id, component_name, task_id, party.role, party.party_id, verb
    )
}
