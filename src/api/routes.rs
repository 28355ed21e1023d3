use axum::routing::{on, MethodFilter, MethodRouter};

use crate::api::handlers;
use crate::api::ApiState;

/// Every operation the control plane exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    SubmitJob,
    StopJob,
    QueryJob,
    JobConfig,
    JobLog,
    CreateJob,
    JobStatus,
    SavePipeline,
    KillJob,
    CleanJob,
    RunTask,
    TaskStatus,
}

impl Operation {
    pub const ALL: [Operation; 12] = [
        Operation::SubmitJob,
        Operation::StopJob,
        Operation::QueryJob,
        Operation::JobConfig,
        Operation::JobLog,
        Operation::CreateJob,
        Operation::JobStatus,
        Operation::SavePipeline,
        Operation::KillJob,
        Operation::CleanJob,
        Operation::RunTask,
        Operation::TaskStatus,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, Copy)]
pub struct RouteSpec {
    pub method: HttpMethod,
    pub path: &'static str,
    pub operation: Operation,
}

const fn route(method: HttpMethod, path: &'static str, operation: Operation) -> RouteSpec {
    RouteSpec {
        method,
        path,
        operation,
    }
}

// Captures are named by position rather than meaning: the router rejects
// differently-named captures at the same depth, and job and task routes
// overlap. Job routes read {s1}/{s2} as role/party_id; task routes read
// {s1}/{s2}/{s3}/{s4} as component_name/task_id/role/party_id.
pub const ROUTES: &[RouteSpec] = &[
    route(HttpMethod::Post, "/submit", Operation::SubmitJob),
    route(HttpMethod::Post, "/stop", Operation::StopJob),
    route(HttpMethod::Post, "/query", Operation::QueryJob),
    route(HttpMethod::Post, "/config", Operation::JobConfig),
    route(HttpMethod::Get, "/log", Operation::JobLog),
    route(HttpMethod::Post, "/{job_id}/{s1}/{s2}/create", Operation::CreateJob),
    route(HttpMethod::Post, "/{job_id}/{s1}/{s2}/status", Operation::JobStatus),
    route(
        HttpMethod::Post,
        "/{job_id}/{s1}/{s2}/{s3}/save/pipeline",
        Operation::SavePipeline,
    ),
    route(HttpMethod::Post, "/{job_id}/{s1}/{s2}/kill", Operation::KillJob),
    route(HttpMethod::Post, "/{job_id}/{s1}/{s2}/clean", Operation::CleanJob),
    route(HttpMethod::Post, "/{job_id}/{s1}/{s2}/{s3}/{s4}/run", Operation::RunTask),
    route(
        HttpMethod::Post,
        "/{job_id}/{s1}/{s2}/{s3}/{s4}/status",
        Operation::TaskStatus,
    ),
];

impl RouteSpec {
    pub fn method_router(&self) -> MethodRouter<ApiState> {
        let filter = match self.method {
            HttpMethod::Get => MethodFilter::GET,
            HttpMethod::Post => MethodFilter::POST,
        };
        match self.operation {
            Operation::SubmitJob => on(filter, handlers::submit_job),
            Operation::StopJob => on(filter, handlers::stop_job),
            Operation::QueryJob => on(filter, handlers::query_job),
            Operation::JobConfig => on(filter, handlers::job_config),
            Operation::JobLog => on(filter, handlers::job_log),
            Operation::CreateJob => on(filter, handlers::create_job),
            Operation::JobStatus => on(filter, handlers::job_status),
            Operation::SavePipeline => on(filter, handlers::save_pipeline),
            Operation::KillJob => on(filter, handlers::kill_job),
            Operation::CleanJob => on(filter, handlers::clean_job),
            Operation::RunTask => on(filter, handlers::run_task),
            Operation::TaskStatus => on(filter, handlers::task_status),
        }
    }
}
