//! HTTP control plane.
//!
//! Thin mapping from the route table in [`routes`] onto [`JobController`]
//! operations. Every JSON response is an [`Envelope`]; domain errors and
//! handler panics both come back as envelopes with a non-zero retcode.

use std::any::Any;
use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{FlowError, Result};
use crate::scheduler::JobController;

pub mod envelope;
pub mod handlers;
pub mod routes;

pub use envelope::Envelope;
pub use routes::{HttpMethod, Operation, RouteSpec, ROUTES};

#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<JobController>,
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "handler panicked".to_string()
    };
    FlowError::Internal(detail).into_response()
}

/// Build the router for every entry of [`ROUTES`].
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods(AnyOrigin)
        .allow_headers(AnyOrigin);

    let mut router = Router::new();
    for spec in ROUTES {
        router = router.route(spec.path, spec.method_router());
    }

    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the control plane on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "Starting control plane server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!(addr = %addr, "Control plane server stopped");
    Ok(())
}
