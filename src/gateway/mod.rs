//! HTTP surface.
//!
//! The only way external callers talk to an agent: bridges and admin POST
//! messages in, poll the outbox, inspect status and history, and trigger
//! repair. Everything responds JSON.

mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::agent::SharedStatus;
use crate::comm::MessageQueue;

/// Shared state injected into handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) workspace: PathBuf,
    pub(crate) queue: Arc<MessageQueue>,
    pub(crate) status: SharedStatus,
}

/// Handle returned by [`start_server`].
pub struct Server {
    pub handle: JoinHandle<()>,
    /// The address actually bound (useful with port 0).
    pub addr: SocketAddr,
}

pub fn router(workspace: PathBuf, queue: Arc<MessageQueue>, status: SharedStatus) -> Router {
    let state = AppState {
        workspace,
        queue,
        status,
    };
    Router::new()
        .route("/health", get(handlers::health))
        .route("/message", post(handlers::post_message))
        .route("/status", get(handlers::get_status))
        .route("/repair-signal", post(handlers::post_repair_signal))
        .route("/outbox", get(handlers::get_outbox))
        .route("/outbox/:id", delete(handlers::delete_outbox_entry))
        .route("/history", get(handlers::get_history))
        .route("/history/:round", get(handlers::get_history_round))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve on `addr`; returns once listening.
pub async fn start_server(
    addr: SocketAddr,
    workspace: PathBuf,
    queue: Arc<MessageQueue>,
    status: SharedStatus,
) -> std::io::Result<Server> {
    let app = router(workspace, queue, status);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("http server error: {e}");
        }
    });

    info!(%bound_addr, "http surface listening");
    Ok(Server {
        handle,
        addr: bound_addr,
    })
}
