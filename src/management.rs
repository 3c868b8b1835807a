//! Local HTTP management API over the session registry.
//!
//! Grounded on the teacher's `management.rs` axum router (list/kick
//! endpoints, permissive CORS for a local dashboard), rebased from
//! `AppState`'s flat tunnel map onto the dual-indexed [`Registry`].

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use log::{error, info};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::registry::Registry;

#[derive(Debug, Serialize)]
pub struct ForwardResponse {
    pub kind: String,
    pub key: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub active_channels: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: String,
    pub owner: String,
    pub uptime_secs: u64,
    pub forwards: Vec<ForwardResponse>,
}

#[derive(Debug, Serialize)]
pub struct SessionsListResponse {
    pub sessions: Vec<SessionResponse>,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// GET /sessions - snapshot of every live session and its forwards.
async fn list_sessions(State(registry): State<Arc<Registry>>) -> Json<SessionsListResponse> {
    let mut sessions = Vec::new();
    for session in registry.list_all().await {
        let forwards = session.forwards.lock().await;
        let mut forward_responses = Vec::with_capacity(forwards.len());
        for record in forwards.values() {
            forward_responses.push(ForwardResponse {
                kind: format!("{:?}", record.kind),
                key: record.key.lock().await.clone(),
                bytes_in: record.bytes_in.load(Ordering::Relaxed),
                bytes_out: record.bytes_out.load(Ordering::Relaxed),
                active_channels: record.active_channels.load(Ordering::Relaxed),
            });
        }
        drop(forwards);
        sessions.push(SessionResponse {
            id: session.id.clone(),
            owner: session.owner.clone(),
            uptime_secs: session.started_at.elapsed().as_secs(),
            forwards: forward_responses,
        });
    }
    Json(SessionsListResponse { sessions })
}

/// DELETE /sessions/:id - force-disconnect a session by its internal id.
async fn terminate_session(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    info!("management API: terminate request for session '{}'", id);

    for session in registry.list_all().await {
        if session.id != id {
            continue;
        }
        session.cancel.cancel();
        if let Some(handle) = session.handle.clone() {
            tokio::spawn(async move {
                if let Err(e) = handle
                    .disconnect(russh::Disconnect::ByApplication, "terminated via management API".to_string(), "en".to_string())
                    .await
                {
                    log::debug!("disconnect result: {:?}", e);
                }
            });
        }
        return Ok(Json(SuccessResponse {
            success: true,
            message: format!("session '{}' terminated", id),
        }));
    }

    error!("management API: session '{}' not found", id);
    Err((StatusCode::NOT_FOUND, Json(ErrorResponse { error: format!("session not found: {}", id) })))
}

pub fn create_management_router(registry: Arc<Registry>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", delete(terminate_session))
        .layer(cors)
        .with_state(registry)
}

pub async fn run_management_api(registry: Arc<Registry>, addr: &str) -> anyhow::Result<()> {
    let router = create_management_router(registry);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("management API listening on {}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}
