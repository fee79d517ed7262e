use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tokio::task::spawn_blocking;
use uuid::Uuid;

use courier_db::models::P2pSessionRow;
use courier_engine::conversation::parse_time;
use courier_types::api::{Claims, P2pSessionResponse};
use courier_types::events::ServerEvent;
use courier_types::models::P2pSessionStatus;

use crate::auth::AppState;
use crate::error::{engine_status, join_error};

/// Session status, visible to its two peers only. Signaling itself runs
/// over the WebSocket; this is the durable lifecycle record.
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let p2p = state.services.p2p.clone();
    let actor = claims.sub;
    let session = spawn_blocking(move || p2p.get(session_id, actor))
        .await
        .map_err(join_error)?
        .map_err(engine_status)?;

    Ok(Json(session_response(&session)))
}

/// The transport came up: connecting -> connected.
pub async fn confirm_connected(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let p2p = state.services.p2p.clone();
    let actor = claims.sub;
    let session = spawn_blocking(move || {
        p2p.confirm_connected(session_id, actor)?;
        p2p.get(session_id, actor)
    })
    .await
    .map_err(join_error)?
    .map_err(engine_status)?;

    Ok(Json(session_response(&session)))
}

/// Orderly teardown by either peer. The other side is told so it stops
/// signaling at a dead channel.
pub async fn disconnect_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let p2p = state.services.p2p.clone();
    let actor = claims.sub;
    let session = spawn_blocking(move || {
        p2p.disconnect(session_id, actor)?;
        p2p.get(session_id, actor)
    })
    .await
    .map_err(join_error)?
    .map_err(engine_status)?;

    if let Some(peer) = other_peer(&session, actor) {
        state.services.hub.send_to_user(
            peer,
            &ServerEvent::P2pIce {
                from_user_id: actor,
                session_id,
                payload: serde_json::json!({ "disconnected": true }),
            },
        );
    }
    Ok(Json(session_response(&session)))
}

/// Signaling timeout or protocol violation observed by a peer.
pub async fn fail_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let p2p = state.services.p2p.clone();
    let actor = claims.sub;
    let session = spawn_blocking(move || {
        p2p.fail(session_id, actor)?;
        p2p.get(session_id, actor)
    })
    .await
    .map_err(join_error)?
    .map_err(engine_status)?;

    Ok(Json(session_response(&session)))
}

fn other_peer(session: &P2pSessionRow, actor: Uuid) -> Option<Uuid> {
    let uid = actor.to_string();
    let other = if session.initiator_id == uid {
        &session.responder_id
    } else {
        &session.initiator_id
    };
    other.parse().ok()
}

fn session_response(row: &P2pSessionRow) -> P2pSessionResponse {
    P2pSessionResponse {
        id: row.id.parse().unwrap_or_default(),
        initiator_id: row.initiator_id.parse().unwrap_or_default(),
        responder_id: row.responder_id.parse().unwrap_or_default(),
        status: P2pSessionStatus::parse(&row.status).unwrap_or(P2pSessionStatus::Failed),
        created_at: parse_time(&row.created_at),
        updated_at: parse_time(&row.updated_at),
    }
}
