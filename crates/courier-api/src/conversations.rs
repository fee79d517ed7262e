use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use tokio::task::spawn_blocking;
use uuid::Uuid;

use courier_engine::conversation::conversation_response;
use courier_types::api::{
    AddParticipantRequest, Claims, ConversationResponse, CreateConversationRequest,
    ParticipantResponse, ReissueKeysRequest,
};
use courier_types::events::ServerEvent;
use courier_types::models::ParticipantRole;

use crate::auth::AppState;
use crate::error::{engine_status, join_error};

pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let creator_wrap = match &req.encrypted_group_key {
        Some(b64) => Some(B64.decode(b64).map_err(|_| StatusCode::BAD_REQUEST)?),
        None => None,
    };

    let engine = state.services.engine.clone();
    let creator = claims.sub;
    let outcome = spawn_blocking(move || {
        engine.create_conversation(
            creator,
            req.kind,
            &req.participant_ids,
            req.transport_mode,
            req.is_encrypted,
            creator_wrap,
        )
    })
    .await
    .map_err(join_error)?
    .map_err(engine_status)?;

    // Tell the other founding members they were added. Dedup hits skip
    // this: nobody joined anything new.
    if outcome.created {
        let conversation_id: Uuid = outcome
            .view
            .conversation
            .id
            .parse()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        for p in &outcome.view.participants {
            let Ok(user_id) = p.user_id.parse::<Uuid>() else {
                continue;
            };
            if user_id == creator {
                continue;
            }
            state.services.hub.send_to_user(
                user_id,
                &ServerEvent::ParticipantJoined {
                    conversation_id,
                    user_id,
                    username: p.username.clone(),
                },
            );
        }
    }

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(conversation_response(&outcome.view, creator))))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let engine = state.services.engine.clone();
    let user = claims.sub;
    let views = spawn_blocking(move || engine.list_conversations(user))
        .await
        .map_err(join_error)?
        .map_err(engine_status)?;

    let conversations: Vec<ConversationResponse> = views
        .iter()
        .map(|view| conversation_response(view, user))
        .collect();
    Ok(Json(conversations))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let engine = state.services.engine.clone();
    let user = claims.sub;
    let view = spawn_blocking(move || engine.get_conversation(conversation_id, user))
        .await
        .map_err(join_error)?
        .map_err(engine_status)?;

    Ok(Json(conversation_response(&view, user)))
}

pub async fn add_participant(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddParticipantRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let wrap = match &req.encrypted_group_key {
        Some(b64) => Some(B64.decode(b64).map_err(|_| StatusCode::BAD_REQUEST)?),
        None => None,
    };

    let engine = state.services.engine.clone();
    let actor = claims.sub;
    let target = req.user_id;
    let role = req.role;
    let (row, view) = spawn_blocking(move || {
        let row = engine.add_participant(conversation_id, actor, target, role, wrap)?;
        let view = engine.get_conversation(conversation_id, actor)?;
        Ok::<_, courier_engine::EngineError>((row, view))
    })
    .await
    .map_err(join_error)?
    .map_err(engine_status)?;

    let recipients: Vec<Uuid> = view
        .participants
        .iter()
        .filter_map(|p| p.user_id.parse().ok())
        .collect();
    state.services.hub.send_to_users(
        &recipients,
        &ServerEvent::ParticipantJoined {
            conversation_id,
            user_id: target,
            username: row.username.clone(),
        },
        Some(actor),
    );

    Ok((
        StatusCode::CREATED,
        Json(ParticipantResponse {
            user_id: target,
            username: row.username,
            role: ParticipantRole::parse(&row.role).unwrap_or(ParticipantRole::Member),
            is_muted: row.is_muted,
            encrypted_group_key: None,
        }),
    ))
}

pub async fn remove_participant(
    State(state): State<AppState>,
    Path((conversation_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let engine = state.services.engine.clone();
    let actor = claims.sub;
    let (outcome, participants) = spawn_blocking(move || {
        let outcome = engine.remove_participant(conversation_id, actor, user_id)?;
        let participants = engine
            .db()
            .list_active_participants(&conversation_id.to_string())?;
        Ok::<_, courier_engine::EngineError>((outcome, participants))
    })
    .await
    .map_err(join_error)?
    .map_err(engine_status)?;

    let event = ServerEvent::ParticipantLeft {
        conversation_id,
        user_id,
        group_key_version: outcome.group_key_version,
    };
    let mut recipients: Vec<Uuid> = participants
        .iter()
        .filter_map(|p| p.user_id.parse().ok())
        .collect();
    // The removed user hears about it too.
    recipients.push(user_id);
    state.services.hub.send_to_users(&recipients, &event, None);

    Ok(StatusCode::NO_CONTENT)
}

/// Store re-issued wrapped group keys after a rekey.
pub async fn reissue_keys(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ReissueKeysRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let mut keys = Vec::with_capacity(req.keys.len());
    for entry in &req.keys {
        let wrapped = B64
            .decode(&entry.encrypted_group_key)
            .map_err(|_| StatusCode::BAD_REQUEST)?;
        keys.push((entry.user_id, wrapped));
    }

    let engine = state.services.engine.clone();
    let actor = claims.sub;
    let version = req.group_key_version;
    spawn_blocking(move || engine.reissue_keys(conversation_id, actor, version, &keys))
        .await
        .map_err(join_error)?
        .map_err(engine_status)?;

    Ok(StatusCode::NO_CONTENT)
}
