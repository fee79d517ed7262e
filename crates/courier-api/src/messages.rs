use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tokio::task::spawn_blocking;
use tracing::warn;
use uuid::Uuid;

use courier_crypto::envelope::decode_envelope_fields;
use courier_engine::conversation::{NewEnvelope, message_response, reaction_groups};
use courier_types::api::{
    Claims, DeleteMessageQuery, EditMessageRequest, MarkReadRequest, MessageQuery,
    MessageResponse, SendMessageRequest, ToggleReactionRequest,
};
use courier_types::events::ServerEvent;

use crate::auth::AppState;
use crate::error::{engine_status, join_error};

/// Persist-then-broadcast: the envelope is committed (with its unread
/// increments and delivery-queue entries) before any follower hears about
/// it. Recipients reached live have their queue entries settled on the
/// spot; offline ones are the background worker's problem.
pub async fn post_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    // Structural validation only — the server cannot verify the signature
    // without the conversation key, but it can reject malformed envelopes.
    let (ciphertext, nonce, signature) =
        decode_envelope_fields(&req.ciphertext, &req.nonce, &req.signature)
            .map_err(|_| StatusCode::BAD_REQUEST)?;

    let engine = state.services.engine.clone();
    let sender = claims.sub;
    let (outcome, participants) = spawn_blocking(move || {
        let outcome = engine.post_message(
            conversation_id,
            sender,
            &NewEnvelope {
                ciphertext: &ciphertext,
                nonce: &nonce,
                signature: &signature,
                sender_key_id: req.sender_key_id,
                encryption_version: req.encryption_version,
            },
            req.client_message_id.as_deref(),
            req.reply_to_id,
            req.expires_in_seconds.map(chrono::Duration::seconds),
        )?;
        let view = engine.get_conversation(conversation_id, sender)?;
        Ok::<_, courier_engine::EngineError>((outcome, view.participants))
    })
    .await
    .map_err(join_error)?
    .map_err(engine_status)?;

    let response = message_response(&outcome.message);

    if outcome.created {
        let recipients: Vec<Uuid> = participants
            .iter()
            .filter_map(|p| p.user_id.parse().ok())
            .collect();
        let reached = state.services.hub.send_to_users(
            &recipients,
            &ServerEvent::MessageNew {
                message: response.clone(),
            },
            Some(sender),
        );

        // Settle queue entries for everyone the broadcast reached.
        if !reached.is_empty() {
            let delivery = state.services.delivery.clone();
            let message_id = response.id;
            let settled = spawn_blocking(move || {
                for recipient in reached {
                    delivery.mark_delivered(message_id, recipient)?;
                }
                Ok::<_, courier_engine::EngineError>(())
            })
            .await;
            match settled {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to settle delivery entries: {}", e),
                Err(e) => warn!("Delivery settle task panicked: {}", e),
            }
        }
    }

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let engine = state.services.engine.clone();
    let user = claims.sub;
    let (rows, reactions) = spawn_blocking(move || {
        let rows =
            engine.get_messages(conversation_id, user, query.limit, query.before.as_deref())?;
        let ids: Vec<String> = rows.iter().map(|m| m.id.clone()).collect();
        let reactions = engine.reactions_for_messages(&ids)?;
        Ok::<_, courier_engine::EngineError>((rows, reactions))
    })
    .await
    .map_err(join_error)?
    .map_err(engine_status)?;

    let mut groups = reaction_groups(&reactions);
    let messages: Vec<MessageResponse> = rows
        .iter()
        .map(|row| {
            let mut response = message_response(row);
            if let Some(reactions) = groups.remove(&row.id) {
                response.reactions = reactions;
            }
            response
        })
        .collect();
    Ok(Json(messages))
}

/// Toggle a reaction: adds when absent, removes when present. Reactions
/// are plaintext metadata, so participants learn who reacted with what —
/// unlike message content they are visible to the server by design of
/// the protocol surface.
pub async fn toggle_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ToggleReactionRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let engine = state.services.engine.clone();
    let actor = claims.sub;
    let emoji = req.emoji.clone();
    let (added, conversation_id, participants) = spawn_blocking(move || {
        let (added, conversation_id) = engine.toggle_reaction(message_id, actor, &emoji)?;
        let participants = engine
            .db()
            .list_active_participants(&conversation_id.to_string())?;
        Ok::<_, courier_engine::EngineError>((added, conversation_id, participants))
    })
    .await
    .map_err(join_error)?
    .map_err(engine_status)?;

    let recipients: Vec<Uuid> = participants
        .iter()
        .filter_map(|p| p.user_id.parse().ok())
        .collect();
    let event = if added {
        ServerEvent::ReactionAdd {
            conversation_id,
            message_id,
            user_id: actor,
            username: claims.username.clone(),
            emoji: req.emoji.clone(),
        }
    } else {
        ServerEvent::ReactionRemove {
            conversation_id,
            message_id,
            user_id: actor,
            emoji: req.emoji.clone(),
        }
    };
    state.services.hub.send_to_users(&recipients, &event, Some(actor));

    Ok(Json(serde_json::json!({ "added": added })))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let (ciphertext, nonce, signature) =
        decode_envelope_fields(&req.ciphertext, &req.nonce, &req.signature)
            .map_err(|_| StatusCode::BAD_REQUEST)?;

    let engine = state.services.engine.clone();
    let actor = claims.sub;
    let (row, participants) = spawn_blocking(move || {
        let row = engine.edit_message(message_id, actor, &ciphertext, &nonce, &signature)?;
        let conversation_id: Uuid = row
            .conversation_id
            .parse()
            .map_err(|_| courier_engine::EngineError::NotFound("conversation"))?;
        let view = engine.get_conversation(conversation_id, actor)?;
        Ok::<_, courier_engine::EngineError>((row, view.participants))
    })
    .await
    .map_err(join_error)?
    .map_err(engine_status)?;

    let response = message_response(&row);
    let recipients: Vec<Uuid> = participants
        .iter()
        .filter_map(|p| p.user_id.parse().ok())
        .collect();
    state.services.hub.send_to_users(
        &recipients,
        &ServerEvent::MessageEdited {
            message: response.clone(),
        },
        Some(actor),
    );

    Ok(Json(response))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Query(query): Query<DeleteMessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let engine = state.services.engine.clone();
    let actor = claims.sub;
    let for_everyone = query.for_everyone;
    let (row, participants) = spawn_blocking(move || {
        let row = engine.delete_message(message_id, actor, for_everyone)?;
        let conversation_id: Uuid = row
            .conversation_id
            .parse()
            .map_err(|_| courier_engine::EngineError::NotFound("conversation"))?;
        let participants = engine
            .db()
            .list_active_participants(&conversation_id.to_string())?;
        Ok::<_, courier_engine::EngineError>((row, participants))
    })
    .await
    .map_err(join_error)?
    .map_err(engine_status)?;

    // Per-viewer deletion is private; only a tombstone for everyone is
    // announced.
    if for_everyone {
        let recipients: Vec<Uuid> = participants
            .iter()
            .filter_map(|p| p.user_id.parse().ok())
            .collect();
        state.services.hub.send_to_users(
            &recipients,
            &ServerEvent::MessageDeleted {
                conversation_id: row.conversation_id.parse().unwrap_or_default(),
                message_id,
                for_everyone: true,
            },
            Some(actor),
        );
    }

    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let engine = state.services.engine.clone();
    let user = claims.sub;
    let up_to = req.up_to_message_id;
    let (read_at, participants) = spawn_blocking(move || {
        let read_at = engine.mark_read(conversation_id, user, up_to)?;
        let view = engine.get_conversation(conversation_id, user)?;
        Ok::<_, courier_engine::EngineError>((read_at, view.participants))
    })
    .await
    .map_err(join_error)?
    .map_err(engine_status)?;

    let recipients: Vec<Uuid> = participants
        .iter()
        .filter_map(|p| p.user_id.parse().ok())
        .collect();
    state.services.hub.send_to_users(
        &recipients,
        &ServerEvent::MessageRead {
            conversation_id,
            user_id: user,
            up_to_message_id: up_to,
            read_at,
        },
        Some(user),
    );

    Ok(Json(serde_json::json!({ "read_at": read_at })))
}

/// Zero the unread counter in every conversation at once.
pub async fn read_all(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let engine = state.services.engine.clone();
    let user = claims.sub;
    let conversation_ids = spawn_blocking(move || engine.mark_all_read(user))
        .await
        .map_err(join_error)?
        .map_err(engine_status)?;

    Ok(Json(serde_json::json!({ "conversation_ids": conversation_ids })))
}
