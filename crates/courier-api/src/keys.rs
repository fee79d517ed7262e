use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use uuid::Uuid;

use courier_db::models::KeyPairRow;
use courier_engine::conversation::parse_time;
use courier_types::api::{Claims, KeyPairResponse, OwnKeyPairResponse, RegisterKeyRequest};

use crate::auth::AppState;
use crate::error::join_error;

/// Register a device key pair. The new pair becomes primary; earlier
/// primaries are demoted but stay active so old envelopes remain
/// verifiable.
pub async fn register_key(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<RegisterKeyRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let public_key = decode_exact(&req.public_key, 32)?;
    let signing_public_key = decode_exact(&req.signing_public_key, 32)?;
    let private_key_encrypted = decode_nonempty(&req.private_key_encrypted)?;
    let signing_private_key_encrypted = decode_nonempty(&req.signing_private_key_encrypted)?;

    let key_id = Uuid::new_v4();
    let uid = claims.sub.to_string();
    let db = state.db().clone();
    let row = tokio::task::spawn_blocking(move || {
        let version = db.next_key_version(&uid)?;
        db.insert_key_pair(&KeyPairRow {
            id: key_id.to_string(),
            user_id: uid.clone(),
            public_key,
            private_key_encrypted,
            signing_public_key,
            signing_private_key_encrypted,
            version,
            is_active: true,
            is_primary: true,
            created_at: String::new(),
        })?;
        db.get_key_pair(&key_id.to_string())
    })
    .await
    .map_err(join_error)?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok((StatusCode::CREATED, Json(key_response(&row))))
}

/// Public key material for a user — what a peer needs to wrap group keys
/// and verify signatures. Active keys only.
pub async fn get_user_keys(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db().clone();
    let rows = tokio::task::spawn_blocking(move || db.list_keys_for_user(&user_id.to_string(), true))
        .await
        .map_err(join_error)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let keys: Vec<KeyPairResponse> = rows.iter().map(key_response).collect();
    Ok(Json(keys))
}

/// The caller's own keys, including the encrypted private halves, so a
/// reinstalled device can restore its identity.
pub async fn get_own_keys(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db().clone();
    let uid = claims.sub.to_string();
    let rows = tokio::task::spawn_blocking(move || db.list_keys_for_user(&uid, true))
        .await
        .map_err(join_error)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let keys: Vec<OwnKeyPairResponse> = rows
        .iter()
        .map(|row| OwnKeyPairResponse {
            public: key_response(row),
            private_key_encrypted: B64.encode(&row.private_key_encrypted),
            signing_private_key_encrypted: B64.encode(&row.signing_private_key_encrypted),
        })
        .collect();
    Ok(Json(keys))
}

/// Revoke one of the caller's keys. Revoked keys stop appearing in
/// lookups and can no longer author new messages.
pub async fn revoke_key(
    State(state): State<AppState>,
    Path(key_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db().clone();
    let uid = claims.sub.to_string();
    let revoked =
        tokio::task::spawn_blocking(move || db.revoke_key_pair(&key_id.to_string(), &uid))
            .await
            .map_err(join_error)?
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if revoked {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

fn key_response(row: &KeyPairRow) -> KeyPairResponse {
    KeyPairResponse {
        id: row.id.parse().unwrap_or_default(),
        user_id: row.user_id.parse().unwrap_or_default(),
        public_key: B64.encode(&row.public_key),
        signing_public_key: B64.encode(&row.signing_public_key),
        version: row.version,
        is_active: row.is_active,
        is_primary: row.is_primary,
        created_at: parse_time(&row.created_at),
    }
}

fn decode_exact(b64: &str, len: usize) -> Result<Vec<u8>, StatusCode> {
    let bytes = B64.decode(b64).map_err(|_| StatusCode::BAD_REQUEST)?;
    if bytes.len() != len {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(bytes)
}

fn decode_nonempty(b64: &str) -> Result<Vec<u8>, StatusCode> {
    let bytes = B64.decode(b64).map_err(|_| StatusCode::BAD_REQUEST)?;
    if bytes.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(bytes)
}
