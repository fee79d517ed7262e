use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationKind, P2pSessionStatus, ParticipantRole, TransportMode};

// -- JWT Claims --

/// JWT claims shared across courier-api (REST middleware) and courier-hub
/// (WebSocket authentication). Canonical definition lives here in
/// courier-types to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Keys --

/// Registers a device key pair. Public halves are served to peers; private
/// halves arrive already encrypted under a password-derived key the server
/// cannot unwrap, and are stored opaquely.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterKeyRequest {
    pub public_key: String,
    pub private_key_encrypted: String,
    pub signing_public_key: String,
    pub signing_private_key_encrypted: String,
}

#[derive(Debug, Serialize)]
pub struct KeyPairResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub public_key: String,
    pub signing_public_key: String,
    pub version: i64,
    pub is_active: bool,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

/// A key pair as seen by its owner: includes the encrypted private halves
/// so a device can restore its keys after reinstall.
#[derive(Debug, Serialize)]
pub struct OwnKeyPairResponse {
    #[serde(flatten)]
    pub public: KeyPairResponse,
    pub private_key_encrypted: String,
    pub signing_private_key_encrypted: String,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub kind: ConversationKind,
    #[serde(default)]
    pub participant_ids: Vec<Uuid>,
    pub transport_mode: Option<TransportMode>,
    #[serde(default = "default_true")]
    pub is_encrypted: bool,
    /// Group key wrapped for the creator, base64. Wraps for the other
    /// participants follow via the key-reissue endpoint.
    pub encrypted_group_key: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub transport_mode: TransportMode,
    pub is_encrypted: bool,
    pub group_key_version: i64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub participants: Vec<ParticipantResponse>,
    /// Caller's unread count in this conversation.
    pub unread_count: i64,
}

#[derive(Debug, Serialize)]
pub struct ParticipantResponse {
    pub user_id: Uuid,
    pub username: String,
    pub role: ParticipantRole,
    pub is_muted: bool,
    /// Group key wrapped for this participant, base64. Only populated for
    /// the requesting user's own row.
    pub encrypted_group_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddParticipantRequest {
    pub user_id: Uuid,
    #[serde(default = "default_member")]
    pub role: ParticipantRole,
    /// Group key wrapped for the new participant, base64.
    pub encrypted_group_key: Option<String>,
}

fn default_member() -> ParticipantRole {
    ParticipantRole::Member
}

/// Re-issues wrapped group keys after a rekey (participant removal bumps
/// `group_key_version` and invalidates every old wrap).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReissueKeysRequest {
    pub group_key_version: i64,
    pub keys: Vec<WrappedKeyEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WrappedKeyEntry {
    pub user_id: Uuid,
    pub encrypted_group_key: String,
}

// -- Messages --

/// An encrypted envelope as posted by a client. All binary fields are
/// base64; the server never sees plaintext.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub ciphertext: String,
    pub nonce: String,
    pub signature: String,
    pub sender_key_id: Uuid,
    #[serde(default = "default_encryption_version")]
    pub encryption_version: i64,
    /// Client-generated idempotency token: retrying a post with the same
    /// id returns the original message instead of duplicating it.
    pub client_message_id: Option<String>,
    pub reply_to_id: Option<Uuid>,
    /// Optional delivery TTL in seconds for disappearing messages; the
    /// queue entry expires this long after posting instead of the
    /// 30-day default.
    pub expires_in_seconds: Option<i64>,
}

fn default_encryption_version() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub ciphertext: String,
    pub nonce: String,
    pub signature: String,
    pub sender_key_id: Uuid,
    pub encryption_version: i64,
    pub reply_to_id: Option<Uuid>,
    pub is_edited: bool,
    pub deleted_for_everyone: bool,
    pub created_at: DateTime<Utc>,
    /// Grouped by emoji. Empty on freshly posted messages and on push
    /// events; populated when listing history.
    #[serde(default)]
    pub reactions: Vec<ReactionGroup>,
}

// -- Reactions --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}

// -- P2P sessions --

#[derive(Debug, Serialize)]
pub struct P2pSessionResponse {
    pub id: Uuid,
    pub initiator_id: Uuid,
    pub responder_id: Uuid,
    pub status: P2pSessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub ciphertext: String,
    pub nonce: String,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteMessageQuery {
    #[serde(default)]
    pub for_everyone: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkReadRequest {
    pub up_to_message_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination — pass the `created_at` timestamp of the
    /// oldest message from the previous page to fetch older messages.
    pub before: Option<String>,
}

fn default_limit() -> u32 {
    50
}
