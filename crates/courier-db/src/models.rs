/// Database row types — these map directly to SQLite rows.
/// Distinct from courier-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct KeyPairRow {
    pub id: String,
    pub user_id: String,
    pub public_key: Vec<u8>,
    pub private_key_encrypted: Vec<u8>,
    pub signing_public_key: Vec<u8>,
    pub signing_private_key_encrypted: Vec<u8>,
    pub version: i64,
    pub is_active: bool,
    pub is_primary: bool,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub kind: String,
    pub transport_mode: String,
    pub is_encrypted: bool,
    pub group_key_version: i64,
    pub direct_key: Option<String>,
    pub last_message_at: Option<String>,
    pub is_active: bool,
    pub created_at: String,
}

pub struct ParticipantRow {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub encrypted_group_key: Option<Vec<u8>>,
    pub unread_count: i64,
    pub last_read_message_id: Option<String>,
    pub is_muted: bool,
    pub is_active: bool,
    pub joined_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub sender_key_id: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub signature: Vec<u8>,
    pub encryption_version: i64,
    pub client_message_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub is_edited: bool,
    pub original_content_hash: Option<Vec<u8>>,
    pub deleted_for_everyone: bool,
    pub deleted_for: String,
    pub created_at: String,
    pub edited_at: Option<String>,
}

pub struct ReactionRow {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

pub struct DeliveryRow {
    pub id: String,
    pub message_id: String,
    pub recipient_id: String,
    pub status: String,
    pub retry_count: i64,
    pub next_retry_at: String,
    pub expires_at: String,
    pub created_at: String,
    pub delivered_at: Option<String>,
}

pub struct P2pSessionRow {
    pub id: String,
    pub initiator_id: String,
    pub responder_id: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}
