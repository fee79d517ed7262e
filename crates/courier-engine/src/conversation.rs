use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use courier_db::Database;
use courier_db::messages::NewMessage;
use courier_db::models::{ConversationRow, MessageRow, ParticipantRow, ReactionRow};
use courier_types::api::{
    ConversationResponse, MessageResponse, ParticipantResponse, ReactionGroup,
};
use courier_types::models::{ConversationKind, ParticipantRole, TransportMode};

use crate::error::{EngineError, EngineResult};

/// Offline delivery obligations live this long by default.
const DELIVERY_TTL_DAYS: i64 = 30;

/// Conversation and message lifecycle over the persistence layer. All
/// methods are blocking; async callers run them via `spawn_blocking`.
///
/// The engine persists and returns domain results — it never broadcasts.
/// Callers fan out through the hub AFTER the engine returns, so followers
/// can never observe state the database does not have.
#[derive(Clone)]
pub struct ConversationEngine {
    db: Arc<Database>,
}

pub struct ConversationView {
    pub conversation: ConversationRow,
    pub participants: Vec<ParticipantRow>,
}

pub struct CreateOutcome {
    pub view: ConversationView,
    /// False when direct-conversation dedup returned an existing thread.
    pub created: bool,
}

pub struct PostOutcome {
    pub message: MessageRow,
    /// False when client_message_id dedup returned an existing message.
    pub created: bool,
}

pub struct RemoveOutcome {
    pub removed_user: Uuid,
    /// New group key version when the removal triggered a rekey.
    pub group_key_version: Option<i64>,
}

/// Decoded envelope fields as they arrive from a client post.
pub struct NewEnvelope<'a> {
    pub ciphertext: &'a [u8],
    pub nonce: &'a [u8],
    pub signature: &'a [u8],
    pub sender_key_id: Uuid,
    pub encryption_version: i64,
}

impl ConversationEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Create a conversation. For `direct` with one other participant the
    /// call is idempotent: an existing direct thread between the pair is
    /// returned instead of a duplicate. The creator always joins as owner.
    pub fn create_conversation(
        &self,
        creator: Uuid,
        kind: ConversationKind,
        participant_ids: &[Uuid],
        transport_mode: Option<TransportMode>,
        is_encrypted: bool,
        creator_wrapped_key: Option<Vec<u8>>,
    ) -> EngineResult<CreateOutcome> {
        let mut others: Vec<Uuid> = participant_ids
            .iter()
            .copied()
            .filter(|id| *id != creator)
            .collect();
        others.sort();
        others.dedup();

        let direct_key = match kind {
            ConversationKind::Direct => {
                if others.len() != 1 {
                    return Err(EngineError::InvalidInput(
                        "direct conversations need exactly one other participant".into(),
                    ));
                }
                Some(direct_pair_key(creator, others[0]))
            }
            _ => None,
        };

        // Dedup check before insert; the UNIQUE constraint on direct_key
        // closes the race below.
        if let Some(ref key) = direct_key {
            if let Some(existing) = self.db.find_direct_conversation(key)? {
                return Ok(CreateOutcome {
                    view: self.load_view(&existing.id)?,
                    created: false,
                });
            }
        }

        let conversation_id = Uuid::new_v4();
        let row = ConversationRow {
            id: conversation_id.to_string(),
            kind: kind.as_str().to_string(),
            transport_mode: transport_mode.unwrap_or(TransportMode::Hub).as_str().to_string(),
            is_encrypted,
            group_key_version: 1,
            direct_key: direct_key.clone(),
            last_message_at: None,
            is_active: true,
            created_at: String::new(), // set by the db layer
        };

        let mut members: Vec<(String, String, Option<Vec<u8>>)> = vec![(
            creator.to_string(),
            ParticipantRole::Owner.as_str().to_string(),
            creator_wrapped_key,
        )];
        for user in &others {
            members.push((
                user.to_string(),
                ParticipantRole::Member.as_str().to_string(),
                None,
            ));
        }

        match self.db.insert_conversation(&row, &members) {
            Ok(()) => Ok(CreateOutcome {
                view: self.load_view(&row.id)?,
                created: true,
            }),
            Err(e) => {
                // Lost the direct-creation race: the other side inserted
                // first and the UNIQUE(direct_key) constraint fired.
                if let Some(ref key) = direct_key {
                    if let Some(existing) = self.db.find_direct_conversation(key)? {
                        return Ok(CreateOutcome {
                            view: self.load_view(&existing.id)?,
                            created: false,
                        });
                    }
                }
                Err(e.into())
            }
        }
    }

    pub fn get_conversation(&self, id: Uuid, for_user: Uuid) -> EngineResult<ConversationView> {
        self.require_participant(id, for_user)?;
        self.load_view(&id.to_string())
    }

    pub fn list_conversations(&self, user: Uuid) -> EngineResult<Vec<ConversationView>> {
        let rows = self.db.list_conversations_for_user(&user.to_string())?;
        rows.into_iter()
            .map(|row| {
                let participants = self.db.list_active_participants(&row.id)?;
                Ok(ConversationView {
                    conversation: row,
                    participants,
                })
            })
            .collect()
    }

    /// Add a participant. Only owners and admins may; owner role itself is
    /// never granted here (exactly one owner, fixed at creation).
    pub fn add_participant(
        &self,
        conversation_id: Uuid,
        actor: Uuid,
        target: Uuid,
        role: ParticipantRole,
        wrapped_group_key: Option<Vec<u8>>,
    ) -> EngineResult<ParticipantRow> {
        let actor_row = self.require_participant(conversation_id, actor)?;
        let actor_role = parse_role(&actor_row.role);
        if !actor_role.can_manage_participants() {
            return Err(EngineError::Permission(
                "only owners and admins can add participants".into(),
            ));
        }
        if role == ParticipantRole::Owner {
            return Err(EngineError::InvalidInput(
                "a conversation has exactly one owner".into(),
            ));
        }

        let cid = conversation_id.to_string();
        let tid = target.to_string();
        if self.db.get_active_participant(&cid, &tid)?.is_some() {
            return Err(EngineError::AlreadyMember);
        }

        self.db
            .insert_participant(&cid, &tid, role.as_str(), wrapped_group_key.as_deref())?;
        self.db
            .get_active_participant(&cid, &tid)?
            .ok_or(EngineError::NotFound("participant"))
    }

    /// Remove a participant. Owners and admins only — except that any
    /// member may remove themselves (leave). The owner can never be
    /// removed. Removal from an encrypted conversation bumps the group
    /// key version and clears stale wraps; the owner's client re-issues
    /// keys to the remaining members.
    pub fn remove_participant(
        &self,
        conversation_id: Uuid,
        actor: Uuid,
        target: Uuid,
    ) -> EngineResult<RemoveOutcome> {
        let actor_row = self.require_participant(conversation_id, actor)?;
        let actor_role = parse_role(&actor_row.role);
        if actor != target && !actor_role.can_manage_participants() {
            return Err(EngineError::Permission(
                "only owners and admins can remove participants".into(),
            ));
        }

        let cid = conversation_id.to_string();
        let tid = target.to_string();
        let target_row = self
            .db
            .get_active_participant(&cid, &tid)?
            .ok_or(EngineError::NotMember)?;
        if parse_role(&target_row.role) == ParticipantRole::Owner {
            return Err(EngineError::CannotRemoveOwner);
        }

        self.db.deactivate_participant(&cid, &tid)?;

        let conversation = self
            .db
            .get_conversation(&cid)?
            .ok_or(EngineError::NotFound("conversation"))?;
        let group_key_version = if conversation.is_encrypted {
            // Stale keys are never reused after a removal.
            Some(self.db.bump_group_key_version(&cid)?)
        } else {
            None
        };

        Ok(RemoveOutcome {
            removed_user: target,
            group_key_version,
        })
    }

    /// Store re-issued wrapped group keys after a rekey. Only the owner
    /// or an admin distributes keys; entries for non-active users are
    /// rejected so a removed member can never be slipped back in.
    pub fn reissue_keys(
        &self,
        conversation_id: Uuid,
        actor: Uuid,
        expected_version: i64,
        keys: &[(Uuid, Vec<u8>)],
    ) -> EngineResult<()> {
        let actor_row = self.require_participant(conversation_id, actor)?;
        if !parse_role(&actor_row.role).can_manage_participants() {
            return Err(EngineError::Permission(
                "only owners and admins can distribute group keys".into(),
            ));
        }

        let cid = conversation_id.to_string();
        let conversation = self
            .db
            .get_conversation(&cid)?
            .ok_or(EngineError::NotFound("conversation"))?;
        if conversation.group_key_version != expected_version {
            return Err(EngineError::InvalidInput(format!(
                "group key version mismatch: expected {}, conversation is at {}",
                expected_version, conversation.group_key_version
            )));
        }

        let active: std::collections::HashSet<String> = self
            .db
            .list_active_participants(&cid)?
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        for (user_id, _) in keys {
            if !active.contains(&user_id.to_string()) {
                return Err(EngineError::InvalidInput(format!(
                    "user {} is not an active participant",
                    user_id
                )));
            }
        }

        let entries: Vec<(String, Vec<u8>)> = keys
            .iter()
            .map(|(user_id, wrapped)| (user_id.to_string(), wrapped.clone()))
            .collect();
        self.db.store_wrapped_keys(&cid, &entries)?;
        Ok(())
    }

    /// Persist a message. Idempotent on `client_message_id`: a retried
    /// post returns the original message and performs no side effects.
    /// Unread increments and delivery-queue entries commit atomically
    /// with the insert.
    pub fn post_message(
        &self,
        conversation_id: Uuid,
        sender: Uuid,
        envelope: &NewEnvelope<'_>,
        client_message_id: Option<&str>,
        reply_to_id: Option<Uuid>,
        delivery_ttl: Option<chrono::Duration>,
    ) -> EngineResult<PostOutcome> {
        self.require_participant(conversation_id, sender)?;
        if let Some(ttl) = delivery_ttl {
            if ttl <= chrono::Duration::zero() {
                return Err(EngineError::InvalidInput(
                    "delivery ttl must be positive".into(),
                ));
            }
        }

        let cid = conversation_id.to_string();
        if let Some(client_id) = client_message_id {
            if let Some(existing) = self.db.find_by_client_message_id(&cid, client_id)? {
                return Ok(PostOutcome {
                    message: existing,
                    created: false,
                });
            }
        }

        // The signing key must belong to the sender; accepting another
        // user's key id would let a sender impersonate them in metadata.
        let key = self
            .db
            .get_key_pair(&envelope.sender_key_id.to_string())?
            .ok_or(EngineError::NotFound("sender key"))?;
        if key.user_id != sender.to_string() {
            return Err(EngineError::Permission(
                "sender_key_id does not belong to the sender".into(),
            ));
        }
        // Revoked keys still verify history but author nothing new.
        if !key.is_active {
            return Err(EngineError::Permission(
                "sender key has been revoked".into(),
            ));
        }

        if let Some(reply_to) = reply_to_id {
            let parent = self
                .db
                .get_message(&reply_to.to_string())?
                .ok_or(EngineError::NotFound("reply-to message"))?;
            if parent.conversation_id != cid {
                return Err(EngineError::InvalidInput(
                    "reply-to message belongs to another conversation".into(),
                ));
            }
        }

        let message_id = Uuid::new_v4();
        let ttl = delivery_ttl.unwrap_or_else(|| chrono::Duration::days(DELIVERY_TTL_DAYS));
        let expires_at = courier_db::time_string(Utc::now() + ttl);
        let reply_to = reply_to_id.map(|id| id.to_string());

        self.db.insert_message(&NewMessage {
            id: &message_id.to_string(),
            conversation_id: &cid,
            sender_id: &sender.to_string(),
            sender_key_id: &envelope.sender_key_id.to_string(),
            ciphertext: envelope.ciphertext,
            nonce: envelope.nonce,
            signature: envelope.signature,
            encryption_version: envelope.encryption_version,
            client_message_id,
            reply_to_id: reply_to.as_deref(),
            delivery_expires_at: &expires_at,
        })?;

        let message = self
            .db
            .get_message(&message_id.to_string())?
            .ok_or(EngineError::NotFound("message"))?;
        Ok(PostOutcome {
            message,
            created: true,
        })
    }

    /// Move the reader's cursor, zero their unread count, and write
    /// receipts for every covered message in one pass.
    pub fn mark_read(
        &self,
        conversation_id: Uuid,
        user: Uuid,
        up_to_message_id: Uuid,
    ) -> EngineResult<DateTime<Utc>> {
        self.require_participant(conversation_id, user)?;
        let (read_at, _) = self.db.mark_read(
            &conversation_id.to_string(),
            &user.to_string(),
            &up_to_message_id.to_string(),
        )?;
        Ok(parse_time(&read_at))
    }

    /// Batch mark-read across all of the user's conversations. Returns
    /// the conversation ids that had unread messages.
    pub fn mark_all_read(&self, user: Uuid) -> EngineResult<Vec<Uuid>> {
        let ids = self.db.mark_all_read(&user.to_string())?;
        Ok(ids.iter().filter_map(|id| id.parse().ok()).collect())
    }

    /// Replace a message's ciphertext. Sender-only; a SHA-256 of the
    /// pre-edit ciphertext is kept for audit.
    pub fn edit_message(
        &self,
        message_id: Uuid,
        actor: Uuid,
        ciphertext: &[u8],
        nonce: &[u8],
        signature: &[u8],
    ) -> EngineResult<MessageRow> {
        let mid = message_id.to_string();
        let existing = self
            .db
            .get_message(&mid)?
            .ok_or(EngineError::NotFound("message"))?;
        if existing.sender_id != actor.to_string() {
            return Err(EngineError::Permission(
                "only the sender can edit a message".into(),
            ));
        }
        if existing.deleted_for_everyone {
            return Err(EngineError::InvalidInput("message was deleted".into()));
        }

        let original_hash = Sha256::digest(&existing.ciphertext);
        self.db
            .edit_message(&mid, ciphertext, nonce, signature, &original_hash)?;
        self.db
            .get_message(&mid)?
            .ok_or(EngineError::NotFound("message"))
    }

    /// Tombstone a message. `for_everyone` requires the sender or a
    /// manager role; per-viewer deletion is open to any participant.
    /// The row always survives — cross-device sync needs the tombstone.
    pub fn delete_message(
        &self,
        message_id: Uuid,
        actor: Uuid,
        for_everyone: bool,
    ) -> EngineResult<MessageRow> {
        let mid = message_id.to_string();
        let existing = self
            .db
            .get_message(&mid)?
            .ok_or(EngineError::NotFound("message"))?;
        let conversation_id: Uuid = existing
            .conversation_id
            .parse()
            .map_err(|_| EngineError::NotFound("conversation"))?;
        let actor_row = self.require_participant(conversation_id, actor)?;

        if for_everyone {
            let is_sender = existing.sender_id == actor.to_string();
            if !is_sender && !parse_role(&actor_row.role).can_manage_participants() {
                return Err(EngineError::Permission(
                    "only the sender or a manager can delete for everyone".into(),
                ));
            }
            self.db.delete_message_for_everyone(&mid)?;
        } else {
            self.db.delete_message_for_user(&mid, &actor.to_string())?;
        }

        self.db
            .get_message(&mid)?
            .ok_or(EngineError::NotFound("message"))
    }

    /// Toggle a reaction on a message: insert when absent, remove when
    /// present. Returns (added, conversation_id). Reactions are plaintext
    /// metadata; they are never part of the encrypted envelope.
    pub fn toggle_reaction(
        &self,
        message_id: Uuid,
        actor: Uuid,
        emoji: &str,
    ) -> EngineResult<(bool, Uuid)> {
        if emoji.is_empty() || emoji.chars().count() > 8 {
            return Err(EngineError::InvalidInput(
                "emoji must be 1 to 8 characters".into(),
            ));
        }
        let mid = message_id.to_string();
        let existing = self
            .db
            .get_message(&mid)?
            .ok_or(EngineError::NotFound("message"))?;
        if existing.deleted_for_everyone {
            return Err(EngineError::InvalidInput("message was deleted".into()));
        }
        let conversation_id: Uuid = existing
            .conversation_id
            .parse()
            .map_err(|_| EngineError::NotFound("conversation"))?;
        self.require_participant(conversation_id, actor)?;

        let (added, _) = self.db.toggle_reaction(
            &Uuid::new_v4().to_string(),
            &mid,
            &actor.to_string(),
            emoji,
        )?;
        Ok((added, conversation_id))
    }

    pub fn reactions_for_messages(&self, message_ids: &[String]) -> EngineResult<Vec<ReactionRow>> {
        Ok(self.db.get_reactions_for_messages(message_ids)?)
    }

    pub fn get_messages(
        &self,
        conversation_id: Uuid,
        for_user: Uuid,
        limit: u32,
        before: Option<&str>,
    ) -> EngineResult<Vec<MessageRow>> {
        self.require_participant(conversation_id, for_user)?;
        let rows = self
            .db
            .get_messages(&conversation_id.to_string(), limit.min(200), before)?;
        // Per-viewer deletions hide the row from this user only.
        let uid = for_user.to_string();
        Ok(rows
            .into_iter()
            .filter(|m| {
                serde_json::from_str::<Vec<String>>(&m.deleted_for)
                    .map(|viewers| !viewers.contains(&uid))
                    .unwrap_or(true)
            })
            .collect())
    }

    // -- helpers --

    fn require_participant(
        &self,
        conversation_id: Uuid,
        user: Uuid,
    ) -> EngineResult<ParticipantRow> {
        self.db
            .get_active_participant(&conversation_id.to_string(), &user.to_string())?
            .ok_or(EngineError::NotMember)
    }

    fn load_view(&self, conversation_id: &str) -> EngineResult<ConversationView> {
        let conversation = self
            .db
            .get_conversation(conversation_id)?
            .ok_or(EngineError::NotFound("conversation"))?;
        let participants = self.db.list_active_participants(conversation_id)?;
        Ok(ConversationView {
            conversation,
            participants,
        })
    }
}

/// Unordered user-pair key for direct-conversation dedup.
fn direct_pair_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    format!("{}:{}", lo, hi)
}

fn parse_role(raw: &str) -> ParticipantRole {
    ParticipantRole::parse(raw).unwrap_or(ParticipantRole::Member)
}

/// Parse a stored timestamp, tolerating both RFC 3339 and SQLite's bare
/// `YYYY-MM-DD HH:MM:SS` format.
pub fn parse_time(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}

/// Convert a message row to its API shape. Deleted-for-everyone messages
/// keep their metadata but lose the ciphertext.
pub fn message_response(row: &MessageRow) -> MessageResponse {
    let tombstoned = row.deleted_for_everyone;
    MessageResponse {
        id: parse_uuid(&row.id, "message id"),
        conversation_id: parse_uuid(&row.conversation_id, "conversation_id"),
        sender_id: parse_uuid(&row.sender_id, "sender_id"),
        sender_username: row.sender_username.clone(),
        ciphertext: if tombstoned {
            String::new()
        } else {
            BASE64.encode(&row.ciphertext)
        },
        nonce: BASE64.encode(&row.nonce),
        signature: BASE64.encode(&row.signature),
        sender_key_id: parse_uuid(&row.sender_key_id, "sender_key_id"),
        encryption_version: row.encryption_version,
        reply_to_id: row.reply_to_id.as_deref().and_then(|id| id.parse().ok()),
        is_edited: row.is_edited,
        deleted_for_everyone: tombstoned,
        created_at: parse_time(&row.created_at),
        reactions: Vec::new(),
    }
}

/// Group raw reaction rows per message id, collapsing identical emojis
/// into one entry carrying every reacting user.
pub fn reaction_groups(
    rows: &[ReactionRow],
) -> std::collections::HashMap<String, Vec<ReactionGroup>> {
    let mut by_message: std::collections::HashMap<String, Vec<ReactionGroup>> =
        std::collections::HashMap::new();
    for row in rows {
        let Ok(user_id) = row.user_id.parse() else {
            continue;
        };
        let groups = by_message.entry(row.message_id.clone()).or_default();
        match groups.iter_mut().find(|g| g.emoji == row.emoji) {
            Some(group) => {
                group.count += 1;
                group.user_ids.push(user_id);
            }
            None => groups.push(ReactionGroup {
                emoji: row.emoji.clone(),
                count: 1,
                user_ids: vec![user_id],
            }),
        }
    }
    by_message
}

/// Convert a conversation view to its API shape for one viewer. Wrapped
/// group keys are only ever disclosed to their own participant.
pub fn conversation_response(view: &ConversationView, for_user: Uuid) -> ConversationResponse {
    let uid = for_user.to_string();
    let unread = view
        .participants
        .iter()
        .find(|p| p.user_id == uid)
        .map(|p| p.unread_count)
        .unwrap_or(0);

    ConversationResponse {
        id: parse_uuid(&view.conversation.id, "conversation id"),
        kind: ConversationKind::parse(&view.conversation.kind).unwrap_or(ConversationKind::Group),
        transport_mode: TransportMode::parse(&view.conversation.transport_mode)
            .unwrap_or(TransportMode::Hub),
        is_encrypted: view.conversation.is_encrypted,
        group_key_version: view.conversation.group_key_version,
        last_message_at: view
            .conversation
            .last_message_at
            .as_deref()
            .map(parse_time),
        created_at: parse_time(&view.conversation.created_at),
        participants: view
            .participants
            .iter()
            .map(|p| ParticipantResponse {
                user_id: parse_uuid(&p.user_id, "participant user_id"),
                username: p.username.clone(),
                role: parse_role(&p.role),
                is_muted: p.is_muted,
                encrypted_group_key: if p.user_id == uid {
                    p.encrypted_group_key.as_ref().map(|k| BASE64.encode(k))
                } else {
                    None
                },
            })
            .collect(),
        unread_count: unread,
    }
}

fn parse_uuid(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_db::models::KeyPairRow;

    fn engine() -> ConversationEngine {
        ConversationEngine::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn make_user(engine: &ConversationEngine, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        engine
            .db()
            .create_user(&id.to_string(), name, "argon2-hash")
            .unwrap();
        id
    }

    fn make_key(engine: &ConversationEngine, user: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        engine
            .db()
            .insert_key_pair(&KeyPairRow {
                id: id.to_string(),
                user_id: user.to_string(),
                public_key: vec![1; 32],
                private_key_encrypted: vec![2; 48],
                signing_public_key: vec![3; 32],
                signing_private_key_encrypted: vec![4; 48],
                version: 1,
                is_active: true,
                is_primary: true,
                created_at: String::new(),
            })
            .unwrap();
        id
    }

    fn envelope(key_id: Uuid) -> (Vec<u8>, Vec<u8>, Vec<u8>, Uuid) {
        (vec![0xaa; 24], vec![0x01; 12], vec![0x02; 64], key_id)
    }

    fn post(
        engine: &ConversationEngine,
        conversation: Uuid,
        sender: Uuid,
        key_id: Uuid,
        client_id: Option<&str>,
    ) -> PostOutcome {
        let (ct, nonce, sig, key) = envelope(key_id);
        engine
            .post_message(
                conversation,
                sender,
                &NewEnvelope {
                    ciphertext: &ct,
                    nonce: &nonce,
                    signature: &sig,
                    sender_key_id: key,
                    encryption_version: 1,
                },
                client_id,
                None,
                None,
            )
            .unwrap()
    }

    fn direct(engine: &ConversationEngine, a: Uuid, b: Uuid) -> Uuid {
        engine
            .create_conversation(a, ConversationKind::Direct, &[b], None, true, None)
            .unwrap()
            .view
            .conversation
            .id
            .parse()
            .unwrap()
    }

    fn group(engine: &ConversationEngine, owner: Uuid, members: &[Uuid]) -> Uuid {
        engine
            .create_conversation(owner, ConversationKind::Group, members, None, true, None)
            .unwrap()
            .view
            .conversation
            .id
            .parse()
            .unwrap()
    }

    #[test]
    fn direct_conversation_dedups_from_either_side() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");

        let first = eng
            .create_conversation(a, ConversationKind::Direct, &[b], None, true, None)
            .unwrap();
        assert!(first.created);

        // B creating the "same" conversation gets A's thread back.
        let second = eng
            .create_conversation(b, ConversationKind::Direct, &[a], None, true, None)
            .unwrap();
        assert!(!second.created);
        assert_eq!(first.view.conversation.id, second.view.conversation.id);
    }

    #[test]
    fn direct_conversation_requires_one_other_participant() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let c = make_user(&eng, "carol");

        let result =
            eng.create_conversation(a, ConversationKind::Direct, &[b, c], None, true, None);
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn creator_is_owner() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let cid = group(&eng, a, &[b]);

        let view = eng.get_conversation(cid, a).unwrap();
        let owner = view
            .participants
            .iter()
            .find(|p| p.user_id == a.to_string())
            .unwrap();
        assert_eq!(owner.role, "owner");
    }

    #[test]
    fn post_message_is_idempotent_on_client_id() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let key = make_key(&eng, a);
        let cid = direct(&eng, a, b);

        let first = post(&eng, cid, a, key, Some("c1"));
        assert!(first.created);
        let second = post(&eng, cid, a, key, Some("c1"));
        assert!(!second.created);
        assert_eq!(first.message.id, second.message.id);

        // No double unread increment.
        let view = eng.get_conversation(cid, b).unwrap();
        let bob = view
            .participants
            .iter()
            .find(|p| p.user_id == b.to_string())
            .unwrap();
        assert_eq!(bob.unread_count, 1);
    }

    #[test]
    fn unread_accounting_is_exact() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let c = make_user(&eng, "carol");
        let key = make_key(&eng, a);
        let cid = group(&eng, a, &[b, c]);

        for i in 0..4 {
            post(&eng, cid, a, key, Some(&format!("m{}", i)));
        }

        let view = eng.get_conversation(cid, a).unwrap();
        for p in &view.participants {
            let expected = if p.user_id == a.to_string() { 0 } else { 4 };
            assert_eq!(p.unread_count, expected, "user {}", p.username);
        }
    }

    #[test]
    fn mark_read_zeroes_unread_and_creates_receipts() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let key = make_key(&eng, a);
        let cid = direct(&eng, a, b);

        let outcome = post(&eng, cid, a, key, Some("c1"));
        let message_id: Uuid = outcome.message.id.parse().unwrap();

        eng.mark_read(cid, b, message_id).unwrap();

        let view = eng.get_conversation(cid, b).unwrap();
        let bob = view
            .participants
            .iter()
            .find(|p| p.user_id == b.to_string())
            .unwrap();
        assert_eq!(bob.unread_count, 0);
        assert_eq!(bob.last_read_message_id.as_deref(), Some(outcome.message.id.as_str()));

        // A can observe B's receipt.
        let receipts = eng.db().get_read_receipts(&outcome.message.id).unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].0, b.to_string());
    }

    #[test]
    fn sender_gets_no_receipt_for_own_message() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let key = make_key(&eng, a);
        let cid = direct(&eng, a, b);

        let outcome = post(&eng, cid, a, key, None);
        let mid: Uuid = outcome.message.id.parse().unwrap();
        eng.mark_read(cid, a, mid).unwrap();

        assert!(eng.db().get_read_receipts(&outcome.message.id).unwrap().is_empty());
    }

    #[test]
    fn owner_cannot_be_removed_by_anyone() {
        let eng = engine();
        let owner = make_user(&eng, "owner");
        let admin = make_user(&eng, "admin");
        let cid = group(&eng, owner, &[]);
        eng.add_participant(cid, owner, admin, ParticipantRole::Admin, None)
            .unwrap();

        assert!(matches!(
            eng.remove_participant(cid, admin, owner),
            Err(EngineError::CannotRemoveOwner)
        ));
        // Not even the owner themselves.
        assert!(matches!(
            eng.remove_participant(cid, owner, owner),
            Err(EngineError::CannotRemoveOwner)
        ));
    }

    #[test]
    fn member_cannot_manage_participants() {
        let eng = engine();
        let owner = make_user(&eng, "owner");
        let member = make_user(&eng, "member");
        let outsider = make_user(&eng, "outsider");
        let cid = group(&eng, owner, &[member]);

        assert!(matches!(
            eng.add_participant(cid, member, outsider, ParticipantRole::Member, None),
            Err(EngineError::Permission(_))
        ));
    }

    #[test]
    fn adding_existing_member_fails() {
        let eng = engine();
        let owner = make_user(&eng, "owner");
        let member = make_user(&eng, "member");
        let cid = group(&eng, owner, &[member]);

        assert!(matches!(
            eng.add_participant(cid, owner, member, ParticipantRole::Member, None),
            Err(EngineError::AlreadyMember)
        ));
    }

    #[test]
    fn removal_bumps_group_key_version_and_clears_wraps() {
        let eng = engine();
        let owner = make_user(&eng, "owner");
        let admin = make_user(&eng, "admin");
        let member = make_user(&eng, "member");
        let cid = group(&eng, owner, &[member]);
        eng.add_participant(cid, owner, admin, ParticipantRole::Admin, Some(vec![9; 60]))
            .unwrap();

        let outcome = eng.remove_participant(cid, owner, member).unwrap();
        assert_eq!(outcome.group_key_version, Some(2));

        // Every remaining wrap was invalidated pending reissue.
        let view = eng.get_conversation(cid, owner).unwrap();
        assert!(view.participants.iter().all(|p| p.encrypted_group_key.is_none()));

        // Reissue covers remaining members only; the removed member is
        // rejected outright.
        let err = eng.reissue_keys(cid, owner, 2, &[(member, vec![1; 60])]);
        assert!(matches!(err, Err(EngineError::InvalidInput(_))));

        eng.reissue_keys(cid, owner, 2, &[(owner, vec![1; 60]), (admin, vec![2; 60])])
            .unwrap();
        let view = eng.get_conversation(cid, owner).unwrap();
        assert!(view.participants.iter().all(|p| p.encrypted_group_key.is_some()));
    }

    #[test]
    fn rejoin_starts_fresh() {
        let eng = engine();
        let owner = make_user(&eng, "owner");
        let member = make_user(&eng, "member");
        let key = make_key(&eng, owner);
        let cid = group(&eng, owner, &[member]);

        post(&eng, cid, owner, key, None);
        eng.remove_participant(cid, owner, member).unwrap();
        eng.add_participant(cid, owner, member, ParticipantRole::Member, None)
            .unwrap();

        // No unread count leaked from the prior tenure.
        let view = eng.get_conversation(cid, member).unwrap();
        let row = view
            .participants
            .iter()
            .find(|p| p.user_id == member.to_string())
            .unwrap();
        assert_eq!(row.unread_count, 0);
        assert!(row.last_read_message_id.is_none());
    }

    #[test]
    fn non_member_cannot_post() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let outsider = make_user(&eng, "mallory");
        let key = make_key(&eng, outsider);
        let cid = direct(&eng, a, b);

        let (ct, nonce, sig, key_id) = envelope(key);
        let result = eng.post_message(
            cid,
            outsider,
            &NewEnvelope {
                ciphertext: &ct,
                nonce: &nonce,
                signature: &sig,
                sender_key_id: key_id,
                encryption_version: 1,
            },
            None,
            None,
            None,
        );
        assert!(matches!(result, Err(EngineError::NotMember)));
    }

    #[test]
    fn posting_with_someone_elses_key_fails() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let bobs_key = make_key(&eng, b);
        let cid = direct(&eng, a, b);

        let (ct, nonce, sig, key_id) = envelope(bobs_key);
        let result = eng.post_message(
            cid,
            a,
            &NewEnvelope {
                ciphertext: &ct,
                nonce: &nonce,
                signature: &sig,
                sender_key_id: key_id,
                encryption_version: 1,
            },
            None,
            None,
            None,
        );
        assert!(matches!(result, Err(EngineError::Permission(_))));
    }

    #[test]
    fn posting_with_a_revoked_key_fails() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let key = make_key(&eng, a);
        let cid = direct(&eng, a, b);

        eng.db()
            .revoke_key_pair(&key.to_string(), &a.to_string())
            .unwrap();

        let (ct, nonce, sig, key_id) = envelope(key);
        let result = eng.post_message(
            cid,
            a,
            &NewEnvelope {
                ciphertext: &ct,
                nonce: &nonce,
                signature: &sig,
                sender_key_id: key_id,
                encryption_version: 1,
            },
            None,
            None,
            None,
        );
        assert!(matches!(result, Err(EngineError::Permission(_))));
    }

    #[test]
    fn per_message_ttl_shortens_delivery_expiry() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let key = make_key(&eng, a);
        let cid = direct(&eng, a, b);

        let (ct, nonce, sig, key_id) = envelope(key);
        let outcome = eng
            .post_message(
                cid,
                a,
                &NewEnvelope {
                    ciphertext: &ct,
                    nonce: &nonce,
                    signature: &sig,
                    sender_key_id: key_id,
                    encryption_version: 1,
                },
                None,
                None,
                Some(chrono::Duration::hours(1)),
            )
            .unwrap();

        let entry = eng
            .db()
            .get_delivery_entry(&outcome.message.id, &b.to_string())
            .unwrap()
            .unwrap();
        let expires = parse_time(&entry.expires_at);
        assert!(expires < Utc::now() + chrono::Duration::hours(2));
        assert!(expires > Utc::now() + chrono::Duration::minutes(30));

        // Non-positive TTLs are rejected outright.
        let result = eng.post_message(
            cid,
            a,
            &NewEnvelope {
                ciphertext: &ct,
                nonce: &nonce,
                signature: &sig,
                sender_key_id: key_id,
                encryption_version: 1,
            },
            None,
            None,
            Some(chrono::Duration::seconds(-5)),
        );
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn reaction_toggles_on_and_off() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let key = make_key(&eng, a);
        let cid = direct(&eng, a, b);

        let outcome = post(&eng, cid, a, key, None);
        let mid: Uuid = outcome.message.id.parse().unwrap();

        let (added, conversation) = eng.toggle_reaction(mid, b, "👍").unwrap();
        assert!(added);
        assert_eq!(conversation, cid);

        let rows = eng
            .reactions_for_messages(&[outcome.message.id.clone()])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].emoji, "👍");

        // Same user, same emoji: the second toggle removes it.
        let (added, _) = eng.toggle_reaction(mid, b, "👍").unwrap();
        assert!(!added);
        assert!(eng
            .reactions_for_messages(&[outcome.message.id.clone()])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn reactions_group_by_emoji() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let c = make_user(&eng, "carol");
        let key = make_key(&eng, a);
        let cid = group(&eng, a, &[b, c]);

        let outcome = post(&eng, cid, a, key, None);
        let mid: Uuid = outcome.message.id.parse().unwrap();
        eng.toggle_reaction(mid, b, "👍").unwrap();
        eng.toggle_reaction(mid, c, "👍").unwrap();
        eng.toggle_reaction(mid, b, "🎉").unwrap();

        let rows = eng
            .reactions_for_messages(&[outcome.message.id.clone()])
            .unwrap();
        let groups = reaction_groups(&rows);
        let message_groups = &groups[&outcome.message.id];
        assert_eq!(message_groups.len(), 2);
        let thumbs = message_groups.iter().find(|g| g.emoji == "👍").unwrap();
        assert_eq!(thumbs.count, 2);
        assert_eq!(thumbs.user_ids.len(), 2);
    }

    #[test]
    fn non_member_cannot_react() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let outsider = make_user(&eng, "mallory");
        let key = make_key(&eng, a);
        let cid = direct(&eng, a, b);

        let outcome = post(&eng, cid, a, key, None);
        let mid: Uuid = outcome.message.id.parse().unwrap();
        assert!(matches!(
            eng.toggle_reaction(mid, outsider, "👍"),
            Err(EngineError::NotMember)
        ));
    }

    #[test]
    fn edit_preserves_original_hash() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let key = make_key(&eng, a);
        let cid = direct(&eng, a, b);

        let outcome = post(&eng, cid, a, key, None);
        let mid: Uuid = outcome.message.id.parse().unwrap();
        let expected_hash = Sha256::digest(&outcome.message.ciphertext).to_vec();

        let edited = eng
            .edit_message(mid, a, &[0xbb; 30], &[0x05; 12], &[0x06; 64])
            .unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.original_content_hash.as_deref(), Some(expected_hash.as_slice()));
        assert_eq!(edited.ciphertext, vec![0xbb; 30]);

        // Only the sender may edit.
        assert!(matches!(
            eng.edit_message(mid, b, &[1], &[0; 12], &[0; 64]),
            Err(EngineError::Permission(_))
        ));
    }

    #[test]
    fn delete_is_a_tombstone() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let key = make_key(&eng, a);
        let cid = direct(&eng, a, b);

        let outcome = post(&eng, cid, a, key, None);
        let mid: Uuid = outcome.message.id.parse().unwrap();

        let deleted = eng.delete_message(mid, a, true).unwrap();
        assert!(deleted.deleted_for_everyone);

        // Row still exists for sync; the response carries no ciphertext.
        let response = message_response(&deleted);
        assert!(response.ciphertext.is_empty());
        assert!(response.deleted_for_everyone);
    }

    #[test]
    fn per_viewer_delete_tracks_the_viewer() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let key = make_key(&eng, a);
        let cid = direct(&eng, a, b);

        let outcome = post(&eng, cid, a, key, None);
        let mid: Uuid = outcome.message.id.parse().unwrap();

        let row = eng.delete_message(mid, b, false).unwrap();
        assert!(!row.deleted_for_everyone);
        let viewers: Vec<String> = serde_json::from_str(&row.deleted_for).unwrap();
        assert_eq!(viewers, vec![b.to_string()]);
    }

    #[test]
    fn message_pagination_walks_backwards() {
        let eng = engine();
        let a = make_user(&eng, "alice");
        let b = make_user(&eng, "bob");
        let key = make_key(&eng, a);
        let cid = direct(&eng, a, b);

        for i in 0..5 {
            post(&eng, cid, a, key, Some(&format!("m{}", i)));
        }

        let page1 = eng.get_messages(cid, b, 2, None).unwrap();
        assert_eq!(page1.len(), 2);
        let cursor = page1.last().unwrap().created_at.clone();
        let page2 = eng.get_messages(cid, b, 10, Some(&cursor)).unwrap();
        assert_eq!(page2.len(), 3);
        // No overlap between pages.
        assert!(page1.iter().all(|m| page2.iter().all(|n| n.id != m.id)));
    }

    #[test]
    fn self_leave_is_allowed_for_members() {
        let eng = engine();
        let owner = make_user(&eng, "owner");
        let member = make_user(&eng, "member");
        let cid = group(&eng, owner, &[member]);

        eng.remove_participant(cid, member, member).unwrap();
        assert!(matches!(
            eng.get_conversation(cid, member),
            Err(EngineError::NotMember)
        ));
    }
}
