use anyhow::Result;
use rusqlite::Connection;

use crate::models::{ConversationRow, ParticipantRow};
use crate::{Database, OptionalExt, now_string};

impl Database {
    /// Insert a conversation and its initial participants in one
    /// transaction. `participants` is (user_id, role, wrapped_key).
    pub fn insert_conversation(
        &self,
        row: &ConversationRow,
        participants: &[(String, String, Option<Vec<u8>>)],
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversations
                    (id, kind, transport_mode, is_encrypted, group_key_version,
                     direct_key, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
                rusqlite::params![
                    row.id,
                    row.kind,
                    row.transport_mode,
                    row.is_encrypted,
                    row.group_key_version,
                    row.direct_key,
                    now_string(),
                ],
            )?;
            for (user_id, role, wrapped_key) in participants {
                tx.execute(
                    "INSERT INTO participants
                        (id, conversation_id, user_id, role, encrypted_group_key, joined_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        uuid::Uuid::new_v4().to_string(),
                        row.id,
                        user_id,
                        role,
                        wrapped_key,
                        now_string(),
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_CONVERSATIONS))?;
            let row = stmt.query_row([id], map_conversation_row).optional()?;
            Ok(row)
        })
    }

    /// Direct-conversation dedup lookup by the sorted user-pair key.
    pub fn find_direct_conversation(&self, direct_key: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE direct_key = ?1 AND is_active = 1",
                SELECT_CONVERSATIONS
            ))?;
            let row = stmt.query_row([direct_key], map_conversation_row).optional()?;
            Ok(row)
        })
    }

    pub fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.kind, c.transport_mode, c.is_encrypted, c.group_key_version,
                        c.direct_key, c.last_message_at, c.is_active, c.created_at
                 FROM conversations c
                 JOIN participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1 AND p.is_active = 1 AND c.is_active = 1
                 ORDER BY c.last_message_at DESC NULLS LAST, c.created_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], map_conversation_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Participants --

    pub fn get_active_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<ParticipantRow>> {
        self.with_conn(|conn| query_active_participant(conn, conversation_id, user_id))
    }

    pub fn list_active_participants(&self, conversation_id: &str) -> Result<Vec<ParticipantRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE p.conversation_id = ?1 AND p.is_active = 1 ORDER BY p.joined_at",
                SELECT_PARTICIPANTS
            ))?;
            let rows = stmt
                .query_map([conversation_id], map_participant_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn insert_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
        role: &str,
        wrapped_key: Option<&[u8]>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO participants
                    (id, conversation_id, user_id, role, encrypted_group_key, joined_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    uuid::Uuid::new_v4().to_string(),
                    conversation_id,
                    user_id,
                    role,
                    wrapped_key,
                    now_string(),
                ],
            )?;
            Ok(())
        })
    }

    /// One-way active -> left transition. A later rejoin inserts a fresh
    /// row; this one keeps its final state for audit.
    pub fn deactivate_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE participants SET is_active = 0, left_at = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2 AND is_active = 1",
                rusqlite::params![conversation_id, user_id, now_string()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Rekey bookkeeping after a removal: bump the conversation's key
    /// version and drop every remaining participant's wrapped key so the
    /// stale key can never be served again. New wraps arrive via
    /// `store_wrapped_keys`.
    pub fn bump_group_key_version(&self, conversation_id: &str) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE conversations SET group_key_version = group_key_version + 1
                 WHERE id = ?1",
                [conversation_id],
            )?;
            tx.execute(
                "UPDATE participants SET encrypted_group_key = NULL
                 WHERE conversation_id = ?1 AND is_active = 1",
                [conversation_id],
            )?;
            let version: i64 = tx.query_row(
                "SELECT group_key_version FROM conversations WHERE id = ?1",
                [conversation_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(version)
        })
    }

    /// Store re-issued wrapped group keys for active participants.
    pub fn store_wrapped_keys(
        &self,
        conversation_id: &str,
        keys: &[(String, Vec<u8>)],
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            for (user_id, wrapped) in keys {
                tx.execute(
                    "UPDATE participants SET encrypted_group_key = ?3
                     WHERE conversation_id = ?1 AND user_id = ?2 AND is_active = 1",
                    rusqlite::params![conversation_id, user_id, wrapped],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn set_last_message_at(&self, conversation_id: &str, at: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conversations SET last_message_at = ?2 WHERE id = ?1",
                [conversation_id, at],
            )?;
            Ok(())
        })
    }
}

const SELECT_CONVERSATIONS: &str = "SELECT id, kind, transport_mode, is_encrypted, group_key_version,
        direct_key, last_message_at, is_active, created_at
 FROM conversations";

const SELECT_PARTICIPANTS: &str = "SELECT p.id, p.conversation_id, p.user_id, u.username, p.role,
        p.encrypted_group_key, p.unread_count, p.last_read_message_id,
        p.is_muted, p.is_active, p.joined_at
 FROM participants p
 JOIN users u ON u.id = p.user_id";

fn map_conversation_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<ConversationRow, rusqlite::Error> {
    Ok(ConversationRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        transport_mode: row.get(2)?,
        is_encrypted: row.get(3)?,
        group_key_version: row.get(4)?,
        direct_key: row.get(5)?,
        last_message_at: row.get(6)?,
        is_active: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn map_participant_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<ParticipantRow, rusqlite::Error> {
    Ok(ParticipantRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        user_id: row.get(2)?,
        username: row.get(3)?,
        role: row.get(4)?,
        encrypted_group_key: row.get(5)?,
        unread_count: row.get(6)?,
        last_read_message_id: row.get(7)?,
        is_muted: row.get(8)?,
        is_active: row.get(9)?,
        joined_at: row.get(10)?,
    })
}

fn query_active_participant(
    conn: &Connection,
    conversation_id: &str,
    user_id: &str,
) -> Result<Option<ParticipantRow>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE p.conversation_id = ?1 AND p.user_id = ?2 AND p.is_active = 1",
        SELECT_PARTICIPANTS
    ))?;
    let row = stmt
        .query_row([conversation_id, user_id], map_participant_row)
        .optional()?;
    Ok(row)
}
