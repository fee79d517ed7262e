use anyhow::{Result, anyhow};
use rusqlite::Connection;

use crate::models::MessageRow;
use crate::{Database, OptionalExt, now_string};

/// Everything needed to persist one message atomically.
pub struct NewMessage<'a> {
    pub id: &'a str,
    pub conversation_id: &'a str,
    pub sender_id: &'a str,
    pub sender_key_id: &'a str,
    pub ciphertext: &'a [u8],
    pub nonce: &'a [u8],
    pub signature: &'a [u8],
    pub encryption_version: i64,
    pub client_message_id: Option<&'a str>,
    pub reply_to_id: Option<&'a str>,
    /// Delivery-queue expiry for the per-recipient entries.
    pub delivery_expires_at: &'a str,
}

impl Database {
    /// Insert a message with all its side effects in ONE transaction:
    /// unread_count increments for every other active participant, one
    /// pending delivery-queue entry per recipient, and the conversation's
    /// last_message_at. A crash can never leave a message without its
    /// unread/delivery bookkeeping, and concurrent posts cannot lose
    /// increments.
    ///
    /// Returns the created_at timestamp.
    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<String> {
        self.with_conn_mut(|conn| {
            let now = now_string();
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO messages
                    (id, conversation_id, sender_id, sender_key_id, ciphertext, nonce,
                     signature, encryption_version, client_message_id, reply_to_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    msg.id,
                    msg.conversation_id,
                    msg.sender_id,
                    msg.sender_key_id,
                    msg.ciphertext,
                    msg.nonce,
                    msg.signature,
                    msg.encryption_version,
                    msg.client_message_id,
                    msg.reply_to_id,
                    now,
                ],
            )?;

            tx.execute(
                "UPDATE participants SET unread_count = unread_count + 1
                 WHERE conversation_id = ?1 AND user_id != ?2 AND is_active = 1",
                [msg.conversation_id, msg.sender_id],
            )?;

            tx.execute(
                "INSERT INTO delivery_queue
                    (id, message_id, recipient_id, status, retry_count,
                     next_retry_at, expires_at, created_at)
                 SELECT lower(hex(randomblob(16))), ?1, user_id, 'pending', 0, ?3, ?4, ?3
                 FROM participants
                 WHERE conversation_id = ?2 AND user_id != ?5 AND is_active = 1",
                rusqlite::params![
                    msg.id,
                    msg.conversation_id,
                    now,
                    msg.delivery_expires_at,
                    msg.sender_id,
                ],
            )?;

            tx.execute(
                "UPDATE conversations SET last_message_at = ?2 WHERE id = ?1",
                [msg.conversation_id, now.as_str()],
            )?;

            tx.commit()?;
            Ok(now)
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} WHERE m.id = ?1", SELECT_MESSAGES))?;
            let row = stmt.query_row([id], map_message_row).optional()?;
            Ok(row)
        })
    }

    /// Idempotency lookup for client retries.
    pub fn find_by_client_message_id(
        &self,
        conversation_id: &str,
        client_message_id: &str,
    ) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE m.conversation_id = ?1 AND m.client_message_id = ?2",
                SELECT_MESSAGES
            ))?;
            let row = stmt
                .query_row([conversation_id, client_message_id], map_message_row)
                .optional()?;
            Ok(row)
        })
    }

    pub fn get_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, conversation_id, limit, before))
    }

    /// Replace ciphertext after an edit, preserving a hash of the prior
    /// blob for audit. Only the first edit records the hash.
    pub fn edit_message(
        &self,
        id: &str,
        ciphertext: &[u8],
        nonce: &[u8],
        signature: &[u8],
        original_hash: &[u8],
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET
                    ciphertext = ?2, nonce = ?3, signature = ?4,
                    is_edited = 1, edited_at = ?5,
                    original_content_hash = COALESCE(original_content_hash, ?6)
                 WHERE id = ?1",
                rusqlite::params![id, ciphertext, nonce, signature, now_string(), original_hash],
            )?;
            Ok(())
        })
    }

    /// Tombstone for everyone. The row stays for cross-device sync.
    pub fn delete_message_for_everyone(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET deleted_for_everyone = 1 WHERE id = ?1",
                [id],
            )?;
            Ok(())
        })
    }

    /// Per-viewer tombstone: append the viewer to the deleted_for list.
    pub fn delete_message_for_user(&self, id: &str, user_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let current: String = tx
                .query_row("SELECT deleted_for FROM messages WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .map_err(|_| anyhow!("Message not found: {}", id))?;

            let mut viewers: Vec<String> =
                serde_json::from_str(&current).unwrap_or_default();
            if !viewers.iter().any(|v| v == user_id) {
                viewers.push(user_id.to_string());
            }
            let updated = serde_json::to_string(&viewers)?;

            tx.execute(
                "UPDATE messages SET deleted_for = ?2 WHERE id = ?1",
                [id, updated.as_str()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Mark everything up to (and including) `up_to_message_id` as read:
    /// read cursor, unread_count reset, and receipts for every covered
    /// message not sent by the reader — one transaction, one pass.
    ///
    /// Returns (read_at, receipts_created).
    pub fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        up_to_message_id: &str,
    ) -> Result<(String, usize)> {
        self.with_conn_mut(|conn| {
            let now = now_string();
            let tx = conn.transaction()?;

            let cutoff: String = tx
                .query_row(
                    "SELECT created_at FROM messages WHERE id = ?1 AND conversation_id = ?2",
                    [up_to_message_id, conversation_id],
                    |row| row.get(0),
                )
                .map_err(|_| anyhow!("Message not found: {}", up_to_message_id))?;

            tx.execute(
                "UPDATE participants SET unread_count = 0, last_read_message_id = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2 AND is_active = 1",
                [conversation_id, user_id, up_to_message_id],
            )?;

            let created = tx.execute(
                "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at)
                 SELECT id, ?2, ?4 FROM messages
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND created_at <= ?3",
                rusqlite::params![conversation_id, user_id, cutoff, now],
            )?;

            tx.commit()?;
            Ok((now, created))
        })
    }

    /// Batch mark-read across every conversation the user participates in.
    /// Returns the affected conversation ids.
    pub fn mark_all_read(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let now = now_string();
            let tx = conn.transaction()?;

            let conversation_ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT conversation_id FROM participants
                     WHERE user_id = ?1 AND is_active = 1 AND unread_count > 0",
                )?;
                stmt.query_map([user_id], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            tx.execute(
                "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at)
                 SELECT m.id, ?1, ?2 FROM messages m
                 JOIN participants p ON p.conversation_id = m.conversation_id
                 WHERE p.user_id = ?1 AND p.is_active = 1 AND m.sender_id != ?1",
                rusqlite::params![user_id, now],
            )?;

            tx.execute(
                "UPDATE participants SET unread_count = 0
                 WHERE user_id = ?1 AND is_active = 1",
                [user_id],
            )?;

            tx.commit()?;
            Ok(conversation_ids)
        })
    }

    pub fn get_read_receipts(&self, message_id: &str) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, read_at FROM read_receipts WHERE message_id = ?1 ORDER BY read_at",
            )?;
            let rows = stmt
                .query_map([message_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

const SELECT_MESSAGES: &str = "SELECT m.id, m.conversation_id, m.sender_id, u.username, m.sender_key_id,
        m.ciphertext, m.nonce, m.signature, m.encryption_version,
        m.client_message_id, m.reply_to_id, m.is_edited, m.original_content_hash,
        m.deleted_for_everyone, m.deleted_for, m.created_at, m.edited_at
 FROM messages m
 LEFT JOIN users u ON m.sender_id = u.id";

fn map_message_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        sender_key_id: row.get(4)?,
        ciphertext: row.get(5)?,
        nonce: row.get(6)?,
        signature: row.get(7)?,
        encryption_version: row.get(8)?,
        client_message_id: row.get(9)?,
        reply_to_id: row.get(10)?,
        is_edited: row.get(11)?,
        original_content_hash: row.get(12)?,
        deleted_for_everyone: row.get(13)?,
        deleted_for: row.get(14)?,
        created_at: row.get(15)?,
        edited_at: row.get(16)?,
    })
}

fn query_messages(
    conn: &Connection,
    conversation_id: &str,
    limit: u32,
    before: Option<&str>,
) -> Result<Vec<MessageRow>> {
    // Cursor pagination: `before` is the created_at of the oldest message
    // from the previous page.
    let (sql, params): (String, Vec<&dyn rusqlite::types::ToSql>) = match before {
        Some(ref cursor) => (
            format!(
                "{} WHERE m.conversation_id = ?1 AND m.created_at < ?2
                 ORDER BY m.created_at DESC LIMIT ?3",
                SELECT_MESSAGES
            ),
            vec![&conversation_id, cursor, &limit],
        ),
        None => (
            format!(
                "{} WHERE m.conversation_id = ?1 ORDER BY m.created_at DESC LIMIT ?2",
                SELECT_MESSAGES
            ),
            vec![&conversation_id, &limit],
        ),
    };

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params.as_slice(), map_message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
