use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        -- One row per (user, device) key pair. Private halves arrive
        -- encrypted under a password-derived key; the server cannot
        -- unwrap them. Revocation is soft: old keys are still needed to
        -- verify history they signed.
        CREATE TABLE IF NOT EXISTS encryption_keys (
            id                              TEXT PRIMARY KEY,
            user_id                         TEXT NOT NULL REFERENCES users(id),
            public_key                      BLOB NOT NULL,
            private_key_encrypted           BLOB NOT NULL,
            signing_public_key              BLOB NOT NULL,
            signing_private_key_encrypted   BLOB NOT NULL,
            version                         INTEGER NOT NULL DEFAULT 1,
            is_active                       INTEGER NOT NULL DEFAULT 1,
            is_primary                      INTEGER NOT NULL DEFAULT 0,
            created_at                      TEXT NOT NULL
        );

        -- At most one active primary key pair per user.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_keys_one_primary
            ON encryption_keys(user_id)
            WHERE is_active = 1 AND is_primary = 1;

        CREATE INDEX IF NOT EXISTS idx_keys_user
            ON encryption_keys(user_id, is_active);

        CREATE TABLE IF NOT EXISTS conversations (
            id                  TEXT PRIMARY KEY,
            kind                TEXT NOT NULL,
            transport_mode      TEXT NOT NULL DEFAULT 'hub',
            is_encrypted        INTEGER NOT NULL DEFAULT 1,
            group_key_version   INTEGER NOT NULL DEFAULT 1,
            -- Sorted 'uuid:uuid' pair for direct conversations; the UNIQUE
            -- constraint is what makes direct-conversation dedup safe under
            -- concurrent creation from both sides.
            direct_key          TEXT UNIQUE,
            last_message_at     TEXT,
            is_active           INTEGER NOT NULL DEFAULT 1,
            created_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS participants (
            id                      TEXT PRIMARY KEY,
            conversation_id         TEXT NOT NULL REFERENCES conversations(id),
            user_id                 TEXT NOT NULL REFERENCES users(id),
            role                    TEXT NOT NULL DEFAULT 'member',
            encrypted_group_key     BLOB,
            unread_count            INTEGER NOT NULL DEFAULT 0,
            last_read_message_id    TEXT,
            is_muted                INTEGER NOT NULL DEFAULT 0,
            is_active               INTEGER NOT NULL DEFAULT 1,
            joined_at               TEXT NOT NULL,
            left_at                 TEXT
        );

        -- One active membership per (conversation, user). Leaving is
        -- one-way; a rejoin inserts a fresh row so no stale unread count
        -- or read cursor leaks across tenures.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_participants_active
            ON participants(conversation_id, user_id)
            WHERE is_active = 1;

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON participants(user_id, is_active);

        CREATE TABLE IF NOT EXISTS messages (
            id                      TEXT PRIMARY KEY,
            conversation_id         TEXT NOT NULL REFERENCES conversations(id),
            sender_id               TEXT NOT NULL REFERENCES users(id),
            sender_key_id           TEXT NOT NULL REFERENCES encryption_keys(id),
            ciphertext              BLOB NOT NULL,
            nonce                   BLOB NOT NULL,
            signature               BLOB NOT NULL,
            encryption_version      INTEGER NOT NULL DEFAULT 1,
            client_message_id       TEXT,
            reply_to_id             TEXT REFERENCES messages(id),
            is_edited               INTEGER NOT NULL DEFAULT 0,
            original_content_hash   BLOB,
            deleted_for_everyone    INTEGER NOT NULL DEFAULT 0,
            -- JSON array of user ids the message is hidden for.
            deleted_for             TEXT NOT NULL DEFAULT '[]',
            created_at              TEXT NOT NULL,
            edited_at               TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        -- Idempotent client retries: one message per client-supplied id.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_client_id
            ON messages(conversation_id, client_message_id)
            WHERE client_message_id IS NOT NULL;

        -- Reactions are plaintext metadata, never part of the envelope.
        CREATE TABLE IF NOT EXISTS reactions (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE (message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);

        CREATE TABLE IF NOT EXISTS read_receipts (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            read_at     TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS delivery_queue (
            id              TEXT PRIMARY KEY,
            message_id      TEXT NOT NULL REFERENCES messages(id),
            recipient_id    TEXT NOT NULL REFERENCES users(id),
            status          TEXT NOT NULL DEFAULT 'pending',
            retry_count     INTEGER NOT NULL DEFAULT 0,
            next_retry_at   TEXT NOT NULL,
            expires_at      TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            delivered_at    TEXT,
            UNIQUE (message_id, recipient_id)
        );

        CREATE INDEX IF NOT EXISTS idx_delivery_due
            ON delivery_queue(status, next_retry_at);

        CREATE TABLE IF NOT EXISTS p2p_sessions (
            id              TEXT PRIMARY KEY,
            initiator_id    TEXT NOT NULL REFERENCES users(id),
            responder_id    TEXT NOT NULL REFERENCES users(id),
            status          TEXT NOT NULL DEFAULT 'initiating',
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_p2p_users
            ON p2p_sessions(initiator_id, responder_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
