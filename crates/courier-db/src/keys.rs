use anyhow::Result;

use crate::models::KeyPairRow;
use crate::{Database, OptionalExt, now_string};

impl Database {
    /// Insert a device key pair. Demotes the user's previous primary in
    /// the same transaction so the one-active-primary invariant holds.
    pub fn insert_key_pair(&self, row: &KeyPairRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if row.is_primary {
                tx.execute(
                    "UPDATE encryption_keys SET is_primary = 0 WHERE user_id = ?1 AND is_primary = 1",
                    [&row.user_id],
                )?;
            }
            tx.execute(
                "INSERT INTO encryption_keys
                    (id, user_id, public_key, private_key_encrypted,
                     signing_public_key, signing_private_key_encrypted,
                     version, is_active, is_primary, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9)",
                rusqlite::params![
                    row.id,
                    row.user_id,
                    row.public_key,
                    row.private_key_encrypted,
                    row.signing_public_key,
                    row.signing_private_key_encrypted,
                    row.version,
                    row.is_primary,
                    now_string(),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_key_pair(&self, id: &str) -> Result<Option<KeyPairRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_KEYS))?;
            let row = stmt.query_row([id], map_key_row).optional()?;
            Ok(row)
        })
    }

    pub fn list_keys_for_user(&self, user_id: &str, active_only: bool) -> Result<Vec<KeyPairRow>> {
        self.with_conn(|conn| {
            let sql = if active_only {
                format!(
                    "{} WHERE user_id = ?1 AND is_active = 1 ORDER BY created_at DESC",
                    SELECT_KEYS
                )
            } else {
                format!("{} WHERE user_id = ?1 ORDER BY created_at DESC", SELECT_KEYS)
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], map_key_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Soft revocation. The row stays — history signed with this key must
    /// remain verifiable.
    pub fn revoke_key_pair(&self, id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE encryption_keys SET is_active = 0, is_primary = 0
                 WHERE id = ?1 AND user_id = ?2 AND is_active = 1",
                [id, user_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Next key version for a user's new device key.
    pub fn next_key_version(&self, user_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let version: i64 = conn.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM encryption_keys WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(version)
        })
    }
}

const SELECT_KEYS: &str = "SELECT id, user_id, public_key, private_key_encrypted,
        signing_public_key, signing_private_key_encrypted,
        version, is_active, is_primary, created_at
 FROM encryption_keys";

fn map_key_row(row: &rusqlite::Row<'_>) -> std::result::Result<KeyPairRow, rusqlite::Error> {
    Ok(KeyPairRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        public_key: row.get(2)?,
        private_key_encrypted: row.get(3)?,
        signing_public_key: row.get(4)?,
        signing_private_key_encrypted: row.get(5)?,
        version: row.get(6)?,
        is_active: row.get(7)?,
        is_primary: row.get(8)?,
        created_at: row.get(9)?,
    })
}
