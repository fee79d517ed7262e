use anyhow::Result;

use crate::models::ReactionRow;
use crate::{Database, OptionalExt, now_string};

impl Database {
    /// Toggle a reaction: removes if it exists, inserts if not.
    /// Returns (added, id) — added=true means inserted.
    pub fn toggle_reaction(
        &self,
        id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(bool, Option<String>)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                    rusqlite::params![message_id, user_id, emoji],
                    |row| row.get(0),
                )
                .optional()?;

            let result = if let Some(existing_id) = existing {
                tx.execute("DELETE FROM reactions WHERE id = ?1", [&existing_id])?;
                (false, Some(existing_id))
            } else {
                tx.execute(
                    "INSERT INTO reactions (id, message_id, user_id, emoji, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id, message_id, user_id, emoji, now_string()],
                )?;
                (true, Some(id.to_string()))
            };
            tx.commit()?;
            Ok(result)
        })
    }

    /// Batch-fetch reactions for a set of message ids.
    pub fn get_reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, message_id, user_id, emoji, created_at
                 FROM reactions WHERE message_id IN ({})
                 ORDER BY created_at",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(ReactionRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        emoji: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
