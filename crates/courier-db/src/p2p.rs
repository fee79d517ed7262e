use anyhow::Result;

use crate::models::P2pSessionRow;
use crate::{Database, OptionalExt, now_string};

impl Database {
    pub fn insert_p2p_session(
        &self,
        id: &str,
        initiator_id: &str,
        responder_id: &str,
        status: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let now = now_string();
            conn.execute(
                "INSERT INTO p2p_sessions (id, initiator_id, responder_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                rusqlite::params![id, initiator_id, responder_id, status, now],
            )?;
            Ok(())
        })
    }

    pub fn get_p2p_session(&self, id: &str) -> Result<Option<P2pSessionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_SESSIONS))?;
            let row = stmt.query_row([id], map_session_row).optional()?;
            Ok(row)
        })
    }

    pub fn update_p2p_status(&self, id: &str, status: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE p2p_sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
                rusqlite::params![id, status, now_string()],
            )?;
            Ok(())
        })
    }

    /// Sessions a user participates in that are not yet terminal. Used on
    /// connection close so in-flight sessions wind down instead of being
    /// orphaned.
    pub fn open_p2p_sessions_for_user(&self, user_id: &str) -> Result<Vec<P2pSessionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE (initiator_id = ?1 OR responder_id = ?1)
                 AND status NOT IN ('disconnected', 'failed')",
                SELECT_SESSIONS
            ))?;
            let rows = stmt
                .query_map([user_id], map_session_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

const SELECT_SESSIONS: &str = "SELECT id, initiator_id, responder_id, status, created_at, updated_at
 FROM p2p_sessions";

fn map_session_row(row: &rusqlite::Row<'_>) -> std::result::Result<P2pSessionRow, rusqlite::Error> {
    Ok(P2pSessionRow {
        id: row.get(0)?,
        initiator_id: row.get(1)?,
        responder_id: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}
