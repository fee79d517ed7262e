use anyhow::{Result, anyhow};
use rusqlite::Connection;

use crate::models::UserRow;
use crate::{Database, OptionalExt, now_string};

impl Database {
    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, username, password_hash, now_string()),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn get_username_by_id(&self, id: &str) -> Result<String> {
        self.with_conn(|conn| {
            conn.query_row("SELECT username FROM users WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map_err(|_| anyhow!("User not found: {}", id))
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!(
        "SELECT id, username, password, created_at FROM users WHERE {} = ?1",
        column
    );
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}
