use anyhow::Result;

use crate::models::DeliveryRow;
use crate::{Database, OptionalExt, now_string};

impl Database {
    /// Pending entries whose retry timer has elapsed.
    pub fn due_delivery_entries(&self, now: &str, limit: u32) -> Result<Vec<DeliveryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE status = 'pending' AND next_retry_at <= ?1
                 ORDER BY next_retry_at LIMIT ?2",
                SELECT_DELIVERY
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![now, limit], map_delivery_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Terminal transition to delivered. Idempotent: already-terminal
    /// entries are left untouched.
    pub fn mark_delivered(&self, message_id: &str, recipient_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE delivery_queue SET status = 'delivered', delivered_at = ?3
                 WHERE message_id = ?1 AND recipient_id = ?2 AND status = 'pending'",
                rusqlite::params![message_id, recipient_id, now_string()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Record a failed attempt: bump retry_count and reschedule.
    pub fn reschedule_delivery(&self, id: &str, retry_count: i64, next_retry_at: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE delivery_queue SET retry_count = ?2, next_retry_at = ?3
                 WHERE id = ?1 AND status = 'pending'",
                rusqlite::params![id, retry_count, next_retry_at],
            )?;
            Ok(())
        })
    }

    /// Retry budget exhausted. The entry stays observable for audit and
    /// backfill — failure is never silently dropped.
    pub fn mark_delivery_failed(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE delivery_queue SET status = 'failed' WHERE id = ?1 AND status = 'pending'",
                [id],
            )?;
            Ok(())
        })
    }

    /// Pending entries past their expiry transition to expired regardless
    /// of retry state. Returns how many were expired.
    pub fn expire_stale_deliveries(&self, now: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE delivery_queue SET status = 'expired'
                 WHERE status = 'pending' AND expires_at <= ?1",
                [now],
            )?;
            Ok(changed)
        })
    }

    pub fn get_delivery_entry(
        &self,
        message_id: &str,
        recipient_id: &str,
    ) -> Result<Option<DeliveryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE message_id = ?1 AND recipient_id = ?2",
                SELECT_DELIVERY
            ))?;
            let row = stmt
                .query_row([message_id, recipient_id], map_delivery_row)
                .optional()?;
            Ok(row)
        })
    }

    /// Pending backlog for a recipient, oldest first — used to flush the
    /// offline queue when a user reconnects.
    pub fn pending_deliveries_for_recipient(
        &self,
        recipient_id: &str,
        limit: u32,
    ) -> Result<Vec<DeliveryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE recipient_id = ?1 AND status = 'pending'
                 ORDER BY created_at LIMIT ?2",
                SELECT_DELIVERY
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![recipient_id, limit], map_delivery_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

const SELECT_DELIVERY: &str = "SELECT id, message_id, recipient_id, status, retry_count,
        next_retry_at, expires_at, created_at, delivered_at
 FROM delivery_queue";

fn map_delivery_row(row: &rusqlite::Row<'_>) -> std::result::Result<DeliveryRow, rusqlite::Error> {
    Ok(DeliveryRow {
        id: row.get(0)?,
        message_id: row.get(1)?,
        recipient_id: row.get(2)?,
        status: row.get(3)?,
        retry_count: row.get(4)?,
        next_retry_at: row.get(5)?,
        expires_at: row.get(6)?,
        created_at: row.get(7)?,
        delivered_at: row.get(8)?,
    })
}
