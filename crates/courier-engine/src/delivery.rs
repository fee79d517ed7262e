use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;
use uuid::Uuid;

use courier_db::Database;
use courier_db::models::MessageRow;
use courier_db::time_string;

use crate::error::{EngineError, EngineResult};

const MAX_RETRIES: i64 = 5;
const BASE_BACKOFF_SECS: i64 = 30;
const RETRY_BATCH: u32 = 256;

/// Something that can push a message at a recipient. The hub implements
/// this over its live connection registry; tests script it.
pub trait DeliverySink: Send + Sync {
    /// Attempt delivery. Returns true when the recipient had a live
    /// connection and the event was handed to it.
    fn deliver(&self, recipient_id: Uuid, message: &MessageRow) -> bool;
}

/// Per-recipient offline delivery with capped exponential backoff.
///
/// Entries are created atomically with the message insert; this type
/// only drives them through their lifecycle: a background worker calls
/// `retry_due_entries` on a timer, and the connection handler calls
/// `flush_for_recipient` when a user comes online. At-least-once:
/// a crash between a push and `mark_delivered` re-sends, and clients
/// dedup by message id.
#[derive(Clone)]
pub struct DeliveryQueue {
    db: Arc<Database>,
    max_retries: i64,
}

pub struct RetryStats {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            max_retries: MAX_RETRIES,
        }
    }

    #[cfg(test)]
    fn with_max_retries(db: Arc<Database>, max_retries: i64) -> Self {
        Self { db, max_retries }
    }

    /// One worker tick: attempt every pending entry whose timer elapsed.
    /// A failed attempt bumps the retry count and backs off; hitting the
    /// retry cap marks the entry failed for good.
    pub fn retry_due_entries(
        &self,
        now: DateTime<Utc>,
        sink: &dyn DeliverySink,
    ) -> EngineResult<RetryStats> {
        let due = self.db.due_delivery_entries(&time_string(now), RETRY_BATCH)?;
        let mut stats = RetryStats {
            attempted: due.len(),
            delivered: 0,
            failed: 0,
        };

        for entry in due {
            let Some(message) = self.db.get_message(&entry.message_id)? else {
                // Hard-deleted upstream; nothing left to deliver.
                self.db.mark_delivery_failed(&entry.id)?;
                stats.failed += 1;
                continue;
            };

            let recipient = match entry.recipient_id.parse::<Uuid>() {
                Ok(id) => id,
                Err(e) => {
                    warn!("Corrupt recipient id '{}': {}", entry.recipient_id, e);
                    self.db.mark_delivery_failed(&entry.id)?;
                    stats.failed += 1;
                    continue;
                }
            };

            if sink.deliver(recipient, &message) {
                self.db.mark_delivered(&entry.message_id, &entry.recipient_id)?;
                stats.delivered += 1;
                continue;
            }

            let attempts = entry.retry_count + 1;
            if attempts >= self.max_retries {
                warn!(
                    "Message {} to {}: {}",
                    entry.message_id,
                    entry.recipient_id,
                    EngineError::DeliveryExhausted(attempts)
                );
                self.db.mark_delivery_failed(&entry.id)?;
                stats.failed += 1;
            } else {
                let next = now + backoff_after(attempts);
                self.db
                    .reschedule_delivery(&entry.id, attempts, &time_string(next))?;
            }
        }
        Ok(stats)
    }

    /// Push the recipient's entire pending backlog, oldest first. Called
    /// when a user connects so queued messages arrive without waiting for
    /// the next worker tick.
    pub fn flush_for_recipient(
        &self,
        recipient_id: Uuid,
        sink: &dyn DeliverySink,
    ) -> EngineResult<usize> {
        let rid = recipient_id.to_string();
        let pending = self.db.pending_deliveries_for_recipient(&rid, RETRY_BATCH)?;
        let mut flushed = 0;
        for entry in pending {
            let Some(message) = self.db.get_message(&entry.message_id)? else {
                self.db.mark_delivery_failed(&entry.id)?;
                continue;
            };
            if sink.deliver(recipient_id, &message) {
                self.db.mark_delivered(&entry.message_id, &rid)?;
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Settle an entry immediately after a live broadcast reached the
    /// recipient, so the worker never re-sends it.
    pub fn mark_delivered(&self, message_id: Uuid, recipient_id: Uuid) -> EngineResult<bool> {
        Ok(self
            .db
            .mark_delivered(&message_id.to_string(), &recipient_id.to_string())?)
    }

    /// Expire pending entries past their TTL. Returns how many expired.
    pub fn expire_stale_entries(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        Ok(self.db.expire_stale_deliveries(&time_string(now))?)
    }
}

/// 30s, 60s, 120s, 240s... capped at one hour.
fn backoff_after(attempts: i64) -> Duration {
    let exp = attempts.clamp(1, 8) as u32 - 1;
    let secs = (BASE_BACKOFF_SECS << exp).min(3600);
    Duration::seconds(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use courier_db::messages::NewMessage;
    use courier_db::models::{ConversationRow, KeyPairRow};

    /// Scripted sink: pops the next result per call, records attempts.
    struct ScriptedSink {
        results: Mutex<Vec<bool>>,
        attempts: Mutex<Vec<Uuid>>,
    }

    impl ScriptedSink {
        fn new(results: Vec<bool>) -> Self {
            Self {
                results: Mutex::new(results),
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempt_count(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }
    }

    impl DeliverySink for ScriptedSink {
        fn deliver(&self, recipient_id: Uuid, _message: &MessageRow) -> bool {
            self.attempts.lock().unwrap().push(recipient_id);
            self.results.lock().unwrap().pop().unwrap_or(false)
        }
    }

    struct Fixture {
        db: Arc<Database>,
        recipient: Uuid,
        message_id: String,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();
        db.create_user(&sender.to_string(), "sender", "hash").unwrap();
        db.create_user(&recipient.to_string(), "recipient", "hash").unwrap();

        let key_id = Uuid::new_v4();
        db.insert_key_pair(&KeyPairRow {
            id: key_id.to_string(),
            user_id: sender.to_string(),
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

        let conversation_id = Uuid::new_v4().to_string();
        db.insert_conversation(
            &ConversationRow {
                id: conversation_id.clone(),
                kind: "direct".into(),
                transport_mode: "hub".into(),
                is_encrypted: true,
                group_key_version: 1,
                direct_key: None,
                last_message_at: None,
                is_active: true,
                created_at: String::new(),
            },
            &[
                (sender.to_string(), "owner".into(), None),
                (recipient.to_string(), "member".into(), None),
            ],
        )
        .unwrap();

        let message_id = Uuid::new_v4().to_string();
        let expires = time_string(Utc::now() + Duration::days(30));
        db.insert_message(&NewMessage {
            id: &message_id,
            conversation_id: &conversation_id,
            sender_id: &sender.to_string(),
            sender_key_id: &key_id.to_string(),
            ciphertext: &[0xaa; 24],
            nonce: &[1; 12],
            signature: &[2; 64],
            encryption_version: 1,
            client_message_id: None,
            reply_to_id: None,
            delivery_expires_at: &expires,
        })
        .unwrap();

        Fixture {
            db,
            recipient,
            message_id,
        }
    }

    fn entry_status(fx: &Fixture) -> String {
        fx.db
            .get_delivery_entry(&fx.message_id, &fx.recipient.to_string())
            .unwrap()
            .unwrap()
            .status
    }

    #[test]
    fn message_insert_queues_delivery_for_recipients_only() {
        let fx = fixture();
        let entry = fx
            .db
            .get_delivery_entry(&fx.message_id, &fx.recipient.to_string())
            .unwrap();
        assert!(entry.is_some());
        assert_eq!(entry.unwrap().status, "pending");
    }

    #[test]
    fn successful_retry_marks_delivered() {
        let fx = fixture();
        let queue = DeliveryQueue::new(fx.db.clone());
        let sink = ScriptedSink::new(vec![true]);

        let stats = queue.retry_due_entries(Utc::now(), &sink).unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(entry_status(&fx), "delivered");

        // Delivered is terminal: the next tick finds nothing.
        let stats = queue.retry_due_entries(Utc::now(), &sink).unwrap();
        assert_eq!(stats.attempted, 0);
    }

    #[test]
    fn failures_back_off_then_exhaust_the_budget() {
        let fx = fixture();
        let queue = DeliveryQueue::new(fx.db.clone());
        let sink = ScriptedSink::new(vec![false; 16]);

        let mut now = Utc::now();
        for attempt in 1..MAX_RETRIES {
            let stats = queue.retry_due_entries(now, &sink).unwrap();
            assert_eq!(stats.attempted, 1, "attempt {}", attempt);
            assert_eq!(entry_status(&fx), "pending");
            // Step past the backoff so the entry is due again.
            now += backoff_after(attempt) + Duration::seconds(1);
        }

        let stats = queue.retry_due_entries(now, &sink).unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(entry_status(&fx), "failed");
        assert_eq!(sink.attempt_count(), MAX_RETRIES as usize);

        // Failed is terminal too: no further attempts.
        now += Duration::hours(2);
        let stats = queue.retry_due_entries(now, &sink).unwrap();
        assert_eq!(stats.attempted, 0);
        assert_eq!(sink.attempt_count(), MAX_RETRIES as usize);
    }

    #[test]
    fn entry_not_due_is_not_attempted() {
        let fx = fixture();
        let queue = DeliveryQueue::with_max_retries(fx.db.clone(), 5);
        let sink = ScriptedSink::new(vec![false; 4]);

        queue.retry_due_entries(Utc::now(), &sink).unwrap();
        // Immediately re-ticking finds the entry still backing off.
        queue.retry_due_entries(Utc::now(), &sink).unwrap();
        assert_eq!(sink.attempt_count(), 1);
    }

    #[test]
    fn reconnect_flush_drains_the_backlog() {
        let fx = fixture();
        let queue = DeliveryQueue::new(fx.db.clone());
        let sink = ScriptedSink::new(vec![true; 4]);

        let flushed = queue.flush_for_recipient(fx.recipient, &sink).unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(entry_status(&fx), "delivered");
    }

    #[test]
    fn live_broadcast_settles_the_entry() {
        let fx = fixture();
        let queue = DeliveryQueue::new(fx.db.clone());

        let settled = queue
            .mark_delivered(fx.message_id.parse().unwrap(), fx.recipient)
            .unwrap();
        assert!(settled);
        // Second settle is a no-op.
        let settled = queue
            .mark_delivered(fx.message_id.parse().unwrap(), fx.recipient)
            .unwrap();
        assert!(!settled);
    }

    #[test]
    fn stale_entries_expire() {
        let fx = fixture();
        let queue = DeliveryQueue::new(fx.db.clone());

        assert_eq!(queue.expire_stale_entries(Utc::now()).unwrap(), 0);
        let expired = queue
            .expire_stale_entries(Utc::now() + Duration::days(31))
            .unwrap();
        assert_eq!(expired, 1);
        assert_eq!(entry_status(&fx), "expired");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_after(1), Duration::seconds(30));
        assert_eq!(backoff_after(2), Duration::seconds(60));
        assert_eq!(backoff_after(3), Duration::seconds(120));
        assert_eq!(backoff_after(20), Duration::seconds(3600));
    }
}
