use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use courier_db::Database;
use courier_db::models::P2pSessionRow;
use courier_types::models::P2pSessionStatus;

use crate::error::{EngineError, EngineResult};

/// Durable state machine for direct peer sessions. The hub relays the
/// signaling payloads verbatim; this type only tracks where each session
/// is in its lifecycle so reconnects and audits have ground truth.
///
/// initiating -> connecting -> connected, with disconnected/failed
/// reachable from any non-terminal state.
#[derive(Clone)]
pub struct P2pSessions {
    db: Arc<Database>,
}

impl P2pSessions {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a new session when the initiator sends an offer.
    pub fn initiate(
        &self,
        session_id: Uuid,
        initiator: Uuid,
        responder: Uuid,
    ) -> EngineResult<()> {
        if initiator == responder {
            return Err(EngineError::InvalidInput(
                "a session needs two distinct peers".into(),
            ));
        }
        self.db.insert_p2p_session(
            &session_id.to_string(),
            &initiator.to_string(),
            &responder.to_string(),
            P2pSessionStatus::Initiating.as_str(),
        )?;
        Ok(())
    }

    /// Responder answered the offer.
    pub fn answer(&self, session_id: Uuid, actor: Uuid) -> EngineResult<()> {
        self.transition(session_id, actor, P2pSessionStatus::Connecting)
    }

    /// Either peer observed the channel come up.
    pub fn confirm_connected(&self, session_id: Uuid, actor: Uuid) -> EngineResult<()> {
        self.transition(session_id, actor, P2pSessionStatus::Connected)
    }

    pub fn disconnect(&self, session_id: Uuid, actor: Uuid) -> EngineResult<()> {
        self.transition(session_id, actor, P2pSessionStatus::Disconnected)
    }

    pub fn fail(&self, session_id: Uuid, actor: Uuid) -> EngineResult<()> {
        self.transition(session_id, actor, P2pSessionStatus::Failed)
    }

    /// Wind down every open session the user participates in. Called on
    /// final socket close so peers are not left signaling into the void.
    /// Returns (session id, other peer) pairs so the caller can notify.
    pub fn disconnect_all_for_user(&self, user: Uuid) -> EngineResult<Vec<(Uuid, Uuid)>> {
        let uid = user.to_string();
        let open = self.db.open_p2p_sessions_for_user(&uid)?;
        let mut closed = Vec::with_capacity(open.len());
        for session in open {
            self.db.update_p2p_status(
                &session.id,
                P2pSessionStatus::Disconnected.as_str(),
            )?;
            let other = if session.initiator_id == uid {
                &session.responder_id
            } else {
                &session.initiator_id
            };
            if let (Ok(sid), Ok(peer)) = (session.id.parse(), other.parse()) {
                closed.push((sid, peer));
            }
        }
        if !closed.is_empty() {
            debug!("Wound down {} p2p session(s) for {}", closed.len(), user);
        }
        Ok(closed)
    }

    /// Session status for one of its peers; outsiders get Permission.
    pub fn get(&self, session_id: Uuid, actor: Uuid) -> EngineResult<P2pSessionRow> {
        let session = self.load(session_id)?;
        let uid = actor.to_string();
        if session.initiator_id != uid && session.responder_id != uid {
            return Err(EngineError::Permission(
                "only the session's peers can view it".into(),
            ));
        }
        Ok(session)
    }

    fn load(&self, session_id: Uuid) -> EngineResult<P2pSessionRow> {
        self.db
            .get_p2p_session(&session_id.to_string())?
            .ok_or(EngineError::NotFound("p2p session"))
    }

    fn transition(
        &self,
        session_id: Uuid,
        actor: Uuid,
        to: P2pSessionStatus,
    ) -> EngineResult<()> {
        let session = self.load(session_id)?;
        let uid = actor.to_string();
        if session.initiator_id != uid && session.responder_id != uid {
            return Err(EngineError::Permission(
                "only the session's peers can change its state".into(),
            ));
        }

        let from = P2pSessionStatus::parse(&session.status)
            .ok_or(EngineError::NotFound("p2p session status"))?;
        if !allowed(from, to) {
            return Err(EngineError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.db
            .update_p2p_status(&session.id, to.as_str())?;
        Ok(())
    }
}

fn allowed(from: P2pSessionStatus, to: P2pSessionStatus) -> bool {
    use P2pSessionStatus::*;
    match (from, to) {
        (Initiating, Connecting) => true,
        (Connecting, Connected) => true,
        // Teardown is reachable from any live state.
        (Initiating | Connecting | Connected, Disconnected | Failed) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sessions() -> (P2pSessions, Uuid, Uuid, Uuid) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        db.create_user(&a.to_string(), "alice", "hash").unwrap();
        db.create_user(&b.to_string(), "bob", "hash").unwrap();
        let sid = Uuid::new_v4();
        let p2p = P2pSessions::new(db);
        p2p.initiate(sid, a, b).unwrap();
        (p2p, sid, a, b)
    }

    #[test]
    fn happy_path_reaches_connected() {
        let (p2p, sid, a, b) = sessions();
        p2p.answer(sid, b).unwrap();
        p2p.confirm_connected(sid, a).unwrap();
        assert_eq!(p2p.get(sid, a).unwrap().status, "connected");
    }

    #[test]
    fn cannot_skip_connecting() {
        let (p2p, sid, a, _) = sessions();
        assert!(matches!(
            p2p.confirm_connected(sid, a),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn terminal_states_are_final() {
        let (p2p, sid, a, b) = sessions();
        p2p.disconnect(sid, a).unwrap();
        assert!(matches!(
            p2p.answer(sid, b),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(matches!(
            p2p.fail(sid, a),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn outsiders_cannot_touch_a_session() {
        let (p2p, sid, _, _) = sessions();
        let mallory = Uuid::new_v4();
        assert!(matches!(
            p2p.answer(sid, mallory),
            Err(EngineError::Permission(_))
        ));
    }

    #[test]
    fn self_session_is_rejected() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let a = Uuid::new_v4();
        let p2p = P2pSessions::new(db);
        assert!(matches!(
            p2p.initiate(Uuid::new_v4(), a, a),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn socket_close_winds_down_open_sessions() {
        let (p2p, sid, a, b) = sessions();
        let second = Uuid::new_v4();
        p2p.initiate(second, b, a).unwrap();

        let closed = p2p.disconnect_all_for_user(a).unwrap();
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|(_, peer)| *peer == b));
        assert_eq!(p2p.get(sid, a).unwrap().status, "disconnected");
        assert_eq!(p2p.get(second, a).unwrap().status, "disconnected");

        // Nothing left open on a repeat close.
        assert!(p2p.disconnect_all_for_user(a).unwrap().is_empty());
    }

    #[test]
    fn failure_from_connecting() {
        let (p2p, sid, a, b) = sessions();
        p2p.answer(sid, b).unwrap();
        p2p.fail(sid, a).unwrap();
        assert_eq!(p2p.get(sid, b).unwrap().status, "failed");
    }

    #[test]
    fn outsiders_cannot_view_a_session() {
        let (p2p, sid, _, _) = sessions();
        let mallory = Uuid::new_v4();
        assert!(matches!(
            p2p.get(sid, mallory),
            Err(EngineError::Permission(_))
        ));
    }
}
