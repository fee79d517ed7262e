use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use courier_db::models::MessageRow;
use courier_engine::DeliverySink;
use courier_engine::conversation::message_response;
use courier_types::events::ServerEvent;

/// Live connection registry and fan-out. A user may hold several
/// concurrent connections (one per device); events addressed to a user
/// reach every device, and presence flips only on the first connection
/// up and the last connection down.
///
/// Events go to explicit recipient sets — the caller decides who may see
/// what, the hub only routes. Locks are std (never held across await);
/// every method here is sync so the delivery worker can drive the hub
/// from a blocking context.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    /// user_id -> live connections [(conn_id, sender)]
    connections: RwLock<HashMap<Uuid, Vec<(Uuid, mpsc::UnboundedSender<ServerEvent>)>>>,

    /// user_id -> username, for presence snapshots
    online_users: RwLock<HashMap<Uuid, String>>,

    /// conversation_id -> users with that conversation on screen.
    /// Scopes typing indicators, not message fan-out.
    watchers: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                connections: RwLock::new(HashMap::new()),
                online_users: RwLock::new(HashMap::new()),
                watchers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a connection. Returns (conn_id, receiver); existing
    /// connections for the same user keep running untouched.
    pub fn register(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .connections
            .write()
            .expect("connection lock poisoned")
            .entry(user_id)
            .or_default()
            .push((conn_id, tx));
        (conn_id, rx)
    }

    /// Mark online and tell everyone — but only when this is the user's
    /// first live connection; further devices join silently. Separate
    /// from `register` so the connection handler can send the presence
    /// snapshot in between.
    pub fn user_online(&self, user_id: Uuid, username: &str) {
        let newly_online = self
            .inner
            .online_users
            .write()
            .expect("presence lock poisoned")
            .insert(user_id, username.to_string())
            .is_none();
        if newly_online {
            self.broadcast_all(&ServerEvent::PresenceUpdate {
                user_id,
                username: username.to_string(),
                online: true,
            });
        }
    }

    /// Tear down one connection. Presence flips and watcher sets clear
    /// only when this was the user's last connection; returns true in
    /// that case.
    pub fn user_offline(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        {
            let mut connections = self
                .inner
                .connections
                .write()
                .expect("connection lock poisoned");
            let Some(handles) = connections.get_mut(&user_id) else {
                return false;
            };
            handles.retain(|(id, _)| *id != conn_id);
            if !handles.is_empty() {
                return false;
            }
            connections.remove(&user_id);
        }

        for watchers in self
            .inner
            .watchers
            .write()
            .expect("watcher lock poisoned")
            .values_mut()
        {
            watchers.remove(&user_id);
        }

        let username = self
            .inner
            .online_users
            .write()
            .expect("presence lock poisoned")
            .remove(&user_id)
            .unwrap_or_default();
        self.broadcast_all(&ServerEvent::PresenceUpdate {
            user_id,
            username,
            online: false,
        });
        true
    }

    /// Push an event at one user, on every device. Returns false when no
    /// live connection took it.
    pub fn send_to_user(&self, user_id: Uuid, event: &ServerEvent) -> bool {
        let connections = self
            .inner
            .connections
            .read()
            .expect("connection lock poisoned");
        let Some(handles) = connections.get(&user_id) else {
            return false;
        };
        let mut reached = false;
        for (_, tx) in handles {
            reached |= tx.send(event.clone()).is_ok();
        }
        reached
    }

    /// Push an event at one specific connection of a user. For replies
    /// that concern only the device that sent the offending frame.
    pub fn send_to_connection(&self, user_id: Uuid, conn_id: Uuid, event: &ServerEvent) -> bool {
        let connections = self
            .inner
            .connections
            .read()
            .expect("connection lock poisoned");
        connections
            .get(&user_id)
            .and_then(|handles| handles.iter().find(|(id, _)| *id == conn_id))
            .is_some_and(|(_, tx)| tx.send(event.clone()).is_ok())
    }

    /// Fan an event out to a recipient set, optionally skipping one user
    /// (usually the originator, who already has the result in hand).
    /// Returns the users the event actually reached.
    pub fn send_to_users(
        &self,
        user_ids: &[Uuid],
        event: &ServerEvent,
        exclude: Option<Uuid>,
    ) -> Vec<Uuid> {
        let connections = self
            .inner
            .connections
            .read()
            .expect("connection lock poisoned");
        let mut reached = Vec::new();
        for user_id in user_ids {
            if Some(*user_id) == exclude {
                continue;
            }
            let Some(handles) = connections.get(user_id) else {
                continue;
            };
            let mut any = false;
            for (_, tx) in handles {
                any |= tx.send(event.clone()).is_ok();
            }
            if any {
                reached.push(*user_id);
            }
        }
        reached
    }

    pub fn broadcast_all(&self, event: &ServerEvent) {
        let connections = self
            .inner
            .connections
            .read()
            .expect("connection lock poisoned");
        for handles in connections.values() {
            for (_, tx) in handles {
                let _ = tx.send(event.clone());
            }
        }
    }

    pub fn watch_conversation(&self, conversation_id: Uuid, user_id: Uuid) {
        self.inner
            .watchers
            .write()
            .expect("watcher lock poisoned")
            .entry(conversation_id)
            .or_default()
            .insert(user_id);
    }

    pub fn unwatch_conversation(&self, conversation_id: Uuid, user_id: Uuid) {
        let mut watchers = self.inner.watchers.write().expect("watcher lock poisoned");
        if let Some(set) = watchers.get_mut(&conversation_id) {
            set.remove(&user_id);
            if set.is_empty() {
                watchers.remove(&conversation_id);
            }
        }
    }

    pub fn watchers_of(&self, conversation_id: Uuid) -> Vec<Uuid> {
        self.inner
            .watchers
            .read()
            .expect("watcher lock poisoned")
            .get(&conversation_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.inner
            .connections
            .read()
            .expect("connection lock poisoned")
            .contains_key(&user_id)
    }

    pub fn online_users(&self) -> Vec<(Uuid, String)> {
        self.inner
            .online_users
            .read()
            .expect("presence lock poisoned")
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// The hub is the delivery sink for the offline queue: an attempt
/// succeeds when the recipient has a live connection and the event was
/// handed to its send task.
impl DeliverySink for Hub {
    fn deliver(&self, recipient_id: Uuid, message: &MessageRow) -> bool {
        self.send_to_user(
            recipient_id,
            &ServerEvent::MessageNew {
                message: message_response(message),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_now(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Option<ServerEvent> {
        rx.try_recv().ok()
    }

    #[test]
    fn send_to_user_requires_a_connection() {
        let hub = Hub::new();
        let user = Uuid::new_v4();
        assert!(!hub.send_to_user(user, &ServerEvent::Pong));

        let (_, mut rx) = hub.register(user);
        assert!(hub.send_to_user(user, &ServerEvent::Pong));
        assert!(matches!(recv_now(&mut rx), Some(ServerEvent::Pong)));
    }

    #[test]
    fn events_reach_every_device() {
        let hub = Hub::new();
        let user = Uuid::new_v4();
        let (_, mut phone_rx) = hub.register(user);
        let (_, mut laptop_rx) = hub.register(user);

        hub.send_to_user(user, &ServerEvent::Pong);
        assert!(recv_now(&mut phone_rx).is_some());
        assert!(recv_now(&mut laptop_rx).is_some());
    }

    #[test]
    fn send_to_connection_targets_one_device() {
        let hub = Hub::new();
        let user = Uuid::new_v4();
        let (phone, mut phone_rx) = hub.register(user);
        let (_, mut laptop_rx) = hub.register(user);

        assert!(hub.send_to_connection(user, phone, &ServerEvent::Pong));
        assert!(recv_now(&mut phone_rx).is_some());
        assert!(recv_now(&mut laptop_rx).is_none());

        assert!(!hub.send_to_connection(user, Uuid::new_v4(), &ServerEvent::Pong));
    }

    #[test]
    fn user_stays_online_until_last_connection_drops() {
        let hub = Hub::new();
        let user = Uuid::new_v4();
        let (phone, _phone_rx) = hub.register(user);
        let (laptop, mut laptop_rx) = hub.register(user);
        hub.user_online(user, "alice");

        // One device closing leaves the other fully functional.
        assert!(!hub.user_offline(user, phone));
        assert!(hub.is_online(user));
        hub.send_to_user(user, &ServerEvent::Pong);
        assert!(recv_now(&mut laptop_rx).is_some());

        assert!(hub.user_offline(user, laptop));
        assert!(!hub.is_online(user));
    }

    #[test]
    fn second_device_joins_without_a_presence_broadcast() {
        let hub = Hub::new();
        let user = Uuid::new_v4();
        let observer = Uuid::new_v4();
        let (_, mut observer_rx) = hub.register(observer);

        let (_, _rx1) = hub.register(user);
        hub.user_online(user, "alice");
        assert!(matches!(
            recv_now(&mut observer_rx),
            Some(ServerEvent::PresenceUpdate { online: true, .. })
        ));

        let (_, _rx2) = hub.register(user);
        hub.user_online(user, "alice");
        assert!(recv_now(&mut observer_rx).is_none());
    }

    #[test]
    fn offline_clears_presence_and_watchers() {
        let hub = Hub::new();
        let user = Uuid::new_v4();
        let conversation = Uuid::new_v4();
        let (conn, _rx) = hub.register(user);
        hub.user_online(user, "alice");
        hub.watch_conversation(conversation, user);

        assert!(hub.user_offline(user, conn));
        assert!(!hub.is_online(user));
        assert!(hub.online_users().is_empty());
        assert!(hub.watchers_of(conversation).is_empty());
    }

    #[test]
    fn fan_out_skips_the_excluded_user() {
        let hub = Hub::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (_, mut a_rx) = hub.register(a);
        let (_, mut b_rx) = hub.register(b);

        let reached = hub.send_to_users(&[a, b], &ServerEvent::Pong, Some(a));
        assert_eq!(reached, vec![b]);
        assert!(recv_now(&mut a_rx).is_none());
        assert!(recv_now(&mut b_rx).is_some());
    }

    #[test]
    fn presence_update_reaches_connected_users() {
        let hub = Hub::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (_, _a_rx) = hub.register(a);
        let (_, mut b_rx) = hub.register(b);

        hub.user_online(a, "alice");
        let Some(ServerEvent::PresenceUpdate {
            user_id, online, ..
        }) = recv_now(&mut b_rx)
        else {
            panic!("expected presence update");
        };
        assert_eq!(user_id, a);
        assert!(online);
    }

    #[test]
    fn unwatch_is_scoped_to_one_conversation() {
        let hub = Hub::new();
        let user = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        hub.watch_conversation(c1, user);
        hub.watch_conversation(c2, user);

        hub.unwatch_conversation(c1, user);
        assert!(hub.watchers_of(c1).is_empty());
        assert_eq!(hub.watchers_of(c2), vec![user]);
    }
}
