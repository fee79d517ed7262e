use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_engine::{ConversationEngine, DeliveryQueue, P2pSessions};
use courier_types::events::{ClientFrame, ServerEvent};

use crate::hub::Hub;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Everything a live connection needs. Cheap to clone; the REST layer
/// shares the same set.
#[derive(Clone)]
pub struct HubServices {
    pub hub: Hub,
    pub engine: ConversationEngine,
    pub delivery: DeliveryQueue,
    pub p2p: P2pSessions,
}

/// Handle a pre-authenticated WebSocket connection. The JWT was already
/// validated at the HTTP upgrade layer, so the first frame is the
/// connection acknowledgement and the event loop starts immediately.
pub async fn handle_connection_authenticated(
    socket: WebSocket,
    services: HubServices,
    user_id: Uuid,
    username: String,
) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected", username, user_id);

    let established = ServerEvent::ConnectionEstablished {
        user_id,
        username: username.clone(),
    };
    if send_event(&mut sender, &established).await.is_err() {
        return;
    }

    let (conn_id, mut user_rx) = services.hub.register(user_id);

    // Presence snapshot before going online, so this client sees who is
    // already here without racing its own broadcast.
    for (uid, uname) in services.hub.online_users() {
        let event = ServerEvent::PresenceUpdate {
            user_id: uid,
            username: uname,
            online: true,
        };
        if send_event(&mut sender, &event).await.is_err() {
            return;
        }
    }
    services.hub.user_online(user_id, &username);

    // Drain the offline backlog into the freshly registered channel.
    {
        let services = services.clone();
        let flushed = task::spawn_blocking(move || {
            services.delivery.flush_for_recipient(user_id, &services.hub)
        })
        .await;
        match flushed {
            Ok(Ok(n)) if n > 0 => debug!("Flushed {} queued message(s) to {}", n, user_id),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Backlog flush for {} failed: {}", user_id, e),
            Err(e) => warn!("Backlog flush task for {} panicked: {}", user_id, e),
        }
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward targeted events -> client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = user_rx.recv() => {
                    let Some(event) = result else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read frames from the client.
    let recv_services = services.clone();
    let recv_username = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => {
                        handle_frame(&recv_services, user_id, &recv_username, frame).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad frame: {} -- raw: {}",
                            recv_username,
                            user_id,
                            e,
                            clip(&text, 200)
                        );
                        // Only the device that sent the frame hears about it.
                        recv_services
                            .hub
                            .send_to_connection(user_id, conn_id, &reject_frame(&text));
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Wind down open direct sessions so peers stop signaling at a ghost.
    {
        let services = services.clone();
        let closed = task::spawn_blocking(move || services.p2p.disconnect_all_for_user(user_id))
            .await;
        match closed {
            Ok(Ok(sessions)) => {
                for (session_id, peer) in sessions {
                    services.hub.send_to_user(
                        peer,
                        &ServerEvent::P2pIce {
                            from_user_id: user_id,
                            session_id,
                            payload: serde_json::json!({ "disconnected": true }),
                        },
                    );
                }
            }
            Ok(Err(e)) => warn!("Session teardown for {} failed: {}", user_id, e),
            Err(e) => warn!("Session teardown task for {} panicked: {}", user_id, e),
        }
    }

    services.hub.user_offline(user_id, conn_id);
    info!("{} ({}) disconnected", username, user_id);
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_default();
    sender.send(Message::Text(text.into())).await
}

/// Truncate a log sample without slicing through a multibyte character —
/// inbound frames are attacker-controlled and a mid-char slice panics.
fn clip(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Build the error frame for an unparseable inbound message: name the
/// unknown type when the JSON at least had one.
fn reject_frame(raw: &str) -> ServerEvent {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => match value.get("type").and_then(|t| t.as_str()) {
            Some(kind) => ServerEvent::unknown_type(kind),
            None => ServerEvent::Error {
                message: "Frame has no type field".to_string(),
            },
        },
        Err(_) => ServerEvent::Error {
            message: "Frame is not valid JSON".to_string(),
        },
    }
}

async fn handle_frame(services: &HubServices, user_id: Uuid, username: &str, frame: ClientFrame) {
    match frame {
        ClientFrame::Ping => {
            services.hub.send_to_user(user_id, &ServerEvent::Pong);
        }

        ClientFrame::JoinConversation { conversation_id } => {
            // Membership gates the watcher set; typing indicators must
            // never leak to non-members.
            let engine = services.engine.clone();
            let allowed = task::spawn_blocking(move || {
                engine.get_conversation(conversation_id, user_id).is_ok()
            })
            .await
            .unwrap_or(false);

            if allowed {
                services.hub.watch_conversation(conversation_id, user_id);
            } else {
                services.hub.send_to_user(
                    user_id,
                    &ServerEvent::Error {
                        message: "Not a participant of that conversation".to_string(),
                    },
                );
            }
        }

        ClientFrame::LeaveConversation { conversation_id } => {
            services.hub.unwatch_conversation(conversation_id, user_id);
        }

        ClientFrame::TypingStart { conversation_id } => {
            let watchers = services.hub.watchers_of(conversation_id);
            services.hub.send_to_users(
                &watchers,
                &ServerEvent::TypingStart {
                    conversation_id,
                    user_id,
                    username: username.to_string(),
                },
                Some(user_id),
            );
        }

        ClientFrame::TypingStop { conversation_id } => {
            let watchers = services.hub.watchers_of(conversation_id);
            services.hub.send_to_users(
                &watchers,
                &ServerEvent::TypingStop {
                    conversation_id,
                    user_id,
                },
                Some(user_id),
            );
        }

        ClientFrame::MessageRead {
            conversation_id,
            message_id,
        } => {
            let engine = services.engine.clone();
            let result = task::spawn_blocking(move || {
                let read_at = engine.mark_read(conversation_id, user_id, message_id)?;
                let view = engine.get_conversation(conversation_id, user_id)?;
                Ok::<_, courier_engine::EngineError>((read_at, view))
            })
            .await;

            match result {
                Ok(Ok((read_at, view))) => {
                    let recipients: Vec<Uuid> = view
                        .participants
                        .iter()
                        .filter_map(|p| p.user_id.parse().ok())
                        .collect();
                    services.hub.send_to_users(
                        &recipients,
                        &ServerEvent::MessageRead {
                            conversation_id,
                            user_id,
                            up_to_message_id: message_id,
                            read_at,
                        },
                        Some(user_id),
                    );
                }
                Ok(Err(e)) => {
                    services.hub.send_to_user(
                        user_id,
                        &ServerEvent::Error {
                            message: e.to_string(),
                        },
                    );
                }
                Err(e) => warn!("mark_read task panicked: {}", e),
            }
        }

        ClientFrame::P2pOffer {
            target_user_id,
            session_id,
            payload,
        } => {
            let p2p = services.p2p.clone();
            let recorded =
                task::spawn_blocking(move || p2p.initiate(session_id, user_id, target_user_id))
                    .await;
            match recorded {
                Ok(Ok(())) => {
                    debug!("{} -> p2p offer to {} [session {}]", user_id, target_user_id, session_id);
                    services.hub.send_to_user(
                        target_user_id,
                        &ServerEvent::P2pOffer {
                            from_user_id: user_id,
                            session_id,
                            payload,
                        },
                    );
                }
                Ok(Err(e)) => {
                    services.hub.send_to_user(
                        user_id,
                        &ServerEvent::Error {
                            message: e.to_string(),
                        },
                    );
                }
                Err(e) => warn!("p2p initiate task panicked: {}", e),
            }
        }

        ClientFrame::P2pAnswer {
            target_user_id,
            session_id,
            payload,
        } => {
            let p2p = services.p2p.clone();
            let recorded =
                task::spawn_blocking(move || p2p.answer(session_id, user_id)).await;
            match recorded {
                Ok(Ok(())) => {
                    services.hub.send_to_user(
                        target_user_id,
                        &ServerEvent::P2pAnswer {
                            from_user_id: user_id,
                            session_id,
                            payload,
                        },
                    );
                }
                Ok(Err(e)) => {
                    services.hub.send_to_user(
                        user_id,
                        &ServerEvent::Error {
                            message: e.to_string(),
                        },
                    );
                }
                Err(e) => warn!("p2p answer task panicked: {}", e),
            }
        }

        // ICE trickles freely once a session exists; no state change.
        ClientFrame::P2pIce {
            target_user_id,
            session_id,
            payload,
        } => {
            services.hub.send_to_user(
                target_user_id,
                &ServerEvent::P2pIce {
                    from_user_id: user_id,
                    session_id,
                    payload,
                },
            );
        }

        // Opaque relay fallback: encrypted blob straight through.
        ClientFrame::P2pMessage {
            target_user_id,
            message,
        } => {
            let delivered = services.hub.send_to_user(
                target_user_id,
                &ServerEvent::P2pMessage {
                    from_user_id: user_id,
                    message,
                },
            );
            if !delivered {
                services.hub.send_to_user(
                    user_id,
                    &ServerEvent::Error {
                        message: "Peer is offline".to_string(),
                    },
                );
            }
        }
    }
}
