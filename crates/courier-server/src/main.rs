use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use courier_api::auth::{self, AppState, AppStateInner};
use courier_api::middleware::{jwt_secret, require_auth, validate_token};
use courier_api::{conversations, keys, messages, p2p};
use courier_engine::{ConversationEngine, DeliveryQueue, P2pSessions};
use courier_hub::{Hub, HubServices, handle_connection_authenticated};

/// How often the background worker retries pending deliveries.
const DELIVERY_TICK: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret = jwt_secret();
    let db_path = std::env::var("COURIER_DB_PATH").unwrap_or_else(|_| "courier.db".into());
    let host = std::env::var("COURIER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("COURIER_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    let db = Arc::new(courier_db::Database::open(&PathBuf::from(&db_path))?);

    let services = HubServices {
        hub: Hub::new(),
        engine: ConversationEngine::new(db.clone()),
        delivery: DeliveryQueue::new(db.clone()),
        p2p: P2pSessions::new(db),
    };
    let app_state: AppState = Arc::new(AppStateInner {
        services: services.clone(),
        jwt_secret: jwt_secret.clone(),
    });

    spawn_delivery_worker(services.clone());

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/keys", post(keys::register_key))
        .route("/keys/mine", get(keys::get_own_keys))
        .route("/keys/{key_id}", delete(keys::revoke_key))
        .route("/users/{user_id}/keys", get(keys::get_user_keys))
        .route("/conversations", post(conversations::create_conversation))
        .route("/conversations", get(conversations::list_conversations))
        .route(
            "/conversations/{conversation_id}",
            get(conversations::get_conversation),
        )
        .route(
            "/conversations/{conversation_id}/participants",
            post(conversations::add_participant),
        )
        .route(
            "/conversations/{conversation_id}/participants/{user_id}",
            delete(conversations::remove_participant),
        )
        .route(
            "/conversations/{conversation_id}/keys",
            put(conversations::reissue_keys),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::post_message),
        )
        .route(
            "/conversations/{conversation_id}/read",
            post(messages::mark_read),
        )
        .route("/messages/{message_id}", put(messages::edit_message))
        .route("/messages/{message_id}", delete(messages::delete_message))
        .route(
            "/messages/{message_id}/reactions",
            post(messages::toggle_reaction),
        )
        .route("/read-all", post(messages::read_all))
        .route("/p2p/{session_id}", get(p2p::get_session))
        .route("/p2p/{session_id}/connected", post(p2p::confirm_connected))
        .route("/p2p/{session_id}/disconnect", post(p2p::disconnect_session))
        .route("/p2p/{session_id}/fail", post(p2p::fail_session))
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(app_state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Courier server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Deserialize)]
struct WsQuery {
    token: String,
}

/// Authenticate at the upgrade so a bad token never gets a socket.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let claims =
        validate_token(&query.token, &state.jwt_secret).ok_or(StatusCode::UNAUTHORIZED)?;

    let services = state.services.clone();
    Ok(ws.on_upgrade(move |socket| {
        handle_connection_authenticated(socket, services, claims.sub, claims.username)
    }))
}

/// Background loop: every tick, retry due offline deliveries against the
/// hub and expire entries past their TTL.
fn spawn_delivery_worker(services: HubServices) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(DELIVERY_TICK);
        loop {
            tick.tick().await;
            let services = services.clone();
            let result = tokio::task::spawn_blocking(move || {
                let now = chrono::Utc::now();
                let stats = services.delivery.retry_due_entries(now, &services.hub)?;
                let expired = services.delivery.expire_stale_entries(now)?;
                Ok::<_, courier_engine::EngineError>((stats, expired))
            })
            .await;

            match result {
                Ok(Ok((stats, expired))) => {
                    if stats.attempted > 0 || expired > 0 {
                        info!(
                            "Delivery tick: {} attempted, {} delivered, {} failed, {} expired",
                            stats.attempted, stats.delivered, stats.failed, expired
                        );
                    }
                }
                Ok(Err(e)) => warn!("Delivery tick failed: {}", e),
                Err(e) => warn!("Delivery worker task panicked: {}", e),
            }
        }
    });
}
