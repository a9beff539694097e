use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        WebSocketUpgrade,
    },
    handler::Handler,
    headers,
    http::Uri,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router, TypedHeader,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, time::timeout};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use synchost::{
    channel::WatchChannel,
    clock::SystemClock,
    config::Args,
    cors::CorsLayer,
    credentials::MemoryCredentialStore,
    events::ListenerEvent,
    player::HostPlayer,
    presence::PresenceTracker,
    CanonicalUpdate, Collaborators, ControllerStatus, Observation, SyncController, SyncError,
};

type ControllerHandle = Arc<Mutex<SyncController>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "synchost=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let loaded_config = Args::parse();

    info!("Starting synchost relay on {}", loaded_config.listen_addr);

    let clock = Arc::new(SystemClock);
    let player = HostPlayer::new(clock.clone());
    let _ticker = player.spawn_ticker(loaded_config.sync_config().tick_interval);
    let channel = Arc::new(WatchChannel::new());
    let presence = PresenceTracker::new();
    let credentials = Arc::new(MemoryCredentialStore::new(
        loaded_config.refresh_token.clone(),
        loaded_config.max_refresh_failures,
    ));

    let controller: ControllerHandle = Arc::new(Mutex::new(SyncController::new(
        loaded_config.sync_config(),
        Collaborators {
            player: player.clone(),
            channel: channel.clone(),
            credentials: credentials.clone(),
            presence: Arc::new(presence.clone()),
            clock,
        },
    )));

    let router_b = Router::new()
        .route("/ws", get(ws_handler))
        .route("/status", get(handle_status))
        .layer(Extension(channel.clone()))
        .layer(Extension(presence.clone()))
        .layer(Extension(controller.clone()));

    let app = Router::new()
        .route("/change_media", post(handle_change_media))
        .route("/seek", post(handle_seek))
        .route("/pause", post(handle_pause))
        .route("/unpause", post(handle_unpause))
        .route("/observe", post(handle_observe))
        .route("/session/start", post(handle_start))
        .route("/session/stop", post(handle_stop))
        .route("/session/credentials_expired", post(handle_credentials_expired))
        .route("/session/token", post(handle_token))
        .fallback(fallback.into_service())
        .layer(Extension(Arc::new(loaded_config.clone())))
        .layer(Extension(player))
        .layer(Extension(credentials))
        .layer(Extension(controller.clone()))
        .layer(CorsLayer::new(loaded_config.allowed_origins.clone()))
        .merge(router_b);

    let addr = SocketAddr::from_str(&loaded_config.listen_addr)
        .with_context(|| format!("invalid listen address {}", loaded_config.listen_addr))?;
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {}", err);
            }
        })
        .await
        .context("server error")?;

    // tell listeners the host is gone before exiting
    controller.lock().await.stop().await?;
    info!("synchost relay stopped");
    Ok(())
}

fn check_admin(headers: &HeaderMap, config: &Args) -> Result<(), StatusCode> {
    let auth_header = headers
        .get("Authorization")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if auth_header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)? == config.admin_pw {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

fn error_status(err: &SyncError) -> StatusCode {
    match err {
        SyncError::Handshake(_) => StatusCode::BAD_GATEWAY,
        SyncError::InvalidState(_) => StatusCode::CONFLICT,
        SyncError::Publish(_) | SyncError::Refresh(_) | SyncError::ChannelClosed(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Deserialize)]
struct ChangeMediaBody {
    track_identifier: String,
}

async fn handle_change_media(
    headers: HeaderMap,
    config: Extension<Arc<Args>>,
    player: Extension<Arc<HostPlayer>>,
    query: Json<ChangeMediaBody>,
) -> Result<StatusCode, StatusCode> {
    check_admin(&headers, &config)?;

    player.change_media(query.track_identifier.clone());

    Ok(StatusCode::OK)
}

async fn handle_pause(
    headers: HeaderMap,
    config: Extension<Arc<Args>>,
    player: Extension<Arc<HostPlayer>>,
) -> Result<StatusCode, StatusCode> {
    check_admin(&headers, &config)?;

    player.pause();

    Ok(StatusCode::OK)
}

async fn handle_unpause(
    headers: HeaderMap,
    config: Extension<Arc<Args>>,
    player: Extension<Arc<HostPlayer>>,
) -> Result<StatusCode, StatusCode> {
    check_admin(&headers, &config)?;

    player.unpause();

    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct SeekBody {
    new_ts_milliseconds: u64,
}

async fn handle_seek(
    headers: HeaderMap,
    config: Extension<Arc<Args>>,
    player: Extension<Arc<HostPlayer>>,
    query: Json<SeekBody>,
) -> Result<StatusCode, StatusCode> {
    check_admin(&headers, &config)?;

    player.seek(query.new_ts_milliseconds);

    Ok(StatusCode::OK)
}

async fn handle_observe(
    headers: HeaderMap,
    config: Extension<Arc<Args>>,
    player: Extension<Arc<HostPlayer>>,
    observation: Json<Observation>,
) -> Result<StatusCode, StatusCode> {
    check_admin(&headers, &config)?;

    player.ingest(observation.0);

    Ok(StatusCode::ACCEPTED)
}

#[derive(Serialize)]
struct StartResponse {
    device_id: String,
}

async fn handle_start(
    headers: HeaderMap,
    config: Extension<Arc<Args>>,
    controller: Extension<ControllerHandle>,
) -> Result<Json<StartResponse>, StatusCode> {
    check_admin(&headers, &config)?;

    let device_id = controller
        .lock()
        .await
        .start()
        .await
        .map_err(|err| error_status(&err))?;

    Ok(Json(StartResponse { device_id }))
}

async fn handle_stop(
    headers: HeaderMap,
    config: Extension<Arc<Args>>,
    controller: Extension<ControllerHandle>,
) -> Result<StatusCode, StatusCode> {
    check_admin(&headers, &config)?;

    controller
        .lock()
        .await
        .stop()
        .await
        .map_err(|err| error_status(&err))?;

    Ok(StatusCode::OK)
}

async fn handle_credentials_expired(
    headers: HeaderMap,
    config: Extension<Arc<Args>>,
    controller: Extension<ControllerHandle>,
) -> Result<StatusCode, StatusCode> {
    check_admin(&headers, &config)?;

    controller
        .lock()
        .await
        .credentials_expired()
        .map_err(|err| error_status(&err))?;

    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct TokenBody {
    refresh_token: String,
}

async fn handle_token(
    headers: HeaderMap,
    config: Extension<Arc<Args>>,
    credentials: Extension<Arc<MemoryCredentialStore>>,
    body: Json<TokenBody>,
) -> Result<StatusCode, StatusCode> {
    check_admin(&headers, &config)?;

    credentials.set_token(Some(body.refresh_token.clone()));

    Ok(StatusCode::OK)
}

#[derive(Serialize)]
struct StatusResponse {
    listeners: usize,
    #[serde(flatten)]
    controller: ControllerStatus,
}

async fn handle_status(controller: Extension<ControllerHandle>) -> Json<StatusResponse> {
    let controller = controller.lock().await;
    Json(StatusResponse {
        listeners: controller.listener_count(),
        controller: controller.status(),
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    channel: Extension<Arc<WatchChannel>>,
    presence: Extension<PresenceTracker>,
) -> impl IntoResponse {
    if let Some(TypedHeader(user_agent)) = user_agent {
        info!("`{}` connected", user_agent.as_str());
    }

    ws.on_upgrade(move |ws| handle_socket(ws, channel.0, presence.0))
}

async fn send_event(socket: &mut WebSocket, event: ListenerEvent) -> bool {
    let serialized = match serde_json::to_string(&event) {
        Ok(serialized) => serialized,
        Err(err) => {
            warn!("failed serializing listener event: {}", err);
            return true;
        }
    };

    if let Err(err) = socket.send(Message::Text(serialized)).await {
        info!("listener disconnected {}", err);
        return false;
    }
    true
}

async fn handle_socket(mut socket: WebSocket, channel: Arc<WatchChannel>, presence: PresenceTracker) {
    let _guard = presence.join();
    let mut sub = channel.subscribe();

    // the "ready" event
    let initial: CanonicalUpdate = sub.borrow_and_update().clone();
    if !send_event(&mut socket, ListenerEvent::Ready(initial)).await {
        return;
    }

    loop {
        // idle sockets get closed by proxies, so repeat the last update periodically
        let update = match timeout(Duration::from_secs(5), sub.changed()).await {
            Err(_) => channel.latest(),

            Ok(Err(err)) => {
                warn!("failed watching for latest update: {err}");
                return;
            }

            Ok(Ok(_)) => sub.borrow_and_update().clone(),
        };

        if !send_event(&mut socket, ListenerEvent::Update(update)).await {
            return;
        }
    }
}

async fn fallback(uri: Uri) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("No route for {}", uri))
}
