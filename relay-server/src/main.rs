mod config;
mod ws_transport;

use crate::config::{AppConfig, RelayConfig, reload_config};
use crate::ws_transport::WsTransport;
use axum::Router;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::stream::StreamExt;
use protocol::Envelope;
use relay_core::{PeerId, RelayController, RelayControllerConfig, Transport, TransportEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EVENT_CHANNEL_BUFFER: usize = 256;
const UPSTREAM_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_CONFIG_PATH: &str = "RelayConfig.json";

#[derive(Clone)]
struct AppState {
    transport: Arc<WsTransport>,
    downstream_events: mpsc::Sender<TransportEvent>,
    config: Arc<AppConfig>,
    controller: Arc<RelayController>,
}

#[tokio::main]
/// Activates error tracing, loads the relay config, wires the transport and
/// the Relay Controller together, then serves the downstream websocket
/// route and the config-reload endpoint. The upstream agent connection is
/// dialed out in a background task that reconnects on its own.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=trace", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let app_config = Arc::new(AppConfig::default());
    let initial = reload_config(&app_config, &config_path).await;
    let config = match initial {
        Ok(config) => config,
        Err(message) => {
            tracing::warn!(message, path = %config_path, "no config file found, using defaults");
            *app_config.path.write().await = config_path.clone();
            RelayConfig::default()
        }
    };

    let transport = Arc::new(WsTransport::new());
    let (downstream_tx, downstream_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
    let (upstream_tx, upstream_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);

    let controller = RelayController::new(
        transport.clone() as Arc<dyn Transport>,
        RelayControllerConfig {
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            nr_version: config.nr_version.clone(),
            supported_versions: config.supported_versions.clone(),
        },
    );

    let mut terminated = controller.terminated();
    tokio::spawn(controller.clone().run(downstream_rx, upstream_rx));

    tokio::spawn(run_upstream_connection(
        config.upstream_url.clone(),
        transport.clone(),
        upstream_tx,
    ));

    let state = AppState {
        transport,
        downstream_events: downstream_tx,
        config: app_config,
        controller: controller.clone(),
    };

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/reload", get(reload_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap();

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(err) = result {
                tracing::error!(?err, "server exited with an error");
            }
        }
        _ = terminated.changed() => {
            tracing::info!("relay terminated via graceful shutdown protocol");
        }
    }
}

/// Re-reads the config file. Takes effect for hot-reloadable fields
/// (`bind_addr` aside, since the listener is already bound); the in-flight
/// [`RelayController`]'s own tunables are fixed at startup, the same
/// limitation the teacher's room config reload has for already-open rooms.
async fn reload_handler(State(state): State<AppState>) -> String {
    let path = state.config.path.read().await.clone();
    match reload_config(&state.config, &path).await {
        Ok(config) => format!(
            "Reloaded: upstream={} nr-version={}",
            config.upstream_url, config.nr_version
        ),
        Err(e) => format!("Config reload failed: {}", e),
    }
}

/// Operator-facing mirror of `nrc-endpoints/health-response`, reachable
/// outside the agent protocol.
async fn health_handler(State(state): State<AppState>) -> axum::Json<protocol::data::HealthResponseData> {
    axum::Json(state.controller.health_snapshot().await)
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_downstream_socket(socket, state))
}

/// Registers a new downstream peer, forwards its frames into the Relay
/// Controller's event stream, and cleans up on disconnect.
async fn handle_downstream_socket(socket: WebSocket, state: AppState) {
    let peer = PeerId::next();
    let (sink, mut stream) = socket.split();
    state
        .transport
        .register_downstream(peer, Arc::new(AsyncMutex::new(sink)))
        .await;

    if state
        .downstream_events
        .send(TransportEvent::Opened(peer))
        .await
        .is_err()
    {
        return;
    }

    while let Some(message) = stream.next().await {
        match message {
            Ok(AxumMessage::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => {
                    if state
                        .downstream_events
                        .send(TransportEvent::Frame(peer, envelope))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => tracing::warn!(%peer, ?err, "malformed downstream frame, ignoring"),
            },
            Ok(AxumMessage::Close(_)) => break,
            Ok(_) => {} // binary/ping/pong carry no protocol meaning here
            Err(err) => {
                tracing::warn!(%peer, ?err, "downstream socket error");
                break;
            }
        }
    }

    state.transport.remove_downstream(peer).await;
    let _ = state.downstream_events.send(TransportEvent::Closed(peer)).await;
}

/// Dials the upstream agent and keeps redialing on disconnect. Each
/// successful connection gets its own read loop; the whole task only ever
/// returns if the event channel itself closes (process shutdown).
async fn run_upstream_connection(
    url: String,
    transport: Arc<WsTransport>,
    events: mpsc::Sender<TransportEvent>,
) {
    loop {
        match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _response)) => {
                tracing::info!(%url, "connected to upstream agent");
                let (sink, mut read) = stream.split();
                transport.set_upstream(Arc::new(AsyncMutex::new(sink))).await;

                if events.send(TransportEvent::Opened(PeerId::UPSTREAM)).await.is_err() {
                    return;
                }

                while let Some(message) = read.next().await {
                    match message {
                        Ok(TungsteniteMessage::Text(text)) => {
                            match serde_json::from_str::<Envelope>(&text) {
                                Ok(envelope) => {
                                    if events
                                        .send(TransportEvent::Frame(PeerId::UPSTREAM, envelope))
                                        .await
                                        .is_err()
                                    {
                                        return;
                                    }
                                }
                                Err(err) => {
                                    tracing::warn!(?err, "malformed upstream frame, ignoring")
                                }
                            }
                        }
                        Ok(TungsteniteMessage::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(?err, "upstream socket error");
                            break;
                        }
                    }
                }

                transport.clear_upstream().await;
                if events.send(TransportEvent::Closed(PeerId::UPSTREAM)).await.is_err() {
                    return;
                }
                tracing::warn!("upstream connection lost, will retry");
            }
            Err(err) => {
                tracing::warn!(%url, ?err, "failed to connect to upstream agent, will retry");
            }
        }
        tokio::time::sleep(UPSTREAM_RECONNECT_DELAY).await;
    }
}
