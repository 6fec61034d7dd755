//! Connection handlers for the Call Mirror gateway.
//!
//! This module handles the handshake, the connection lifecycle, and the
//! bridge between the event bus and local connections.

use crate::config::{BusBackend, BusConfig, Config};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use callmirror_bus::{EventBus, MemoryBus, RedisBus, RedisBusConfig, Subscription};
use callmirror_core::{
    bearer_token, AuthError, CallRouter, ConnectionHandle, Directory, Identity, InMemoryDirectory,
    NoopPresenceStore, PassthroughDirectory, PresenceStore, PresenceTracker, Registry,
    TokenVerifier,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use mirror_protocol::{codec, ClientEvent, Encoding, RawEvent, ServerEvent, Version, WireFrame, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Id stamped on everything this instance publishes.
    pub instance_id: String,
    /// Live connections on this instance.
    pub registry: Arc<Registry>,
    /// Local presence broadcaster.
    pub presence: PresenceTracker,
    /// Call event router.
    pub router: Arc<CallRouter>,
    /// Handshake token verifier.
    pub verifier: TokenVerifier,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(
        config: Config,
        bus: Arc<dyn EventBus>,
        directory: Arc<dyn Directory>,
        store: Arc<dyn PresenceStore>,
    ) -> Self {
        let instance_id = config.instance_id();
        let registry = Arc::new(Registry::new());
        let router = CallRouter::new(instance_id.clone(), Arc::clone(&registry), directory, bus)
            .with_topic(config.bus.topic.clone());
        let verifier =
            TokenVerifier::new(config.auth.jwt_secret.as_bytes()).with_leeway(config.auth.leeway_secs);

        Self {
            presence: PresenceTracker::new(Arc::clone(&registry), store),
            router: Arc::new(router),
            registry,
            verifier,
            instance_id,
            config,
        }
    }
}

/// Connect the configured event bus.
///
/// # Errors
///
/// Returns an error if the Redis backend is selected and cannot be reached.
pub async fn connect_bus(config: &BusConfig) -> Result<Arc<dyn EventBus>> {
    match config.backend {
        BusBackend::Local => Ok(Arc::new(MemoryBus::new())),
        BusBackend::Redis => {
            let (reconnect_min, reconnect_max) = config.reconnect_range();
            let bus = RedisBus::connect(RedisBusConfig {
                url: config.redis_url.clone(),
                reconnect_min,
                reconnect_max,
            })
            .await
            .context("Failed to connect to Redis event bus")?;
            Ok(Arc::new(bus))
        }
    }
}

/// Directory and presence store for the configured bus.
///
/// On a local bus this process is the whole fleet, so an in-memory directory
/// fed by local presence is authoritative: never-seen identities are
/// `not_found` and departed ones are `offline`. Across a shared bus no
/// single process knows that, and liveness is left to whichever instance
/// holds the target.
#[must_use]
pub fn collaborators(config: &BusConfig) -> (Arc<dyn Directory>, Arc<dyn PresenceStore>) {
    match config.backend {
        BusBackend::Local => {
            let directory = InMemoryDirectory::new();
            (Arc::new(directory.clone()), Arc::new(directory))
        }
        BusBackend::Redis => (Arc::new(PassthroughDirectory), Arc::new(NoopPresenceStore)),
    }
}

/// Connect the bus and wire the server state as the binary runs it.
///
/// # Errors
///
/// Returns an error if the bus cannot be connected.
pub async fn build_state(config: Config) -> Result<Arc<AppState>> {
    let bus = connect_bus(&config.bus).await?;
    let (directory, store) = collaborators(&config.bus);
    Ok(Arc::new(AppState::new(config, bus, directory, store)))
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the bus, the listener, or the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = build_state(config).await?;

    let subscription = state
        .router
        .bus()
        .subscribe(state.router.topic())
        .await
        .context("Failed to subscribe to event bus")?;
    spawn_bus_listener(Arc::clone(&state), subscription);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(instance = %state.instance_id, bus = state.router.bus().name(), "Call Mirror listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Deliver envelopes from the bus to local connections until the
/// subscription ends.
pub fn spawn_bus_listener(state: Arc<AppState>, mut subscription: Subscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = subscription.recv().await {
            let outcome = state.router.deliver_remote(envelope);
            metrics::record_remote(outcome);
        }
        warn!(topic = %subscription.topic(), "Event bus subscription ended");
    })
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let bus = state.router.bus();
    axum::Json(serde_json::json!({
        "status": if bus.is_healthy() { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "instance": state.instance_id,
        "connections": state.registry.connection_count(),
        "online": state.registry.len(),
        "bus": {
            "backend": bus.name(),
            "healthy": bus.is_healthy(),
        },
    }))
}

/// WebSocket upgrade handler.
///
/// The token is read from the configured query parameter, falling back to
/// an `Authorization: Bearer` header. Rejected handshakes are upgraded and
/// closed immediately, without a reason.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let ws = ws.max_message_size(state.config.transport.max_message_size);

    let token = params
        .get(&state.config.auth.token_query_param)
        .map(String::as_str)
        .filter(|token| !token.is_empty())
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(bearer_token)
        });

    let verified = match token {
        Some(token) => state.verifier.verify(token),
        None => Err(AuthError::Missing),
    };

    let identity = match verified {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "Rejected connection");
            metrics::record_auth_failure(&e);
            return ws.on_upgrade(close_silently);
        }
    };

    if let Err(e) = Version::negotiate(params.get("v").map(String::as_str)) {
        warn!(identity = %identity, error = %e, "Rejected incompatible protocol version");
        metrics::record_error("version");
        return ws.on_upgrade(close_silently);
    }

    let encoding = match params.get("encoding").map(|e| e.parse::<Encoding>()) {
        Some(Ok(encoding)) => encoding,
        Some(Err(e)) => {
            debug!(identity = %identity, error = %e, "Falling back to JSON frames");
            Encoding::Json
        }
        None => Encoding::Json,
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, state, identity, encoding))
}

async fn close_silently(mut socket: WebSocket) {
    let _ = socket.send(Message::Close(None)).await;
}

/// Handle an authenticated WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, identity: Identity, encoding: Encoding) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (handle, mut outbound) = ConnectionHandle::channel(identity);
    let connection_id = handle.id().clone();
    debug!(connection = %connection_id, identity = %handle.identity(), %encoding, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    state.presence.connect(handle.clone()).await;
    metrics::set_presence_online(state.registry.len());

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    let interval = Duration::from_millis(state.config.heartbeat.interval_ms);
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    // Message processing loop
    loop {
        tokio::select! {
            biased;

            // Events routed to this connection
            Some(event) = outbound.recv() => {
                if send_event(&mut sender, &event, encoding, &connection_id).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        match codec::decode_text(&text) {
                            Ok(Some(event)) => handle_event(&state, &handle, event, text.len()).await,
                            Ok(None) => debug!(connection = %connection_id, "Ignoring unknown event"),
                            Err(e) => {
                                debug!(connection = %connection_id, error = %e, "Dropping malformed frame");
                                metrics::record_error("decode");
                            }
                        }
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        // Try to decode frames
                        loop {
                            match codec::decode_from::<RawEvent>(&mut read_buffer) {
                                Ok(Some(raw)) => match raw.into_client_event() {
                                    Ok(Some(event)) => handle_event(&state, &handle, event, data.len()).await,
                                    Ok(None) => debug!(connection = %connection_id, "Ignoring unknown event"),
                                    Err(e) => {
                                        debug!(connection = %connection_id, error = %e, "Dropping malformed frame");
                                        metrics::record_error("decode");
                                    }
                                },
                                Ok(None) => break,
                                Err(e) => {
                                    debug!(connection = %connection_id, error = %e, "Discarding undecodable binary data");
                                    metrics::record_error("decode");
                                    read_buffer.clear();
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > timeout {
                    info!(connection = %connection_id, "Heartbeat timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Cleanup: later deliveries to this identity stop here
    state.presence.disconnect(&handle).await;
    metrics::set_presence_online(state.registry.len());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Route one inbound event. Awaited inline so a connection's events are
/// handled in arrival order.
async fn handle_event(state: &AppState, handle: &ConnectionHandle, event: ClientEvent, bytes: usize) {
    metrics::record_event(event.name(), bytes, "inbound");
    let outcome = state.router.dispatch(handle, event).await;
    metrics::record_dispatch(&outcome);
}

/// Send an event to the WebSocket.
///
/// Events that cannot be encoded are dropped; only a socket failure is an
/// error.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
    encoding: Encoding,
    connection_id: &callmirror_core::ConnectionId,
) -> Result<()> {
    let frame = match codec::encode(event, encoding) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection = %connection_id, event = event.name(), error = %e, "Dropping unencodable event");
            metrics::record_error("encode");
            return Ok(());
        }
    };

    metrics::record_event(event.name(), frame.len(), "outbound");
    let message = match frame {
        WireFrame::Text(text) => Message::Text(text),
        WireFrame::Binary(data) => Message::Binary(data.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}
