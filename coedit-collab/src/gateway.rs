//! WebSocket session gateway.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── RoomRegistry ── Room (per-room lock)
//!             ├── SessionGateway ── CollabEngine
//! Client B ──┘   (one task/socket)   └── SessionHub ── bounded queue per session
//!                      ▲                                   │
//!                      └───────────── outbound ◄───────────┘
//! ```
//!
//! Each connection is one site. Text frames carry JSON, binary frames carry
//! bincode; replies follow the encoding of the last frame the client sent.
//! A connection whose queue overflowed gets fresh snapshots once it has
//! written out its backlog.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::direct;
use crate::config::ServerConfig;
use crate::engine::{CollabEngine, Session};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage, WireFormat};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// Gateway statistics.
#[derive(Debug, Clone, Default)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
    pub active_rooms: usize,
}

/// The WebSocket front of the engine.
pub struct SessionGateway {
    config: ServerConfig,
    engine: Arc<CollabEngine>,
    stats: Arc<RwLock<GatewayStats>>,
}

impl SessionGateway {
    pub fn new(config: ServerConfig) -> Self {
        let engine = Arc::new(CollabEngine::new(&config));
        Self {
            config,
            engine,
            stats: Arc::new(RwLock::new(GatewayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Session gateway listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let reaper = self.spawn_reaper();
        let result = self.accept_loop(listener).await;
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let stats = self.stats.clone();
            let heartbeat = self.config.heartbeat_interval();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine, stats, heartbeat).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Periodically evict idle rooms, when a TTL is configured.
    fn spawn_reaper(&self) -> Option<JoinHandle<()>> {
        let ttl = self.config.room_idle_ttl?;
        let period = self.config.reap_interval.max(Duration::from_millis(10));
        let engine = self.engine.clone();

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let evicted = engine.evict_idle(ttl).await;
                if !evicted.is_empty() {
                    log::info!("Evicted {} idle rooms", evicted.len());
                }
            }
        }))
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<CollabEngine>,
        stats: Arc<RwLock<GatewayStats>>,
        heartbeat: Option<Duration>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (mut session, mut outbound) = engine.open_session().await;
        let mut heartbeat = heartbeat.map(|period| tokio::time::interval_at(Instant::now() + period, period));

        let result = Self::pump(
            &mut ws_sender,
            &mut ws_receiver,
            &engine,
            &stats,
            &mut session,
            &mut outbound,
            &mut heartbeat,
            addr,
        )
        .await;

        // Whatever ended the loop, the session leaves its rooms.
        log::info!("Session {} ({addr}) leaving {} rooms", session.id(), session.room_count());
        engine.disconnect(session).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump(
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        engine: &CollabEngine,
        stats: &RwLock<GatewayStats>,
        session: &mut Session,
        outbound: &mut mpsc::Receiver<Arc<ServerMessage>>,
        heartbeat: &mut Option<Interval>,
        addr: SocketAddr,
    ) -> Result<(), BoxError> {
        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            Self::on_frame(engine, stats, session, text.as_bytes(), WireFormat::Json).await;
                        }

                        Some(Ok(Message::Binary(data))) => {
                            Self::on_frame(engine, stats, session, &data[..], WireFormat::Bincode).await;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                // Outgoing notification
                msg = outbound.recv() => {
                    match msg {
                        Some(message) => {
                            ws_sender.send(frame(&message, session.format())?).await?;
                            // Caught up with the backlog: replace what was dropped.
                            if outbound.is_empty() && engine.hub().is_lagged(session.id()).await {
                                engine.resync(session).await;
                            }
                        }
                        None => return Err(ProtocolError::ConnectionClosed.into()),
                    }
                }

                _ = tick(heartbeat) => {
                    ws_sender.send(Message::Ping(Default::default())).await?;
                }
            }
        }
    }

    async fn on_frame(
        engine: &CollabEngine,
        stats: &RwLock<GatewayStats>,
        session: &mut Session,
        bytes: &[u8],
        format: WireFormat,
    ) {
        {
            let mut s = stats.write().await;
            s.total_messages += 1;
            s.total_bytes += bytes.len() as u64;
        }
        session.set_format(format);

        let envelopes = match ClientMessage::decode(bytes, format) {
            Ok(message) => {
                if message.validate().is_err() {
                    stats.write().await.rejected_messages += 1;
                }
                engine.handle(session, message).await
            }
            Err(e) => {
                log::warn!("Failed to decode message from session {}: {e}", session.id());
                stats.write().await.rejected_messages += 1;
                vec![direct(session.id(), ServerMessage::error(e.to_string()))]
            }
        };
        engine.dispatch(envelopes).await;
    }

    /// Get gateway statistics.
    pub async fn stats(&self) -> GatewayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.engine.registry().room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn engine(&self) -> &Arc<CollabEngine> {
        &self.engine
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Encode a notification as a WebSocket frame in the session's format.
fn frame(message: &ServerMessage, format: WireFormat) -> Result<Message, ProtocolError> {
    let bytes = message.encode(format)?;
    match format {
        WireFormat::Json => String::from_utf8(bytes)
            .map(|text| Message::Text(text.into()))
            .map_err(|e| ProtocolError::SerializationError(e.to_string())),
        WireFormat::Bincode => Ok(Message::Binary(bytes.into())),
    }
}
