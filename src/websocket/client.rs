use super::close_code::NORMAL_CLOSE_CODE;
use super::codec::GatewayFrameCodec;
use super::heartbeat::{spawn_heartbeat, HeartbeatTracker};
use super::reconnect::{ReconnectCoordinator, ReconnectTicket, SessionKey};
use super::sender::{spawn_writer, OutboundLimiter, OutboundSender};
use super::session::{CloseDecision, ConnectKind, ConnectionStatus, GatewaySession, SessionAction};
use crate::auth::Token;
use crate::config::GatewayConfig;
use crate::error::{ConnectorError, Result};
use crate::rest::ratelimit::stopped;
use crate::types::{GatewayEvent, GatewayPayload};
use futures_util::stream::SplitStream;
use futures_util::{FutureExt, StreamExt};
use log::*;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

// Type alias for the WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Receives lifecycle events and dispatches, in the order they arrived.
pub type EventCallback = Arc<dyn Fn(GatewayEvent) + Send + Sync + 'static>;

/// State shared between the client handle and its manager task.
struct Shared {
    config: GatewayConfig,
    tag: String,
    /// This client's identity in the reconnect queue.
    key: SessionKey,
    session: Mutex<GatewaySession>,
    heartbeat: Arc<HeartbeatTracker>,
    // Sender of the live connection, if any
    sender: Mutex<Option<OutboundSender>>,
    shutdown_tx: watch::Sender<bool>,
    on_event: EventCallback,
}

impl Shared {
    fn emit(&self, event: GatewayEvent) {
        (self.on_event)(event);
    }
}

/// One live connection's halves.
struct Connection {
    reader: SplitStream<WsStream>,
    sender: OutboundSender,
    writer: JoinHandle<()>,
}

/// A gateway connection that keeps itself alive: it heartbeats, resumes or
/// re-identifies after disconnects, and waits its turn in a shared
/// [`ReconnectCoordinator`] before every attempt.
///
/// # Examples
///
/// ```no_run
/// use chat_connector_rs::config::ClientConfig;
/// use chat_connector_rs::websocket::{GatewayClient, ReconnectCoordinator};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let config = ClientConfig::from_env().expect("CHAT_TOKEN not set");
///     let coordinator = ReconnectCoordinator::from_config(&config.gateway.reconnect);
///     let client = GatewayClient::connect(
///         config.gateway.clone(),
///         config.token().expect("invalid token"),
///         coordinator,
///         Arc::new(|event| println!("{:?}", event)),
///     )
///     .await
///     .expect("Failed to start gateway");
///
///     tokio::signal::ctrl_c().await.ok();
///     client.shutdown().await;
/// }
/// ```
pub struct GatewayClient {
    shared: Arc<Shared>,
    coordinator: ReconnectCoordinator,
    // Flips to true once the manager task has exited
    finished: watch::Receiver<bool>,
}

impl GatewayClient {
    /// Starts the manager task and returns immediately. Connection progress
    /// is reported through `on_event`.
    pub async fn connect(
        config: GatewayConfig,
        token: Token,
        coordinator: ReconnectCoordinator,
        on_event: EventCallback,
    ) -> Result<Self> {
        // Reject a bad URL now rather than inside the manager loop.
        gateway_url(&config.url, &config)?;

        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            tag: config.shard_tag(),
            key: SessionKey::new(),
            session: Mutex::new(GatewaySession::new(token, &config)),
            heartbeat: Arc::new(HeartbeatTracker::new()),
            sender: Mutex::new(None),
            shutdown_tx,
            on_event,
            config,
        });

        let (finished_tx, finished) = watch::channel(false);
        let manager_shared = Arc::clone(&shared);
        let manager_coordinator = coordinator.clone();
        tokio::spawn(async move {
            let _finished = FinishedSignal {
                tx: finished_tx,
                tag: manager_shared.tag.clone(),
            };
            run_manager(manager_shared, manager_coordinator).await;
        });

        Ok(Self {
            shared,
            coordinator,
            finished,
        })
    }

    /// Queues a payload on the live connection.
    pub async fn send(&self, payload: &GatewayPayload) -> Result<()> {
        let sender = self.shared.sender.lock().clone();
        match sender {
            Some(sender) => sender.send(payload).await,
            None => Err(ConnectorError::WebsocketError("Not connected".to_string())),
        }
    }

    /// Sends a presence update and remembers it for future identifies.
    pub async fn update_presence(&self, presence: Value) -> Result<()> {
        self.shared.session.lock().set_presence(presence.clone());
        self.send(&GatewayPayload::presence_update(presence)).await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.session.lock().status()
    }

    /// Last measured heartbeat round trip.
    pub fn latency(&self) -> Option<Duration> {
        self.shared.heartbeat.latency()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.session.lock().session_id().map(str::to_string)
    }

    pub fn coordinator(&self) -> &ReconnectCoordinator {
        &self.coordinator
    }

    /// Cooperative shutdown: flags the session, leaves the reconnect queue,
    /// closes the socket with 1000 and waits for the manager to finish.
    pub async fn shutdown(&self) {
        info!("[{}] Shutting down gateway connection", self.shared.tag);
        self.shared.session.lock().request_shutdown();
        self.coordinator.remove(self.shared.key);
        self.shared.shutdown_tx.send_replace(true);
        self.closed().await;
    }

    /// Waits until the manager task exits, either after [`GatewayClient::shutdown`]
    /// or after a close that cannot be recovered from. Any number of callers
    /// may wait at once.
    pub async fn closed(&self) {
        let mut finished = self.finished.clone();
        // The flag is set before its sender goes away.
        let _ = finished.wait_for(|done| *done).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.finished.borrow()
    }
}

/// Signals manager exit on drop, so waiters wake even if the task panicked.
struct FinishedSignal {
    tx: watch::Sender<bool>,
    tag: String,
}

impl Drop for FinishedSignal {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("[{}] Manager task panicked", self.tag);
        }
        self.tx.send_replace(true);
    }
}

/// Appends the version, encoding and compression query parameters.
fn gateway_url(base: &str, config: &GatewayConfig) -> Result<Url> {
    let mut url = Url::parse(base)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("v", &config.api_version.to_string());
        query.append_pair("encoding", "json");
        if config.compress {
            query.append_pair("compress", "zlib-stream");
        }
    }
    Ok(url)
}

async fn run_manager(shared: Arc<Shared>, coordinator: ReconnectCoordinator) {
    let tag = shared.tag.clone();
    let reconnect = &shared.config.reconnect;
    let mut backoff = reconnect.initial_backoff();
    let mut codec = GatewayFrameCodec::new(shared.config.compress);
    let mut shutdown = shared.shutdown_tx.subscribe();
    let mut first_attempt = true;

    loop {
        let (kind, last_identify) = {
            let session = shared.session.lock();
            if session.is_shutdown() {
                break;
            }
            (session.next_connect_kind(), session.last_identify())
        };

        // The ticket's action hands us the turn and reports back once the
        // handshake is written, so the queue spaces handshakes, not sockets.
        let (turn_tx, turn_rx) = oneshot::channel::<oneshot::Sender<Result<()>>>();
        let ticket = ReconnectTicket::new(shared.key, shared.config.shard_id(), kind, last_identify, move || {
            async move {
                let (done_tx, done_rx) = oneshot::channel();
                if turn_tx.send(done_tx).is_err() {
                    return Err(ConnectorError::Shutdown);
                }
                done_rx.await.unwrap_or(Err(ConnectorError::Shutdown))
            }
            .boxed()
        });

        if let Err(e) = coordinator.enqueue(ticket) {
            error!("[{}] Reconnect queue rejected the session: {}", tag, e);
            let event = shared
                .session
                .lock()
                .on_fatal(&format!("Reconnect queue rejected the session: {}", e));
            shared.emit(event);
            break;
        }
        if !first_attempt {
            shared.session.lock().on_reconnect_scheduled();
        }
        info!("[{}] Queued {:?} attempt", tag, kind);

        let done_tx = tokio::select! {
            turn = turn_rx => match turn {
                Ok(done_tx) => done_tx,
                Err(_) => {
                    debug!("[{}] Connect ticket dropped before its turn", tag);
                    continue;
                }
            },
            _ = stopped(&mut shutdown) => break,
        };

        if !first_attempt {
            shared.session.lock().on_reconnect_attempt();
        }
        first_attempt = false;
        codec.reset();
        shared.heartbeat.reset();

        match open_connection(&shared).await {
            Ok(connection) => {
                let _ = done_tx.send(Ok(()));
                backoff = reconnect.initial_backoff();
                let decision = run_connection(&shared, connection, &mut codec, &mut shutdown).await;
                let reconnect_kind = decision.reconnect;
                for event in decision.events {
                    shared.emit(event);
                }
                match reconnect_kind {
                    Some(kind) => info!("[{}] Disconnected; reconnecting with {:?}", tag, kind),
                    None => break,
                }
            }
            Err(e) => {
                warn!(
                    "[{}] Connection attempt failed: {}. Retrying in {:?}",
                    tag, e, backoff
                );
                let _ = done_tx.send(Err(ConnectorError::WebsocketError(e.to_string())));
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = stopped(&mut shutdown) => break,
                }
                backoff = (backoff * 2).min(reconnect.max_backoff());
            }
        }
    }

    *shared.sender.lock() = None;
    let leftover = {
        let mut session = shared.session.lock();
        if session.status().is_terminal() {
            Vec::new()
        } else {
            session.on_close(None, "Client shutdown").events
        }
    };
    for event in leftover {
        shared.emit(event);
    }
    info!("[{}] Manager task finished.", tag);
}

/// Opens the socket, starts the writer and sends identify or resume.
async fn open_connection(shared: &Shared) -> Result<Connection> {
    let tag = &shared.tag;
    let base = {
        let session = shared.session.lock();
        match (session.next_connect_kind(), session.resume_gateway_url()) {
            (ConnectKind::Resume, Some(url)) => url.to_string(),
            _ => shared.config.url.clone(),
        }
    };
    let url = gateway_url(&base, &shared.config)?;

    info!("[{}] Connecting to gateway: {}", tag, url);
    let (ws_stream, response) = connect_async(url.as_str())
        .await
        .map_err(|e| ConnectorError::WebsocketError(format!("WebSocket connection failed: {}", e)))?;
    debug!("[{}] Gateway connected. Response: {:?}", tag, response.status());

    let (write, reader) = ws_stream.split();
    let (sender, priority_rx, normal_rx) = OutboundSender::channel(OUTBOUND_QUEUE_CAPACITY);
    let writer = spawn_writer(
        write,
        priority_rx,
        normal_rx,
        OutboundLimiter::new(&shared.config.outbound),
        tag.clone(),
    );

    let handshake = shared.session.lock().on_open(Instant::now())?;
    debug!("[{}] Sending {}", tag, handshake.op);
    sender.send(&handshake).await?;
    shared.session.lock().on_handshake_sent();
    *shared.sender.lock() = Some(sender.clone());

    Ok(Connection {
        reader,
        sender,
        writer,
    })
}

/// Reads one connection until it closes and returns the session's verdict.
async fn run_connection(
    shared: &Arc<Shared>,
    connection: Connection,
    codec: &mut GatewayFrameCodec,
    shutdown: &mut watch::Receiver<bool>,
) -> CloseDecision {
    let Connection {
        mut reader,
        sender,
        writer,
    } = connection;
    let tag = &shared.tag;
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<SessionAction>();
    let mut heartbeat: Option<JoinHandle<()>> = None;

    let (code, reason) = 'connection: loop {
        let message = tokio::select! {
            message = reader.next() => message,
            Some(action) = control_rx.recv() => {
                if let SessionAction::Close { code, reason } = action {
                    let _ = sender.close(code, &reason);
                    break (Some(code), reason);
                }
                continue;
            }
            _ = stopped(shutdown) => {
                let _ = sender.close(NORMAL_CLOSE_CODE, "Client shutdown");
                break (Some(NORMAL_CLOSE_CODE), "Client shutdown".to_string());
            }
        };

        let decoded = match message {
            Some(Ok(Message::Text(text))) => codec.decode_text(&text).map(Some),
            Some(Ok(Message::Binary(data))) => codec.decode_binary(&data),
            Some(Ok(Message::Ping(data))) => {
                let _ = sender.send_priority(Message::Pong(data));
                continue;
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                    None => (None, String::new()),
                };
                warn!("[{}] Gateway closed by server: {:?} {}", tag, code, reason);
                break (code, reason);
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!("[{}] Gateway read error: {}", tag, e);
                break (None, e.to_string());
            }
            None => {
                info!("[{}] Gateway stream ended.", tag);
                break (None, "Stream ended".to_string());
            }
        };

        let payload = match decoded {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(e) => {
                let action = shared.session.lock().on_decode_error(&e.to_string());
                if let SessionAction::Close { code, reason } = action {
                    let _ = sender.close(code, &reason);
                    break (Some(code), reason);
                }
                continue;
            }
        };

        let actions = shared.session.lock().on_payload(payload);
        for action in actions {
            match action {
                SessionAction::StartHeartbeat(interval) => {
                    if let Some(previous) = heartbeat.take() {
                        previous.abort();
                    }
                    let session_source = Arc::clone(shared);
                    heartbeat = Some(spawn_heartbeat(
                        interval,
                        Arc::clone(&shared.heartbeat),
                        sender.clone(),
                        control_tx.clone(),
                        move || session_source.session.lock().sequence(),
                        tag.clone(),
                    ));
                }
                SessionAction::SendHeartbeat => {
                    let sequence = shared.session.lock().sequence();
                    shared.heartbeat.on_sent(Instant::now());
                    if let Err(e) = sender.send(&GatewayPayload::heartbeat(sequence)).await {
                        warn!("[{}] Failed to send requested heartbeat: {}", tag, e);
                    }
                }
                SessionAction::HeartbeatAck => {
                    if let Some(latency) = shared.heartbeat.on_ack(Instant::now()) {
                        trace!("[{}] Heartbeat acknowledged in {:?}", tag, latency);
                    }
                }
                SessionAction::Emit(event) => shared.emit(event),
                SessionAction::Close { code, reason } => {
                    let _ = sender.close(code, &reason);
                    break 'connection (Some(code), reason);
                }
            }
        }
    };

    if let Some(handle) = heartbeat.take() {
        handle.abort();
    }
    *shared.sender.lock() = None;
    drop(sender);
    if timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        debug!("[{}] Writer did not finish within {:?}", tag, WRITER_FLUSH_TIMEOUT);
    }
    drop(reader);

    let decision = shared.session.lock().on_close(code, &reason);
    shared.heartbeat.reset();
    decision
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_url_query() {
        let config = GatewayConfig::default();
        let url = gateway_url("wss://gateway.example.com", &config).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://gateway.example.com/?v=10&encoding=json&compress=zlib-stream"
        );

        let plain = GatewayConfig {
            compress: false,
            ..GatewayConfig::default()
        };
        let url = gateway_url("wss://gateway.example.com", &plain).unwrap();
        assert_eq!(url.query(), Some("v=10&encoding=json"));
    }
}
