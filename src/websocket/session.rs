//! Gateway session lifecycle.
//!
//! [`GatewaySession`] holds everything that survives a reconnect (session id,
//! last sequence, resume URL) and decides what to do with each inbound
//! payload and each socket close. It performs no I/O: every decision comes
//! back as [`SessionAction`]s or a [`CloseDecision`] for the connection driver
//! to carry out, which keeps the transitions testable without a socket.

use super::close_code::{CloseCode, NORMAL_CLOSE_CODE, RESUME_CLOSE_CODE};
use crate::auth::Token;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::types::{
    ConnectionProperties, GatewayEvent, GatewayPayload, HelloPayload, IdentifyPayload, OpCode,
    ReadyPayload, ResumePayload,
};
use log::{debug, info, trace, warn};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Identifying,
    Resuming,
    AwaitingConfirmation,
    LoadingSubsystems,
    Connected,
    Disconnected,
    WaitingToReconnect,
    AttemptingToReconnect,
    ShuttingDown,
    Shutdown,
    FailedToLogin,
}

impl ConnectionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Shutdown | Self::FailedToLogin)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How the next connection authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectKind {
    Identify,
    Resume,
}

/// Work the driver must carry out for an inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    StartHeartbeat(Duration),
    /// The server asked for a heartbeat right now.
    SendHeartbeat,
    HeartbeatAck,
    Emit(GatewayEvent),
    /// Close the socket with this code; the close is then fed to
    /// [`GatewaySession::on_close`].
    Close { code: u16, reason: String },
}

/// What follows a closed socket.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseDecision {
    pub events: Vec<GatewayEvent>,
    /// `None` when the session is finished and must not be queued again.
    pub reconnect: Option<ConnectKind>,
}

pub struct GatewaySession {
    token: Token,
    identify: IdentifyTemplate,
    session_id: Option<String>,
    sequence: Option<u64>,
    resume_url: Option<String>,
    status: ConnectionStatus,
    reconnect_attempts: u32,
    seen_ready: bool,
    shutdown: bool,
    last_identify: Option<Instant>,
}

/// Identify fields that do not change between connections.
struct IdentifyTemplate {
    properties: ConnectionProperties,
    large_threshold: u32,
    shard: Option<[u32; 2]>,
    presence: Option<Value>,
    intents: u64,
}

impl GatewaySession {
    pub fn new(token: Token, config: &GatewayConfig) -> Self {
        Self {
            token,
            identify: IdentifyTemplate {
                properties: ConnectionProperties {
                    os: config.properties.os.clone(),
                    browser: config.properties.browser.clone(),
                    device: config.properties.device.clone(),
                },
                large_threshold: config.large_threshold,
                shard: config.shard,
                presence: config.presence.clone(),
                intents: config.intents,
            },
            session_id: None,
            sequence: None,
            resume_url: None,
            status: ConnectionStatus::Connecting,
            reconnect_attempts: 0,
            seen_ready: false,
            shutdown: false,
            last_identify: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn resume_gateway_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_identify(&self) -> Option<Instant> {
        self.last_identify
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn next_connect_kind(&self) -> ConnectKind {
        if self.session_id.is_some() {
            ConnectKind::Resume
        } else {
            ConnectKind::Identify
        }
    }

    /// Presence sent with future identifies.
    pub fn set_presence(&mut self, presence: Value) {
        self.identify.presence = Some(presence);
    }

    /// The socket is open: build the identify or resume handshake.
    pub fn on_open(&mut self, now: Instant) -> Result<GatewayPayload> {
        match &self.session_id {
            Some(session_id) => {
                self.status = ConnectionStatus::Resuming;
                GatewayPayload::resume(&ResumePayload {
                    token: self.token.secret().to_string(),
                    session_id: session_id.clone(),
                    seq: self.sequence,
                })
                .map_err(Into::into)
            }
            None => {
                self.status = ConnectionStatus::Identifying;
                self.sequence = None;
                self.last_identify = Some(now);
                GatewayPayload::identify(&IdentifyPayload {
                    token: self.token.secret().to_string(),
                    properties: self.identify.properties.clone(),
                    // Transport compression is negotiated in the URL instead.
                    compress: false,
                    large_threshold: self.identify.large_threshold,
                    shard: self.identify.shard,
                    presence: self.identify.presence.clone(),
                    intents: self.identify.intents,
                })
                .map_err(Into::into)
            }
        }
    }

    pub fn on_handshake_sent(&mut self) {
        self.status = ConnectionStatus::AwaitingConfirmation;
    }

    pub fn on_payload(&mut self, payload: GatewayPayload) -> Vec<SessionAction> {
        match payload.op {
            OpCode::Dispatch => self.on_dispatch(payload),
            OpCode::Heartbeat => vec![SessionAction::SendHeartbeat],
            OpCode::HeartbeatAck => vec![SessionAction::HeartbeatAck],
            OpCode::Hello => match serde_json::from_value::<HelloPayload>(payload.d) {
                Ok(hello) => vec![SessionAction::StartHeartbeat(hello.interval())],
                Err(e) => vec![resume_close(format!("Malformed hello: {}", e))],
            },
            OpCode::Reconnect => {
                info!("Server requested a reconnect");
                vec![resume_close("Server requested reconnect".to_string())]
            }
            OpCode::InvalidSession => {
                if payload.d.as_bool().unwrap_or(false) {
                    info!("Session invalidated; it can be resumed");
                    vec![resume_close("Resumable session invalidated".to_string())]
                } else {
                    warn!("Session invalidated; a fresh identify is required");
                    self.invalidate();
                    vec![
                        SessionAction::Emit(GatewayEvent::SessionInvalidated),
                        SessionAction::Close {
                            code: NORMAL_CLOSE_CODE,
                            reason: "Session invalidated".to_string(),
                        },
                    ]
                }
            }
            other => {
                debug!("Ignoring unexpected inbound op {}", other);
                Vec::new()
            }
        }
    }

    fn on_dispatch(&mut self, payload: GatewayPayload) -> Vec<SessionAction> {
        if let Some(seq) = payload.s {
            if let Some(last) = self.sequence {
                if seq <= last {
                    trace!("Dropping duplicate dispatch {} (last {})", seq, last);
                    return Vec::new();
                }
            }
            self.sequence = Some(seq);
        }

        let event_type = payload.t.unwrap_or_default();
        let mut actions = Vec::with_capacity(2);
        match event_type.as_str() {
            "READY" => {
                let ready = match serde_json::from_value::<ReadyPayload>(payload.d.clone()) {
                    Ok(ready) => ready,
                    Err(e) => return vec![resume_close(format!("Malformed READY: {}", e))],
                };
                self.status = ConnectionStatus::LoadingSubsystems;
                self.session_id = Some(ready.session_id.clone());
                self.resume_url = ready.resume_gateway_url;
                self.reconnect_attempts = 0;
                self.status = ConnectionStatus::Connected;
                let event = if self.seen_ready {
                    GatewayEvent::Reconnected {
                        session_id: ready.session_id,
                    }
                } else {
                    GatewayEvent::Ready {
                        session_id: ready.session_id,
                    }
                };
                self.seen_ready = true;
                actions.push(SessionAction::Emit(event));
            }
            "RESUMED" => {
                self.status = ConnectionStatus::Connected;
                self.reconnect_attempts = 0;
                actions.push(SessionAction::Emit(GatewayEvent::Resumed));
            }
            _ => {}
        }

        actions.push(SessionAction::Emit(GatewayEvent::Dispatch {
            event_type,
            sequence: payload.s,
            data: payload.d,
        }));
        actions
    }

    /// A frame could not be decoded; the connection is torn down and resumed.
    pub fn on_decode_error(&mut self, error: &str) -> SessionAction {
        warn!("Gateway decode error: {}", error);
        resume_close(format!("Decode error: {}", error))
    }

    /// Classifies a closed socket. `code` is `None` when the connection
    /// dropped without a close frame.
    pub fn on_close(&mut self, code: Option<u16>, reason: &str) -> CloseDecision {
        let close = CloseCode::from_u16(code.unwrap_or(1006));

        if self.shutdown {
            self.status = ConnectionStatus::Shutdown;
            return CloseDecision {
                events: vec![GatewayEvent::Shutdown {
                    code,
                    reason: reason.to_string(),
                }],
                reconnect: None,
            };
        }

        if !close.should_reconnect() {
            self.status = if close.is_authentication_failure() {
                ConnectionStatus::FailedToLogin
            } else {
                ConnectionStatus::Shutdown
            };
            warn!("Gateway closed with {}; not reconnecting", close);
            return CloseDecision {
                events: vec![GatewayEvent::Shutdown {
                    code,
                    reason: reason.to_string(),
                }],
                reconnect: None,
            };
        }

        self.status = ConnectionStatus::Disconnected;
        let mut events = vec![GatewayEvent::Disconnected {
            code,
            reason: reason.to_string(),
        }];
        if close.invalidates_session() && self.session_id.is_some() {
            info!("Close {} invalidated the session; next connection will identify", close);
            self.invalidate();
            events.push(GatewayEvent::SessionInvalidated);
        }
        CloseDecision {
            events,
            reconnect: Some(self.next_connect_kind()),
        }
    }

    /// The driver queued the next connection attempt.
    pub fn on_reconnect_scheduled(&mut self) {
        self.status = ConnectionStatus::WaitingToReconnect;
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
    }

    /// The queue granted this session its turn.
    pub fn on_reconnect_attempt(&mut self) {
        self.status = ConnectionStatus::AttemptingToReconnect;
    }

    /// Unrecoverable local failure, such as the reconnect queue refusing the session.
    pub fn on_fatal(&mut self, reason: &str) -> GatewayEvent {
        self.status = ConnectionStatus::Shutdown;
        GatewayEvent::Shutdown {
            code: None,
            reason: reason.to_string(),
        }
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown = true;
        if !self.status.is_terminal() {
            self.status = ConnectionStatus::ShuttingDown;
        }
    }

    fn invalidate(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_url = None;
    }
}

impl fmt::Debug for GatewaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewaySession")
            .field("session_id", &self.session_id)
            .field("sequence", &self.sequence)
            .field("status", &self.status)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .finish()
    }
}

fn resume_close(reason: String) -> SessionAction {
    SessionAction::Close {
        code: RESUME_CLOSE_CODE,
        reason,
    }
}
