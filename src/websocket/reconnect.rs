//! Process-wide queue that serializes gateway connection attempts.
//!
//! Identifies are spaced by the identify delay across every session sharing
//! a coordinator; resumes do not consume that budget and go out as soon as
//! their turn comes.

use super::session::ConnectKind;
use crate::config::ReconnectConfig;
use crate::error::{ConnectorError, Result};
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

/// Opens the connection and sends the handshake; resolves once it was sent.
pub type ConnectAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Identifies one session in the queue; shard ids may repeat across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey(Uuid);

impl SessionKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

pub struct ReconnectTicket {
    session: SessionKey,
    shard_id: u32,
    kind: ConnectKind,
    /// When this session last identified, if ever.
    last_identify: Option<Instant>,
    action: ConnectAction,
}

impl ReconnectTicket {
    pub fn new<F>(
        session: SessionKey,
        shard_id: u32,
        kind: ConnectKind,
        last_identify: Option<Instant>,
        action: F,
    ) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        Self {
            session,
            shard_id,
            kind,
            last_identify,
            action: Box::new(action),
        }
    }

    pub fn session(&self) -> SessionKey {
        self.session
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn kind(&self) -> ConnectKind {
        self.kind
    }
}

impl fmt::Debug for ReconnectTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectTicket")
            .field("session", &self.session)
            .field("shard_id", &self.shard_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ReconnectTicket>,
    worker_running: bool,
    shutdown: bool,
    last_identify: Option<Instant>,
}

struct Inner {
    state: Mutex<QueueState>,
    identify_delay: Duration,
}

/// Shared handle; clone it into every session that should share the
/// identify budget.
#[derive(Clone)]
pub struct ReconnectCoordinator {
    inner: Arc<Inner>,
}

impl ReconnectCoordinator {
    pub fn new(identify_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                identify_delay,
            }),
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.identify_delay())
    }

    pub fn identify_delay(&self) -> Duration {
        self.inner.identify_delay
    }

    /// Appends `ticket`, replacing a pending ticket of the same session, and
    /// starts the worker if it is idle.
    pub fn enqueue(&self, ticket: ReconnectTicket) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(ConnectorError::Shutdown);
        }
        state.queue.retain(|queued| queued.session != ticket.session);
        debug!(
            "Queued {:?} for shard {} ({} pending)",
            ticket.kind,
            ticket.shard_id,
            state.queue.len() + 1
        );
        state.queue.push_back(ticket);
        if !state.worker_running {
            state.worker_running = true;
            let coordinator = self.clone();
            tokio::spawn(async move { coordinator.run_worker().await });
        }
        Ok(())
    }

    /// Drops the pending ticket of `session`. Returns whether one was queued.
    pub fn remove(&self, session: SessionKey) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.queue.len();
        state.queue.retain(|queued| queued.session != session);
        before != state.queue.len()
    }

    /// Rejects new tickets and drops pending ones.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        let dropped = state.queue.len();
        state.queue.clear();
        if dropped > 0 {
            info!("Reconnect queue shut down; dropped {} pending tickets", dropped);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    async fn run_worker(self) {
        loop {
            let (ticket, global_identify) = {
                let mut state = self.inner.state.lock();
                match state.queue.pop_front() {
                    Some(ticket) => (ticket, state.last_identify),
                    None => {
                        state.worker_running = false;
                        return;
                    }
                }
            };

            if ticket.kind == ConnectKind::Identify {
                let last = match (global_identify, ticket.last_identify) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
                if let Some(last) = last {
                    let ready_at = last + self.inner.identify_delay;
                    if ready_at > Instant::now() {
                        debug!(
                            "Shard {} waiting {:?} for identify budget",
                            ticket.shard_id,
                            ready_at - Instant::now()
                        );
                        sleep_until(ready_at).await;
                    }
                }
            }

            let shard_id = ticket.shard_id;
            let kind = ticket.kind;
            let result = (ticket.action)().await;
            if kind == ConnectKind::Identify {
                self.inner.state.lock().last_identify = Some(Instant::now());
            }
            match result {
                Ok(()) => debug!("Shard {} connect attempt ({:?}) sent", shard_id, kind),
                Err(e) => warn!("Shard {} connect attempt ({:?}) failed: {}", shard_id, kind, e),
            }
        }
    }
}
