//! Outbound side of a gateway connection.
//!
//! Producers push onto two channels: priority (heartbeats, identify, resume,
//! close) and normal. A single writer task drains them, priority first, and
//! keeps text frames within the server's rolling-window message budget.

use crate::config::OutboundConfig;
use crate::error::{ConnectorError, Result};
use crate::types::GatewayPayload;
use futures_util::{Sink, SinkExt};
use log::{debug, error, info, trace};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Rolling-window budget for outbound text frames, with slots only
/// priority traffic may use.
#[derive(Debug)]
pub struct OutboundLimiter {
    limit: usize,
    reserved: usize,
    window: Duration,
    sent: VecDeque<Instant>,
}

impl OutboundLimiter {
    pub fn new(config: &OutboundConfig) -> Self {
        let limit = config.messages_per_window.max(1) as usize;
        Self {
            limit,
            reserved: (config.reserved_priority as usize).min(limit - 1),
            window: Duration::from_secs(config.window_secs),
            sent: VecDeque::with_capacity(limit),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.sent.front() {
            if now.duration_since(oldest) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Takes a slot, or returns how long until one frees up.
    pub fn try_acquire(&mut self, priority: bool, now: Instant) -> std::result::Result<(), Duration> {
        self.prune(now);
        let capacity = if priority {
            self.limit
        } else {
            self.limit - self.reserved
        };
        if self.sent.len() < capacity {
            self.sent.push_back(now);
            return Ok(());
        }
        // The slot that frees up first is the one that brings the count below capacity.
        let index = self.sent.len() - capacity;
        let wait = self
            .sent
            .get(index)
            .map(|&at| (at + self.window).saturating_duration_since(now))
            .unwrap_or(self.window);
        Err(wait.max(Duration::from_millis(1)))
    }

    pub fn in_window(&self) -> usize {
        self.sent.len()
    }
}

/// Cloneable producer handle for one connection's writer task.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    priority: mpsc::UnboundedSender<Message>,
    normal: mpsc::Sender<Message>,
}

impl OutboundSender {
    /// Creates the handle and the receivers to pass to [`spawn_writer`].
    pub fn channel(
        capacity: usize,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Message>,
        mpsc::Receiver<Message>,
    ) {
        let (priority, priority_rx) = mpsc::unbounded_channel();
        let (normal, normal_rx) = mpsc::channel(capacity.max(1));
        (Self { priority, normal }, priority_rx, normal_rx)
    }

    /// Serializes and queues `payload`; lifecycle op codes take the priority lane.
    pub async fn send(&self, payload: &GatewayPayload) -> Result<()> {
        let message = Message::Text(serde_json::to_string(payload)?);
        if payload.op.is_priority() {
            self.send_priority(message)
        } else {
            self.normal
                .send(message)
                .await
                .map_err(|e| ConnectorError::WebsocketError(format!("Failed to send message: {}", e)))
        }
    }

    pub fn send_priority(&self, message: Message) -> Result<()> {
        self.priority
            .send(message)
            .map_err(|e| ConnectorError::WebsocketError(format!("Failed to send message: {}", e)))
    }

    /// Queues a close frame ahead of any normal traffic.
    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        self.send_priority(Message::Close(Some(CloseFrame {
            code: WsCloseCode::from(code),
            reason: reason.to_string().into(),
        })))
    }

    pub fn is_closed(&self) -> bool {
        self.priority.is_closed()
    }
}

/// Spawns the writer task. It ends after writing a close frame, when every
/// sender is dropped, or when the sink fails.
pub fn spawn_writer<S>(
    mut sink: S,
    mut priority_rx: mpsc::UnboundedReceiver<Message>,
    mut normal_rx: mpsc::Receiver<Message>,
    mut limiter: OutboundLimiter,
    tag: String,
) -> JoinHandle<()>
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let (message, priority) = tokio::select! {
                biased;
                Some(message) = priority_rx.recv() => (message, true),
                Some(message) = normal_rx.recv() => (message, false),
                else => break,
            };

            if !priority {
                // Wait for a normal slot, letting priority frames through meanwhile.
                let mut stop = false;
                while let Err(wait) = limiter.try_acquire(false, Instant::now()) {
                    debug!("[{}] Outbound budget exhausted; waiting {:?}", tag, wait);
                    tokio::select! {
                        biased;
                        Some(urgent) = priority_rx.recv() => {
                            if !write(&mut sink, urgent, &mut limiter, true, &tag).await {
                                stop = true;
                                break;
                            }
                        }
                        _ = sleep(wait) => {}
                    }
                }
                if stop {
                    break;
                }
                if !write(&mut sink, message, &mut limiter, false, &tag).await {
                    break;
                }
            } else if !write(&mut sink, message, &mut limiter, true, &tag).await {
                break;
            }
        }
        let _ = sink.close().await;
        info!("[{}] Gateway writer task finished.", tag);
    })
}

/// Writes one frame. Returns `false` when the writer should stop.
async fn write<S>(
    sink: &mut S,
    message: Message,
    limiter: &mut OutboundLimiter,
    priority: bool,
    tag: &str,
) -> bool
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let is_close = matches!(message, Message::Close(_));
    if priority && matches!(message, Message::Text(_)) {
        while let Err(wait) = limiter.try_acquire(true, Instant::now()) {
            sleep(wait).await;
        }
    }
    // Payload text may contain the token; only the frame kind is logged.
    trace!("[{}] Sending {} frame", tag, frame_kind(&message));
    if let Err(e) = sink.send(message).await {
        error!("[{}] Gateway send error: {}. Stopping writer task.", tag, e);
        return false;
    }
    !is_close
}

fn frame_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "raw",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, reserved: u32) -> OutboundLimiter {
        OutboundLimiter::new(&OutboundConfig {
            messages_per_window: limit,
            window_secs: 60,
            reserved_priority: reserved,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_traffic_leaves_reserved_slots() {
        let mut limiter = limiter(120, 5);
        let now = Instant::now();
        for _ in 0..115 {
            assert!(limiter.try_acquire(false, now).is_ok());
        }
        assert!(limiter.try_acquire(false, now).is_err());
        for _ in 0..5 {
            assert!(limiter.try_acquire(true, now).is_ok());
        }
        let wait = limiter.try_acquire(true, now).unwrap_err();
        assert_eq!(wait, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rolls() {
        let mut limiter = limiter(2, 0);
        let start = Instant::now();
        limiter.try_acquire(false, start).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.try_acquire(false, Instant::now()).unwrap();

        let wait = limiter.try_acquire(false, Instant::now()).unwrap_err();
        assert_eq!(wait, Duration::from_secs(30));

        tokio::time::advance(wait).await;
        assert!(limiter.try_acquire(false, Instant::now()).is_ok());
        assert_eq!(limiter.in_window(), 2);
    }

    #[tokio::test]
    async fn test_lifecycle_ops_use_priority_lane() {
        let (sender, mut priority_rx, mut normal_rx) = OutboundSender::channel(4);
        sender.send(&GatewayPayload::heartbeat(None)).await.unwrap();
        sender
            .send(&GatewayPayload::presence_update(serde_json::json!({"status": "idle"})))
            .await
            .unwrap();
        sender.close(4900, "resume").unwrap();

        assert!(matches!(priority_rx.recv().await, Some(Message::Text(_))));
        assert!(matches!(priority_rx.recv().await, Some(Message::Close(Some(_)))));
        assert!(matches!(normal_rx.recv().await, Some(Message::Text(_))));
    }
}
