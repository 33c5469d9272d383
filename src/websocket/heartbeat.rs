//! Keepalive for one gateway connection.

use super::close_code::RESUME_CLOSE_CODE;
use super::sender::OutboundSender;
use super::session::SessionAction;
use crate::types::GatewayPayload;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug, Default)]
struct TrackerState {
    last_sent: Option<Instant>,
    awaiting_ack: bool,
    latency: Option<Duration>,
}

/// Send and ack bookkeeping shared by the heartbeat task and the reader.
#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    state: Mutex<TrackerState>,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_sent(&self, now: Instant) {
        let mut state = self.state.lock();
        state.last_sent = Some(now);
        state.awaiting_ack = true;
    }

    /// Records an ack and returns the measured round trip.
    pub fn on_ack(&self, now: Instant) -> Option<Duration> {
        let mut state = self.state.lock();
        state.awaiting_ack = false;
        let latency = state.last_sent.map(|sent| now.saturating_duration_since(sent))?;
        state.latency = Some(latency);
        Some(latency)
    }

    /// Last measured round trip; `None` until the first ack.
    pub fn latency(&self) -> Option<Duration> {
        self.state.lock().latency
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.state.lock().awaiting_ack
    }

    /// Forgets the in-flight heartbeat when its connection is replaced.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.last_sent = None;
        state.awaiting_ack = false;
    }
}

/// Spawns the heartbeat timer for one connection.
///
/// The first beat goes out one interval after hello. If a tick finds the
/// previous beat still unacknowledged the connection is a zombie: the task
/// asks the reader to close it with the resume code and exits.
pub fn spawn_heartbeat<F>(
    interval: Duration,
    tracker: Arc<HeartbeatTracker>,
    sender: OutboundSender,
    control: mpsc::UnboundedSender<SessionAction>,
    sequence: F,
    tag: String,
) -> JoinHandle<()>
where
    F: Fn() -> Option<u64> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("[{}] Heartbeating every {:?}", tag, interval);

        loop {
            ticker.tick().await;

            if tracker.is_awaiting_ack() {
                warn!("[{}] Heartbeat ack not received; closing zombie connection", tag);
                let _ = control.send(SessionAction::Close {
                    code: RESUME_CLOSE_CODE,
                    reason: "Heartbeat ack not received".to_string(),
                });
                break;
            }

            tracker.on_sent(Instant::now());
            if let Err(e) = sender.send(&GatewayPayload::heartbeat(sequence())).await {
                debug!("[{}] Heartbeat task stopping: {}", tag, e);
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OpCode;
    use tokio_tungstenite::tungstenite::Message;

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_send_to_ack() {
        let tracker = HeartbeatTracker::new();
        assert_eq!(tracker.latency(), None);

        let sent = Instant::now();
        tracker.on_sent(sent);
        assert!(tracker.is_awaiting_ack());

        tokio::time::advance(Duration::from_millis(120)).await;
        let latency = tracker.on_ack(Instant::now());
        assert_eq!(latency, Some(Duration::from_millis(120)));
        assert_eq!(tracker.latency(), Some(Duration::from_millis(120)));
        assert!(!tracker.is_awaiting_ack());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_closes_with_resume_code() {
        let tracker = Arc::new(HeartbeatTracker::new());
        let (sender, mut priority_rx, _normal_rx) = OutboundSender::channel(8);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        let handle = spawn_heartbeat(
            Duration::from_secs(1),
            Arc::clone(&tracker),
            sender,
            control_tx,
            || Some(42),
            "test".to_string(),
        );

        // First beat carries the sequence.
        let first = priority_rx.recv().await.expect("heartbeat sent");
        let Message::Text(text) = first else {
            panic!("heartbeat should be a text frame");
        };
        let payload: GatewayPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(payload.op, OpCode::Heartbeat);
        assert_eq!(payload.d, serde_json::json!(42));

        // No ack arrives before the next tick.
        let action = control_rx.recv().await.expect("zombie close requested");
        assert!(matches!(action, SessionAction::Close { code: RESUME_CLOSE_CODE, .. }));
        handle.await.unwrap();
    }
}
