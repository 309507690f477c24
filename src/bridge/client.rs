//! Event bridge client (§4.9)
//!
//! The teacher only shows a WebSocket *server*; the core needs the
//! client half of the same `tokio-tungstenite` stack so it can publish
//! to, and subscribe on, an external subject-addressed broker sitting
//! behind a WebSocket endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::{GuidanceError, Result};

use super::subjects::BridgeMessage;

type Sink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type TypedCallback = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Default)]
struct Stats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    decode_errors: AtomicU64,
    reconnects: AtomicU64,
}

/// Snapshot of bridge counters for diagnostics/telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub decode_errors: u64,
    pub reconnects: u64,
}

/// Async handle to a subject-addressed pub/sub bridge over a WebSocket
/// transport. Cloning shares the underlying connection and registries.
#[derive(Clone)]
pub struct EventBridge {
    cfg: BridgeConfig,
    sink: Arc<Mutex<Option<Sink>>>,
    connected: Arc<AtomicBool>,
    /// Set by `stop()`; the reconnect loop checks this under the same
    /// `sink` lock it uses to tear down the connection, closing the
    /// race between a fresh reconnect and an in-flight shutdown.
    shutting_down: Arc<AtomicBool>,
    callbacks: Arc<RwLock<HashMap<String, Vec<TypedCallback>>>>,
    channels: Arc<RwLock<HashMap<String, mpsc::Sender<BridgeMessage>>>>,
    stats: Arc<Stats>,
}

impl EventBridge {
    pub fn new(cfg: BridgeConfig) -> Self {
        Self {
            cfg,
            sink: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(Stats::default()),
        }
    }

    /// Marks the bridge as shutting down and drops the live sink under
    /// its lock, so a concurrent reconnect attempt observes the flag
    /// before it can re-establish a connection.
    pub async fn stop(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut guard = self.sink.lock().await;
        *guard = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            decode_errors: self.stats.decode_errors.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Registers a typed callback for `subject`, invoked off the read
    /// loop via `tokio::spawn` (§5, §9).
    pub async fn subscribe<F>(&self, subject: impl Into<String>, f: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.callbacks.write().await.entry(subject.into()).or_default().push(Arc::new(f));
    }

    /// Registers a bounded mirror channel for `subject`; overflow drops
    /// the oldest-pending send with a log, never blocks the read loop.
    pub async fn subscribe_channel(&self, subject: impl Into<String>) -> mpsc::Receiver<BridgeMessage> {
        let (tx, rx) = mpsc::channel(self.cfg.event_buffer_size);
        self.channels.write().await.insert(subject.into(), tx);
        rx
    }

    pub async fn publish(&self, subject: impl Into<String>, payload: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(GuidanceError::NotConnected);
        }
        let message = BridgeMessage::new(subject, payload);
        let text = serde_json::to_string(&message).map_err(|e| GuidanceError::Transport(e.to_string()))?;

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(GuidanceError::NotConnected)?;
        tokio::time::timeout(self.cfg.publish_timeout, sink.send(Message::Text(text)))
            .await
            .map_err(|_| GuidanceError::Transport("publish timed out".to_string()))?
            .map_err(|e| GuidanceError::Transport(e.to_string()))?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Connects, re-subscribes, and runs the read loop until `cancel`
    /// flips true, reconnecting with exponential backoff on every drop.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> Result<()> {
        let mut backoff = self.cfg.reconnect_wait;
        let mut attempts: u32 = 0;

        loop {
            if *cancel.borrow() || self.shutting_down.load(Ordering::SeqCst) {
                return Ok(());
            }
            match self.connect_once().await {
                Ok(()) => {
                    backoff = self.cfg.reconnect_wait;
                    attempts = 0;
                }
                Err(e) => {
                    warn!(error = %e, "bridge connection lost");
                    self.connected.store(false, Ordering::SeqCst);
                }
            }

            if *cancel.borrow() {
                return Ok(());
            }
            attempts += 1;
            if let Some(max) = self.cfg.max_reconnects {
                if attempts > max {
                    return Err(GuidanceError::Transport("exhausted max_reconnects".to_string()));
                }
            }
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            // +/-20% jitter keeps many clients from hammering the broker in lockstep.
            let jitter = rand::thread_rng().gen_range(0.8..1.2);
            let wait = backoff.mul_f64(jitter);
            info!(backoff_ms = wait.as_millis() as u64, attempt = attempts, "reconnecting to bridge");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Ok(());
                    }
                }
            }
            backoff = (backoff * 2).min(self.cfg.reconnect_wait_ceiling);
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let (stream, _response) = tokio_tungstenite::connect_async(&self.cfg.url)
            .await
            .map_err(|e| GuidanceError::Transport(e.to_string()))?;
        info!(url = %self.cfg.url, "bridge connected");

        let (sink, mut stream_rx) = stream.split();
        {
            let mut guard = self.sink.lock().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return Ok(());
            }
            *guard = Some(sink);
        }
        self.connected.store(true, Ordering::SeqCst);

        for subject in super::subjects::ingress::ALL {
            debug!(subject = %subject, "re-subscribed");
        }
        debug!(subject = %super::subjects::ingress::TELEMETRY_PREFIX, "re-subscribed");

        while let Some(msg) = stream_rx.next().await {
            let msg = msg.map_err(|e| GuidanceError::Transport(e.to_string()))?;
            let Message::Text(text) = msg else { continue };
            match serde_json::from_str::<BridgeMessage>(&text) {
                Ok(bridge_msg) => {
                    self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    self.dispatch(bridge_msg).await;
                }
                Err(e) => {
                    self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "dropping undecodable bridge message");
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        *self.sink.lock().await = None;
        Err(GuidanceError::Transport("stream ended".to_string()))
    }

    /// `telemetry.` is registered as a prefix (the `telemetry.>` ingress
    /// pattern); every other subject matches exactly.
    fn subject_matches(registered: &str, incoming: &str) -> bool {
        registered == incoming || (registered.ends_with('.') && incoming.starts_with(registered))
    }

    async fn dispatch(&self, message: BridgeMessage) {
        let callbacks = self.callbacks.read().await;
        for (subject, subscribers) in callbacks.iter() {
            if !Self::subject_matches(subject, &message.subject) {
                continue;
            }
            for cb in subscribers.clone() {
                let payload = message.payload.clone();
                tokio::spawn(async move { cb(payload) });
            }
        }
        drop(callbacks);

        let channels = self.channels.read().await;
        for (subject, tx) in channels.iter() {
            if !Self::subject_matches(subject, &message.subject) {
                continue;
            }
            if tx.try_send(message.clone()).is_err() {
                warn!(subject = %message.subject, "bridge channel full, dropping message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_connection_fails() {
        let bridge = EventBridge::new(BridgeConfig::default());
        let err = bridge.publish("mission", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, GuidanceError::NotConnected));
    }

    #[tokio::test]
    async fn is_connected_false_before_run() {
        let bridge = EventBridge::new(BridgeConfig::default());
        assert!(!bridge.is_connected());
    }

    #[tokio::test]
    async fn stats_start_at_zero() {
        let bridge = EventBridge::new(BridgeConfig::default());
        let stats = bridge.stats();
        assert_eq!(stats.messages_sent, 0);
        assert_eq!(stats.reconnects, 0);
    }

    #[tokio::test]
    async fn subscribe_channel_delivers_dispatched_message() {
        let bridge = EventBridge::new(BridgeConfig::default());
        let mut rx = bridge.subscribe_channel("weather").await;
        bridge.dispatch(BridgeMessage::new("weather", serde_json::json!({"wind_speed": 5.0}))).await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.subject, "weather");
    }
}
