//! Relay connection management
//!
//! Owns the WebSocket transport, the reconnection state machine, and the
//! periodic latency probe. Runs as a background task; the rest of the crate
//! talks to it through a cloneable [`ConnectionHandle`] and an event
//! receiver, so no transport detail leaks into the stores.
//!
//! State machine: Disconnected -> Connecting -> Connected;
//! Connected -> Reconnecting on transport failure;
//! Reconnecting -> Connected on success;
//! Reconnecting -> Disconnected after exceeding the attempt budget.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::clock::now_ms;
use crate::latency::LatencyTracker;
use crate::sync::WireEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Observable connection state
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub is_connecting: bool,
    /// Estimated one-way latency to the relay
    pub latency_ms: u64,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

/// Shared handle to the observable connection state
pub type SharedConnectionState = Arc<RwLock<ConnectionState>>;

/// Exponential backoff policy for reconnect attempts
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Ceiling for the exponential delay
    pub max_delay: Duration,
    /// Attempts before giving up and dropping to Disconnected
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempts + 1`: `base * 2^attempts`, capped.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 1u64 << attempts.min(20);
        let delay_ms = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}

/// Connection manager configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnect: ReconnectPolicy,
    /// Interval between latency probe pings
    pub probe_interval: Duration,
    /// Timeout for a single connect attempt
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            probe_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection-related errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,

    #[error("connection task closed")]
    TaskClosed,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Transport is up (initial connect or successful reconnect)
    Connected,
    /// Transport is down and no retry is pending (manual disconnect or
    /// exhausted attempts)
    Disconnected { error: Option<String> },
    /// Transport failed; a retry is scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// Inbound protocol event
    Inbound(WireEvent),
    /// Fresh latency estimate from the probe
    LatencyUpdated { latency_ms: u64 },
    /// Non-fatal error (e.g. send while offline)
    Error(String),
}

/// Commands sent to the connection task
#[derive(Debug)]
enum Command {
    Connect { url: String },
    Disconnect,
    Send { event: WireEvent },
    Shutdown,
}

/// Handle to communicate with the running connection task
#[derive(Clone)]
pub struct ConnectionHandle {
    command_tx: mpsc::UnboundedSender<Command>,
    state: SharedConnectionState,
}

impl ConnectionHandle {
    /// Connect to a relay URL (ws:// or wss://)
    pub fn connect(&self, url: &str) -> Result<(), ConnectionError> {
        self.command_tx
            .send(Command::Connect {
                url: url.to_string(),
            })
            .map_err(|_| ConnectionError::TaskClosed)
    }

    /// Disconnect, cancelling any pending reconnect attempt
    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        self.command_tx
            .send(Command::Disconnect)
            .map_err(|_| ConnectionError::TaskClosed)
    }

    /// Send a protocol event. No-op with a reported error when disconnected.
    pub fn send(&self, event: WireEvent) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.command_tx
            .send(Command::Send { event })
            .map_err(|_| ConnectionError::TaskClosed)
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Snapshot of the observable connection state
    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }
}

/// Manages the relay connection - runs in a background task
pub struct ConnectionManager {
    config: ConnectionConfig,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_config(ConnectionConfig::default())
    }

    pub fn with_config(config: ConnectionConfig) -> Self {
        Self { config }
    }

    /// Start the connection task and return a handle plus the event stream
    pub fn start(self) -> (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state: SharedConnectionState = Arc::new(RwLock::new(ConnectionState::default()));

        let handle = ConnectionHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        tokio::spawn(run(self.config, state, event_tx, command_rx));

        (handle, event_rx)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The connection event loop
async fn run(
    config: ConnectionConfig,
    state: SharedConnectionState,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut url: Option<String> = None;
    let mut ws_tx: Option<WsSink> = None;
    let mut ws_rx: Option<WsSource> = None;
    let mut latency = LatencyTracker::new();
    let mut reconnect_sleep: Option<Pin<Box<tokio::time::Sleep>>> = None;

    let mut probe = tokio::time::interval(config.probe_interval);
    probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(command) = command_rx.recv() => {
                match command {
                    Command::Connect { url: target } => {
                        // A fresh connect supersedes whatever we were doing
                        close_socket(&mut ws_tx, &mut ws_rx).await;
                        reconnect_sleep = None;
                        {
                            let mut s = state.write();
                            s.reconnect_attempts = 0;
                            s.last_error = None;
                        }
                        url = Some(target.clone());
                        attempt_connect(
                            &config, &target, &state, &event_tx,
                            &mut ws_tx, &mut ws_rx, &mut reconnect_sleep,
                        ).await;
                    }
                    Command::Disconnect => {
                        let was_active = ws_tx.is_some() || reconnect_sleep.is_some();
                        close_socket(&mut ws_tx, &mut ws_rx).await;
                        reconnect_sleep = None;
                        url = None;
                        latency.clear();
                        {
                            let mut s = state.write();
                            s.is_connected = false;
                            s.is_connecting = false;
                            s.reconnect_attempts = 0;
                        }
                        if was_active {
                            info!("Disconnected from relay");
                            let _ = event_tx.send(ConnectionEvent::Disconnected { error: None });
                        }
                    }
                    Command::Send { event } => {
                        let sent = match ws_tx.as_mut() {
                            Some(sink) => Some(send_event(sink, &event).await),
                            None => None,
                        };
                        match sent {
                            Some(Ok(())) => {}
                            Some(Err(e)) => {
                                warn!("Send failed: {}", e);
                                handle_transport_failure(
                                    &config, &state, &event_tx,
                                    &mut ws_tx, &mut ws_rx, &mut reconnect_sleep,
                                    e.to_string(),
                                ).await;
                            }
                            None => {
                                let message = format!(
                                    "cannot send {} while disconnected", event.name()
                                );
                                debug!("{}", message);
                                let _ = event_tx.send(ConnectionEvent::Error(message));
                            }
                        }
                    }
                    Command::Shutdown => {
                        close_socket(&mut ws_tx, &mut ws_rx).await;
                        info!("Connection task shutting down");
                        break;
                    }
                }
            }

            frame = next_frame(&mut ws_rx), if ws_rx.is_some() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WireEvent>(&text) {
                            Ok(WireEvent::Ping { sent_at_ms }) => {
                                // Answer the peer's probe directly
                                if let Some(sink) = ws_tx.as_mut() {
                                    let pong = WireEvent::Pong {
                                        ping_sent_at_ms: sent_at_ms,
                                        received_at_ms: now_ms(),
                                    };
                                    let _ = send_event(sink, &pong).await;
                                }
                            }
                            Ok(WireEvent::Pong { ping_sent_at_ms, .. }) => {
                                if latency.handle_pong(ping_sent_at_ms).is_some() {
                                    let latency_ms = latency.latency_ms();
                                    state.write().latency_ms = latency_ms;
                                    let _ = event_tx.send(
                                        ConnectionEvent::LatencyUpdated { latency_ms }
                                    );
                                }
                            }
                            Ok(event) => {
                                let _ = event_tx.send(ConnectionEvent::Inbound(event));
                            }
                            Err(e) => {
                                debug!("Ignoring malformed frame: {}", e);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        handle_transport_failure(
                            &config, &state, &event_tx,
                            &mut ws_tx, &mut ws_rx, &mut reconnect_sleep,
                            e.to_string(),
                        ).await;
                    }
                    None | Some(Ok(Message::Close(_))) => {
                        handle_transport_failure(
                            &config, &state, &event_tx,
                            &mut ws_tx, &mut ws_rx, &mut reconnect_sleep,
                            "connection closed by relay".to_string(),
                        ).await;
                    }
                    Some(Ok(_)) => {} // binary/ws-level ping handled by tungstenite
                }
            }

            _ = probe.tick(), if ws_tx.is_some() => {
                let marker = latency.create_ping();
                if let Some(sink) = ws_tx.as_mut() {
                    let ping = WireEvent::Ping { sent_at_ms: marker };
                    if let Err(e) = send_event(sink, &ping).await {
                        debug!("Probe send failed: {}", e);
                    }
                }
            }

            () = async { reconnect_sleep.as_mut().unwrap().as_mut().await },
                if reconnect_sleep.is_some() =>
            {
                reconnect_sleep = None;
                if let Some(target) = url.clone() {
                    attempt_connect(
                        &config, &target, &state, &event_tx,
                        &mut ws_tx, &mut ws_rx, &mut reconnect_sleep,
                    ).await;
                }
            }

            else => break,
        }
    }
}

/// Read the next frame from the socket, if one is open
async fn next_frame(
    ws_rx: &mut Option<WsSource>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match ws_rx.as_mut() {
        Some(stream) => stream.next().await,
        None => None,
    }
}

async fn send_event(
    sink: &mut WsSink,
    event: &WireEvent,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let json = serde_json::to_string(event).unwrap_or_default();
    sink.send(Message::Text(json)).await
}

async fn close_socket(ws_tx: &mut Option<WsSink>, ws_rx: &mut Option<WsSource>) {
    if let Some(mut sink) = ws_tx.take() {
        let _ = sink.close().await;
    }
    ws_rx.take();
}

/// One connect attempt. On success the socket is installed and the attempt
/// counter resets; on failure the next retry is scheduled per policy.
async fn attempt_connect(
    config: &ConnectionConfig,
    url: &str,
    state: &SharedConnectionState,
    event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    ws_tx: &mut Option<WsSink>,
    ws_rx: &mut Option<WsSource>,
    reconnect_sleep: &mut Option<Pin<Box<tokio::time::Sleep>>>,
) {
    state.write().is_connecting = true;
    debug!("Connecting to {}", url);

    let attempt = tokio::time::timeout(config.connect_timeout, connect_async(url)).await;

    match attempt {
        Ok(Ok((stream, _response))) => {
            let (sink, source) = stream.split();
            *ws_tx = Some(sink);
            *ws_rx = Some(source);
            {
                let mut s = state.write();
                s.is_connected = true;
                s.is_connecting = false;
                s.reconnect_attempts = 0;
                s.last_error = None;
            }
            info!("Connected to {}", url);
            let _ = event_tx.send(ConnectionEvent::Connected);
        }
        Ok(Err(e)) => {
            schedule_retry(config, state, event_tx, reconnect_sleep, e.to_string());
        }
        Err(_) => {
            schedule_retry(
                config,
                state,
                event_tx,
                reconnect_sleep,
                "connect attempt timed out".to_string(),
            );
        }
    }
}

/// Transport dropped while connected: tear down and enter Reconnecting
async fn handle_transport_failure(
    config: &ConnectionConfig,
    state: &SharedConnectionState,
    event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    ws_tx: &mut Option<WsSink>,
    ws_rx: &mut Option<WsSource>,
    reconnect_sleep: &mut Option<Pin<Box<tokio::time::Sleep>>>,
    reason: String,
) {
    warn!("Transport failure: {}", reason);
    close_socket(ws_tx, ws_rx).await;
    state.write().is_connected = false;
    schedule_retry(config, state, event_tx, reconnect_sleep, reason);
}

/// Record the failure and either schedule the next attempt or give up
fn schedule_retry(
    config: &ConnectionConfig,
    state: &SharedConnectionState,
    event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    reconnect_sleep: &mut Option<Pin<Box<tokio::time::Sleep>>>,
    reason: String,
) {
    let (attempt, gave_up) = {
        let mut s = state.write();
        s.is_connected = false;
        s.last_error = Some(reason.clone());
        let delay_index = s.reconnect_attempts;
        s.reconnect_attempts += 1;
        (delay_index, s.reconnect_attempts > config.reconnect.max_attempts)
    };

    if gave_up {
        state.write().is_connecting = false;
        warn!(
            "Giving up after {} reconnect attempts: {}",
            config.reconnect.max_attempts, reason
        );
        let _ = event_tx.send(ConnectionEvent::Disconnected {
            error: Some(reason),
        });
        return;
    }

    let delay = config.reconnect.delay_for(attempt);
    info!(
        "Reconnect attempt {} in {:?} ({})",
        attempt + 1,
        delay,
        reason
    );
    let _ = event_tx.send(ConnectionEvent::Reconnecting {
        attempt: attempt + 1,
        delay,
    });
    *reconnect_sleep = Some(Box::pin(tokio::time::sleep(delay)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(32_000).min(Duration::from_secs(30)));
        // Far past the cap, including shift widths that would overflow
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn test_state_defaults() {
        let state = ConnectionState::default();
        assert!(!state.is_connected);
        assert!(!state.is_connecting);
        assert_eq!(state.reconnect_attempts, 0);
        assert_eq!(state.last_error, None);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_reported() {
        let (handle, _events) = ConnectionManager::new().start();

        let result = handle.send(WireEvent::SessionLeave);
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
        assert!(!handle.is_connected());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_failed_attempts_increment_and_give_up() {
        let config = ConnectionConfig {
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                max_attempts: 2,
            },
            probe_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_millis(500),
        };
        let (handle, mut events) = ConnectionManager::with_config(config).start();

        // Nothing listens on this port
        handle.connect("ws://127.0.0.1:1").unwrap();

        let mut reconnecting_attempts = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event loop stalled")
                .expect("event channel closed");
            match event {
                ConnectionEvent::Reconnecting { attempt, .. } => {
                    reconnecting_attempts.push(attempt);
                }
                ConnectionEvent::Disconnected { error } => {
                    assert!(error.is_some());
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(reconnecting_attempts, vec![1, 2]);
        let state = handle.state();
        assert!(!state.is_connected);
        assert!(state.last_error.is_some());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connect_probe_and_inbound_events() {
        use tokio::net::TcpListener;
        use tokio_tungstenite::accept_async;

        // Minimal relay stand-in: answers probes, then pushes one event
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    if let Ok(WireEvent::Ping { sent_at_ms }) = serde_json::from_str(&text) {
                        let pong = WireEvent::Pong {
                            ping_sent_at_ms: sent_at_ms,
                            received_at_ms: now_ms(),
                        };
                        let json = serde_json::to_string(&pong).unwrap();
                        ws.send(Message::Text(json)).await.unwrap();

                        let update = WireEvent::SessionParticipants {
                            participant_count: 3,
                        };
                        let json = serde_json::to_string(&update).unwrap();
                        ws.send(Message::Text(json)).await.unwrap();
                    }
                }
            }
        });

        let config = ConnectionConfig {
            probe_interval: Duration::from_millis(50),
            ..ConnectionConfig::default()
        };
        let (handle, mut events) = ConnectionManager::with_config(config).start();
        handle.connect(&format!("ws://{}", addr)).unwrap();

        let mut connected = false;
        let mut latency_seen = false;
        let mut inbound_seen = false;
        while !(connected && latency_seen && inbound_seen) {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event loop stalled")
                .expect("event channel closed");
            match event {
                ConnectionEvent::Connected => connected = true,
                ConnectionEvent::LatencyUpdated { .. } => latency_seen = true,
                ConnectionEvent::Inbound(WireEvent::SessionParticipants {
                    participant_count,
                }) => {
                    assert_eq!(participant_count, 3);
                    inbound_seen = true;
                }
                _ => {}
            }
        }

        assert!(handle.is_connected());
        assert_eq!(handle.state().reconnect_attempts, 0);

        handle.disconnect().unwrap();
        handle.shutdown();
    }
}
