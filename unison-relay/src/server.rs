//! WebSocket accept loop and per-client event routing
//!
//! Each client gets a reader loop and a writer task joined by an unbounded
//! channel, so fan-out never blocks on a slow socket. Host-originated
//! playback/playlist events are forwarded to the rest of the session;
//! anything a listener tries to originate is dropped here.

use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use unison_core::clock::now_ms;
use unison_core::{Role, WireEvent};

use crate::metrics::Metrics;
use crate::rooms::{ClientTx, Registry};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Run the relay server on the given address
pub async fn run(addr: &str, metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!("Relay listening on {}", addr);
    run_on(listener, metrics).await
}

/// Run the relay server on an already-bound listener
pub async fn run_on(
    listener: TcpListener,
    metrics: Arc<RwLock<Metrics>>,
) -> Result<(), Box<dyn Error>> {
    let registry = Arc::new(RwLock::new(Registry::new()));

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        debug!("Client {} connecting from {}", client_id, peer_addr);

        let registry = Arc::clone(&registry);
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            metrics.write().client_connected();
            if let Err(e) = handle_client(stream, client_id, &registry, &metrics).await {
                debug!("Client {} ended: {}", client_id, e);
            }
            disconnect_client(client_id, &registry, &metrics);
        });
    }
}

/// Serve one client until its socket closes
async fn handle_client(
    stream: TcpStream,
    client_id: u64,
    registry: &Arc<RwLock<Registry>>,
    metrics: &Arc<RwLock<Metrics>>,
) -> Result<(), Box<dyn Error>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Writer task: drains the client's outbound queue
    let (tx, mut rx) = mpsc::unbounded_channel::<WireEvent>();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode event: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        let frame = frame?;
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let event: WireEvent = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(e) => {
                debug!("Client {} sent malformed frame: {}", client_id, e);
                continue;
            }
        };

        handle_event(client_id, event, &tx, registry, metrics);
    }

    writer.abort();
    Ok(())
}

/// Route one inbound event
fn handle_event(
    client_id: u64,
    event: WireEvent,
    tx: &ClientTx,
    registry: &Arc<RwLock<Registry>>,
    metrics: &Arc<RwLock<Metrics>>,
) {
    match event {
        WireEvent::SessionCreate => {
            let session_id = registry.write().create(client_id, tx.clone());
            {
                let mut m = metrics.write();
                m.session_created();
                m.active_sessions = registry.read().session_count();
            }
            let _ = tx.send(WireEvent::SessionJoined {
                session_id,
                role: Role::Host,
                participant_count: 1,
            });
        }

        WireEvent::SessionJoin { session_id } => {
            let joined = registry.write().join(&session_id, client_id, tx.clone());
            match joined {
                Some((role, participant_count, others)) => {
                    let _ = tx.send(WireEvent::SessionJoined {
                        session_id,
                        role,
                        participant_count,
                    });
                    for other in others {
                        let _ = other.send(WireEvent::SessionParticipants { participant_count });
                    }
                }
                None => {
                    let _ = tx.send(WireEvent::Error {
                        message: format!("session {} not found", session_id),
                    });
                }
            }
        }

        WireEvent::SessionLeave => {
            leave_session(client_id, registry);
            metrics.write().active_sessions = registry.read().session_count();
        }

        WireEvent::Ping { sent_at_ms } => {
            let _ = tx.send(WireEvent::Pong {
                ping_sent_at_ms: sent_at_ms,
                received_at_ms: now_ms(),
            });
        }

        event if event.requires_host() => {
            let targets = registry.read().host_fanout(client_id);
            match targets {
                Some(targets) => {
                    metrics.write().events_forwarded += targets.len() as u64;
                    for target in targets {
                        let _ = target.send(event.clone());
                    }
                }
                None => {
                    debug!(
                        "Dropping {} from client {} (not session host)",
                        event.name(),
                        client_id
                    );
                }
            }
        }

        // Pong replies and relay-originated events need no routing
        _ => {}
    }
}

/// Remove a client from its session and notify the remaining participants
fn leave_session(client_id: u64, registry: &Arc<RwLock<Registry>>) {
    let outcome = registry.write().leave(client_id);
    if let Some(outcome) = outcome {
        if outcome.was_host {
            info!(
                "Host left session {}; slot vacant until rejoin",
                outcome.session_id
            );
        }
        for tx in &outcome.remaining {
            let _ = tx.send(WireEvent::SessionParticipants {
                participant_count: outcome.participant_count,
            });
        }
    }
}

/// Socket closed: session cleanup plus connection accounting
fn disconnect_client(
    client_id: u64,
    registry: &Arc<RwLock<Registry>>,
    metrics: &Arc<RwLock<Metrics>>,
) {
    leave_session(client_id, registry);
    let mut m = metrics.write();
    m.client_disconnected();
    m.active_sessions = registry.read().session_count();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use unison_core::session::{Session, SessionConfig, SessionEvent};
    use unison_core::storage::MemoryPreferences;
    use unison_core::{Role, Track};

    async fn start_relay() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics = Arc::new(RwLock::new(Metrics::new()));
        tokio::spawn(async move {
            let _ = run_on(listener, metrics).await;
        });
        format!("ws://{}", addr)
    }

    async fn wait_connected(session: &Session) {
        for _ in 0..100 {
            if session.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("session never connected");
    }

    async fn wait_joined(events: &mut UnboundedReceiver<SessionEvent>) -> (String, Role) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("join confirmation stalled")
                .expect("event channel closed");
            if let SessionEvent::Joined { session_id, role } = event {
                return (session_id, role);
            }
        }
    }

    #[tokio::test]
    async fn test_host_playback_reaches_listener() {
        let url = start_relay().await;

        let (host, mut host_events) =
            Session::new(Arc::new(MemoryPreferences::new()), SessionConfig::default());
        host.connect(&url).unwrap();
        wait_connected(&host).await;
        host.create_session().unwrap();
        let (session_id, role) = wait_joined(&mut host_events).await;
        assert_eq!(role, Role::Host);

        let (listener, mut listener_events) =
            Session::new(Arc::new(MemoryPreferences::new()), SessionConfig::default());
        listener.connect(&url).unwrap();
        wait_connected(&listener).await;
        listener.join_session(&session_id).unwrap();
        let (joined_id, role) = wait_joined(&mut listener_events).await;
        assert_eq!(joined_id, session_id);
        assert_eq!(role, Role::Listener);

        // Host drives: queue a track, select it, start playback
        host.add_track(Track {
            id: "t1".to_string(),
            url: "https://cdn.example/one.mp3".to_string(),
            title: Some("One".to_string()),
            artist: None,
            duration_seconds: Some(180.0),
            added_at_ms: 0,
        })
        .unwrap();
        host.select_track(0).unwrap();
        host.play().unwrap();

        // Listener replica converges on the host's state
        let mut synced = false;
        for _ in 0..100 {
            let state = listener.playback_state();
            if state.is_playing && state.track_id == "t1" && listener.playlist().len() == 1 {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(synced, "listener never converged on host playback");

        // Listener-originated commands must not reach the host
        listener.pause().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(host.playback_state().is_playing);
    }

    #[tokio::test]
    async fn test_participant_count_updates_on_join_and_leave() {
        let url = start_relay().await;

        let (host, mut host_events) =
            Session::new(Arc::new(MemoryPreferences::new()), SessionConfig::default());
        host.connect(&url).unwrap();
        wait_connected(&host).await;
        host.create_session().unwrap();
        let (session_id, _) = wait_joined(&mut host_events).await;

        let (listener, mut listener_events) =
            Session::new(Arc::new(MemoryPreferences::new()), SessionConfig::default());
        listener.connect(&url).unwrap();
        wait_connected(&listener).await;
        listener.join_session(&session_id).unwrap();
        wait_joined(&mut listener_events).await;

        // Host hears the count go to 2
        let mut saw_two = false;
        for _ in 0..100 {
            match tokio::time::timeout(Duration::from_millis(100), host_events.recv()).await {
                Ok(Some(SessionEvent::ParticipantCountChanged(2))) => {
                    saw_two = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => continue,
            }
        }
        assert!(saw_two, "host never saw participant count reach 2");

        // Listener leaves; host hears the count drop back to 1
        listener.leave_session().unwrap();
        let mut saw_one = false;
        for _ in 0..100 {
            match tokio::time::timeout(Duration::from_millis(100), host_events.recv()).await {
                Ok(Some(SessionEvent::ParticipantCountChanged(1))) => {
                    saw_one = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => continue,
            }
        }
        assert!(saw_one, "host never saw the listener leave");
    }

    #[tokio::test]
    async fn test_join_unknown_session_reports_error() {
        let url = start_relay().await;

        let (client, mut events) =
            Session::new(Arc::new(MemoryPreferences::new()), SessionConfig::default());
        client.connect(&url).unwrap();
        wait_connected(&client).await;
        client.join_session("ABCDEFGH").unwrap();

        let mut saw_error = false;
        for _ in 0..100 {
            match tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
                Ok(Some(SessionEvent::Error(message))) => {
                    assert!(message.contains("not found"));
                    saw_error = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => continue,
            }
        }
        assert!(saw_error, "relay never reported the unknown session");
    }
}
