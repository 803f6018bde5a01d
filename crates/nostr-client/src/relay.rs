//! Single relay connection management
//!
//! One logical connection to the configured relay: a background task owns the
//! WebSocket, pushes matching events onto a channel, resolves publish
//! acknowledgments, and reconnects with exponential backoff.

use crate::error::{ClientError, Result};
use futures::{SinkExt, StreamExt};
use nostr::Event;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Initial reconnection delay
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// How long to wait for the relay `OK` after publishing
    pub publish_timeout: Duration,
    /// Inbound event channel capacity
    pub event_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            publish_timeout: Duration::from_secs(10),
            event_buffer: 256,
        }
    }
}

/// The single subscription this connection maintains.
///
/// `since` is read each time the subscription is (re-)established, so the
/// owner can advance it to the last handled event time and survive redelivery
/// gaps across reconnects.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub kinds: Vec<u16>,
    /// `#p` tag filter values
    pub pubkeys: Vec<String>,
    pub since: Arc<AtomicU64>,
}

impl SubscriptionSpec {
    fn filter(&self) -> Value {
        json!({
            "kinds": self.kinds,
            "#p": self.pubkeys,
            "since": self.since.load(Ordering::Acquire),
        })
    }
}

/// Relay message received from the relay
#[derive(Debug, Clone)]
enum RelayMessage {
    /// EVENT message: ["EVENT", subscription_id, event]
    Event(String, Event),
    /// OK message: ["OK", event_id, success, message]
    Ok(String, bool, String),
    /// EOSE message: ["EOSE", subscription_id]
    Eose(String),
    /// NOTICE message: ["NOTICE", message]
    Notice(String),
}

enum Command {
    Publish {
        event: Event,
        ack: oneshot::Sender<Result<()>>,
    },
}

const SUBSCRIPTION_ID: &str = "nwc-requests";

/// Relay connection handle
pub struct RelayClient {
    url: Url,
    config: RelayConfig,
    state: Arc<RwLock<ConnectionState>>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: Mutex<Option<mpsc::Receiver<Command>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayClient {
    /// Create a new relay client (does not connect yet)
    pub fn new(url: &str, config: RelayConfig) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            url,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            shutdown_tx,
        })
    }

    /// Get current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Start the connection task and return the inbound event stream.
    ///
    /// Panics if called twice.
    pub async fn start(&self, spec: SubscriptionSpec) -> mpsc::Receiver<Event> {
        let cmd_rx = self
            .cmd_rx
            .lock()
            .await
            .take()
            .expect("relay client already started");
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer);

        let url = self.url.clone();
        let config = self.config.clone();
        let state = self.state.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(run(url, config, spec, state, cmd_rx, events_tx, shutdown_rx));

        events_rx
    }

    /// Publish a signed event and await the relay acknowledgment.
    ///
    /// Fails fast with [`ClientError::NotConnected`] while the connection is
    /// down; a negative ack surfaces as [`ClientError::PublishRejected`].
    pub async fn publish(&self, event: &Event) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish {
                event: event.clone(),
                ack: tx,
            })
            .await
            .map_err(|_| ClientError::NotConnected)?;

        match timeout(self.config.publish_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => Err(ClientError::Timeout(format!(
                "no OK from relay within {:?}",
                self.config.publish_timeout
            ))),
        }
    }

    /// Stop the connection task.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Get relay URL
    pub fn url(&self) -> &Url {
        &self.url
    }
}

async fn run(
    url: Url,
    config: RelayConfig,
    spec: SubscriptionSpec,
    state: Arc<RwLock<ConnectionState>>,
    mut cmd_rx: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<Event>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut delay = config.reconnect_delay;
    let mut first_attempt = true;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        *state.write().await = if first_attempt {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };
        first_attempt = false;

        let ws = match timeout(config.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                warn!(relay = %url, error = %e, "relay connection failed");
                if !backoff(&mut delay, &config, &mut cmd_rx, &mut shutdown_rx).await {
                    break;
                }
                continue;
            }
            Err(_) => {
                warn!(relay = %url, "relay connection timed out");
                if !backoff(&mut delay, &config, &mut cmd_rx, &mut shutdown_rx).await {
                    break;
                }
                continue;
            }
        };

        info!(relay = %url, "connected to relay");
        *state.write().await = ConnectionState::Connected;
        delay = config.reconnect_delay;

        let (mut write, mut read) = ws.split();

        // (Re-)establish the subscription; `since` advances with handled events
        let req = json!(["REQ", SUBSCRIPTION_ID, spec.filter()]);
        if write.send(Message::Text(req.to_string())).await.is_err() {
            warn!(relay = %url, "failed to send subscription request");
            if !backoff(&mut delay, &config, &mut cmd_rx, &mut shutdown_rx).await {
                break;
            }
            continue;
        }

        let mut pending: HashMap<String, oneshot::Sender<Result<()>>> = HashMap::new();

        let disconnected = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    break false;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Publish { event, ack }) => {
                        let msg = json!(["EVENT", &event]).to_string();
                        match write.send(Message::Text(msg)).await {
                            Ok(()) => {
                                pending.insert(event.id, ack);
                            }
                            Err(e) => {
                                let _ = ack.send(Err(ClientError::WebSocket(e.to_string())));
                                break true;
                            }
                        }
                    }
                    // All client handles dropped
                    None => break false,
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match parse_relay_message(&text) {
                            Some(RelayMessage::Event(sub_id, event)) => {
                                if sub_id == SUBSCRIPTION_ID
                                    && events_tx.send(event).await.is_err()
                                {
                                    // Receiver gone, nothing left to serve
                                    break false;
                                }
                            }
                            Some(RelayMessage::Ok(event_id, accepted, message)) => {
                                if let Some(ack) = pending.remove(&event_id) {
                                    let result = if accepted {
                                        Ok(())
                                    } else {
                                        Err(ClientError::PublishRejected(message))
                                    };
                                    let _ = ack.send(result);
                                }
                            }
                            Some(RelayMessage::Eose(_)) => {
                                debug!(relay = %url, "end of stored events");
                            }
                            Some(RelayMessage::Notice(message)) => {
                                debug!(relay = %url, notice = %message, "relay notice");
                            }
                            None => {}
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            break true;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(relay = %url, "relay closed connection");
                        break true;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(relay = %url, error = %e, "websocket error");
                        break true;
                    }
                }
            }
        };

        // Connection lost: in-flight publishes fail fast, callers retry
        for (_, ack) in pending.drain() {
            let _ = ack.send(Err(ClientError::NotConnected));
        }

        if !disconnected {
            break;
        }

        *state.write().await = ConnectionState::Reconnecting;
        if !backoff(&mut delay, &config, &mut cmd_rx, &mut shutdown_rx).await {
            break;
        }
    }

    *state.write().await = ConnectionState::Disconnected;
}

/// Sleep for the current backoff delay, doubling it up to the cap.
///
/// Publish commands arriving while disconnected are answered immediately with
/// `NotConnected`. Returns false when shutdown was requested.
async fn backoff(
    delay: &mut Duration,
    config: &RelayConfig,
    cmd_rx: &mut mpsc::Receiver<Command>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let sleep = tokio::time::sleep(*delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => break,
            _ = shutdown_rx.changed() => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Publish { ack, .. }) => {
                    let _ = ack.send(Err(ClientError::NotConnected));
                }
                None => return false,
            },
        }
    }

    *delay = (*delay * 2).min(config.max_reconnect_delay);
    true
}

/// Parse a relay message
fn parse_relay_message(text: &str) -> Option<RelayMessage> {
    let value: Value = serde_json::from_str(text).ok()?;
    let arr = value.as_array()?;
    let msg_type = arr.first()?.as_str()?;

    match msg_type {
        "EVENT" if arr.len() >= 3 => {
            let sub_id = arr[1].as_str().unwrap_or("").to_string();
            let event: Event = serde_json::from_value(arr[2].clone()).ok()?;
            Some(RelayMessage::Event(sub_id, event))
        }
        "OK" if arr.len() >= 4 => {
            let event_id = arr[1].as_str().unwrap_or("").to_string();
            let accepted = arr[2].as_bool().unwrap_or(false);
            let message = arr[3].as_str().unwrap_or("").to_string();
            Some(RelayMessage::Ok(event_id, accepted, message))
        }
        "EOSE" if arr.len() >= 2 => {
            Some(RelayMessage::Eose(arr[1].as_str().unwrap_or("").to_string()))
        }
        "NOTICE" if arr.len() >= 2 => {
            Some(RelayMessage::Notice(arr[1].as_str().unwrap_or("").to_string()))
        }
        other => {
            debug!(message_type = other, "ignoring relay message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_scheme() {
        let result = RelayClient::new("https://relay.example.com", RelayConfig::default());
        assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
    }

    #[test]
    fn test_backoff_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_subscription_filter_shape() {
        let spec = SubscriptionSpec {
            kinds: vec![23194],
            pubkeys: vec!["ab".repeat(32)],
            since: Arc::new(AtomicU64::new(1_700_000_000)),
        };
        let filter = spec.filter();
        assert_eq!(filter["kinds"][0], 23194);
        assert_eq!(filter["#p"][0], "ab".repeat(32));
        assert_eq!(filter["since"], 1_700_000_000);

        // Advancing `since` is reflected in the next (re-)subscription
        spec.since.store(1_700_000_100, Ordering::Release);
        assert_eq!(spec.filter()["since"], 1_700_000_100);
    }

    #[test]
    fn test_parse_event_message() {
        let text = format!(
            r#"["EVENT","{}",{{"id":"abc","pubkey":"def","created_at":123,"kind":23194,"tags":[],"content":"hello","sig":"xyz"}}]"#,
            SUBSCRIPTION_ID
        );
        match parse_relay_message(&text) {
            Some(RelayMessage::Event(sub_id, event)) => {
                assert_eq!(sub_id, SUBSCRIPTION_ID);
                assert_eq!(event.kind, 23194);
            }
            other => panic!("expected Event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ok_message() {
        match parse_relay_message(r#"["OK","event123",false,"blocked: rate limited"]"#) {
            Some(RelayMessage::Ok(id, accepted, message)) => {
                assert_eq!(id, "event123");
                assert!(!accepted);
                assert_eq!(message, "blocked: rate limited");
            }
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_eose_and_notice() {
        assert!(matches!(
            parse_relay_message(r#"["EOSE","sub1"]"#),
            Some(RelayMessage::Eose(_))
        ));
        assert!(matches!(
            parse_relay_message(r#"["NOTICE","slow down"]"#),
            Some(RelayMessage::Notice(_))
        ));
    }

    #[test]
    fn test_parse_garbage_is_ignored() {
        assert!(parse_relay_message("not json").is_none());
        assert!(parse_relay_message(r#"{"not":"an array"}"#).is_none());
        assert!(parse_relay_message(r#"["AUTH","challenge"]"#).is_none());
        assert!(parse_relay_message(r#"["OK","id-only"]"#).is_none());
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = RelayClient::new("wss://relay.example.com", RelayConfig::default()).unwrap();
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert_eq!(client.url().scheme(), "wss");
    }
}
