//! JSON-over-WebSocket playback engine adapter
//!
//! Frames are JSON objects `{"event": <name>, "data": <payload>}`:
//!
//! | direction | event       | data                                          |
//! |-----------|-------------|-----------------------------------------------|
//! | in        | `pushState` | `{status, volume, mute, seek}`                |
//! | in        | `volume`    | `{vol, mute}`                                 |
//! | out       | `getState`  | none                                          |
//! | out       | `seek`      | position in milliseconds                      |
//!
//! While the socket is down, [`PlaybackEngine::current_state`] pulls the same
//! `{status, volume, mute, seek}` object over HTTP from a separate state url.
//! Volume notifications otherwise arrive only on the socket, so a pulled
//! volume or mute that differs from the last one seen is relayed to the
//! volume callback.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use super::{
    PlaybackEngine, PlaybackState, PlaybackStatus, PushFeed, VolumeEvent, VolumeHandler,
};
use crate::error::ConnectionError;

/// Time allowed for a one-shot state pull
const PULL_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the push feed channel
const FEED_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct WireState {
    status: PlaybackStatus,
    #[serde(default)]
    volume: Option<i64>,
    #[serde(default)]
    mute: bool,
    #[serde(default)]
    seek: Option<u64>,
}

impl From<WireState> for PlaybackState {
    fn from(wire: WireState) -> Self {
        Self {
            status: wire.status,
            volume: wire.volume.map(clamp_volume),
            mute: wire.mute,
            seek_ms: wire.seek,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireVolume {
    vol: i64,
    #[serde(default)]
    mute: bool,
}

/// Decoded inbound frame
#[derive(Debug, PartialEq)]
enum Inbound {
    State(PlaybackState),
    Volume(VolumeEvent),
    Other(String),
}

fn clamp_volume(v: i64) -> u8 {
    v.clamp(0, 100) as u8
}

fn parse_frame(text: &str) -> Result<Inbound, ConnectionError> {
    let frame: Frame =
        serde_json::from_str(text).map_err(|e| ConnectionError::Protocol(e.to_string()))?;
    match frame.event.as_str() {
        "pushState" => {
            let wire: WireState = serde_json::from_value(frame.data)
                .map_err(|e| ConnectionError::Protocol(format!("pushState: {}", e)))?;
            Ok(Inbound::State(wire.into()))
        }
        "volume" => {
            let wire: WireVolume = serde_json::from_value(frame.data)
                .map_err(|e| ConnectionError::Protocol(format!("volume: {}", e)))?;
            Ok(Inbound::Volume(VolumeEvent {
                volume: clamp_volume(wire.vol),
                mute: wire.mute,
            }))
        }
        other => Ok(Inbound::Other(other.to_string())),
    }
}

fn request(event: &str, data: Option<Value>) -> Message {
    let frame = match data {
        Some(data) => json!({ "event": event, "data": data }),
        None => json!({ "event": event }),
    };
    Message::text(frame.to_string())
}

/// Volume callback plus the last event handed to it
#[derive(Default)]
struct VolumeRelay {
    handler: RwLock<Option<VolumeHandler>>,
    last: Mutex<Option<VolumeEvent>>,
}

impl VolumeRelay {
    fn deliver(&self, event: VolumeEvent) {
        *self.last.lock() = Some(event);
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn deliver_if_changed(&self, event: VolumeEvent) {
        if *self.last.lock() != Some(event) {
            self.deliver(event);
        }
    }
}

/// Playback engine reached over a WebSocket
pub struct WebSocketEngine {
    url: String,
    state_url: Option<String>,
    http: reqwest::Client,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    volume: Arc<VolumeRelay>,
}

impl WebSocketEngine {
    /// Engine with its push socket at `url` and, optionally, an HTTP state
    /// snapshot at `state_url` for the degraded poll
    pub fn new(url: impl Into<String>, state_url: Option<String>) -> Self {
        Self {
            url: url.into(),
            state_url,
            http: reqwest::Client::new(),
            outbound: Mutex::new(None),
            volume: Arc::new(VolumeRelay::default()),
        }
    }

    fn send(&self, msg: Message) -> Result<(), ConnectionError> {
        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| ConnectionError::Closed),
            None => Err(ConnectionError::Closed),
        }
    }

    async fn pull_state(&self, state_url: &str) -> Result<PlaybackState, ConnectionError> {
        let response = self
            .http
            .get(state_url)
            .timeout(PULL_TIMEOUT)
            .send()
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ConnectionError::Protocol(format!(
                "state pull returned {}",
                response.status()
            )));
        }
        let wire: WireState = response
            .json()
            .await
            .map_err(|e| ConnectionError::Protocol(format!("state pull: {}", e)))?;
        Ok(wire.into())
    }
}

#[async_trait]
impl PlaybackEngine for WebSocketEngine {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn connect(&self) -> Result<PushFeed, ConnectionError> {
        debug!("Connecting to playback engine at {}", self.url);
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock() = Some(out_tx);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!("Engine socket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (feed_tx, feed_rx) = mpsc::channel(FEED_CAPACITY);
        let volume = Arc::clone(&self.volume);
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Engine socket error: {}", e);
                        break;
                    }
                };
                match parse_frame(&text) {
                    Ok(Inbound::State(state)) => {
                        trace!("Engine state: {:?}", state);
                        if feed_tx.send(state).await.is_err() {
                            break;
                        }
                    }
                    Ok(Inbound::Volume(event)) => volume.deliver(event),
                    Ok(Inbound::Other(name)) => trace!("Ignoring engine event {}", name),
                    Err(e) => warn!("Bad frame from engine: {}", e),
                }
            }
            info!("Playback engine feed at {} closed", url);
        });

        Ok(feed_rx)
    }

    async fn request_state(&self) -> Result<(), ConnectionError> {
        self.send(request("getState", None))
    }

    async fn current_state(&self) -> Option<PlaybackState> {
        let Some(state_url) = self.state_url.as_deref() else {
            trace!("No state url configured, skipping pull");
            return None;
        };
        match self.pull_state(state_url).await {
            Ok(state) => {
                if let Some(volume) = state.volume {
                    self.volume.deliver_if_changed(VolumeEvent {
                        volume,
                        mute: state.mute,
                    });
                }
                Some(state)
            }
            Err(e) => {
                debug!("State pull from {} failed: {}", state_url, e);
                None
            }
        }
    }

    async fn seek(&self, position_ms: u64) -> Result<(), ConnectionError> {
        self.send(request("seek", Some(json!(position_ms))))
    }

    fn on_volume_change(&self, handler: VolumeHandler) {
        *self.volume.handler.write() = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_push_state() {
        let text = r#"{"event":"pushState","data":{"status":"play","volume":42,"mute":false,"seek":1500,"title":"x"}}"#;
        assert_eq!(
            parse_frame(text).unwrap(),
            Inbound::State(PlaybackState {
                status: PlaybackStatus::Play,
                volume: Some(42),
                mute: false,
                seek_ms: Some(1500),
            })
        );
    }

    #[test]
    fn test_parse_push_state_clamps_and_defaults() {
        let text = r#"{"event":"pushState","data":{"status":"stop","volume":140}}"#;
        let Inbound::State(state) = parse_frame(text).unwrap() else {
            panic!("expected a state frame");
        };
        assert_eq!(state.volume, Some(100));
        assert!(!state.mute);
        assert_eq!(state.seek_ms, None);
    }

    #[test]
    fn test_parse_volume_event() {
        let text = r#"{"event":"volume","data":{"vol":-3,"mute":true}}"#;
        assert_eq!(
            parse_frame(text).unwrap(),
            Inbound::Volume(VolumeEvent {
                volume: 0,
                mute: true
            })
        );
    }

    #[test]
    fn test_parse_errors_are_protocol_errors() {
        assert!(matches!(
            parse_frame("not json"),
            Err(ConnectionError::Protocol(_))
        ));
        assert!(matches!(
            parse_frame(r#"{"event":"pushState","data":{"status":"rewind"}}"#),
            Err(ConnectionError::Protocol(_))
        ));
        assert_eq!(
            parse_frame(r#"{"event":"pushQueue","data":[]}"#).unwrap(),
            Inbound::Other("pushQueue".to_string())
        );
    }

    #[test]
    fn test_request_frames() {
        let Message::Text(text) = request("seek", Some(json!(1234))) else {
            panic!("expected text frame");
        };
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v, json!({"event": "seek", "data": 1234}));
    }

    #[tokio::test]
    async fn test_send_without_connection_is_closed() {
        let engine = WebSocketEngine::new("ws://127.0.0.1:1", None);
        assert_eq!(engine.seek(10).await, Err(ConnectionError::Closed));
        assert_eq!(engine.request_state().await, Err(ConnectionError::Closed));
        assert_eq!(engine.current_state().await, None);
    }

    const STATE_BODY: &str =
        r#"{"status":"play","volume":35,"mute":false,"seek":4200,"title":"x","service":"mpd"}"#;

    #[tokio::test]
    async fn test_state_pull_works_while_socket_is_down() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/getState")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(STATE_BODY)
            .expect(2)
            .create_async()
            .await;

        let engine = WebSocketEngine::new(
            "ws://127.0.0.1:1/ws",
            Some(format!("{}/api/v1/getState", server.url())),
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = Arc::clone(&events);
            engine.on_volume_change(Arc::new(move |event| events.lock().push(event)));
        }

        assert!(matches!(
            engine.connect().await,
            Err(ConnectionError::Connect(_))
        ));
        assert_eq!(
            engine.current_state().await,
            Some(PlaybackState {
                status: PlaybackStatus::Play,
                volume: Some(35),
                mute: false,
                seek_ms: Some(4200),
            })
        );
        // Same volume on the next pull is not relayed again
        assert!(engine.current_state().await.is_some());
        assert_eq!(
            *events.lock(),
            vec![VolumeEvent {
                volume: 35,
                mute: false
            }]
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_state_pull_is_none() {
        let mut server = mockito::Server::new_async().await;
        let _error = server
            .mock("GET", "/api/v1/getState")
            .with_status(500)
            .create_async()
            .await;
        let _garbage = server
            .mock("GET", "/garbage")
            .with_status(200)
            .with_body("<html></html>")
            .create_async()
            .await;

        let engine = WebSocketEngine::new(
            "ws://127.0.0.1:1/ws",
            Some(format!("{}/api/v1/getState", server.url())),
        );
        assert_eq!(engine.current_state().await, None);

        let engine = WebSocketEngine::new(
            "ws://127.0.0.1:1/ws",
            Some(format!("{}/garbage", server.url())),
        );
        assert_eq!(engine.current_state().await, None);
    }
}
