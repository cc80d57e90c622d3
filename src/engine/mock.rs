//! Scripted playback engine for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{PlaybackEngine, PlaybackState, PushFeed, VolumeEvent, VolumeHandler};
use crate::error::ConnectionError;

type SeekObserver = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Default)]
struct MockEngineState {
    reachable: bool,
    feed: Option<mpsc::Sender<PlaybackState>>,
    current: Option<PlaybackState>,
    volume_handler: Option<VolumeHandler>,
    seek_observer: Option<SeekObserver>,
    seek_fails: bool,
    seeks: Vec<u64>,
    connects: usize,
    state_requests: usize,
    polls: usize,
}

/// Engine double: push states, drop the feed, fire volume callbacks
#[derive(Clone)]
pub struct MockEngine {
    state: Arc<Mutex<MockEngineState>>,
}

impl MockEngine {
    /// A reachable engine with no state yet
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockEngineState {
                reachable: true,
                ..Default::default()
            })),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// State returned by the pull accessor
    pub fn set_current(&self, state: Option<PlaybackState>) {
        self.state.lock().current = state;
    }

    /// Deliver a state over the open push feed. Returns false if the feed is down.
    pub fn push(&self, state: PlaybackState) -> bool {
        let mut guard = self.state.lock();
        guard.current = Some(state);
        match &guard.feed {
            Some(tx) => tx.try_send(state).is_ok(),
            None => false,
        }
    }

    /// Drop the push feed as if the connection broke
    pub fn disconnect(&self) {
        self.state.lock().feed = None;
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .feed
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Invoke the registered volume handler
    pub fn fire_volume(&self, volume: u8, mute: bool) {
        let handler = self.state.lock().volume_handler.clone();
        if let Some(handler) = handler {
            handler(VolumeEvent { volume, mute });
        }
    }

    /// Called with the position when a seek reaches the engine
    pub fn on_seek(&self, observer: impl Fn(u64) + Send + Sync + 'static) {
        self.state.lock().seek_observer = Some(Arc::new(observer));
    }

    pub fn set_seek_fails(&self, fails: bool) {
        self.state.lock().seek_fails = fails;
    }

    pub fn seeks(&self) -> Vec<u64> {
        self.state.lock().seeks.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn state_requests(&self) -> usize {
        self.state.lock().state_requests
    }

    pub fn polls(&self) -> usize {
        self.state.lock().polls
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlaybackEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<PushFeed, ConnectionError> {
        let mut state = self.state.lock();
        state.connects += 1;
        if !state.reachable {
            return Err(ConnectionError::Connect("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::channel(32);
        state.feed = Some(tx);
        Ok(rx)
    }

    async fn request_state(&self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        state.state_requests += 1;
        match (&state.feed, state.current) {
            (Some(tx), Some(current)) => {
                let _ = tx.try_send(current);
                Ok(())
            }
            (Some(_), None) => Ok(()),
            (None, _) => Err(ConnectionError::Closed),
        }
    }

    async fn current_state(&self) -> Option<PlaybackState> {
        let mut state = self.state.lock();
        state.polls += 1;
        state.current
    }

    async fn seek(&self, position_ms: u64) -> Result<(), ConnectionError> {
        let (observer, fails) = {
            let mut state = self.state.lock();
            state.seeks.push(position_ms);
            (state.seek_observer.clone(), state.seek_fails)
        };
        if let Some(observer) = observer {
            observer(position_ms);
        }
        if fails {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }

    fn on_volume_change(&self, handler: VolumeHandler) {
        self.state.lock().volume_handler = Some(handler);
    }
}
