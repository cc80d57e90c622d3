//! Event source adapter
//!
//! Merges the playback engine's push feed, its volume callback and the
//! degraded-mode poll into one stream of [`StateUpdate`]s.
//!
//! Connection lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                    |  ^           |
//!          failure   |  | backoff   | feed closed
//!                    v  |           v
//!                  Connecting    Connecting (immediately)
//! ```
//!
//! Retries back off as `min(1000 * 2^(attempt-1), cap)` ms. Once the feed has
//! been down continuously for `degraded_after`, the adapter enters
//! `Degraded` and pulls state every `poll_interval` until it reconnects.
//! The volume callback is registered once and stays active whatever the
//! connection does.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::{CallbackSlot, PlaybackEngine, PlaybackState, VolumeEvent};
use crate::timer::TimerHandle;

/// First reconnect delay
const BACKOFF_BASE_MS: u64 = 1000;

/// Connection phase of the push feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
    /// Disconnected long enough that the fallback poll is running
    Degraded,
}

/// Reconnection bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    /// Failed attempts since the last successful connect
    pub attempt: u32,
    /// Start of the current disconnection, if any
    pub failed_since: Option<Instant>,
}

/// Where a playback snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    Push,
    Poll,
}

/// The single message type consumed by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateUpdate {
    Playback {
        state: PlaybackState,
        source: UpdateSource,
    },
    Volume(VolumeEvent),
}

/// Timing of the reconnect machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedSettings {
    pub reconnect_cap: Duration,
    pub degraded_after: Duration,
    pub poll_interval: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            reconnect_cap: Duration::from_millis(30_000),
            degraded_after: Duration::from_millis(300_000),
            poll_interval: Duration::from_millis(60_000),
        }
    }
}

/// Delay before reconnect attempt number `attempt` (1-based)
pub fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << exp);
    Duration::from_millis(ms).min(cap)
}

struct Shared {
    state: FeedState,
    conn: ConnectionState,
}

impl Shared {
    /// Connection attempts while degraded keep reporting `Degraded`
    fn set_state(&mut self, next: FeedState) {
        let keep_degraded = self.state == FeedState::Degraded
            && matches!(next, FeedState::Connecting | FeedState::Disconnected);
        if !keep_degraded && self.state != next {
            debug!("Feed state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

/// Running event source adapter
pub struct EventFeed {
    shared: Arc<RwLock<Shared>>,
    volume_slot: CallbackSlot<VolumeEvent>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EventFeed {
    /// Register the volume callback and start the connection loop
    pub fn spawn(
        engine: Arc<dyn PlaybackEngine>,
        settings: FeedSettings,
        updates: mpsc::UnboundedSender<StateUpdate>,
    ) -> Self {
        let volume_slot = CallbackSlot::new();
        let volume_tx = updates.clone();
        volume_slot.set(move |event| {
            let _ = volume_tx.send(StateUpdate::Volume(event));
        });
        engine.on_volume_change(volume_slot.trampoline());

        let shared = Arc::new(RwLock::new(Shared {
            state: FeedState::Disconnected,
            conn: ConnectionState::default(),
        }));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            engine,
            settings,
            updates,
            Arc::clone(&shared),
            shutdown_rx,
        ));

        Self {
            shared,
            volume_slot,
            shutdown_tx,
            task,
        }
    }

    pub fn state(&self) -> FeedState {
        self.shared.read().state
    }

    pub fn connection(&self) -> ConnectionState {
        self.shared.read().conn
    }

    /// Release the volume callback and stop the connection loop and poll
    pub async fn shutdown(self) {
        self.volume_slot.release();
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!("Event feed task ended abnormally: {}", e);
            }
        }
        debug!("Event feed stopped");
    }
}

/// Start the degraded-mode poll
fn start_poll(
    engine: &Arc<dyn PlaybackEngine>,
    updates: &mpsc::UnboundedSender<StateUpdate>,
    interval: Duration,
) -> TimerHandle {
    let engine = Arc::clone(engine);
    let updates = updates.clone();
    TimerHandle::every(interval, move || {
        let engine = Arc::clone(&engine);
        let updates = updates.clone();
        async move {
            match engine.current_state().await {
                Some(state) => {
                    let _ = updates.send(StateUpdate::Playback {
                        state,
                        source: UpdateSource::Poll,
                    });
                }
                None => debug!("Fallback poll got no state from {}", engine.name()),
            }
        }
    })
}

/// Arm the watchdog that switches to `Degraded` at `failed_since + degraded_after`
fn arm_degrade_watchdog(
    engine: &Arc<dyn PlaybackEngine>,
    updates: &mpsc::UnboundedSender<StateUpdate>,
    shared: &Arc<RwLock<Shared>>,
    poll: &Arc<Mutex<TimerHandle>>,
    settings: FeedSettings,
    failed_since: Instant,
) -> TimerHandle {
    let engine = Arc::clone(engine);
    let updates = updates.clone();
    let shared = Arc::clone(shared);
    let poll = Arc::clone(poll);
    let delay = (failed_since + settings.degraded_after).saturating_duration_since(Instant::now());

    TimerHandle::once(delay, move || async move {
        if shared.read().conn.connected {
            return;
        }
        warn!(
            "Playback engine unreachable for {:?}, polling every {:?}",
            settings.degraded_after, settings.poll_interval
        );
        shared.write().set_state(FeedState::Degraded);
        poll.lock()
            .replace(start_poll(&engine, &updates, settings.poll_interval));
    })
}

async fn run(
    engine: Arc<dyn PlaybackEngine>,
    settings: FeedSettings,
    updates: mpsc::UnboundedSender<StateUpdate>,
    shared: Arc<RwLock<Shared>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let poll = Arc::new(Mutex::new(TimerHandle::idle()));
    let mut watchdog = TimerHandle::idle();

    // Marks the start of a disconnection and arms the watchdog once per run
    let mark_failed = |watchdog: &mut TimerHandle| {
        let mut guard = shared.write();
        guard.conn.connected = false;
        if guard.conn.failed_since.is_none() {
            let now = Instant::now();
            guard.conn.failed_since = Some(now);
            drop(guard);
            watchdog.replace(arm_degrade_watchdog(
                &engine, &updates, &shared, &poll, settings, now,
            ));
        }
    };

    loop {
        shared.write().set_state(FeedState::Connecting);

        let connected = tokio::select! {
            result = engine.connect() => result,
            _ = shutdown_rx.changed() => break,
        };

        match connected {
            Ok(mut feed) => {
                {
                    let mut guard = shared.write();
                    guard.conn = ConnectionState {
                        connected: true,
                        attempt: 0,
                        failed_since: None,
                    };
                    guard.set_state(FeedState::Connected);
                }
                watchdog.cancel();
                poll.lock().cancel();
                info!("Connected to playback engine ({})", engine.name());

                if let Err(e) = engine.request_state().await {
                    warn!("State request failed: {}", e);
                }

                loop {
                    tokio::select! {
                        state = feed.recv() => match state {
                            Some(state) => {
                                let _ = updates.send(StateUpdate::Playback {
                                    state,
                                    source: UpdateSource::Push,
                                });
                            }
                            None => break,
                        },
                        _ = shutdown_rx.changed() => {
                            poll.lock().cancel();
                            return;
                        }
                    }
                }

                warn!("Playback engine feed lost, reconnecting");
                mark_failed(&mut watchdog);
                shared.write().set_state(FeedState::Disconnected);
            }
            Err(e) => {
                mark_failed(&mut watchdog);
                let attempt = {
                    let mut guard = shared.write();
                    guard.conn.attempt = guard.conn.attempt.saturating_add(1);
                    guard.conn.attempt
                };
                let delay = backoff_delay(attempt, settings.reconnect_cap);
                debug!("Engine connect #{} failed ({}), retrying in {:?}", attempt, e, delay);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    }

    poll.lock().cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::engine::PlaybackStatus;

    const CAP: Duration = Duration::from_millis(30_000);

    fn playing(volume: u8) -> PlaybackState {
        PlaybackState {
            status: PlaybackStatus::Play,
            volume: Some(volume),
            mute: false,
            seek_ms: None,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StateUpdate>) -> Vec<StateUpdate> {
        let mut out = Vec::new();
        while let Ok(u) = rx.try_recv() {
            out.push(u);
        }
        out
    }

    #[test]
    fn test_backoff_sequence() {
        let delays: Vec<u64> = (1..=7)
            .map(|a| backoff_delay(a, CAP).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(backoff_delay(500, CAP), CAP);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_requests_snapshot_and_forwards_pushes() {
        let engine = MockEngine::new();
        engine.set_current(Some(playing(40)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = EventFeed::spawn(Arc::new(engine.clone()), FeedSettings::default(), tx);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(feed.state(), FeedState::Connected);
        assert_eq!(engine.state_requests(), 1);

        engine.push(playing(55));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            drain(&mut rx),
            vec![
                StateUpdate::Playback {
                    state: playing(40),
                    source: UpdateSource::Push
                },
                StateUpdate::Playback {
                    state: playing(55),
                    source: UpdateSource::Push
                },
            ]
        );
        feed.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_timing() {
        let engine = MockEngine::new();
        engine.set_reachable(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let feed = EventFeed::spawn(Arc::new(engine.clone()), FeedSettings::default(), tx);

        // Attempts at 0, 1, 3, 7, 15, 31 s
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.connects(), 1);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(engine.connects(), 2);
        tokio::time::sleep(Duration::from_millis(14_000)).await;
        assert_eq!(engine.connects(), 5);
        assert_eq!(feed.connection().attempt, 5);
        tokio::time::sleep(Duration::from_millis(16_000)).await;
        assert_eq!(engine.connects(), 6);
        // Capped from here on
        tokio::time::sleep(Duration::from_millis(30_000)).await;
        assert_eq!(engine.connects(), 7);

        let conn = feed.connection();
        assert!(!conn.connected);
        assert!(conn.failed_since.is_some());
        feed.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_poll_starts_late_and_stops_on_reconnect() {
        let engine = MockEngine::new();
        engine.set_reachable(false);
        engine.set_current(Some(playing(70)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = EventFeed::spawn(Arc::new(engine.clone()), FeedSettings::default(), tx);

        tokio::time::sleep(Duration::from_millis(299_500)).await;
        assert_eq!(engine.polls(), 0);
        assert_ne!(feed.state(), FeedState::Degraded);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(feed.state(), FeedState::Degraded);
        assert_eq!(engine.polls(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![StateUpdate::Playback {
                state: playing(70),
                source: UpdateSource::Poll
            }]
        );

        // Next attempt at 331 s succeeds
        engine.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(31_000)).await;
        assert_eq!(feed.state(), FeedState::Connected);
        assert_eq!(feed.connection(), ConnectionState {
            connected: true,
            attempt: 0,
            failed_since: None,
        });

        let polls = engine.polls();
        tokio::time::sleep(Duration::from_millis(200_000)).await;
        assert_eq!(engine.polls(), polls);
        feed.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_loss_reconnects() {
        let engine = MockEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let feed = EventFeed::spawn(Arc::new(engine.clone()), FeedSettings::default(), tx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.connects(), 1);

        engine.set_reachable(false);
        engine.disconnect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_ne!(feed.state(), FeedState::Connected);
        assert!(feed.connection().failed_since.is_some());

        engine.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(feed.state(), FeedState::Connected);
        assert_eq!(engine.connects(), 3);
        feed.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_callback_independent_of_connection() {
        let engine = MockEngine::new();
        engine.set_reachable(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = EventFeed::spawn(Arc::new(engine.clone()), FeedSettings::default(), tx);

        engine.fire_volume(33, false);
        assert_eq!(
            drain(&mut rx),
            vec![StateUpdate::Volume(VolumeEvent {
                volume: 33,
                mute: false
            })]
        );

        feed.shutdown().await;
        engine.fire_volume(34, false);
        assert!(drain(&mut rx).is_empty());
    }
}
