//! Playback engine boundary
//!
//! The engine is an opaque source of state changes and a sink for seek
//! requests. This module defines what the core needs from it:
//!
//! - a push feed of [`PlaybackState`] snapshots with a "send me everything"
//!   round trip,
//! - a pull accessor used by the degraded poll,
//! - a volume-change callback,
//! - a seek entry point that the core wraps with a [`SeekInterceptor`].

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ConnectionError;

#[cfg(test)]
pub mod mock;
pub mod websocket;

pub use websocket::WebSocketEngine;

/// Transport status reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    Play,
    Pause,
    Stop,
}

impl PlaybackStatus {
    pub fn is_play(self) -> bool {
        self == Self::Play
    }
}

/// Snapshot of the engine's state, consumed read-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaybackState {
    pub status: PlaybackStatus,
    /// Logical volume 0..=100, absent when the engine omits it
    pub volume: Option<u8>,
    pub mute: bool,
    /// Playback position in milliseconds, if the engine reports one
    pub seek_ms: Option<u64>,
}

/// Payload of the volume callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeEvent {
    pub volume: u8,
    pub mute: bool,
}

/// Handler invoked by the engine on every volume change
pub type VolumeHandler = Arc<dyn Fn(VolumeEvent) + Send + Sync>;

/// Receiving side of an open push feed. The feed is down once it yields `None`.
pub type PushFeed = mpsc::Receiver<PlaybackState>;

/// Everything the core needs from a playback engine
#[async_trait]
pub trait PlaybackEngine: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Open the push feed; resolves once the handshake has succeeded
    async fn connect(&self) -> Result<PushFeed, ConnectionError>;

    /// Ask the engine to push a full snapshot over the open feed
    async fn request_state(&self) -> Result<(), ConnectionError>;

    /// Pull the current state directly, bypassing the push feed
    async fn current_state(&self) -> Option<PlaybackState>;

    /// Forward a seek to the engine
    async fn seek(&self, position_ms: u64) -> Result<(), ConnectionError>;

    /// Install the volume handler, replacing any previous one
    ///
    /// There is no way to unregister; callers replace the handler instead.
    fn on_volume_change(&self, handler: VolumeHandler);
}

/// Stable registration handle around a callback
///
/// The engine is given a trampoline once. Releasing the slot swaps in a
/// no-op so the engine's reference stays valid but does nothing.
pub struct CallbackSlot<T> {
    handler: Arc<RwLock<Option<Arc<dyn Fn(T) + Send + Sync>>>>,
}

impl<T: 'static> CallbackSlot<T> {
    pub fn new() -> Self {
        Self {
            handler: Arc::new(RwLock::new(None)),
        }
    }

    /// Route deliveries to `handler`
    pub fn set(&self, handler: impl Fn(T) + Send + Sync + 'static) {
        *self.handler.write() = Some(Arc::new(handler));
    }

    /// Swap in the no-op handler. Idempotent.
    pub fn release(&self) {
        if self.handler.write().take().is_some() {
            debug!("Callback released");
        }
    }

    pub fn is_active(&self) -> bool {
        self.handler.read().is_some()
    }

    /// Deliver `value` to the current handler, if any
    pub fn invoke(&self, value: T) {
        // Clone out so the handler never runs under the lock
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(value);
        }
    }

    /// Closure to hand to the engine; forwards to whatever the slot holds
    pub fn trampoline(&self) -> Arc<dyn Fn(T) + Send + Sync> {
        let handler = Arc::clone(&self.handler);
        Arc::new(move |value: T| {
            let current = handler.read().clone();
            if let Some(current) = current {
                current(value);
            }
        })
    }
}

impl<T: 'static> Default for CallbackSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre/post hook around outbound seek requests
#[async_trait]
pub trait SeekHook: Send + Sync {
    /// Runs to completion before the seek reaches the engine
    async fn before_seek(&self, position_ms: u64);

    /// Runs after the engine returned, whatever the outcome
    async fn after_seek(&self, position_ms: u64, result: &Result<(), ConnectionError>);
}

/// Seek entry point with an optional installed hook
///
/// Without a hook, seeks go straight to the engine.
pub struct SeekInterceptor {
    engine: Arc<dyn PlaybackEngine>,
    hook: RwLock<Option<Arc<dyn SeekHook>>>,
}

impl SeekInterceptor {
    pub fn new(engine: Arc<dyn PlaybackEngine>) -> Self {
        Self {
            engine,
            hook: RwLock::new(None),
        }
    }

    /// Install `hook`, replacing any previous one
    pub fn install(&self, hook: Arc<dyn SeekHook>) {
        *self.hook.write() = Some(hook);
        debug!("Seek hook installed on {}", self.engine.name());
    }

    /// Restore direct forwarding. Returns false if no hook was installed.
    pub fn uninstall(&self) -> bool {
        let removed = self.hook.write().take().is_some();
        if removed {
            debug!("Seek hook removed from {}", self.engine.name());
        }
        removed
    }

    pub fn is_installed(&self) -> bool {
        self.hook.read().is_some()
    }

    /// Run the hook, forward the seek and return the engine's result unchanged
    pub async fn seek(&self, position_ms: u64) -> Result<(), ConnectionError> {
        let hook = self.hook.read().clone();
        if let Some(hook) = &hook {
            hook.before_seek(position_ms).await;
        }
        let result = self.engine.seek(position_ms).await;
        if let Some(hook) = &hook {
            hook.after_seek(position_ms, &result).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockEngine;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_status_wire_names() {
        let s: PlaybackStatus = serde_json::from_str("\"pause\"").unwrap();
        assert_eq!(s, PlaybackStatus::Pause);
        assert_eq!(serde_json::to_string(&PlaybackStatus::Play).unwrap(), "\"play\"");
    }

    #[test]
    fn test_callback_slot_release_is_noop_swap() {
        let calls = Arc::new(AtomicUsize::new(0));
        let slot = CallbackSlot::<u8>::new();
        let c = Arc::clone(&calls);
        slot.set(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let trampoline = slot.trampoline();
        trampoline(1);
        slot.invoke(2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        slot.release();
        slot.release();
        trampoline(3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!slot.is_active());
    }

    struct Recorder(parking_lot::Mutex<Vec<String>>);

    #[async_trait]
    impl SeekHook for Recorder {
        async fn before_seek(&self, position_ms: u64) {
            self.0.lock().push(format!("before {}", position_ms));
        }
        async fn after_seek(&self, position_ms: u64, result: &Result<(), ConnectionError>) {
            self.0.lock().push(format!("after {} {}", position_ms, result.is_ok()));
        }
    }

    #[tokio::test]
    async fn test_interceptor_wraps_and_returns_result() {
        let engine = MockEngine::new();
        let interceptor = SeekInterceptor::new(Arc::new(engine.clone()));
        let hook = Arc::new(Recorder(parking_lot::Mutex::new(Vec::new())));

        interceptor.install(hook.clone());
        assert!(interceptor.seek(1000).await.is_ok());
        assert_eq!(engine.seeks(), vec![1000]);

        engine.set_seek_fails(true);
        assert_eq!(interceptor.seek(2000).await, Err(ConnectionError::Closed));
        assert_eq!(
            *hook.0.lock(),
            vec!["before 1000", "after 1000 true", "before 2000", "after 2000 false"]
        );

        assert!(interceptor.uninstall());
        assert!(!interceptor.uninstall());
        engine.set_seek_fails(false);
        interceptor.seek(3000).await.unwrap();
        assert_eq!(hook.0.lock().len(), 4);
        assert_eq!(engine.seeks(), vec![1000, 2000, 3000]);
    }
}
