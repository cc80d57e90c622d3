//! Last-applied playback view used to de-duplicate updates
//!
//! Also extrapolates the playback position between reports so a jump the
//! seek hook never saw can still be recognised.

use std::time::Duration;
use tokio::time::Instant;

use crate::engine::PlaybackStatus;

/// Position differences up to this are reporting jitter, not seeks
pub const SEEK_TOLERANCE_MS: u64 = 3000;

/// Feed volumes are ignored for this long after a volume callback
pub const VOLUME_PRECEDENCE: Duration = Duration::from_millis(1000);

/// Last known position and whether it was advancing
#[derive(Debug, Clone, Copy)]
struct Anchor {
    position_ms: u64,
    at: Instant,
    playing: bool,
}

impl Anchor {
    fn predict(&self, now: Instant) -> u64 {
        if self.playing {
            let elapsed = now.saturating_duration_since(self.at).as_millis();
            self.position_ms
                .saturating_add(u64::try_from(elapsed).unwrap_or(u64::MAX))
        } else {
            self.position_ms
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct PlaybackView {
    status: Option<PlaybackStatus>,
    engine_mute: Option<bool>,
    anchor: Option<Anchor>,
    volume_callback_at: Option<Instant>,
    seeks_in_flight: u32,
}

impl PlaybackView {
    pub fn status(&self) -> Option<PlaybackStatus> {
        self.status
    }

    fn playing(&self) -> bool {
        self.status.is_some_and(PlaybackStatus::is_play)
    }

    /// Record a status/mute pair. Returns false if it equals the last one.
    pub fn record_transport(&mut self, status: PlaybackStatus, mute: bool) -> bool {
        let changed = self.status != Some(status) || self.engine_mute != Some(mute);
        self.status = Some(status);
        self.engine_mute = Some(mute);
        changed
    }

    /// Record the mute flag of a volume callback. Returns true if it changed.
    pub fn record_callback(&mut self, mute: bool, now: Instant) -> bool {
        self.volume_callback_at = Some(now);
        let changed = self.engine_mute != Some(mute);
        self.engine_mute = Some(mute);
        changed
    }

    /// Mute flag the feed should be read with: inside the precedence
    /// window the callback's value wins.
    pub fn effective_mute(&self, reported: bool, now: Instant) -> bool {
        if self.callback_fresh(now) {
            self.engine_mute.unwrap_or(reported)
        } else {
            reported
        }
    }

    pub fn callback_fresh(&self, now: Instant) -> bool {
        self.volume_callback_at
            .is_some_and(|at| now.saturating_duration_since(at) < VOLUME_PRECEDENCE)
    }

    /// Track a reported position
    ///
    /// Returns true for a jump away from the predicted position while
    /// playing, with no intercepted seek in flight. Jumps back to the start
    /// of a track are track changes, not seeks.
    pub fn observe_position(&mut self, position_ms: Option<u64>, playing: bool, now: Instant) -> bool {
        let Some(position_ms) = position_ms else {
            return false;
        };
        let previous = self.anchor.replace(Anchor {
            position_ms,
            at: now,
            playing,
        });
        if self.seeks_in_flight > 0 || !playing || position_ms < SEEK_TOLERANCE_MS {
            return false;
        }
        match previous {
            Some(prev) if prev.playing => {
                position_ms.abs_diff(prev.predict(now)) > SEEK_TOLERANCE_MS
            }
            _ => false,
        }
    }

    pub fn seek_started(&mut self, target_ms: u64, now: Instant) {
        self.seeks_in_flight += 1;
        self.move_anchor(target_ms, now);
    }

    pub fn seek_finished(&mut self, target_ms: u64, now: Instant) {
        self.seeks_in_flight = self.seeks_in_flight.saturating_sub(1);
        self.move_anchor(target_ms, now);
    }

    fn move_anchor(&mut self, position_ms: u64, now: Instant) {
        self.anchor = Some(Anchor {
            position_ms,
            at: now,
            playing: self.playing(),
        });
    }
}
