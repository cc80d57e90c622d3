//! Mute/ramp sequencer
//!
//! The hardware mute bit is the OR of three independent intents:
//!
//! - `transport`: set when playback leaves `play`, cleared once playback is
//!   back in `play` and the engine does not report mute
//! - `seek`: set before a seek reaches the engine, cleared by a timer
//! - `user`: mirrors the engine's own mute flag while playing
//!
//! The bit is only written when the OR changes. With graceful mute enabled,
//! transitions fade the attenuation registers over a few steps instead of
//! toggling the bit abruptly. The pre-seek mute always toggles the bit
//! directly through the gateway's synchronous path.
//!
//! All attenuation writes go through here so fades and plain volume changes
//! never interleave.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::dac::registers::{
    ATT_MUTED, GENERAL_MUTE, REG_GENERAL, REG_VOLUME_LEFT, REG_VOLUME_RIGHT,
};
use crate::dac::volume::ramp;
use crate::dac::BusGateway;
use crate::engine::PlaybackStatus;
use crate::timer::TimerHandle;

/// Default seek mute hold time
pub const DEFAULT_SEEK_MUTE_MS: u64 = 300;

/// Upper bound for the seek mute hold time
pub const MAX_SEEK_MUTE_MS: u64 = 2000;

/// Allowed range of ramp steps
pub const RAMP_STEPS_RANGE: std::ops::RangeInclusive<u8> = 1..=5;

/// Tunables of the sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerSettings {
    /// How long the seek intent holds after the seek was forwarded
    pub seek_mute: Duration,
    /// Fade the attenuation on mute/unmute instead of toggling the bit
    pub graceful_mute: bool,
    /// Fade volume jumps
    pub graceful_volume: bool,
    pub ramp_steps: u8,
    pub ramp_step: Duration,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            seek_mute: Duration::from_millis(DEFAULT_SEEK_MUTE_MS),
            graceful_mute: false,
            graceful_volume: false,
            ramp_steps: 3,
            ramp_step: Duration::from_millis(40),
        }
    }
}

/// Active mute requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MuteIntent {
    pub user: bool,
    pub transport: bool,
    pub seek: bool,
}

impl MuteIntent {
    /// Net mute: true while any intent is active
    pub fn any(&self) -> bool {
        self.user || self.transport || self.seek
    }
}

struct SeqState {
    intent: MuteIntent,
    /// Net mute last requested from the hardware
    muted: bool,
    status: Option<PlaybackStatus>,
    engine_mute: bool,
    /// Attenuation the current volume maps to
    volume_target: Option<(u8, u8)>,
    /// A fade-in owns the attenuation registers until it reaches the target
    fading_in: bool,
    seek_timer: TimerHandle,
    ramp: TimerHandle,
}

struct SeqInner {
    gateway: BusGateway,
    settings: RwLock<SequencerSettings>,
    state: Mutex<SeqState>,
}

/// Handle to the sequencer; cheap to clone
#[derive(Clone)]
pub struct MuteSequencer {
    inner: Arc<SeqInner>,
}

impl MuteSequencer {
    pub fn new(gateway: BusGateway, settings: SequencerSettings) -> Self {
        Self {
            inner: Arc::new(SeqInner {
                gateway,
                settings: RwLock::new(settings),
                state: Mutex::new(SeqState {
                    intent: MuteIntent::default(),
                    muted: false,
                    status: None,
                    engine_mute: false,
                    volume_target: None,
                    fading_in: false,
                    seek_timer: TimerHandle::idle(),
                    ramp: TimerHandle::idle(),
                }),
            }),
        }
    }

    fn from_weak(weak: &Weak<SeqInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn settings(&self) -> SequencerSettings {
        *self.inner.settings.read()
    }

    /// Replace the tunables. Running timers keep their original timing.
    pub fn update_settings(&self, settings: SequencerSettings) {
        *self.inner.settings.write() = settings;
    }

    pub fn intent(&self) -> MuteIntent {
        self.inner.state.lock().intent
    }

    /// Net mute last requested from the hardware
    pub fn is_muted(&self) -> bool {
        self.inner.state.lock().muted
    }

    pub fn volume_target(&self) -> Option<(u8, u8)> {
        self.inner.state.lock().volume_target
    }

    /// Record an attenuation that is already on the hardware
    pub fn prime(&self, target: (u8, u8)) {
        self.inner.state.lock().volume_target = Some(target);
    }

    /// Feed a playback status and the engine's mute flag
    pub fn on_playback(&self, status: PlaybackStatus, engine_mute: bool) {
        let mut st = self.inner.state.lock();
        let was_play = st.status.is_some_and(PlaybackStatus::is_play);
        st.status = Some(status);
        st.engine_mute = engine_mute;

        if status.is_play() {
            if st.intent.transport && !engine_mute {
                st.intent.transport = false;
            }
            st.intent.user = engine_mute;
        } else if was_play {
            st.intent.transport = true;
        }
        self.apply(&mut st);
    }

    /// Engine mute flag from the volume callback
    ///
    /// Ignored unless playing; outside `play` it would fight the transport intent.
    pub fn set_user_mute(&self, mute: bool) {
        let mut st = self.inner.state.lock();
        st.engine_mute = mute;
        if !st.status.is_some_and(PlaybackStatus::is_play) {
            trace!("Ignoring engine mute {} outside play", mute);
            return;
        }
        st.intent.user = mute;
        self.apply(&mut st);
    }

    /// Mute synchronously ahead of a seek
    ///
    /// Returns once the mute bit is on the hardware or the write failed. A
    /// failure is logged and the seek proceeds.
    pub async fn before_seek(&self) {
        {
            let mut st = self.inner.state.lock();
            st.seek_timer.cancel();
            st.ramp.cancel();
            st.fading_in = false;
            st.intent.seek = true;
            st.muted = true;
        }

        // Written even when the shadow already shows mute: an older unmute
        // may still be queued, and only a synchronous write supersedes it
        let gateway = &self.inner.gateway;
        if !gateway.is_enabled() {
            trace!("Device absent, skipping pre-seek mute");
            return;
        }
        match gateway
            .write_sync(REG_GENERAL, GENERAL_MUTE, GENERAL_MUTE)
            .await
        {
            Ok(_) => debug!("Muted ahead of seek"),
            Err(e) => warn!("Pre-seek mute failed, seeking anyway: {}", e),
        }
    }

    /// Start the seek-mute clear timer once the seek has been forwarded
    pub fn after_seek(&self) {
        let mut st = self.inner.state.lock();
        self.arm_seek_clear(&mut st);
    }

    /// Seek noticed on the feed without going through the interceptor
    ///
    /// Mutes through the regular queue and arms the same clear timer.
    pub fn seek_detected(&self) {
        let mut st = self.inner.state.lock();
        st.seek_timer.cancel();
        st.intent.seek = true;
        self.apply(&mut st);
        self.arm_seek_clear(&mut st);
    }

    fn arm_seek_clear(&self, st: &mut SeqState) {
        let delay = self.settings().seek_mute;
        let weak = Arc::downgrade(&self.inner);
        st.seek_timer.replace(TimerHandle::once(delay, move || async move {
            if let Some(seq) = Self::from_weak(&weak) {
                seq.clear_seek();
            }
        }));
    }

    /// Seek timer expiry
    ///
    /// If playback is not running, or the engine reports mute, the mute is
    /// handed over to the intent whose clear path applies.
    fn clear_seek(&self) {
        let mut st = self.inner.state.lock();
        if !st.intent.seek {
            return;
        }
        st.intent.seek = false;
        if !st.status.is_some_and(PlaybackStatus::is_play) {
            st.intent.transport = true;
        } else if st.engine_mute {
            st.intent.user = true;
        }
        trace!("Seek mute cleared, intents {:?}", st.intent);
        self.apply(&mut st);
    }

    /// Bring the hardware mute in line with the intents
    fn apply(&self, st: &mut SeqState) {
        let want = st.intent.any();
        if want == st.muted {
            return;
        }
        st.muted = want;
        debug!("Net mute -> {} ({:?})", want, st.intent);

        let settings = self.settings();
        st.fading_in = !want && settings.graceful_mute;
        if settings.graceful_mute {
            let gateway = self.inner.gateway.clone();
            let task = if want {
                tokio::spawn(fade_out(gateway, settings))
            } else {
                tokio::spawn(fade_in(gateway, Arc::downgrade(&self.inner), settings))
            };
            st.ramp.replace(TimerHandle::from_task(task));
        } else {
            st.ramp.cancel();
            let bit = if want { GENERAL_MUTE } else { 0 };
            self.inner.gateway.queue_update(REG_GENERAL, GENERAL_MUTE, bit);
        }
    }

    /// Apply a new attenuation target
    ///
    /// While faded out the target is only remembered; the fade-in restores it.
    /// A running fade-in picks up the new target itself.
    pub fn set_volume_target(&self, target: (u8, u8)) {
        let mut st = self.inner.state.lock();
        st.volume_target = Some(target);

        let settings = self.settings();
        if st.muted && settings.graceful_mute {
            trace!("Faded out, deferring volume {:?}", target);
            return;
        }
        if st.fading_in {
            trace!("Fade-in running, retargeting to {:?}", target);
            return;
        }

        if settings.graceful_volume {
            let gateway = self.inner.gateway.clone();
            st.ramp.replace(TimerHandle::from_task(tokio::spawn(fade_volume(
                gateway, target, settings,
            ))));
        } else {
            st.ramp.cancel();
            self.inner.gateway.queue_write(REG_VOLUME_LEFT, target.0);
            self.inner.gateway.queue_write(REG_VOLUME_RIGHT, target.1);
        }
    }

    /// Re-issue the current mute and volume to the hardware
    ///
    /// Used after the chip was (re)initialized underneath us.
    pub fn resync(&self) {
        let st = self.inner.state.lock();
        let bit = if st.muted { GENERAL_MUTE } else { 0 };
        self.inner.gateway.queue_update(REG_GENERAL, GENERAL_MUTE, bit);
        if let Some((l, r)) = st.volume_target {
            if !(st.muted && self.settings().graceful_mute) {
                self.inner.gateway.queue_write(REG_VOLUME_LEFT, l);
                self.inner.gateway.queue_write(REG_VOLUME_RIGHT, r);
            }
        }
    }

    /// Stop all timers and mute synchronously
    pub async fn final_mute(&self) {
        {
            let mut st = self.inner.state.lock();
            st.seek_timer.cancel();
            st.ramp.cancel();
            st.fading_in = false;
            st.muted = true;
        }
        if !self.inner.gateway.is_enabled() {
            return;
        }
        if let Err(e) = self
            .inner
            .gateway
            .write_sync(REG_GENERAL, GENERAL_MUTE, GENERAL_MUTE)
            .await
        {
            warn!("Final mute failed: {}", e);
        }
    }
}

fn current_attenuation(gateway: &BusGateway) -> (u8, u8) {
    let shadow = gateway.shadow();
    (shadow.value(REG_VOLUME_LEFT), shadow.value(REG_VOLUME_RIGHT))
}

async fn write_pair(gateway: &BusGateway, (l, r): (u8, u8)) {
    for (reg, value) in [(REG_VOLUME_LEFT, l), (REG_VOLUME_RIGHT, r)] {
        if let Err(e) = gateway.write(reg, value).await {
            warn!("Ramp write {:#04x} failed: {}", reg, e);
        }
    }
}

async fn step_through(gateway: &BusGateway, from: (u8, u8), to: (u8, u8), settings: SequencerSettings) {
    let steps = ramp(from, to, settings.ramp_steps);
    let last = steps.len().saturating_sub(1);
    for (i, step) in steps.into_iter().enumerate() {
        write_pair(gateway, step).await;
        if i < last {
            tokio::time::sleep(settings.ramp_step).await;
        }
    }
}

/// Fade to full attenuation, then set the mute bit
async fn fade_out(gateway: BusGateway, settings: SequencerSettings) {
    gateway.flush().await;
    let from = current_attenuation(&gateway);
    step_through(&gateway, from, (ATT_MUTED, ATT_MUTED), settings).await;
    if let Err(e) = gateway
        .update_bits(REG_GENERAL, GENERAL_MUTE, GENERAL_MUTE)
        .await
    {
        warn!("Mute after fade failed: {}", e);
    }
}

/// Next target for a running fade-in
///
/// Ends the fade, under the state lock, once `reached` is the latest target.
fn next_fade_target(seq: &Weak<SeqInner>, reached: Option<(u8, u8)>) -> Option<(u8, u8)> {
    let inner = seq.upgrade()?;
    let mut st = inner.state.lock();
    match st.volume_target {
        Some(target) if Some(target) != reached => Some(target),
        _ => {
            st.fading_in = false;
            None
        }
    }
}

/// Release the mute bit at full attenuation, then fade up to the volume target
///
/// Targets set while the fade runs are followed until the latest one is reached.
async fn fade_in(gateway: BusGateway, seq: Weak<SeqInner>, settings: SequencerSettings) {
    gateway.flush().await;
    let has_target = seq
        .upgrade()
        .is_some_and(|inner| inner.state.lock().volume_target.is_some());
    let bit_set = gateway.shadow().value(REG_GENERAL) & GENERAL_MUTE != 0;
    let mut from = if bit_set && has_target {
        write_pair(&gateway, (ATT_MUTED, ATT_MUTED)).await;
        (ATT_MUTED, ATT_MUTED)
    } else {
        current_attenuation(&gateway)
    };

    if bit_set {
        if let Err(e) = gateway.update_bits(REG_GENERAL, GENERAL_MUTE, 0).await {
            warn!("Unmute before fade failed: {}", e);
            if let Some(inner) = seq.upgrade() {
                inner.state.lock().fading_in = false;
            }
            return;
        }
    }

    let mut reached = None;
    while let Some(target) = next_fade_target(&seq, reached) {
        step_through(&gateway, from, target, settings).await;
        from = target;
        reached = Some(target);
    }
}

/// Fade from the current attenuation to `target`
async fn fade_volume(gateway: BusGateway, target: (u8, u8), settings: SequencerSettings) {
    gateway.flush().await;
    let from = current_attenuation(&gateway);
    if from != target {
        step_through(&gateway, from, target, settings).await;
    }
}
