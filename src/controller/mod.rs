//! Controller - the context object tying the DAC layer to the playback engine
//!
//! The controller owns:
//! - The bus gateway (and through it the register shadow)
//! - The mute/ramp sequencer
//! - Logical volume, balance and filter settings
//! - The detected device identity
//!
//! Every [`StateUpdate`] goes through [`DacController::handle_update`], which
//! drops values identical to the last applied ones before anything reaches
//! the sequencer.

mod playback;

pub use playback::{SEEK_TOLERANCE_MS, VOLUME_PRECEDENCE};


use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dac::bootstrap::{self, DeviceIdentity};
use crate::dac::filters::{Deemphasis, FilterSettings, FirFilter, IirBandwidth, DPLL_MAX};
use crate::dac::volume::{map_volume, VolumeCurve, VolumeState, MAX_BALANCE};
use crate::dac::{Balance, BusGateway, BusStats};
use crate::engine::{PlaybackState, PlaybackStatus, SeekHook, SeekInterceptor, VolumeEvent};
use crate::error::{ConnectionError, DacError, DacResult};
use crate::feed::{EventFeed, FeedState, StateUpdate, UpdateSource};
use crate::sequencer::{
    MuteIntent, MuteSequencer, SequencerSettings, MAX_SEEK_MUTE_MS, RAMP_STEPS_RANGE,
};
use playback::PlaybackView;

/// Values the controller reads from the configuration boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub bus: u8,
    pub address: u8,
    pub curve: VolumeCurve,
    pub sequencer: SequencerSettings,
    /// Signed balance, positive attenuates the left channel
    pub balance: i32,
    /// Volume written at bootstrap until the engine reports one
    pub initial_volume: u8,
    pub filters: FilterSettings,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            bus: 1,
            address: crate::dac::registers::DEFAULT_ADDRESS,
            curve: VolumeCurve::default(),
            sequencer: SequencerSettings::default(),
            balance: 0,
            initial_volume: 50,
            filters: FilterSettings::default(),
        }
    }
}

/// Snapshot for the host's status display
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub device: DeviceIdentity,
    pub playback: Option<PlaybackStatus>,
    pub muted: bool,
    pub intent: MuteIntent,
    pub feed: Option<FeedState>,
    pub volume: Option<u8>,
    pub balance: i32,
    pub attenuation: Option<(u8, u8)>,
    pub bus: BusStats,
}

struct Inner {
    gateway: BusGateway,
    sequencer: MuteSequencer,
    settings: RwLock<ControllerSettings>,
    identity: RwLock<DeviceIdentity>,
    volume: Mutex<VolumeState>,
    view: Mutex<PlaybackView>,
    /// Serializes detection runs
    detection: tokio::sync::Mutex<()>,
}

/// Shared handle to the controller; cheap to clone
#[derive(Clone)]
pub struct DacController {
    inner: Arc<Inner>,
}

impl DacController {
    /// Create a controller on top of a running gateway
    ///
    /// Nothing touches the hardware until [`DacController::bootstrap`].
    pub fn new(gateway: BusGateway, settings: ControllerSettings) -> Self {
        let sequencer = MuteSequencer::new(gateway.clone(), settings.sequencer);
        let volume = VolumeState {
            volume: Some(settings.initial_volume.min(100)),
            balance: Balance::new(settings.balance),
        };
        Self {
            inner: Arc::new(Inner {
                gateway,
                sequencer,
                identity: RwLock::new(DeviceIdentity::absent(settings.bus, settings.address)),
                settings: RwLock::new(settings),
                volume: Mutex::new(volume),
                view: Mutex::new(PlaybackView::default()),
                detection: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn gateway(&self) -> &BusGateway {
        &self.inner.gateway
    }

    pub fn sequencer(&self) -> &MuteSequencer {
        &self.inner.sequencer
    }

    pub fn settings(&self) -> ControllerSettings {
        *self.inner.settings.read()
    }

    pub fn identity(&self) -> DeviceIdentity {
        *self.inner.identity.read()
    }

    pub fn volume_state(&self) -> VolumeState {
        *self.inner.volume.lock()
    }

    // ===== Device lifecycle =====

    /// Detect the chip and bring it up
    ///
    /// Returns [`DacError::DeviceAbsent`] when nothing answers; the
    /// controller keeps running with hardware writes disabled.
    pub async fn bootstrap(&self) -> DacResult<DeviceIdentity> {
        let _detection = self.inner.detection.lock().await;
        let identity = self.detect().await;
        if !identity.found {
            return Err(DacError::DeviceAbsent {
                bus: identity.bus,
                address: identity.address,
            });
        }
        self.bring_up().await?;
        Ok(identity)
    }

    /// Re-run detection on demand
    ///
    /// A device that appeared is initialized with the current state; a
    /// device that vanished leaves hardware writes disabled.
    pub async fn recheck_device(&self) -> DacResult<DeviceIdentity> {
        let _detection = self.inner.detection.lock().await;
        let was_found = self.identity().found;
        let identity = self.detect().await;
        match (was_found, identity.found) {
            (false, true) => {
                info!("DAC appeared on re-check, initializing");
                self.bring_up().await?;
            }
            (true, false) => warn!("DAC lost on re-check, hardware writes disabled"),
            _ => debug!("Re-check unchanged (found: {})", identity.found),
        }
        Ok(identity)
    }

    async fn detect(&self) -> DeviceIdentity {
        let (bus, address) = {
            let settings = self.inner.settings.read();
            (settings.bus, settings.address)
        };
        let identity = bootstrap::detect(&self.inner.gateway, bus, address).await;
        *self.inner.identity.write() = identity;
        identity
    }

    /// Initialize the chip with the controller's current volume, mute and filters
    async fn bring_up(&self) -> DacResult<()> {
        let curve = self.inner.settings.read().curve;
        let target = self
            .inner
            .volume
            .lock()
            .attenuation(curve)
            .unwrap_or((curve.mute_byte(), curve.mute_byte()));
        let unmute = !self.inner.sequencer.is_muted();

        bootstrap::initialize(&self.inner.gateway, target, unmute).await?;
        self.inner.sequencer.prime(target);
        self.apply_filters().await;
        Ok(())
    }

    /// Write every filter field, logging failures
    async fn apply_filters(&self) {
        let filters = self.inner.settings.read().filters;
        for (reg, mask, value) in filters.writes() {
            if let Err(e) = self.write_field(reg, mask, value).await {
                warn!("Filter write {:#04x} failed: {}", reg, e);
            }
        }
    }

    // ===== Update consumer =====

    /// Apply one update from the event feed
    pub fn handle_update(&self, update: StateUpdate) {
        match update {
            StateUpdate::Playback { state, source } => self.on_playback(state, source),
            StateUpdate::Volume(event) => self.on_volume_event(event),
        }
    }

    fn on_playback(&self, state: PlaybackState, source: UpdateSource) {
        let now = Instant::now();
        let (transport, seek, volume) = {
            let mut view = self.inner.view.lock();
            let fresh = view.callback_fresh(now);
            let mute = view.effective_mute(state.mute, now);
            let seek = view.observe_position(state.seek_ms, state.status.is_play(), now);
            let changed = view.record_transport(state.status, mute);
            let volume = if fresh { None } else { state.volume };
            (changed.then_some(mute), seek, volume)
        };

        if seek {
            info!("Unannounced seek on the {:?} feed, muting", source);
            self.inner.sequencer.seek_detected();
        }
        if let Some(mute) = transport {
            debug!("Playback {:?} (mute: {}) from {:?}", state.status, mute, source);
            self.inner.sequencer.on_playback(state.status, mute);
        }
        if let Some(volume) = volume {
            self.apply_volume(volume);
        }
    }

    fn on_volume_event(&self, event: VolumeEvent) {
        let mute_changed = self.inner.view.lock().record_callback(event.mute, Instant::now());
        if mute_changed {
            self.inner.sequencer.set_user_mute(event.mute);
        }
        self.apply_volume(event.volume);
    }

    fn apply_volume(&self, volume: u8) -> (u8, u8) {
        let curve = self.inner.settings.read().curve;
        let target = {
            let mut state = self.inner.volume.lock();
            let volume = volume.min(100);
            state.volume = Some(volume);
            map_volume(curve, i32::from(volume), state.balance)
        };
        self.push_target(target);
        target
    }

    /// Hand an attenuation target to the sequencer unless it is already current
    fn push_target(&self, target: (u8, u8)) {
        if self.inner.sequencer.volume_target() == Some(target) {
            return;
        }
        debug!("Volume attenuation -> {:02x}/{:02x}", target.0, target.1);
        self.inner.sequencer.set_volume_target(target);
    }

    // ===== Setters =====

    /// Set the logical volume; values outside 0..=100 are clamped
    ///
    /// Returns the `(left, right)` attenuation the volume maps to.
    pub fn set_volume(&self, volume: i32) -> (u8, u8) {
        let clamped = volume.clamp(0, 100) as u8;
        if i32::from(clamped) != volume {
            warn!("Volume {} out of range, using {}", volume, clamped);
        }
        self.apply_volume(clamped)
    }

    /// Set the balance, clamped to `[-MAX_BALANCE, MAX_BALANCE]`
    pub fn set_balance(&self, balance: i32) {
        let clamped = balance.clamp(-MAX_BALANCE, MAX_BALANCE);
        if clamped != balance {
            warn!("Balance {} out of range, using {}", balance, clamped);
        }
        let curve = {
            let mut settings = self.inner.settings.write();
            settings.balance = clamped;
            settings.curve
        };
        let target = {
            let mut state = self.inner.volume.lock();
            state.balance.set(clamped);
            state.attenuation(curve)
        };
        if let Some(target) = target {
            self.push_target(target);
        }
    }

    /// Seek mute hold time, clamped to `[0, MAX_SEEK_MUTE_MS]`
    pub fn set_seek_mute_ms(&self, ms: u64) {
        let clamped = ms.min(MAX_SEEK_MUTE_MS);
        if clamped != ms {
            warn!("Seek mute {} ms out of range, using {} ms", ms, clamped);
        }
        self.update_sequencer(|s| s.seek_mute = Duration::from_millis(clamped));
    }

    /// Number of fade steps, clamped to the allowed range
    pub fn set_ramp_steps(&self, steps: u8) {
        let clamped = steps.clamp(*RAMP_STEPS_RANGE.start(), *RAMP_STEPS_RANGE.end());
        if clamped != steps {
            warn!("Ramp steps {} out of range, using {}", steps, clamped);
        }
        self.update_sequencer(|s| s.ramp_steps = clamped);
    }

    pub fn set_graceful(&self, graceful_mute: bool, graceful_volume: bool) {
        self.update_sequencer(|s| {
            s.graceful_mute = graceful_mute;
            s.graceful_volume = graceful_volume;
        });
    }

    fn update_sequencer(&self, change: impl FnOnce(&mut SequencerSettings)) {
        let next = {
            let mut settings = self.inner.settings.write();
            change(&mut settings.sequencer);
            settings.sequencer
        };
        self.inner.sequencer.update_settings(next);
    }

    pub async fn set_fir_filter(&self, filter: FirFilter) -> DacResult<()> {
        self.update_filters(|f| f.fir_filter = filter).await
    }

    pub async fn set_iir_bandwidth(&self, bandwidth: IirBandwidth) -> DacResult<()> {
        self.update_filters(|f| f.iir_bandwidth = bandwidth).await
    }

    pub async fn set_deemphasis(&self, deemphasis: Deemphasis) -> DacResult<()> {
        self.update_filters(|f| f.deemphasis = deemphasis).await
    }

    /// DPLL bandwidth for I2S input, clamped to `DPLL_MAX`
    pub async fn set_dpll_i2s(&self, bandwidth: u8) -> DacResult<()> {
        let bandwidth = clamp_dpll("I2S", bandwidth);
        self.update_filters(|f| f.dpll_i2s = bandwidth).await
    }

    /// DPLL bandwidth for DSD input, clamped to `DPLL_MAX`
    pub async fn set_dpll_dsd(&self, bandwidth: u8) -> DacResult<()> {
        let bandwidth = clamp_dpll("DSD", bandwidth);
        self.update_filters(|f| f.dpll_dsd = bandwidth).await
    }

    pub async fn set_oversampling_bypass(&self, bypass: bool) -> DacResult<()> {
        self.update_filters(|f| f.oversampling_bypass = bypass).await
    }

    /// Store the changed filters and write the fields that differ
    async fn update_filters(&self, change: impl FnOnce(&mut FilterSettings)) -> DacResult<()> {
        let (before, after) = {
            let mut settings = self.inner.settings.write();
            let before = settings.filters;
            change(&mut settings.filters);
            (before, settings.filters)
        };
        self.write_filter_changes(&before, &after).await
    }

    async fn write_filter_changes(&self, before: &FilterSettings, after: &FilterSettings) -> DacResult<()> {
        for (new, old) in after.writes().into_iter().zip(before.writes()) {
            if new != old {
                let (reg, mask, value) = new;
                self.write_field(reg, mask, value).await?;
            }
        }
        Ok(())
    }

    /// Masked register write, refused while the device is absent
    async fn write_field(&self, reg: u8, mask: u8, value: u8) -> DacResult<()> {
        let identity = self.identity();
        if !identity.found {
            return Err(DacError::DeviceAbsent {
                bus: identity.bus,
                address: identity.address,
            });
        }
        let full = self.inner.gateway.update_bits(reg, mask, value).await?;
        debug!("Register {:#04x} -> {:#04x}", reg, full);
        Ok(())
    }

    /// Apply reloaded settings without a restart
    ///
    /// Everything else is applied even when an error is returned. Bus and
    /// address are only read at startup; a change to them is reported as
    /// [`DacError::Configuration`] and otherwise ignored.
    pub async fn apply_settings(&self, next: ControllerSettings) -> DacResult<()> {
        let (previous, curve_changed) = {
            let mut settings = self.inner.settings.write();
            let previous = *settings;
            settings.curve = next.curve;
            settings.sequencer = next.sequencer;
            settings.filters = next.filters;
            settings.initial_volume = next.initial_volume;
            (previous, previous.curve != next.curve)
        };

        self.inner.sequencer.update_settings(next.sequencer);
        if curve_changed || previous.balance != next.balance {
            self.set_balance(next.balance);
        }
        if self.identity().found {
            self.write_filter_changes(&previous.filters, &next.filters)
                .await?;
        }
        if (previous.bus, previous.address) != (next.bus, next.address) {
            return Err(DacError::Configuration(format!(
                "bus/address change to {}@{:#04x} needs a restart, keeping {}@{:#04x}",
                next.bus, next.address, previous.bus, previous.address
            )));
        }
        info!("Settings applied");
        Ok(())
    }

    // ===== Seek interception =====

    /// Hook to install on the engine's [`SeekInterceptor`]
    pub fn seek_hook(&self) -> Arc<dyn SeekHook> {
        Arc::new(SeekGuard {
            controller: self.clone(),
        })
    }

    // ===== Status and shutdown =====

    pub fn status(&self, feed: Option<FeedState>) -> ControllerStatus {
        let volume = self.volume_state();
        ControllerStatus {
            device: self.identity(),
            playback: self.inner.view.lock().status(),
            muted: self.inner.sequencer.is_muted(),
            intent: self.inner.sequencer.intent(),
            feed,
            volume: volume.volume,
            balance: volume.balance.value(),
            attenuation: self.inner.sequencer.volume_target(),
            bus: self.inner.gateway.stats(),
        }
    }

    /// Stop the feed, remove the seek hook, mute, then drain the bus
    pub async fn shutdown(&self, feed: Option<EventFeed>, interceptor: Option<&SeekInterceptor>) {
        if let Some(feed) = feed {
            feed.shutdown().await;
        }
        if let Some(interceptor) = interceptor {
            interceptor.uninstall();
        }
        self.inner.sequencer.final_mute().await;
        self.inner.gateway.flush().await;
        info!("Controller stopped");
    }
}

fn clamp_dpll(input: &str, bandwidth: u8) -> u8 {
    if bandwidth > DPLL_MAX {
        warn!("{} DPLL bandwidth {} out of range, using {}", input, bandwidth, DPLL_MAX);
    }
    bandwidth.min(DPLL_MAX)
}

/// Mutes ahead of every intercepted seek
struct SeekGuard {
    controller: DacController,
}

#[async_trait]
impl SeekHook for SeekGuard {
    async fn before_seek(&self, position_ms: u64) {
        let inner = &self.controller.inner;
        inner.view.lock().seek_started(position_ms, Instant::now());
        inner.sequencer.before_seek().await;
    }

    async fn after_seek(&self, position_ms: u64, result: &Result<(), ConnectionError>) {
        if let Err(e) = result {
            warn!("Seek to {} ms failed: {}", position_ms, e);
        }
        let inner = &self.controller.inner;
        inner.view.lock().seek_finished(position_ms, Instant::now());
        inner.sequencer.after_seek();
    }
}
