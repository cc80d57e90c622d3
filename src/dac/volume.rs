//! Volume mapper - logical volume and balance to attenuation bytes
//!
//! Two curves are supported:
//!
//! - [`VolumeCurve::Linear`] spreads 0..=100 across the whole 0x00..=0xFF
//!   attenuation range.
//! - [`VolumeCurve::Restricted`] treats `min_gain` as the quietest audible step
//!   and reserves `mute_byte` for volume 0.
//!
//! Balance is an attenuation offset added to one channel after mapping.

use serde::Serialize;

use super::registers::ATT_MUTED;

/// Largest balance offset, in attenuation steps
pub const MAX_BALANCE: i32 = 40;

/// Volume-to-attenuation policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeCurve {
    /// `round((100 - v) * 2.55)`
    #[default]
    Linear,
    /// `round(min_gain - v * min_gain / 100)`, volume 0 forced to `mute_byte`
    Restricted { min_gain: u8, mute_byte: u8 },
}

impl VolumeCurve {
    /// Attenuation byte for a logical volume, before balance
    ///
    /// Values above 100 are treated as 100; zero and below map to the
    /// quietest byte of the curve.
    pub fn attenuation(&self, volume: i32) -> u8 {
        // Integer form of round(full * (100 - v) / 100), halves rounded up
        let scale = |full: u32, v: u32| ((full * (100 - v) + 50) / 100) as u8;
        let v = volume.clamp(0, 100) as u32;
        match *self {
            Self::Linear => scale(255, v),
            Self::Restricted { .. } if v == 0 => self.mute_byte(),
            Self::Restricted { min_gain, .. } => scale(u32::from(min_gain), v),
        }
    }

    /// Byte produced by volume 0
    pub fn mute_byte(&self) -> u8 {
        match *self {
            Self::Linear => ATT_MUTED,
            Self::Restricted { mute_byte, .. } => mute_byte,
        }
    }
}

/// Per-channel balance offsets; at most one side is non-zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Balance {
    left: u8,
    right: u8,
}

impl Balance {
    /// Balance from a signed value: positive attenuates the left channel,
    /// negative the right. Clamped to `[-MAX_BALANCE, MAX_BALANCE]`.
    pub fn new(balance: i32) -> Self {
        let mut b = Self::default();
        b.set(balance);
        b
    }

    /// Replace the balance, zeroing the other side first
    pub fn set(&mut self, balance: i32) {
        let balance = balance.clamp(-MAX_BALANCE, MAX_BALANCE);
        self.left = 0;
        self.right = 0;
        if balance > 0 {
            self.left = balance as u8;
        } else if balance < 0 {
            self.right = balance.unsigned_abs() as u8;
        }
    }

    /// Signed value as accepted by [`Balance::set`]
    pub fn value(&self) -> i32 {
        i32::from(self.left) - i32::from(self.right)
    }

    /// `(left, right)` attenuation offsets
    pub fn offsets(&self) -> (u8, u8) {
        (self.left, self.right)
    }
}

/// Map a logical volume and balance to `(left, right)` attenuation bytes
pub fn map_volume(curve: VolumeCurve, volume: i32, balance: Balance) -> (u8, u8) {
    let base = curve.attenuation(volume);
    let (l, r) = balance.offsets();
    (base.saturating_add(l), base.saturating_add(r))
}

/// Logical volume state owned by the controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VolumeState {
    /// Last logical volume, `None` until the engine or config provided one
    pub volume: Option<u8>,
    pub balance: Balance,
}

impl VolumeState {
    /// Attenuation bytes for the current state, if a volume is known
    pub fn attenuation(&self, curve: VolumeCurve) -> Option<(u8, u8)> {
        self.volume
            .map(|v| map_volume(curve, i32::from(v), self.balance))
    }
}

/// Attenuation bytes stepping from `from` to `to` in `steps` increments
///
/// The last element is always `to`. Used for graceful fades.
pub fn ramp(from: (u8, u8), to: (u8, u8), steps: u8) -> Vec<(u8, u8)> {
    let steps = u32::from(steps.max(1));
    let lerp = |a: u8, b: u8, i: u32| -> u8 {
        let weighted = u32::from(a) * (steps - i) + u32::from(b) * i;
        ((weighted + steps / 2) / steps) as u8
    };
    (1..=steps)
        .map(|i| (lerp(from.0, to.0, i), lerp(from.1, to.1, i)))
        .collect()
}
