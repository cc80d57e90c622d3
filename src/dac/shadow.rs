//! Register model - in-memory shadow of the DAC's control registers
//!
//! The shadow holds the last value that was successfully written to or read
//! from each register. It never performs I/O: [`RegisterShadow::set_bits`]
//! only computes the byte a masked write would produce, and the bus gateway
//! calls [`RegisterShadow::store`] once the transaction has succeeded.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::registers::POWER_ON_DEFAULTS;

/// Shared register shadow
///
/// Cheap to clone; all clones view the same registers.
#[derive(Debug, Clone)]
pub struct RegisterShadow {
    values: Arc<Mutex<BTreeMap<u8, u8>>>,
}

impl RegisterShadow {
    /// Create a shadow seeded with the chip's power-on defaults
    pub fn new() -> Self {
        Self::with_values(POWER_ON_DEFAULTS)
    }

    /// Create a shadow from an explicit table
    pub fn with_values(values: &[(u8, u8)]) -> Self {
        Self {
            values: Arc::new(Mutex::new(values.iter().copied().collect())),
        }
    }

    /// Last known value of `reg`, or `None` if the register was never seen
    pub fn get(&self, reg: u8) -> Option<u8> {
        self.values.lock().get(&reg).copied()
    }

    /// Last known value of `reg`, treating unknown registers as zero
    pub fn value(&self, reg: u8) -> u8 {
        self.get(reg).unwrap_or(0)
    }

    /// Compute the byte produced by replacing the `mask` bits of `reg` with `value`
    ///
    /// Bits of `value` outside `mask` are ignored. The shadow itself is not
    /// modified; call [`store`](Self::store) after the hardware accepted it.
    pub fn set_bits(&self, reg: u8, mask: u8, value: u8) -> u8 {
        let current = self.value(reg);
        (current & !mask) | (value & mask)
    }

    /// Record a value confirmed by the hardware
    pub fn store(&self, reg: u8, value: u8) {
        self.values.lock().insert(reg, value);
    }

    /// Reset every register to the power-on defaults
    pub fn reset(&self) {
        let mut values = self.values.lock();
        values.clear();
        values.extend(POWER_ON_DEFAULTS.iter().copied());
    }

    /// Copy of every register, ordered by address
    pub fn snapshot(&self) -> Vec<(u8, u8)> {
        self.values.lock().iter().map(|(r, v)| (*r, *v)).collect()
    }
}

impl Default for RegisterShadow {
    fn default() -> Self {
        Self::new()
    }
}
