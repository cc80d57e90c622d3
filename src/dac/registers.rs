//! ES9018K2M register map
//!
//! Source: ESS Technology ES9018K2M datasheet, register section.
//!
//! # I2C notes
//!
//! Every register is a single byte and every read is a separate
//! address-then-read transaction returning exactly one byte. The chip has no
//! auto-increment we rely on.
//!
//! The chip powers up with both attenuation registers at 0x00 (0 dB), so the
//! bootstrap forces the mute bit before touching anything else.

// ---------------------------------------------------------------------------
// Register addresses
// ---------------------------------------------------------------------------

/// System settings (bit 0 = soft reset, oscillator drive in 7:4)
pub const REG_SYSTEM: u8 = 0x00;

/// Input configuration: word length in 7:6, input select in 1:0
pub const REG_INPUT_CONFIG: u8 = 0x01;

/// Automute time
pub const REG_AUTOMUTE_TIME: u8 = 0x04;

/// Automute level (6:0, in -dB)
pub const REG_AUTOMUTE_LEVEL: u8 = 0x05;

/// De-emphasis and volume ramp rate
///
/// bit 7 = automatic de-emphasis, bit 6 = de-emphasis bypass,
/// bits 5:4 = de-emphasis sample rate, bits 2:0 = volume ramp rate.
pub const REG_DEEMPHASIS: u8 = 0x06;

/// General settings: FIR shape in 6:5, IIR bandwidth in 3:2, mute in bit 0
pub const REG_GENERAL: u8 = 0x07;

/// GPIO configuration
pub const REG_GPIO: u8 = 0x08;

/// Reserved, kept in the shadow because the chip reports it
pub const REG_RESERVED_09: u8 = 0x09;

/// Master mode and sync configuration
pub const REG_MASTER_MODE: u8 = 0x0A;

/// Channel mapping
pub const REG_CHANNEL_MAP: u8 = 0x0B;

/// DPLL bandwidth: I2S/serial in 7:4, DSD in 3:0
pub const REG_DPLL: u8 = 0x0C;

/// THD compensation
pub const REG_THD_COMP: u8 = 0x0D;

/// Soft-start configuration (bit 7 enable, 4:0 ramp time)
pub const REG_SOFT_START: u8 = 0x0E;

/// Left-channel attenuation (0x00 = 0 dB, 0xFF = -127.5 dB)
pub const REG_VOLUME_LEFT: u8 = 0x0F;

/// Right-channel attenuation (same encoding as [`REG_VOLUME_LEFT`])
pub const REG_VOLUME_RIGHT: u8 = 0x10;

/// GPIO input selection and oversampling-filter bypass (bit 0)
pub const REG_OSF: u8 = 0x15;

/// ASRC enable and volume latch configuration
pub const REG_ASRC: u8 = 0x1B;

/// Chip status (read only): chip id in 4:2, revision in 1:0
pub const REG_CHIP_STATUS: u8 = 0x40;

// ---------------------------------------------------------------------------
// Field masks and values
// ---------------------------------------------------------------------------

/// Mute bit in [`REG_GENERAL`]
pub const GENERAL_MUTE: u8 = 0b0000_0001;

/// FIR roll-off field in [`REG_GENERAL`]
pub const GENERAL_FIR_MASK: u8 = 0b0110_0000;

/// IIR bandwidth field in [`REG_GENERAL`]
pub const GENERAL_IIR_MASK: u8 = 0b0000_1100;

/// Whole de-emphasis field in [`REG_DEEMPHASIS`] (auto, bypass, select)
pub const DEEMPHASIS_MASK: u8 = 0b1111_0000;

/// De-emphasis bypass bit
pub const DEEMPHASIS_BYPASS: u8 = 0b0100_0000;

/// Automatic de-emphasis bit
pub const DEEMPHASIS_AUTO: u8 = 0b1000_0000;

/// Serial (I2S) DPLL bandwidth field in [`REG_DPLL`]
pub const DPLL_I2S_MASK: u8 = 0b1111_0000;

/// DSD DPLL bandwidth field in [`REG_DPLL`]
pub const DPLL_DSD_MASK: u8 = 0b0000_1111;

/// Oversampling filter bypass bit in [`REG_OSF`]
pub const OSF_BYPASS: u8 = 0b0000_0001;

/// Chip id field of [`REG_CHIP_STATUS`]
pub const CHIP_ID_MASK: u8 = 0b0001_1100;

/// Value of the chip id field for an ES9018K2M (0b100 << 2)
pub const CHIP_ID_ES9018K2M: u8 = 0b0001_0000;

/// Revision field of [`REG_CHIP_STATUS`]
pub const CHIP_REVISION_MASK: u8 = 0b0000_0011;

/// Attenuation byte for full volume (0 dB)
pub const ATT_FULL_VOLUME: u8 = 0x00;

/// Attenuation byte for maximum attenuation
pub const ATT_MUTED: u8 = 0xFF;

/// 7-bit I2C address with ADDR tied low
pub const DEFAULT_ADDRESS: u8 = 0x48;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Power-on values of every shadowed register
pub const POWER_ON_DEFAULTS: &[(u8, u8)] = &[
    (REG_SYSTEM, 0x00),
    (REG_INPUT_CONFIG, 0x8C),
    (REG_AUTOMUTE_TIME, 0x00),
    (REG_AUTOMUTE_LEVEL, 0x68),
    (REG_DEEMPHASIS, 0x4A),
    (REG_GENERAL, 0x80),
    (REG_GPIO, 0x10),
    (REG_RESERVED_09, 0x00),
    (REG_MASTER_MODE, 0x05),
    (REG_CHANNEL_MAP, 0x02),
    (REG_DPLL, 0x5A),
    (REG_THD_COMP, 0x00),
    (REG_SOFT_START, 0x8A),
    (REG_VOLUME_LEFT, ATT_FULL_VOLUME),
    (REG_VOLUME_RIGHT, ATT_FULL_VOLUME),
    (REG_OSF, 0x00),
    (REG_ASRC, 0xD4),
];

/// Register values written once the chip is identified and muted
///
/// Order matters: input format first so the DPLL locks to the right stream,
/// soft start before the ASRC latch.
pub const INIT_SEQUENCE: &[(u8, u8)] = &[
    // I2S, 32-bit words
    (REG_INPUT_CONFIG, 0x80),
    // Automute after ~0.1 s below -104 dB
    (REG_AUTOMUTE_TIME, 0x10),
    (REG_AUTOMUTE_LEVEL, 0x68),
    // De-emphasis bypassed, slowest volume ramp
    (REG_DEEMPHASIS, 0x47),
    // GPIO1 = lock status, GPIO2 = automute status
    (REG_GPIO, 0x10),
    // DPLL: mid bandwidth for I2S and DSD
    (REG_DPLL, 0x5A),
    // Soft start on lock/unlock
    (REG_SOFT_START, 0x8A),
    // Oversampling filter and IIR active
    (REG_OSF, 0x00),
    // ASRC on, channel 1 volume latched to both channels off
    (REG_ASRC, 0xD4),
];

/// Returns true when `reg` is one of the shadowed control registers
pub fn is_shadowed(reg: u8) -> bool {
    POWER_ON_DEFAULTS.iter().any(|(r, _)| *r == reg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadowed_register_set() {
        for reg in [0x00, 0x01, 0x0F, 0x10, 0x15, 0x1B] {
            assert!(is_shadowed(reg), "register {:#04x} should be shadowed", reg);
        }
        for reg in 0x04..=0x0E {
            assert!(is_shadowed(reg), "register {:#04x} should be shadowed", reg);
        }
        assert!(!is_shadowed(REG_CHIP_STATUS));
        assert!(!is_shadowed(0x02));
    }

    #[test]
    fn test_init_sequence_never_touches_mute_or_volume() {
        for (reg, _) in INIT_SEQUENCE {
            assert_ne!(*reg, REG_GENERAL);
            assert_ne!(*reg, REG_VOLUME_LEFT);
            assert_ne!(*reg, REG_VOLUME_RIGHT);
        }
    }

    #[test]
    fn test_field_masks_do_not_overlap() {
        assert_eq!(GENERAL_MUTE & GENERAL_FIR_MASK, 0);
        assert_eq!(GENERAL_MUTE & GENERAL_IIR_MASK, 0);
        assert_eq!(GENERAL_FIR_MASK & GENERAL_IIR_MASK, 0);
        assert_eq!(DPLL_I2S_MASK & DPLL_DSD_MASK, 0);
    }
}
