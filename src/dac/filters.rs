//! Typed values for the filter, de-emphasis and DPLL register fields

use serde::{Deserialize, Serialize};

use super::registers::*;

/// FIR interpolation filter shape (register 0x07, bits 6:5)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirFilter {
    #[default]
    Fast,
    Slow,
    Minimum,
}

impl FirFilter {
    pub fn bits(self) -> u8 {
        match self {
            Self::Fast => 0b0000_0000,
            Self::Slow => 0b0010_0000,
            Self::Minimum => 0b0100_0000,
        }
    }
}

/// IIR filter bandwidth (register 0x07, bits 3:2)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IirBandwidth {
    #[default]
    #[serde(rename = "47k")]
    K47,
    #[serde(rename = "50k")]
    K50,
    #[serde(rename = "60k")]
    K60,
    #[serde(rename = "70k")]
    K70,
}

impl IirBandwidth {
    pub fn bits(self) -> u8 {
        match self {
            Self::K47 => 0b0000_0000,
            Self::K50 => 0b0000_0100,
            Self::K60 => 0b0000_1000,
            Self::K70 => 0b0000_1100,
        }
    }
}

/// De-emphasis selection (register 0x06, bits 7:4)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Deemphasis {
    #[default]
    #[serde(rename = "off")]
    Off,
    /// Follow the de-emphasis flag of the incoming stream
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "32k")]
    K32,
    #[serde(rename = "44k1")]
    K44_1,
    #[serde(rename = "48k")]
    K48,
}

impl Deemphasis {
    pub fn bits(self) -> u8 {
        match self {
            Self::Off => DEEMPHASIS_BYPASS,
            Self::Auto => DEEMPHASIS_AUTO,
            Self::K32 => 0b0000_0000,
            Self::K44_1 => 0b0001_0000,
            Self::K48 => 0b0010_0000,
        }
    }
}

/// Highest DPLL bandwidth setting
pub const DPLL_MAX: u8 = 15;

/// Everything written through the filter setters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSettings {
    #[serde(default)]
    pub fir_filter: FirFilter,
    #[serde(default)]
    pub iir_bandwidth: IirBandwidth,
    #[serde(default)]
    pub deemphasis: Deemphasis,
    #[serde(default = "default_dpll_i2s")]
    pub dpll_i2s: u8,
    #[serde(default = "default_dpll_dsd")]
    pub dpll_dsd: u8,
    #[serde(default)]
    pub oversampling_bypass: bool,
}

// Same bandwidths as the init table (0x5A)
fn default_dpll_i2s() -> u8 {
    5
}

fn default_dpll_dsd() -> u8 {
    10
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            fir_filter: FirFilter::default(),
            iir_bandwidth: IirBandwidth::default(),
            deemphasis: Deemphasis::default(),
            dpll_i2s: default_dpll_i2s(),
            dpll_dsd: default_dpll_dsd(),
            oversampling_bypass: false,
        }
    }
}

impl FilterSettings {
    /// Masked register writes that apply these settings
    pub fn writes(&self) -> [(u8, u8, u8); 6] {
        [
            (REG_GENERAL, GENERAL_FIR_MASK, self.fir_filter.bits()),
            (REG_GENERAL, GENERAL_IIR_MASK, self.iir_bandwidth.bits()),
            (REG_DEEMPHASIS, DEEMPHASIS_MASK, self.deemphasis.bits()),
            (REG_DPLL, DPLL_I2S_MASK, self.dpll_i2s.min(DPLL_MAX) << 4),
            (REG_DPLL, DPLL_DSD_MASK, self.dpll_dsd.min(DPLL_MAX)),
            (
                REG_OSF,
                OSF_BYPASS,
                if self.oversampling_bypass { OSF_BYPASS } else { 0 },
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_values_fit_their_masks() {
        for f in [FirFilter::Fast, FirFilter::Slow, FirFilter::Minimum] {
            assert_eq!(f.bits() & !GENERAL_FIR_MASK, 0);
        }
        for b in [IirBandwidth::K47, IirBandwidth::K50, IirBandwidth::K60, IirBandwidth::K70] {
            assert_eq!(b.bits() & !GENERAL_IIR_MASK, 0);
        }
        for d in [Deemphasis::Off, Deemphasis::Auto, Deemphasis::K32, Deemphasis::K44_1, Deemphasis::K48] {
            assert_eq!(d.bits() & !DEEMPHASIS_MASK, 0);
        }
    }

    #[test]
    fn test_default_dpll_matches_init_table() {
        let f = FilterSettings::default();
        let dpll: u8 = f
            .writes()
            .iter()
            .filter(|(reg, _, _)| *reg == REG_DPLL)
            .map(|(_, _, v)| *v)
            .fold(0, |acc, v| acc | v);
        assert_eq!(dpll, 0x5A);
    }

    #[test]
    fn test_dpll_is_capped() {
        let f = FilterSettings {
            dpll_i2s: 99,
            dpll_dsd: 99,
            ..Default::default()
        };
        let w = f.writes();
        assert_eq!(w[3].2, 0xF0);
        assert_eq!(w[4].2, 0x0F);
    }

    #[test]
    fn test_yaml_names() {
        let f: FilterSettings =
            serde_yaml::from_str("fir_filter: minimum\niir_bandwidth: 60k\ndeemphasis: 44k1\n")
                .unwrap();
        assert_eq!(f.fir_filter, FirFilter::Minimum);
        assert_eq!(f.iir_bandwidth, IirBandwidth::K60);
        assert_eq!(f.deemphasis, Deemphasis::K44_1);
        assert_eq!(f.dpll_i2s, 5);
    }
}
