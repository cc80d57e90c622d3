//! Device bootstrap - identify the chip, then bring it up muted
//!
//! Detection reads the chip status register once. A read failure or an
//! unexpected chip id both mean "absent": hardware writes stay disabled and
//! nothing else is attempted. Absence is never fatal.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::bus::BusGateway;
use super::registers::*;
use crate::error::DacResult;

/// Result of device detection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub found: bool,
    pub bus: u8,
    pub address: u8,
    /// Two-bit silicon revision, only meaningful when `found`
    pub revision: u8,
}

impl DeviceIdentity {
    pub fn absent(bus: u8, address: u8) -> Self {
        Self {
            found: false,
            bus,
            address,
            revision: 0,
        }
    }
}

/// Revision encoded in a chip status byte, or `None` if the id does not match
pub fn decode_status(status: u8) -> Option<u8> {
    if status & CHIP_ID_MASK == CHIP_ID_ES9018K2M {
        Some(status & CHIP_REVISION_MASK)
    } else {
        None
    }
}

/// Probe the chip and enable or disable hardware writes accordingly
pub async fn detect(gateway: &BusGateway, bus: u8, address: u8) -> DeviceIdentity {
    let identity = match gateway.read(REG_CHIP_STATUS).await {
        Ok(status) => match decode_status(status) {
            Some(revision) => {
                info!(
                    "ES9018K2M found on bus {} at {:#04x} (revision {})",
                    bus, address, revision
                );
                DeviceIdentity {
                    found: true,
                    bus,
                    address,
                    revision,
                }
            }
            None => {
                warn!(
                    "Unexpected chip status {:#04x} on bus {} at {:#04x}",
                    status, bus, address
                );
                DeviceIdentity::absent(bus, address)
            }
        },
        Err(e) => {
            warn!("No DAC answering on bus {} at {:#04x}: {}", bus, address, e);
            DeviceIdentity::absent(bus, address)
        }
    };

    gateway.set_enabled(identity.found);
    identity
}

/// Write the initialization table and the initial volume
///
/// The mute bit is forced first. If that write fails nothing else is
/// attempted. Later failures are logged and skipped. With `unmute` the mute
/// bit is released at the end.
pub async fn initialize(gateway: &BusGateway, attenuation: (u8, u8), unmute: bool) -> DacResult<()> {
    gateway.shadow().reset();
    gateway
        .update_bits(REG_GENERAL, GENERAL_MUTE, GENERAL_MUTE)
        .await?;

    for (reg, value) in INIT_SEQUENCE {
        if let Err(e) = gateway.write(*reg, *value).await {
            warn!("Init write {:#04x} <- {:#04x} failed: {}", reg, value, e);
        }
    }

    let (left, right) = attenuation;
    for (reg, value) in [(REG_VOLUME_LEFT, left), (REG_VOLUME_RIGHT, right)] {
        if let Err(e) = gateway.write(reg, value).await {
            warn!("Initial volume write {:#04x} failed: {}", reg, e);
        }
    }

    if unmute {
        gateway.update_bits(REG_GENERAL, GENERAL_MUTE, 0).await?;
    }
    debug!("DAC initialized (muted: {})", !unmute);
    Ok(())
}
