//! Concrete bus transports
//!
//! - [`ShellTransport`] drives the chip through the i2c-tools binaries
//!   (`i2cset` / `i2cget`), which is what most single-board setups have.
//! - [`HalTransport`] wraps any blocking `embedded_hal::i2c::I2c`
//!   implementation, e.g. a Linux i2cdev handle.

use async_trait::async_trait;
use embedded_hal::i2c::Error as _;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use tokio::process::Command;
use tracing::trace;

use super::bus::BusTransport;
use crate::error::BusError;

/// Transport that shells out to i2c-tools
#[derive(Debug, Clone)]
pub struct ShellTransport {
    bus: u8,
    address: u8,
    i2cset: PathBuf,
    i2cget: PathBuf,
}

impl ShellTransport {
    pub fn new(bus: u8, address: u8, i2cset: impl Into<PathBuf>, i2cget: impl Into<PathBuf>) -> Self {
        Self {
            bus,
            address,
            i2cset: i2cset.into(),
            i2cget: i2cget.into(),
        }
    }

    async fn run(&self, program: &Path, reg: u8, args: &[String]) -> Result<Output, BusError> {
        trace!("{} {}", program.display(), args.join(" "));
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BusError::Transport {
                reg,
                reason: format!("failed to run {}: {}", program.display(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BusError::Transport {
                reg,
                reason: stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    fn base_args(&self, reg: u8) -> Vec<String> {
        vec![
            "-y".to_string(),
            self.bus.to_string(),
            format!("{:#04x}", self.address),
            format!("{:#04x}", reg),
        ]
    }
}

#[async_trait]
impl BusTransport for ShellTransport {
    fn describe(&self) -> String {
        format!("i2c-{}@{:#04x}", self.bus, self.address)
    }

    async fn write(&mut self, reg: u8, value: u8) -> Result<(), BusError> {
        let mut args = self.base_args(reg);
        args.push(format!("{:#04x}", value));
        self.run(&self.i2cset, reg, &args).await.map(|_| ())
    }

    async fn read(&mut self, reg: u8) -> Result<u8, BusError> {
        let args = self.base_args(reg);
        let output = self.run(&self.i2cget, reg, &args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_hex_byte(&stdout).ok_or_else(|| BusError::Transport {
            reg,
            reason: format!("unexpected i2cget output {:?}", stdout.trim()),
        })
    }
}

/// Parse an i2cget answer such as `0x1c`
pub(crate) fn parse_hex_byte(text: &str) -> Option<u8> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    let padded = match digits.len() {
        1 => format!("0{}", digits),
        2 => digits.to_string(),
        _ => return None,
    };
    hex::decode(padded).ok()?.first().copied()
}

/// Transport over a blocking embedded-hal I2C bus
///
/// Each transaction runs on the blocking pool so the runtime never stalls on
/// a slow bus.
pub struct HalTransport<I> {
    i2c: Arc<parking_lot::Mutex<I>>,
    address: u8,
}

impl<I> HalTransport<I>
where
    I: embedded_hal::i2c::I2c + Send + 'static,
{
    pub fn new(i2c: I, address: u8) -> Self {
        Self {
            i2c: Arc::new(parking_lot::Mutex::new(i2c)),
            address,
        }
    }

    async fn blocking<T, F>(&self, reg: u8, f: F) -> Result<T, BusError>
    where
        T: Send + 'static,
        F: FnOnce(&mut I, u8) -> Result<T, I::Error> + Send + 'static,
    {
        let i2c = Arc::clone(&self.i2c);
        let address = self.address;
        let joined = tokio::task::spawn_blocking(move || {
            f(&mut i2c.lock(), address).map_err(|e| format!("{:?}", e.kind()))
        })
        .await
        .map_err(|e| BusError::Transport {
            reg,
            reason: format!("i2c task failed: {}", e),
        })?;
        joined.map_err(|reason| BusError::Transport { reg, reason })
    }
}

#[async_trait]
impl<I> BusTransport for HalTransport<I>
where
    I: embedded_hal::i2c::I2c + Send + 'static,
{
    fn describe(&self) -> String {
        format!("i2c@{:#04x}", self.address)
    }

    async fn write(&mut self, reg: u8, value: u8) -> Result<(), BusError> {
        self.blocking(reg, move |i2c, addr| i2c.write(addr, &[reg, value]))
            .await
    }

    async fn read(&mut self, reg: u8) -> Result<u8, BusError> {
        self.blocking(reg, move |i2c, addr| {
            let mut buf = [0u8; 1];
            i2c.write_read(addr, &[reg], &mut buf)?;
            Ok(buf[0])
        })
        .await
    }
}
