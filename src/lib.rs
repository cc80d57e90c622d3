//! ES9018K2M DAC gateway
//!
//! Keeps the DAC's mute, attenuation and filter registers in sync with a
//! playback engine without audible clicks:
//! - [`dac`]: register map, shadow, throttled bus gateway, volume mapper, bootstrap
//! - [`sequencer`]: mute intents, seek mute and graceful fades
//! - [`feed`]: push feed with reconnect backoff and degraded polling
//! - [`controller`]: the context object consuming every state update

pub mod config;
pub mod controller;
pub mod dac;
pub mod engine;
pub mod error;
pub mod feed;
pub mod sequencer;
pub mod timer;

pub use controller::{ControllerSettings, ControllerStatus, DacController};
pub use error::{BusError, ConnectionError, DacError, DacResult};
