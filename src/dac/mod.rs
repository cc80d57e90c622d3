//! ES9018K2M device layer
//!
//! Register map, register shadow, the serialized bus gateway and its
//! transports, the volume mapper and the bootstrap sequence.

pub mod bootstrap;
pub mod bus;
pub mod filters;
pub mod mock;
pub mod registers;
pub mod shadow;
pub mod transport;
pub mod volume;

pub use bootstrap::DeviceIdentity;
pub use filters::FilterSettings;
pub use bus::{BusGateway, BusSettings, BusStats, BusTransport};
pub use shadow::RegisterShadow;
pub use volume::{Balance, VolumeCurve, VolumeState};
