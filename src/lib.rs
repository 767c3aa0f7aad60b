//! Core library for the spectrograph enclosure electronics.
//!
//! This library contains the wire codecs, device links and unit aggregate
//! that drive the shutters, Hartmann doors, power relays and environmental
//! sensors of each spectrograph unit. It is used by the `ieb` command-line
//! tool and by any dispatch layer that embeds it.
//!
//! - [`protocol`]: pure frame/status codecs for the motor controllers
//! - [`hardware`]: per-device links (motor, backplane, transducer, depth)
//! - [`group`]: [`group::DeviceGroup`] per unit and the [`group::Enclosure`]
//!   registry
//! - [`config`]: figment-based settings

pub mod config;
pub mod error;
pub mod error_recovery;
pub mod group;
pub mod hardware;
pub mod protocol;

pub use error::{AppResult, IebError};
pub use group::{DeviceGroup, Enclosure, HartmannSide};
