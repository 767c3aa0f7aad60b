//! Device links for one spectrograph unit.
//!
//! - [`MotorLink`]: shutter and Hartmann door controllers
//! - [`RelayBackplane`]: power relays and environmental sensors over a
//!   [`RegisterBus`]
//! - [`TransducerLink`], [`DepthLink`]: scalar ASCII readers
//!
//! Every link owns its per-device state and opens one connection per call.

pub mod backplane;
pub mod connection;
pub mod depth;
pub mod mock;
pub mod motor;
pub mod register_bus;
pub mod register_map;
pub mod transducer;

pub use backplane::{RelayBackplane, RelayStates, SensorReadings};
pub use depth::DepthLink;
pub use mock::MockRegisterBus;
pub use motor::{DeviceIdentity, LinkState, MotorLink, MotorTimeouts};
pub use register_bus::{ModbusTcpBus, RegisterBus};
pub use register_map::{RelayClass, RelayRegisterMap, SensorLayout, SensorReading};
pub use transducer::{TransducerLink, DEFAULT_TRANSDUCER_ID};
