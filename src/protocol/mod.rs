//! Wire-level codecs for the motor controllers.
//!
//! Everything here is pure: no I/O, no clocks. The links in
//! [`crate::hardware`] own the connections and call into these functions.

pub mod frame;
pub mod status;

pub use frame::{
    classify_reply, decode_status, encode, CommandReply, DeviceClass, MotorCommand, CR,
};
pub use status::{LastKnown, MotorStatus, Position, RawStatusBits, StatusReport};
