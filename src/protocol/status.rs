//! Motor status flags and the raw status byte.

use bitflags::bitflags;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

bitflags! {
    /// Status of a motor controller, combined from the backplane power state
    /// and the position bit-pair of a fresh `IS` reply.
    ///
    /// Exactly one power flag and exactly one position flag are set in any
    /// status produced by [`crate::hardware::MotorLink`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MotorStatus: u8 {
        /// Backplane reports the controller powered.
        const POWER_ON = 0x01;
        /// Backplane reports the controller unpowered.
        const POWER_OFF = 0x02;
        /// No backplane attached to this link.
        const POWER_UNKNOWN = 0x04;
        /// Mechanism fully open.
        const OPEN = 0x10;
        /// Mechanism fully closed.
        const CLOSED = 0x20;
        /// Status bit-pair was 00 or 11 (ajar).
        const POSITION_INVALID = 0x40;
        /// Position was not queried (unpowered controller).
        const POSITION_UNKNOWN = 0x80;
    }
}

impl MotorStatus {
    /// True if the position is neither definitely open nor definitely closed.
    pub fn is_indeterminate(self) -> bool {
        self.intersects(MotorStatus::POSITION_INVALID | MotorStatus::POSITION_UNKNOWN)
    }

    /// Flag names, in bit order.
    pub fn names(self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

/// Position encoded by the status bit-pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    /// Fully open.
    Open,
    /// Fully closed.
    Closed,
    /// Bit-pair 00 or 11.
    Invalid,
}

impl Position {
    /// The matching position flag.
    pub fn flag(self) -> MotorStatus {
        match self {
            Position::Open => MotorStatus::OPEN,
            Position::Closed => MotorStatus::CLOSED,
            Position::Invalid => MotorStatus::POSITION_INVALID,
        }
    }
}

/// Verbatim 8-bit field of an `IS=` reply, leftmost digit first.
///
/// Kept alongside [`MotorStatus`] so auxiliary bits stay visible for
/// diagnostics even though only the leading pair is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawStatusBits(u8);

impl RawStatusBits {
    /// The bits as a byte, leftmost digit in the MSB.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Digit at `index` counted from the left (0..8).
    pub fn digit(self, index: usize) -> bool {
        debug_assert!(index < 8);
        self.0 & (0x80 >> index) != 0
    }

    /// The leading (open, closed) pair.
    pub fn position_pair(self) -> (bool, bool) {
        (self.digit(0), self.digit(1))
    }
}

impl fmt::Display for RawStatusBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08b}", self.0)
    }
}

impl FromStr for RawStatusBits {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 || !s.bytes().all(|b| b == b'0' || b == b'1') {
            return Err(format!("expected 8 binary digits, got {s:?}"));
        }
        u8::from_str_radix(s, 2)
            .map(Self)
            .map_err(|e| e.to_string())
    }
}

impl Serialize for RawStatusBits {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Result of a status query: flags plus the raw bits when a reply was decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Combined power and position flags.
    #[serde(serialize_with = "serialize_flag_names")]
    pub status: MotorStatus,
    /// Raw `IS` bits; `None` when the controller was not queried.
    pub bits: Option<RawStatusBits>,
}

impl StatusReport {
    /// Status synthesised for an unpowered controller, without any motor I/O.
    pub fn powered_off() -> Self {
        Self {
            status: MotorStatus::POWER_OFF | MotorStatus::POSITION_UNKNOWN,
            bits: None,
        }
    }

    /// Whether the status reports power on.
    pub fn is_powered(&self) -> bool {
        self.status.contains(MotorStatus::POWER_ON)
    }

    /// Whether the status reports a fully open mechanism.
    pub fn is_open(&self) -> bool {
        self.status.contains(MotorStatus::OPEN)
    }

    /// Whether the status reports a fully closed mechanism.
    pub fn is_closed(&self) -> bool {
        self.status.contains(MotorStatus::CLOSED)
    }
}

fn serialize_flag_names<S: Serializer>(
    status: &MotorStatus,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(status.names())
}

/// Last known position of a mechanism, owned by its link.
///
/// `NeverQueried` and `Unknown` are distinct: the former means no status was
/// ever read, the latter that the last query (or an interrupted move) left the
/// position indeterminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LastKnown {
    /// No status read since construction.
    #[default]
    NeverQueried,
    /// Last query failed, was ajar, or a move was interrupted.
    Unknown,
    /// Last query reported open.
    Open,
    /// Last query reported closed.
    Closed,
}

impl LastKnown {
    /// Derives the last-known position from a freshly read status.
    pub fn from_status(status: MotorStatus) -> Self {
        if status.contains(MotorStatus::OPEN) {
            LastKnown::Open
        } else if status.contains(MotorStatus::CLOSED) {
            LastKnown::Closed
        } else {
            LastKnown::Unknown
        }
    }
}
