//! ASCII command frames and status replies of the shutter / Hartmann door
//! motor controllers.
//!
//! Request: `STX ENQ <code> CR` where `<code>` comes from a fixed per-class
//! table. Terminal replies end in CR and contain `DONE`, `ERR<n>` or
//! `IS=<8 binary digits>`.
//!
//! The status bit-pair is the first two digits after `IS=` (bytes 6 and 7 of
//! the frame, counting from one). The pair mapping is mirrored for the left
//! Hartmann door.

use crate::error::{AppResult, IebError};
use crate::protocol::status::{Position, RawStatusBits};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Start of frame.
pub const STX: u8 = 0x00;
/// Enquiry byte following STX.
pub const ENQ: u8 = 0x07;
/// Frame terminator.
pub const CR: u8 = 0x0D;

#[allow(clippy::expect_used)]
static STATUS_REPLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x00\x07IS=([01]{8})\r$").expect("status reply pattern is valid"));

#[allow(clippy::expect_used)]
static ERROR_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ERR[0-9]*").expect("error token pattern is valid"));

/// Kind of mechanism behind a motor controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// Exposure shutter.
    Shutter,
    /// Left Hartmann door.
    HartmannLeft,
    /// Right Hartmann door.
    HartmannRight,
}

impl DeviceClass {
    /// All classes, in configuration order.
    pub const ALL: [DeviceClass; 3] = [
        DeviceClass::Shutter,
        DeviceClass::HartmannLeft,
        DeviceClass::HartmannRight,
    ];

    /// Configuration name of the class.
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Shutter => "shutter",
            DeviceClass::HartmannLeft => "hartmann_left",
            DeviceClass::HartmannRight => "hartmann_right",
        }
    }

    /// Whether this is one of the Hartmann doors.
    pub fn is_door(self) -> bool {
        !matches!(self, DeviceClass::Shutter)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = IebError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shutter" => Ok(DeviceClass::Shutter),
            "hartmann_left" => Ok(DeviceClass::HartmannLeft),
            "hartmann_right" => Ok(DeviceClass::HartmannRight),
            other => Err(IebError::UnknownDevice(other.to_string())),
        }
    }
}

/// Logical motor-controller command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorCommand {
    /// Initialise the controller.
    Init,
    /// Drive to the reference position.
    Home,
    /// Open the mechanism.
    Open,
    /// Close the mechanism.
    Close,
    /// Timed exposure (shutter only).
    Flash,
    /// Shutter only.
    On,
    /// Shutter only.
    Off,
    /// Solid-state relay off (shutter only).
    SsrOff,
    /// Solid-state relay on (shutter only).
    SsrOn,
    /// Query the `IS` status byte.
    Status,
}

impl MotorCommand {
    /// Command name as used by the dispatch layer.
    pub fn as_str(self) -> &'static str {
        match self {
            MotorCommand::Init => "init",
            MotorCommand::Home => "home",
            MotorCommand::Open => "open",
            MotorCommand::Close => "close",
            MotorCommand::Flash => "flash",
            MotorCommand::On => "on",
            MotorCommand::Off => "off",
            MotorCommand::SsrOff => "ssroff",
            MotorCommand::SsrOn => "ssron",
            MotorCommand::Status => "status",
        }
    }

    /// Wire code for this command on a device of `class`.
    ///
    /// Fails with [`IebError::InvalidCommand`] for shutter-only commands sent
    /// to a Hartmann door.
    pub fn code(self, class: DeviceClass) -> AppResult<&'static str> {
        use DeviceClass::*;
        use MotorCommand::*;

        match (class, self) {
            (_, Init) => Ok("QX1"),
            (_, Home) => Ok("QX2"),
            (_, Open) => Ok("QX3"),
            (_, Close) => Ok("QX4"),
            (_, Status) => Ok("IS"),
            (Shutter, Flash) => Ok("QX5"),
            (Shutter, On) => Ok("QX8"),
            (Shutter, Off) => Ok("QX9"),
            (Shutter, SsrOff) => Ok("QX10"),
            (Shutter, SsrOn) => Ok("QX11"),
            (HartmannLeft | HartmannRight, Flash | On | Off | SsrOff | SsrOn) => {
                Err(IebError::InvalidCommand {
                    device: class.to_string(),
                    command: self.as_str().to_string(),
                })
            }
        }
    }

    /// Whether the command physically moves the mechanism between end stops.
    pub fn is_transit(self) -> bool {
        matches!(self, MotorCommand::Open | MotorCommand::Close)
    }
}

impl fmt::Display for MotorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MotorCommand {
    type Err = IebError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let command = match s.to_ascii_lowercase().as_str() {
            "init" => MotorCommand::Init,
            "home" => MotorCommand::Home,
            "open" => MotorCommand::Open,
            "close" => MotorCommand::Close,
            "flash" => MotorCommand::Flash,
            "on" => MotorCommand::On,
            "off" => MotorCommand::Off,
            "ssroff" => MotorCommand::SsrOff,
            "ssron" => MotorCommand::SsrOn,
            "status" => MotorCommand::Status,
            _ => {
                return Err(IebError::InvalidCommand {
                    device: "motor controller".to_string(),
                    command: s.to_string(),
                })
            }
        };
        Ok(command)
    }
}

/// Builds the request frame for `command` on a device of `class`.
pub fn encode(class: DeviceClass, command: MotorCommand) -> AppResult<Vec<u8>> {
    let code = command.code(class)?;
    let mut frame = Vec::with_capacity(code.len() + 3);
    frame.push(STX);
    frame.push(ENQ);
    frame.extend(code.bytes().map(|b| b.to_ascii_uppercase()));
    frame.push(CR);
    Ok(frame)
}

/// Outcome carried by a reply to a non-status command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// Controller finished the command.
    Done,
    /// Controller reported an error; holds the `ERR<n>` token.
    Error(String),
}

/// Classifies an accumulated reply. `None` means no terminal token yet.
///
/// `ERR` takes precedence over `DONE` if both appear.
pub fn classify_reply(reply: &[u8]) -> Option<CommandReply> {
    if let Some(token) = ERROR_TOKEN.find(reply) {
        return Some(CommandReply::Error(
            String::from_utf8_lossy(token.as_bytes()).into_owned(),
        ));
    }
    if contains(reply, b"DONE") {
        return Some(CommandReply::Done);
    }
    None
}

/// Decodes an `IS=` reply into the position and raw bits.
///
/// Any reply not matching `STX ENQ "IS=" <8 binary digits> CR` fails with
/// [`IebError::Protocol`] and is never interpreted as a position.
pub fn decode_status(class: DeviceClass, reply: &[u8]) -> AppResult<(Position, RawStatusBits)> {
    let digits = STATUS_REPLY
        .captures(reply)
        .and_then(|c| c.get(1))
        .ok_or_else(|| IebError::Protocol {
            device: class.to_string(),
            detail: format!("cannot match status reply {:?}", String::from_utf8_lossy(reply)),
        })?;

    let text = String::from_utf8_lossy(digits.as_bytes());
    let bits: RawStatusBits = text.parse().map_err(|detail| IebError::Protocol {
        device: class.to_string(),
        detail,
    })?;

    Ok((decode_pair(class, bits.position_pair()), bits))
}

/// Maps the leading bit-pair to a position for a device of `class`.
pub fn decode_pair(class: DeviceClass, pair: (bool, bool)) -> Position {
    let mirrored = matches!(class, DeviceClass::HartmannLeft);
    match (pair, mirrored) {
        ((true, false), false) | ((false, true), true) => Position::Open,
        ((false, true), false) | ((true, false), true) => Position::Closed,
        _ => Position::Invalid,
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
