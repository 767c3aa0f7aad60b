//! Connection-per-command link to one shutter or Hartmann door controller.
//!
//! ## State machine
//!
//! ```text
//! Idle -> Connecting -> AwaitingReply -> { Done | Error | Timeout } -> Idle
//! ```
//!
//! Each exchange opens its own connection and closes it before the call
//! returns, on every path including errors and cancellation.
//!
//! ## Recovery
//!
//! An `ERR` reply or an ajar status (bit-pair 00/11) triggers exactly one
//! `home` command sent through the raw exchange path. The home reply is never
//! itself recovered, so there is no loop. The link performs no other retries.
//!
//! ## Last-known position
//!
//! The last-known position gates non-forced open/close. It is set to
//! `Unknown` before any motion command is written, so a dropped future leaves
//! the device requiring a fresh status query.

use crate::error::{AppResult, IebError};
use crate::hardware::backplane::RelayBackplane;
use crate::hardware::connection::{Deadline, Session};
use crate::protocol::{
    classify_reply, decode_status, encode, CommandReply, DeviceClass, LastKnown, MotorCommand,
    MotorStatus, Position, StatusReport, CR,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Immutable identity of a physical motor controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    /// Spectrograph unit id.
    pub unit: String,
    /// Mechanism kind.
    pub class: DeviceClass,
    /// `host:port` of the controller.
    pub endpoint: String,
}

impl DeviceIdentity {
    /// Creates an identity.
    pub fn new(unit: impl Into<String>, class: DeviceClass, endpoint: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            class,
            endpoint: endpoint.into(),
        }
    }

    /// `unit.class` label used in errors and logs.
    pub fn label(&self) -> String {
        format!("{}.{}", self.unit, self.class)
    }
}

/// Deadlines for one motor link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorTimeouts {
    /// TCP connect.
    pub connect: Duration,
    /// Reply to status, init, home and auxiliary commands.
    pub command: Duration,
    /// Reply to open/close; must exceed the slowest mechanical transit.
    pub transit: Duration,
}

impl Default for MotorTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            command: Duration::from_secs(1),
            transit: Duration::from_secs(4),
        }
    }
}

impl MotorTimeouts {
    fn reply_for(&self, command: MotorCommand) -> Duration {
        if command.is_transit() {
            self.transit
        } else {
            self.command
        }
    }
}

/// Exchange state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    /// No exchange in progress.
    Idle,
    /// Opening the connection.
    Connecting,
    /// Request written, waiting for a terminal reply.
    AwaitingReply,
    /// Terminal `DONE` or status reply received.
    Done,
    /// `ERR` reply, protocol or connection failure.
    Error,
    /// No terminal reply before the deadline.
    Timeout,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "IDLE",
            LinkState::Connecting => "CONNECTING",
            LinkState::AwaitingReply => "AWAITING_REPLY",
            LinkState::Done => "DONE",
            LinkState::Error => "ERROR",
            LinkState::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// Link to one motor controller.
pub struct MotorLink {
    identity: DeviceIdentity,
    label: String,
    timeouts: MotorTimeouts,
    backplane: Option<Arc<RelayBackplane>>,
    // Serializes whole operations (including multi-exchange moves).
    op_lock: tokio::sync::Mutex<()>,
    last_known: parking_lot::Mutex<LastKnown>,
    state: parking_lot::Mutex<LinkState>,
}

impl MotorLink {
    /// Creates a link without power gating.
    pub fn new(identity: DeviceIdentity, timeouts: MotorTimeouts) -> Self {
        Self {
            label: identity.label(),
            identity,
            timeouts,
            backplane: None,
            op_lock: tokio::sync::Mutex::new(()),
            last_known: parking_lot::Mutex::new(LastKnown::NeverQueried),
            state: parking_lot::Mutex::new(LinkState::Idle),
        }
    }

    /// Gates every operation on the backplane's power state for this device.
    pub fn with_backplane(mut self, backplane: Arc<RelayBackplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    /// Identity of the controller.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Mechanism kind.
    pub fn class(&self) -> DeviceClass {
        self.identity.class
    }

    /// Current exchange state.
    pub fn link_state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Last-known position.
    pub fn last_known(&self) -> LastKnown {
        *self.last_known.lock()
    }

    /// Sends `command` and returns the resulting status.
    ///
    /// The command is validated against the class table before any I/O. A
    /// non-forced open (close) of a device that is open (closed) issues no
    /// motion and only returns a fresh status. Without a definite last-known
    /// position the status is queried before deciding. After a `DONE` the
    /// status is re-queried rather than assumed.
    pub async fn send(&self, command: MotorCommand, force: bool) -> AppResult<StatusReport> {
        command.code(self.identity.class)?;
        let _op = self.op_lock.lock().await;

        if command == MotorCommand::Status {
            return self.status_locked().await;
        }
        if let Some(report) = self.power_gate().await? {
            return Ok(report);
        }

        if command.is_transit() && !force {
            let fresh = match self.last_known() {
                LastKnown::Open | LastKnown::Closed => None,
                _ => Some(self.status_locked().await?),
            };
            if self.last_known() == target_of(command) {
                debug!(device = %self.label, %command, "already at target, no transition");
                return match fresh {
                    Some(report) => Ok(report),
                    None => self.status_locked().await,
                };
            }
        }

        self.execute(command).await?;
        self.status_locked().await
    }

    /// Queries the status.
    ///
    /// An ajar reading triggers one corrective home. The pre-home status is
    /// returned and the last-known position becomes `Unknown`.
    pub async fn get_status(&self) -> AppResult<StatusReport> {
        let _op = self.op_lock.lock().await;
        self.status_locked().await
    }

    /// Drives the mechanism open (`Some(true)`), closed (`Some(false)`) or to
    /// the opposite of its current position (`None`).
    ///
    /// Returns whether a motion command was issued. Fails with
    /// [`IebError::InvalidState`] if the current position is indeterminate.
    pub async fn r#move(&self, open: Option<bool>, force: bool) -> AppResult<bool> {
        let _op = self.op_lock.lock().await;

        let current = self.status_locked().await?;
        if current.status.is_indeterminate() {
            return Err(IebError::InvalidState {
                device: self.label.clone(),
                detail: format!("refusing to move from {:?}", current.status),
            });
        }

        let target = open.unwrap_or(!current.is_open());
        if target == current.is_open() && !force {
            debug!(device = %self.label, open = target, "already at target, no transition");
            return Ok(false);
        }

        let command = if target {
            MotorCommand::Open
        } else {
            MotorCommand::Close
        };
        self.execute(command).await?;
        Ok(true)
    }

    async fn power_gate(&self) -> AppResult<Option<StatusReport>> {
        let Some(backplane) = &self.backplane else {
            return Ok(None);
        };
        if backplane.power_state(self.identity.class).await? {
            return Ok(None);
        }
        debug!(device = %self.label, "controller unpowered, skipping motor I/O");
        self.set_last_known(LastKnown::Unknown);
        Ok(Some(StatusReport::powered_off()))
    }

    async fn status_locked(&self) -> AppResult<StatusReport> {
        if let Some(report) = self.power_gate().await? {
            return Ok(report);
        }
        let power = if self.backplane.is_some() {
            MotorStatus::POWER_ON
        } else {
            MotorStatus::POWER_UNKNOWN
        };

        let reply = match self.exchange(MotorCommand::Status).await {
            Ok(reply) => reply,
            Err(e) => {
                self.set_last_known(LastKnown::Unknown);
                return Err(e);
            }
        };
        let (position, bits) = match decode_status(self.identity.class, &reply) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.set_last_known(LastKnown::Unknown);
                if let Some(CommandReply::Error(token)) = classify_reply(&reply) {
                    return Err(self.recover(MotorCommand::Status, token).await);
                }
                return Err(e);
            }
        };

        let report = StatusReport {
            status: power | position.flag(),
            bits: Some(bits),
        };

        if position == Position::Invalid {
            warn!(device = %self.label, bits = %bits, "position invalid, homing");
            self.set_last_known(LastKnown::Unknown);
            self.home_once().await?;
            return Ok(report);
        }

        self.set_last_known(LastKnown::from_status(report.status));
        Ok(report)
    }

    /// Runs a non-status command; an `ERR` reply homes once, then fails.
    async fn execute(&self, command: MotorCommand) -> AppResult<()> {
        if command.is_transit() {
            self.set_last_known(LastKnown::Unknown);
        }
        info!(device = %self.label, %command, "sending command");

        let reply = self.exchange(command).await?;
        match classify_reply(&reply) {
            Some(CommandReply::Done) => {
                if command == MotorCommand::Home {
                    self.set_last_known(LastKnown::Unknown);
                }
                Ok(())
            }
            Some(CommandReply::Error(token)) => Err(self.recover(command, token).await),
            None => Err(self.protocol_error(&reply)),
        }
    }

    /// Homes once after an `ERR` reply to `command` and builds the error to
    /// surface. A failing home replaces the controller error.
    async fn recover(&self, command: MotorCommand, token: String) -> IebError {
        warn!(device = %self.label, %command, reply = %token, "controller error, homing");
        if let Err(home_error) = self.home_once().await {
            return home_error;
        }
        IebError::Controller {
            device: self.label.clone(),
            command: command.to_string(),
            reply: token,
        }
    }

    /// One corrective home. Its own failure propagates; it is never recovered.
    async fn home_once(&self) -> AppResult<()> {
        self.set_last_known(LastKnown::Unknown);
        let reply = self.exchange(MotorCommand::Home).await?;
        match classify_reply(&reply) {
            Some(CommandReply::Done) => {
                info!(device = %self.label, "self-home complete");
                Ok(())
            }
            Some(CommandReply::Error(token)) => Err(IebError::Controller {
                device: self.label.clone(),
                command: MotorCommand::Home.to_string(),
                reply: token,
            }),
            None => Err(self.protocol_error(&reply)),
        }
    }

    /// One request/reply over a fresh connection.
    ///
    /// Status replies are the first CR-terminated segment. Other commands read
    /// segments until one carries `DONE` or `ERR`; the accumulated reply is
    /// returned.
    async fn exchange(&self, command: MotorCommand) -> AppResult<Vec<u8>> {
        let frame = encode(self.identity.class, command)?;
        let mut tracker = StateTracker::new(self);

        tracker.enter(LinkState::Connecting);
        let opened =
            Session::open(&self.label, &self.identity.endpoint, self.timeouts.connect).await;
        let mut session = match opened {
            Ok(session) => session,
            Err(e) => {
                tracker.fail(&e);
                return Err(e);
            }
        };

        tracker.enter(LinkState::AwaitingReply);
        let deadline = Deadline::after(self.timeouts.reply_for(command));
        let result = self.converse(&mut session, command, &frame, deadline).await;
        session.close().await;

        match &result {
            Ok(_) => tracker.enter(LinkState::Done),
            Err(e) => tracker.fail(e),
        }
        result
    }

    async fn converse(
        &self,
        session: &mut Session,
        command: MotorCommand,
        frame: &[u8],
        deadline: Deadline,
    ) -> AppResult<Vec<u8>> {
        session.send(frame, deadline).await?;
        let operation = format!("reply to '{command}'");

        if command == MotorCommand::Status {
            return session.read_segment(CR, deadline, &operation).await;
        }

        let mut reply = Vec::new();
        loop {
            let segment = session.read_segment(CR, deadline, &operation).await?;
            reply.extend_from_slice(&segment);
            if classify_reply(&reply).is_some() {
                return Ok(reply);
            }
        }
    }

    fn set_last_known(&self, value: LastKnown) {
        *self.last_known.lock() = value;
    }

    fn protocol_error(&self, reply: &[u8]) -> IebError {
        IebError::Protocol {
            device: self.label.clone(),
            detail: format!("unexpected reply {:?}", String::from_utf8_lossy(reply)),
        }
    }
}

fn target_of(command: MotorCommand) -> LastKnown {
    match command {
        MotorCommand::Open => LastKnown::Open,
        _ => LastKnown::Closed,
    }
}

/// Records state transitions and returns the link to `Idle` when dropped, so
/// a cancelled exchange never leaves a stale state behind.
struct StateTracker<'a> {
    link: &'a MotorLink,
}

impl<'a> StateTracker<'a> {
    fn new(link: &'a MotorLink) -> Self {
        Self { link }
    }

    fn enter(&mut self, next: LinkState) {
        let mut state = self.link.state.lock();
        let from = *state;
        debug!(device = %self.link.label, %from, to = %next, "link state");
        *state = next;
    }

    fn fail(&mut self, error: &IebError) {
        let next = if error.is_timeout() {
            LinkState::Timeout
        } else {
            LinkState::Error
        };
        self.enter(next);
    }
}

impl Drop for StateTracker<'_> {
    fn drop(&mut self) {
        self.enter(LinkState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tracing_test::traced_test;

    /// Serves one reply per connection, in order.
    async fn serve(replies: Vec<&'static [u8]>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for reply in replies {
                let (stream, _) = listener.accept().await.unwrap();
                let mut reader = BufReader::new(stream);
                let mut request = Vec::new();
                reader.read_until(b'\r', &mut request).await.unwrap();
                reader.get_mut().write_all(reply).await.unwrap();
            }
        });
        addr.to_string()
    }

    #[tokio::test]
    #[traced_test]
    async fn test_ajar_status_logs_self_home() {
        let endpoint = serve(vec![b"\x00\x07IS=00000000\r", b"\x00\x07%DONE\r"]).await;
        let link = MotorLink::new(
            DeviceIdentity::new("sp1", DeviceClass::Shutter, endpoint),
            MotorTimeouts::default(),
        );

        let report = link.get_status().await.unwrap();

        assert!(report.status.contains(MotorStatus::POSITION_INVALID));
        assert_eq!(link.last_known(), LastKnown::Unknown);
        assert_eq!(link.link_state(), LinkState::Idle);
        assert_eq!(link.identity().label(), "sp1.shutter");
        assert!(logs_contain("position invalid, homing"));
        assert!(logs_contain("self-home complete"));
    }

    #[test]
    fn transit_commands_get_the_long_deadline() {
        let timeouts = MotorTimeouts::default();
        assert_eq!(timeouts.reply_for(MotorCommand::Open), timeouts.transit);
        assert_eq!(timeouts.reply_for(MotorCommand::Close), timeouts.transit);
        assert_eq!(timeouts.reply_for(MotorCommand::Home), timeouts.command);
        assert_eq!(LinkState::AwaitingReply.to_string(), "AWAITING_REPLY");
    }
}
