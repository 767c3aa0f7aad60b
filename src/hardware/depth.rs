//! Linear depth gauge measuring detector focus.
//!
//! Query `SEND <channel>\n`; the reply is `<channel> <float> mm`, optionally
//! prefixed with CR, terminated by LF.

use crate::error::{AppResult, IebError};
use crate::hardware::connection::{Deadline, Session};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[allow(clippy::expect_used)]
static DEPTH_REPLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\r?(\S+) ([+\-0-9.]+) mm").expect("depth reply pattern is valid")
});

/// Link to one depth gauge.
pub struct DepthLink {
    label: String,
    endpoint: String,
    channels: Vec<String>,
    camera: parking_lot::Mutex<Option<String>>,
    connect_timeout: Duration,
    reply_timeout: Duration,
    lock: Mutex<()>,
}

impl DepthLink {
    /// Creates a link reading `channels` from `endpoint`.
    pub fn new(
        label: impl Into<String>,
        endpoint: impl Into<String>,
        channels: Vec<String>,
        connect_timeout: Duration,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            endpoint: endpoint.into(),
            channels,
            camera: parking_lot::Mutex::new(None),
            connect_timeout,
            reply_timeout,
            lock: Mutex::new(()),
        }
    }

    /// Configured channel names.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Records which camera the gauge is currently mounted on.
    pub fn set_camera(&self, camera: impl Into<String>) {
        *self.camera.lock() = Some(camera.into());
    }

    /// Camera the gauge is mounted on, if known.
    pub fn camera(&self) -> Option<String> {
        self.camera.lock().clone()
    }

    /// Reads one channel, in millimetres.
    pub async fn read_channel(&self, channel: &str) -> AppResult<f64> {
        if !self.channels.iter().any(|c| c == channel) {
            return Err(IebError::UnknownDevice(format!("{}.{channel}", self.label)));
        }
        let _guard = self.lock.lock().await;

        let mut session = Session::open(&self.label, &self.endpoint, self.connect_timeout).await?;
        let deadline = Deadline::after(self.reply_timeout);
        let request = format!("SEND {channel}\n");
        let reply = match session.send(request.as_bytes(), deadline).await {
            Ok(()) => {
                session
                    .read_segment(b'\n', deadline, &format!("channel {channel}"))
                    .await
            }
            Err(e) => Err(e),
        };
        session.close().await;

        let value = parse_depth(&self.label, channel, &reply?)?;
        debug!(device = %self.label, channel, value, "depth read");
        Ok(value)
    }

    /// Reads every configured channel in order. The first failure aborts.
    pub async fn read_all(&self) -> AppResult<BTreeMap<String, f64>> {
        let mut values = BTreeMap::new();
        for channel in &self.channels {
            values.insert(channel.clone(), self.read_channel(channel).await?);
        }
        Ok(values)
    }
}

/// Extracts the value of a `<channel> <float> mm` reply for `channel`.
pub fn parse_depth(device: &str, channel: &str, reply: &[u8]) -> AppResult<f64> {
    let parse_error = || IebError::Parse {
        device: device.to_string(),
        reply: String::from_utf8_lossy(reply).into_owned(),
    };

    let captures = DEPTH_REPLY.captures(reply).ok_or_else(parse_error)?;
    let name = captures.get(1).map(|m| m.as_bytes()).ok_or_else(parse_error)?;
    if name != channel.as_bytes() {
        return Err(parse_error());
    }
    captures
        .get(2)
        .and_then(|m| std::str::from_utf8(m.as_bytes()).ok())
        .and_then(|text| text.parse::<f64>().ok())
        .ok_or_else(parse_error)
}
