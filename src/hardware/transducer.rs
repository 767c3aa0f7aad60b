//! Pressure/temperature transducer on a camera dewar.
//!
//! Query `@<id>P?\` (pressure) or `@<id>T?\` (temperature); the reply is
//! `@<id>ACK<float>\`. One connection per query.

use crate::error::{AppResult, IebError};
use crate::hardware::connection::{Deadline, Session};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Default transducer address on the serial-over-TCP line.
pub const DEFAULT_TRANSDUCER_ID: u16 = 253;

const TERMINATOR: u8 = b'\\';

#[allow(clippy::expect_used)]
static ACK_REPLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@[0-9]{1,3}ACK([0-9.E+-]+)\\$").expect("transducer reply pattern is valid")
});

/// Quantity read from a transducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// Pressure, in the gauge's configured unit.
    Pressure,
    /// Sensor temperature in °C.
    Temperature,
}

impl Quantity {
    fn code(self) -> char {
        match self {
            Quantity::Pressure => 'P',
            Quantity::Temperature => 'T',
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Quantity::Pressure => "pressure",
            Quantity::Temperature => "temperature",
        }
    }
}

/// Link to one transducer.
pub struct TransducerLink {
    label: String,
    endpoint: String,
    id: u16,
    connect_timeout: Duration,
    reply_timeout: Duration,
    lock: Mutex<()>,
}

impl TransducerLink {
    /// Creates a link to transducer `id` behind `endpoint`.
    pub fn new(
        label: impl Into<String>,
        endpoint: impl Into<String>,
        id: u16,
        connect_timeout: Duration,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            endpoint: endpoint.into(),
            id,
            connect_timeout,
            reply_timeout,
            lock: Mutex::new(()),
        }
    }

    /// Label used in errors and logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Reads the pressure.
    pub async fn read_pressure(&self) -> AppResult<f64> {
        self.query(Quantity::Pressure).await
    }

    /// Reads the temperature.
    pub async fn read_temperature(&self) -> AppResult<f64> {
        self.query(Quantity::Temperature).await
    }

    async fn query(&self, quantity: Quantity) -> AppResult<f64> {
        let _guard = self.lock.lock().await;
        let request = format!("@{}{}?\\", self.id, quantity.code());

        let mut session = Session::open(&self.label, &self.endpoint, self.connect_timeout).await?;
        let deadline = Deadline::after(self.reply_timeout);
        let reply = match session.send(request.as_bytes(), deadline).await {
            Ok(()) => session.read_segment(TERMINATOR, deadline, quantity.as_str()).await,
            Err(e) => Err(e),
        };
        session.close().await;

        let value = parse_ack(&self.label, &reply?)?;
        debug!(device = %self.label, quantity = quantity.as_str(), value, "transducer read");
        Ok(value)
    }
}

/// Extracts the value of an `@<id>ACK<float>\` reply.
pub fn parse_ack(device: &str, reply: &[u8]) -> AppResult<f64> {
    let parse_error = || IebError::Parse {
        device: device.to_string(),
        reply: String::from_utf8_lossy(reply).into_owned(),
    };

    let digits = ACK_REPLY
        .captures(reply)
        .and_then(|c| c.get(1))
        .ok_or_else(parse_error)?;
    std::str::from_utf8(digits.as_bytes())
        .ok()
        .and_then(|text| text.parse::<f64>().ok())
        .ok_or_else(parse_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scientific_notation() {
        let value = parse_ack("b1", b"@253ACK1.23E-6\\").unwrap();
        assert!((value - 1.23e-6).abs() < 1e-12);
        assert_eq!(parse_ack("b1", b"@001ACK-150.5\\").unwrap(), -150.5);
    }

    #[test]
    fn rejects_nak_and_garbage() {
        for reply in [&b"@253NAK160\\"[..], b"@253ACK\\", b"@253ACK1.2.3\\", b""] {
            assert!(matches!(parse_ack("b1", reply), Err(IebError::Parse { .. })));
        }
    }
}
