//! Per-call TCP session shared by the ASCII device links.
//!
//! Every link opens a fresh session for one request/reply exchange and tears
//! it down before returning. No socket outlives the call that opened it.

use crate::error::{AppResult, IebError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace};

/// An open connection to one device endpoint.
pub struct Session {
    reader: BufReader<TcpStream>,
    device: String,
    endpoint: String,
}

impl Session {
    /// Connects to `endpoint` (`host:port`) within `connect_timeout`.
    pub async fn open(device: &str, endpoint: &str, connect_timeout: Duration) -> AppResult<Self> {
        let stream = match timeout(connect_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(IebError::Connection {
                    device: device.to_string(),
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(IebError::Timeout {
                    device: device.to_string(),
                    operation: format!("connect to {endpoint}"),
                    after: connect_timeout,
                })
            }
        };
        // Small frames; do not let Nagle hold the request back.
        stream.set_nodelay(true)?;
        debug!(device, endpoint, "connected");

        Ok(Self {
            reader: BufReader::new(stream),
            device: device.to_string(),
            endpoint: endpoint.to_string(),
        })
    }

    /// Writes a complete request frame.
    pub async fn send(&mut self, frame: &[u8], deadline: Deadline) -> AppResult<()> {
        trace!(device = %self.device, frame = ?String::from_utf8_lossy(frame), "tx");
        let stream = self.reader.get_mut();
        match timeout_at(deadline.at, async {
            stream.write_all(frame).await?;
            stream.flush().await
        })
        .await
        {
            Ok(result) => result.map_err(|e| self.connection_error(e)),
            Err(_) => Err(self.timeout_error("request write", deadline)),
        }
    }

    /// Reads one segment up to and including `terminator`.
    ///
    /// Fails with [`IebError::Timeout`] if the deadline passes first and with
    /// [`IebError::Connection`] if the peer closes before the terminator.
    pub async fn read_segment(
        &mut self,
        terminator: u8,
        deadline: Deadline,
        operation: &str,
    ) -> AppResult<Vec<u8>> {
        let mut segment = Vec::new();
        let read = timeout_at(deadline.at, self.reader.read_until(terminator, &mut segment)).await;
        match read {
            Ok(Ok(_)) if segment.last() == Some(&terminator) => {
                trace!(device = %self.device, segment = ?String::from_utf8_lossy(&segment), "rx");
                Ok(segment)
            }
            Ok(Ok(_)) => Err(IebError::Connection {
                device: self.device.clone(),
                endpoint: self.endpoint.clone(),
                reason: format!(
                    "connection closed before reply was complete ({:?})",
                    String::from_utf8_lossy(&segment)
                ),
            }),
            Ok(Err(e)) => Err(self.connection_error(e)),
            Err(_) => Err(self.timeout_error(operation, deadline)),
        }
    }

    /// Shuts the connection down. Errors are irrelevant at this point.
    pub async fn close(mut self) {
        let _ = self.reader.get_mut().shutdown().await;
        debug!(device = %self.device, endpoint = %self.endpoint, "closed");
    }

    fn connection_error(&self, e: std::io::Error) -> IebError {
        IebError::Connection {
            device: self.device.clone(),
            endpoint: self.endpoint.clone(),
            reason: e.to_string(),
        }
    }

    fn timeout_error(&self, operation: &str, deadline: Deadline) -> IebError {
        IebError::Timeout {
            device: self.device.clone(),
            operation: operation.to_string(),
            after: deadline.span,
        }
    }
}

/// Absolute deadline for one exchange, remembering the span it was built from.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    span: Duration,
}

impl Deadline {
    /// Deadline `span` from now.
    pub fn after(span: Duration) -> Self {
        Self {
            at: Instant::now() + span,
            span,
        }
    }
}
