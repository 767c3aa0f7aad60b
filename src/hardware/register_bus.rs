//! Register-protocol transport for the relay/sensor backplane.

use crate::error::{AppResult, IebError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::debug;

/// Minimal register access needed by [`crate::hardware::RelayBackplane`].
#[async_trait]
pub trait RegisterBus: Send + Sync {
    /// `host:port` label used in errors and logs.
    fn endpoint(&self) -> &str;

    /// Reads `count` holding registers starting at `address`.
    async fn read_registers(&self, address: u16, count: u16) -> AppResult<Vec<u16>>;

    /// Writes a single coil.
    async fn write_coil(&self, address: u16, value: bool) -> AppResult<()>;
}

/// Modbus/TCP bus that connects per call and drops the connection on return.
#[derive(Debug, Clone)]
pub struct ModbusTcpBus {
    endpoint: String,
    slave: u8,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl ModbusTcpBus {
    /// Creates a bus for `host:port` addressing unit id `slave`.
    pub fn new(
        host: &str,
        port: u16,
        slave: u8,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Self {
        Self {
            endpoint: format!("{host}:{port}"),
            slave,
            connect_timeout,
            io_timeout,
        }
    }

    async fn resolve(&self) -> AppResult<SocketAddr> {
        lookup_host(&self.endpoint)
            .await
            .map_err(|e| self.fieldbus_error(format!("cannot resolve: {e}")))?
            .next()
            .ok_or_else(|| self.fieldbus_error("no address for host".to_string()))
    }

    async fn connect(&self) -> AppResult<Context> {
        let addr = self.resolve().await?;
        match timeout(self.connect_timeout, tcp::connect_slave(addr, Slave(self.slave))).await {
            Ok(Ok(ctx)) => Ok(ctx),
            Ok(Err(e)) => Err(IebError::Connection {
                device: "backplane".to_string(),
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(IebError::Timeout {
                device: "backplane".to_string(),
                operation: format!("connect to {}", self.endpoint),
                after: self.connect_timeout,
            }),
        }
    }

    fn fieldbus_error(&self, detail: String) -> IebError {
        IebError::Fieldbus {
            endpoint: self.endpoint.clone(),
            detail,
        }
    }

    fn timeout_error(&self, operation: String) -> IebError {
        IebError::Timeout {
            device: "backplane".to_string(),
            operation,
            after: self.io_timeout,
        }
    }
}

#[async_trait]
impl RegisterBus for ModbusTcpBus {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn read_registers(&self, address: u16, count: u16) -> AppResult<Vec<u16>> {
        let mut ctx = self.connect().await?;
        let reply = timeout(self.io_timeout, ctx.read_holding_registers(address, count))
            .await
            .map_err(|_| self.timeout_error(format!("read of {count} registers at {address}")))?;

        match reply {
            Ok(Ok(words)) => {
                debug!(endpoint = %self.endpoint, address, count, "registers read");
                Ok(words)
            }
            Ok(Err(code)) => {
                Err(self.fieldbus_error(format!("exception {code:?} reading {address}")))
            }
            Err(e) => Err(self.fieldbus_error(e.to_string())),
        }
    }

    async fn write_coil(&self, address: u16, value: bool) -> AppResult<()> {
        let mut ctx = self.connect().await?;
        let reply = timeout(self.io_timeout, ctx.write_single_coil(address, value))
            .await
            .map_err(|_| self.timeout_error(format!("write of coil {address}")))?;

        match reply {
            Ok(Ok(())) => {
                debug!(endpoint = %self.endpoint, address, value, "coil written");
                Ok(())
            }
            Ok(Err(code)) => Err(self.fieldbus_error(format!(
                "exception {code:?} writing coil {address}"
            ))),
            Err(e) => Err(self.fieldbus_error(e.to_string())),
        }
    }
}
