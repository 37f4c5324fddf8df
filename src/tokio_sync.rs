//! Synchronous `tokio-modbus` transport.
//!
//! [`ModbusLink`] implements [`Transport`] on top of a `tokio-modbus`
//! synchronous client context. Use it with an RS-485 adapter that switches
//! the transceiver direction automatically, or with a Modbus TCP gateway in
//! front of the bus.
//!
//! # Examples
//!
//! ## TCP Gateway Example
//!
//! ```no_run
//! use soilmon_lib::tokio_sync::ModbusLink;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let link = ModbusLink::connect_tcp("192.168.1.100:502".parse()?, Duration::from_secs(1))?;
//!     Ok(())
//! }
//! ```
use crate::codec::ReadRequest;
use crate::link::Transport;
use crate::protocol as proto;
use crate::{Error, Result};
use log::*;
use std::fmt;
use std::time::Duration;
use tokio_modbus::client::sync::Context;
use tokio_modbus::prelude::SyncReader;
use tokio_modbus::{slave::SlaveContext, Slave};

/// A transport backed by a `tokio-modbus` synchronous context.
pub struct ModbusLink {
    ctx: Context,
}

// `Context` has no `Debug` impl.
impl fmt::Debug for ModbusLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusLink")
            .field("timeout", &self.ctx.timeout())
            .finish_non_exhaustive()
    }
}

impl ModbusLink {
    /// Wraps an existing synchronous context.
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Connects to a Modbus TCP gateway.
    #[cfg(feature = "tokio-tcp-sync")]
    pub fn connect_tcp(socket_addr: std::net::SocketAddr, timeout: Duration) -> Result<Self> {
        let mut ctx = tokio_modbus::client::sync::tcp::connect(socket_addr)
            .map_err(|err| Error::LinkUnavailable(format!("{socket_addr}: {err}")))?;
        ctx.set_timeout(timeout);
        info!("Connected to Modbus TCP gateway {socket_addr}");
        Ok(Self { ctx })
    }

    /// Opens a serial port with an auto-direction RS-485 adapter.
    #[cfg(feature = "tokio-rtu-sync")]
    pub fn connect_rtu(settings: &crate::link::LinkSettings) -> Result<Self> {
        let builder =
            crate::tokio_common::serial_port_builder(&settings.device, &settings.baud_rate);
        let mut ctx = tokio_modbus::client::sync::rtu::connect_slave(&builder, Slave(1))
            .map_err(|err| Error::LinkUnavailable(format!("{}: {err}", settings.device)))?;
        ctx.set_timeout(settings.timeout);
        info!(
            "Opened {} at {} baud via tokio-modbus",
            settings.device, settings.baud_rate
        );
        Ok(Self { ctx })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.ctx.set_timeout(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.ctx.timeout()
    }

    /// Helper function to map tokio result to our result.
    fn map_tokio_result<T>(result: tokio_modbus::Result<T>) -> Result<T> {
        match result {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err.into()), // Modbus exception
            Err(err) => Err(err.into()),     // IO or protocol error
        }
    }
}

impl Transport for ModbusLink {
    fn transact(&mut self, request: &ReadRequest) -> Result<Vec<u16>> {
        if request.function != proto::READ_HOLDING_REGISTERS {
            return Err(Error::Configuration(format!(
                "function code {:#04x} is not supported",
                request.function
            )));
        }
        self.ctx.set_slave(Slave(*request.address));
        Self::map_tokio_result(self.ctx.read_holding_registers(request.start, request.count))
    }
}

#[cfg(all(test, feature = "tokio-tcp-sync"))]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn debug_shows_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let link =
            ModbusLink::connect_tcp(listener.local_addr().unwrap(), Duration::from_millis(250))
                .unwrap();
        assert_eq!(
            format!("{link:?}"),
            "ModbusLink { timeout: Some(250ms), .. }"
        );
    }
}
