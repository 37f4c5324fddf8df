//! Error taxonomy shared by every layer of the acquisition core.
//!
//! Per-attempt errors ([`Error::NoResponse`], [`Error::Timeout`],
//! [`Error::Corrupt`], [`Error::ShortResponse`], [`Error::DeviceFault`],
//! [`Error::Implausible`]) are absorbed by the retry loop of
//! [`crate::acquisition::SensorService`]. [`Error::LinkUnavailable`] and
//! [`Error::Configuration`] are only returned while constructing components
//! and must stop startup.
use crate::protocol::Parameter;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The serial port (or gateway) could not be opened.
    #[error("Link unavailable: {0}")]
    LinkUnavailable(String),

    /// Nothing was received within the timeout window.
    #[error("No response from device")]
    NoResponse,

    /// A partial response arrived but did not complete within the timeout window.
    #[error("Timed out waiting for a complete response")]
    Timeout,

    /// The response failed integrity or framing checks.
    #[error("Corrupt response: {0}")]
    Corrupt(String),

    /// The register block is shorter than the layout requires.
    #[error("Short response: expected {expected} registers, got {actual}")]
    ShortResponse { expected: usize, actual: usize },

    /// The device answered with a Modbus exception.
    #[error("Device fault: exception code {0:#04x}")]
    DeviceFault(u8),

    /// A calibrated value lies outside the configured plausibility limits.
    #[error("Implausible {parameter} value: {value}")]
    Implausible { parameter: Parameter, value: f64 },

    /// Invalid configuration, detected at initialization.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Returns `true` for errors scoped to a single transaction attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::LinkUnavailable(_) | Error::Configuration(_))
    }

    pub(crate) fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::NoResponse,
        }
    }
}

#[cfg(any(feature = "tokio-rtu-sync", feature = "tokio-tcp-sync"))]
impl From<tokio_modbus::Error> for Error {
    fn from(err: tokio_modbus::Error) -> Error {
        match err {
            tokio_modbus::Error::Transport(err) => Error::from_io(&err),
            other => Error::Corrupt(other.to_string()),
        }
    }
}

#[cfg(any(feature = "tokio-rtu-sync", feature = "tokio-tcp-sync"))]
impl From<tokio_modbus::ExceptionCode> for Error {
    fn from(code: tokio_modbus::ExceptionCode) -> Error {
        Error::DeviceFault(u8::from(code))
    }
}

/// The result type of the acquisition core.
pub type Result<T> = std::result::Result<T, Error>;
