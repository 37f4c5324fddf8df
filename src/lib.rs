//! A library for polling NPK soil sensors over Modbus RTU and driving
//! climate actuators from their readings.
//!
//! The crate is layered bottom-up:
//!
//! 1.  **Links**: [`link::RtuLink`] speaks RTU framing over a serial port and
//!     switches an RS-485 transceiver direction pin around each request.
//!     [`tokio_sync::ModbusLink`] uses a `tokio-modbus` synchronous context
//!     instead (auto-direction adapters or Modbus TCP gateways).
//! 2.  **Decoding**: [`codec`] validates response frames and
//!     [`protocol::RegisterLayout`] maps register blocks to named values.
//! 3.  **Calibration**: [`calibration::Calibration`] applies per-device linear
//!     corrections.
//! 4.  **Acquisition**: [`acquisition::SensorService`] serializes bus access,
//!     retries failed transactions and returns one [`acquisition::Reading`]
//!     per device.
//! 5.  **Control**: [`control`] hysteresis controllers and the
//!     [`automation::Automation`] that hands their decisions to an
//!     [`automation::ActuatorGateway`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use soilmon_lib::{
//!     acquisition::SensorService,
//!     calibration::Calibration,
//!     link::{LinkSettings, RtuLink},
//!     protocol::{Address, RegisterLayout},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut settings = LinkSettings::new("/dev/ttyAMA0");
//!     settings.direction_pin = Some(24);
//!     let link = RtuLink::open(&settings)?;
//!     let service = SensorService::new(link, RegisterLayout::npk_soil(), Calibration::Disabled);
//!
//!     let reading = service.read_device(Address::try_from(1)?);
//!     println!("{reading}");
//!
//!     Ok(())
//! }
//! ```

pub mod acquisition;
pub mod automation;
pub mod calibration;
pub mod codec;
mod error;
pub mod control;
pub mod gpio;
pub mod health;
pub mod link;
pub mod protocol;

pub use error::{Error, Result};

#[cfg_attr(docsrs, doc(cfg(any(feature = "rtu", feature = "tokio-rtu-sync"))))]
#[cfg(any(feature = "rtu", feature = "tokio-rtu-sync"))]
pub mod tokio_common;

#[cfg_attr(
    docsrs,
    doc(cfg(any(feature = "tokio-rtu-sync", feature = "tokio-tcp-sync")))
)]
#[cfg(any(feature = "tokio-rtu-sync", feature = "tokio-tcp-sync"))]
pub mod tokio_sync;
