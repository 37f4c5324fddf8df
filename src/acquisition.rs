//! Sensor acquisition: retries, decoding and calibration per device.
//!
//! [`SensorService`] owns the transport behind a mutex, so concurrent callers
//! queue behind the transaction in flight instead of interleaving frames on
//! the half-duplex bus. Every read ends in a [`Reading`]; transport and
//! protocol errors never escape as `Err` or panic.
use crate::calibration::Calibration;
use crate::codec::ReadRequest;
use crate::health::PlausibilityLimits;
use crate::link::Transport;
use crate::protocol::{Address, Parameter, RegisterLayout, Values};
use crate::{Error, Result};
use log::*;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Bounded retry loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u8,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u8, backoff: Duration) -> Result<Self> {
        if attempts == 0 {
            return Err(Error::Configuration("at least one attempt is required".into()));
        }
        Ok(Self { attempts, backoff })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Values of a successful read, before and after calibration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Measurement {
    pub raw: Values,
    pub calibrated: Values,
}

/// Terminal outcome of a read whose attempts were all exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    /// The error of the last attempt.
    pub error: Error,
    pub attempts: u8,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempts)", self.error, self.attempts)
    }
}

/// The result of reading one device: fully valid or invalid with a reason.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub address: Address,
    pub outcome: std::result::Result<Measurement, Failure>,
}

impl Reading {
    pub fn is_valid(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn measurement(&self) -> Option<&Measurement> {
        self.outcome.as_ref().ok()
    }

    /// Human readable reason of an invalid reading.
    pub fn error(&self) -> Option<String> {
        self.outcome.as_ref().err().map(ToString::to_string)
    }

    /// Calibrated value of `parameter`, `None` if invalid or not reported.
    pub fn value(&self, parameter: Parameter) -> Option<f64> {
        self.measurement()
            .and_then(|measurement| measurement.calibrated.get(parameter))
    }

    pub fn temperature(&self) -> Option<f64> {
        self.value(Parameter::Temperature)
    }

    pub fn humidity(&self) -> Option<f64> {
        self.value(Parameter::Humidity)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Ok(measurement) => write!(f, "Sensor {}: {}", self.address, measurement.calibrated),
            Err(failure) => write!(f, "Sensor {}: invalid, {failure}", self.address),
        }
    }
}

/// Reads, decodes and calibrates sensors on a shared bus.
pub struct SensorService<T> {
    link: Mutex<T>,
    layout: RegisterLayout,
    device_layouts: BTreeMap<Address, RegisterLayout>,
    calibration: Calibration,
    retry: RetryPolicy,
    plausibility: Option<PlausibilityLimits>,
}

impl<T: Transport> SensorService<T> {
    pub fn new(link: T, layout: RegisterLayout, calibration: Calibration) -> Self {
        Self {
            link: Mutex::new(link),
            layout,
            device_layouts: BTreeMap::new(),
            calibration,
            retry: RetryPolicy::default(),
            plausibility: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Rejects calibrated values outside `limits` (retried like transport errors).
    pub fn with_plausibility(mut self, limits: PlausibilityLimits) -> Self {
        self.plausibility = Some(limits);
        self
    }

    /// Uses `layout` instead of the default one for the device at `address`.
    pub fn with_device_layout(mut self, address: Address, layout: RegisterLayout) -> Self {
        self.device_layouts.insert(address, layout);
        self
    }

    /// The default register layout.
    pub fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    pub fn layout_for(&self, address: Address) -> &RegisterLayout {
        self.device_layouts.get(&address).unwrap_or(&self.layout)
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Reads one device, retrying per-attempt failures.
    pub fn read_device(&self, address: Address) -> Reading {
        let outcome = self.with_retries(address, || self.attempt(address));
        match &outcome {
            Ok(measurement) => info!(
                "Sensor {address}: raw [{}] calibrated [{}]",
                measurement.raw, measurement.calibrated
            ),
            Err(failure) => error!("Sensor {address}: {failure}"),
        }
        Reading { address, outcome }
    }

    /// Reads devices one after the other in the given order.
    pub fn read_all(&self, addresses: &[Address]) -> Vec<Reading> {
        addresses
            .iter()
            .map(|address| self.read_device(*address))
            .collect()
    }

    /// Reads the undecoded register block of one device.
    pub fn read_registers(&self, address: Address) -> std::result::Result<Vec<u16>, Failure> {
        self.with_retries(address, || self.transact(address))
    }

    fn transact(&self, address: Address) -> Result<Vec<u16>> {
        let layout = self.layout_for(address);
        let request = ReadRequest::holding_registers(address, layout.start(), layout.count());
        let mut link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        link.transact(&request)
    }

    fn attempt(&self, address: Address) -> Result<Measurement> {
        let words = self.transact(address)?;
        let raw = self.layout_for(address).decode(&words)?;
        let calibrated = self.calibration.apply_all(address, &raw);
        if let Some(limits) = &self.plausibility {
            limits.check(&calibrated)?;
        }
        Ok(Measurement { raw, calibrated })
    }

    fn with_retries<R>(
        &self,
        address: Address,
        mut operation: impl FnMut() -> Result<R>,
    ) -> std::result::Result<R, Failure> {
        let mut attempt = 1;
        loop {
            debug!("Sensor {address}: attempt {attempt}/{}", self.retry.attempts);
            match operation() {
                Ok(result) => return Ok(result),
                Err(error) => {
                    match &error {
                        Error::DeviceFault(code) => {
                            warn!("Sensor {address}: device fault {code:#04x} (attempt {attempt})")
                        }
                        _ => debug!("Sensor {address}: {error} (attempt {attempt})"),
                    }
                    if attempt >= self.retry.attempts || !error.is_retryable() {
                        return Err(Failure {
                            error,
                            attempts: attempt,
                        });
                    }
                }
            }
            thread::sleep(self.retry.backoff);
            attempt += 1;
        }
    }
}
