//! Classification of calibrated values.
//!
//! Two independent layers sit above calibration: [`ReferenceRanges`] label a
//! value low/optimal/high for display, and [`PlausibilityLimits`] reject
//! physically impossible values during acquisition.
use crate::protocol::{Parameter, Values};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize),
    serde(rename_all = "lowercase")
)]
pub enum Health {
    Low,
    Optimal,
    High,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Health::Low => "low",
            Health::Optimal => "optimal",
            Health::High => "high",
        })
    }
}

/// Typical topsoil range of a parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReferenceRange {
    pub low: f64,
    pub optimal: f64,
    pub high: f64,
}

impl ReferenceRange {
    pub const fn new(low: f64, optimal: f64, high: f64) -> Self {
        Self { low, optimal, high }
    }

    pub fn classify(&self, value: f64) -> Health {
        if value < self.low {
            Health::Low
        } else if value > self.high {
            Health::High
        } else {
            Health::Optimal
        }
    }
}

/// Reference ranges per parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceRanges(BTreeMap<Parameter, ReferenceRange>);

impl ReferenceRanges {
    pub fn new(ranges: impl IntoIterator<Item = (Parameter, ReferenceRange)>) -> Self {
        Self(ranges.into_iter().collect())
    }

    pub fn get(&self, parameter: Parameter) -> Option<&ReferenceRange> {
        self.0.get(&parameter)
    }

    /// Health of one value, `None` for parameters without a reference.
    pub fn classify(&self, parameter: Parameter, value: f64) -> Option<Health> {
        self.get(parameter).map(|range| range.classify(value))
    }
}

impl Default for ReferenceRanges {
    fn default() -> Self {
        Self::new([
            (Parameter::Nitrogen, ReferenceRange::new(20.0, 50.0, 100.0)),
            (Parameter::Phosphorus, ReferenceRange::new(10.0, 25.0, 50.0)),
            (Parameter::Potassium, ReferenceRange::new(100.0, 200.0, 400.0)),
            (Parameter::Ph, ReferenceRange::new(5.5, 6.5, 7.5)),
            (Parameter::Ec, ReferenceRange::new(0.2, 0.7, 2.0)),
            (Parameter::Temperature, ReferenceRange::new(10.0, 22.0, 30.0)),
        ])
    }
}

/// Inclusive bounds outside of which a calibrated value is rejected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlausibilityLimits(BTreeMap<Parameter, (f64, f64)>);

impl PlausibilityLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds bounds for `parameter`; rejects an empty interval.
    pub fn with_limit(mut self, parameter: Parameter, min: f64, max: f64) -> Result<Self> {
        if !(min <= max) {
            return Err(Error::Configuration(format!(
                "{parameter} plausibility range {min}..{max} is empty"
            )));
        }
        self.0.insert(parameter, (min, max));
        Ok(self)
    }

    /// Checks every limited parameter present in `values`.
    pub fn check(&self, values: &Values) -> Result<()> {
        for (parameter, value) in values.iter() {
            if let Some((min, max)) = self.0.get(&parameter) {
                if !(*min..=*max).contains(&value) {
                    return Err(Error::Implausible { parameter, value });
                }
            }
        }
        Ok(())
    }
}
