//! Per-device linear calibration of decoded values.
//!
//! Each (device, parameter) pair may carry coefficients applied as
//! `calibrated = slope * raw + intercept`. Pairs without an entry pass the raw
//! value through unchanged. The table is built once at startup and never
//! mutated afterwards.
use crate::protocol::{Address, Parameter, Values};
use log::*;
use std::collections::HashMap;
use std::fmt::Write;

/// Linear correction `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Coefficients {
    pub slope: f64,
    pub intercept: f64,
}

impl Coefficients {
    pub const IDENTITY: Self = Self {
        slope: 1.0,
        intercept: 0.0,
    };

    pub const fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }

    /// Derives coefficients from two (raw, reference) sample pairs.
    ///
    /// Returns `None` if both samples share the same raw value.
    pub fn from_two_points(raw1: f64, reference1: f64, raw2: f64, reference2: f64) -> Option<Self> {
        if raw1 == raw2 {
            return None;
        }
        let slope = (reference2 - reference1) / (raw2 - raw1);
        Some(Self {
            slope,
            intercept: reference1 - slope * raw1,
        })
    }

    #[inline]
    pub fn apply(&self, raw: f64) -> f64 {
        self.slope * raw + self.intercept
    }
}

impl Default for Coefficients {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Calibration coefficients keyed by device address and parameter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationTable {
    entries: HashMap<(Address, Parameter), Coefficients>,
}

impl CalibrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the coefficients of one pair while building the table.
    pub fn with_entry(
        mut self,
        address: Address,
        parameter: Parameter,
        coefficients: Coefficients,
    ) -> Self {
        self.entries.insert((address, parameter), coefficients);
        self
    }

    pub fn coefficients(&self, address: Address, parameter: Parameter) -> Option<&Coefficients> {
        self.entries.get(&(address, parameter))
    }

    /// Calibrates one raw value; identity if the pair has no entry.
    pub fn apply(&self, address: Address, parameter: Parameter, raw: f64) -> f64 {
        match self.coefficients(address, parameter) {
            Some(coefficients) => coefficients.apply(raw),
            None => raw,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the coefficients of one device, one parameter per line.
    pub fn describe(&self, address: Address) -> String {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter(|((a, _), _)| *a == address)
            .map(|((_, parameter), coefficients)| (*parameter, *coefficients))
            .collect();
        if entries.is_empty() {
            return format!("Sensor {address}: no calibration configured");
        }
        entries.sort_by_key(|(parameter, _)| *parameter);
        let mut text = format!("Sensor {address} calibration:");
        for (parameter, c) in entries {
            let _ = write!(text, "\n  {parameter}: y = {}x + {}", c.slope, c.intercept);
        }
        text
    }
}

impl FromIterator<((Address, Parameter), Coefficients)> for CalibrationTable {
    fn from_iter<I: IntoIterator<Item = ((Address, Parameter), Coefficients)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Calibration mode, resolved once at initialization.
#[derive(Debug, Clone, PartialEq)]
pub enum Calibration {
    Enabled(CalibrationTable),
    Disabled,
}

impl Calibration {
    pub fn apply(&self, address: Address, parameter: Parameter, raw: f64) -> f64 {
        match self {
            Calibration::Enabled(table) => table.apply(address, parameter, raw),
            Calibration::Disabled => raw,
        }
    }

    /// Calibrates every value of a raw reading.
    pub fn apply_all(&self, address: Address, raw: &Values) -> Values {
        raw.iter()
            .map(|(parameter, value)| {
                let calibrated = self.apply(address, parameter, value);
                trace!("Sensor {address} {parameter}: {value} -> {calibrated}");
                (parameter, calibrated)
            })
            .collect()
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Calibration::Enabled(_))
    }

    pub fn table(&self) -> Option<&CalibrationTable> {
        match self {
            Calibration::Enabled(table) => Some(table),
            Calibration::Disabled => None,
        }
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration::Enabled(CalibrationTable::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(n: u8) -> Address {
        Address::try_from(n).unwrap()
    }

    fn table() -> CalibrationTable {
        CalibrationTable::new()
            .with_entry(address(1), Parameter::Nitrogen, Coefficients::new(1.065, -3.5))
            .with_entry(address(1), Parameter::Ph, Coefficients::new(0.998, 0.05))
            .with_entry(address(2), Parameter::Nitrogen, Coefficients::new(1.078, -4.2))
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn identity_without_entry() {
        let table = table();
        for raw in [0.0, -12.5, 45.2, 1e6] {
            assert_eq!(table.apply(address(1), Parameter::Potassium, raw), raw);
            assert_eq!(table.apply(address(3), Parameter::Nitrogen, raw), raw);
        }
        let disabled = Calibration::Disabled;
        assert_eq!(disabled.apply(address(1), Parameter::Nitrogen, 70.0), 70.0);
    }

    #[test]
    fn linear_law() {
        let cases = [(1.065, -3.5, 70.0), (0.5, 2.0, -8.0), (-1.25, 0.0, 3.3), (1.0, 0.0, 0.0)];
        for (slope, intercept, raw) in cases {
            let table = CalibrationTable::new().with_entry(
                address(5),
                Parameter::Ec,
                Coefficients::new(slope, intercept),
            );
            let calibrated = table.apply(address(5), Parameter::Ec, raw);
            assert!(close(calibrated, slope * raw + intercept));
        }
        assert!(close(
            table().apply(address(1), Parameter::Nitrogen, 70.0),
            71.05
        ));
    }

    #[test]
    fn apply_all_values() {
        let raw: Values = [(Parameter::Nitrogen, 70.0), (Parameter::Temperature, 21.5)]
            .into_iter()
            .collect();
        let calibrated = Calibration::Enabled(table()).apply_all(address(1), &raw);
        assert!(close(calibrated.get(Parameter::Nitrogen).unwrap(), 71.05));
        assert_eq!(calibrated.get(Parameter::Temperature), Some(21.5));
        assert_eq!(Calibration::Disabled.apply_all(address(1), &raw), raw);
    }

    #[test]
    fn two_point_coefficients() {
        let c = Coefficients::from_two_points(10.0, 12.0, 20.0, 22.0).unwrap();
        assert!(close(c.slope, 1.0));
        assert!(close(c.intercept, 2.0));
        assert!(Coefficients::from_two_points(10.0, 12.0, 10.0, 22.0).is_none());
    }

    #[test]
    fn describe_device() {
        let text = table().describe(address(1));
        assert_eq!(
            text,
            "Sensor 1 calibration:\n  nitrogen: y = 1.065x + -3.5\n  ph: y = 0.998x + 0.05"
        );
        assert_eq!(
            table().describe(address(9)),
            "Sensor 9: no calibration configured"
        );
    }
}
