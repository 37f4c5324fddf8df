//! Register-level protocol of the NPK soil sensor family.
//!
//! Defines the strongly-typed building blocks (`Address`, `BaudRate`,
//! `Parameter`) and the [`RegisterLayout`] table that decodes a block of
//! holding registers into raw physical quantities.
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Modbus function code "read holding registers".
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
/// High bit of the function code marking an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;
/// Maximum number of registers a single read request may ask for.
pub const MAX_REGISTER_COUNT: u16 = 125;

/// A Modbus RTU device address (unit id) in the range 1..=247.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "u8", into = "u8")
)]
pub struct Address(u8);

impl Address {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 247;
}

impl Default for Address {
    fn default() -> Self {
        Address(0x01)
    }
}

impl Deref for Address {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u8> for Address {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Address(value))
        } else {
            Err(Error::Configuration(format!(
                "device address {value} out of range {}..={}",
                Self::MIN,
                Self::MAX
            )))
        }
    }
}

impl From<Address> for u8 {
    fn from(address: Address) -> u8 {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serial baud rates supported by the sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "u32", into = "u32")
)]
pub enum BaudRate {
    B1200,
    B2400,
    B4800,
    #[default]
    B9600,
    B19200,
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;
    fn try_from(value: u32) -> Result<Self> {
        match value {
            1200 => Ok(BaudRate::B1200),
            2400 => Ok(BaudRate::B2400),
            4800 => Ok(BaudRate::B4800),
            9600 => Ok(BaudRate::B9600),
            19200 => Ok(BaudRate::B19200),
            _ => Err(Error::Configuration(format!(
                "unsupported baud rate {value}"
            ))),
        }
    }
}

impl From<BaudRate> for u32 {
    fn from(baud_rate: BaudRate) -> u32 {
        match baud_rate {
            BaudRate::B1200 => 1200,
            BaudRate::B2400 => 2400,
            BaudRate::B4800 => 4800,
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
        }
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

/// A physical quantity reported by a soil sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Parameter {
    Nitrogen,
    Phosphorus,
    Potassium,
    Ph,
    Ec,
    Temperature,
    Humidity,
}

impl Parameter {
    pub const ALL: [Parameter; 7] = [
        Parameter::Nitrogen,
        Parameter::Phosphorus,
        Parameter::Potassium,
        Parameter::Ph,
        Parameter::Ec,
        Parameter::Temperature,
        Parameter::Humidity,
    ];

    /// The configuration key of the parameter.
    pub fn name(&self) -> &'static str {
        match self {
            Parameter::Nitrogen => "nitrogen",
            Parameter::Phosphorus => "phosphorus",
            Parameter::Potassium => "potassium",
            Parameter::Ph => "ph",
            Parameter::Ec => "ec",
            Parameter::Temperature => "temperature",
            Parameter::Humidity => "humidity",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Parameter::Nitrogen | Parameter::Phosphorus | Parameter::Potassium => "mg/kg",
            Parameter::Ph => "",
            Parameter::Ec => "mS/cm",
            Parameter::Temperature => "°C",
            Parameter::Humidity => "%",
        }
    }
}

impl FromStr for Parameter {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Parameter::ALL
            .into_iter()
            .find(|parameter| parameter.name() == s)
            .ok_or_else(|| Error::Configuration(format!("unknown parameter key '{s}'")))
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of named scalar values, ordered by parameter.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Values(BTreeMap<Parameter, f64>);

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, parameter: Parameter, value: f64) {
        self.0.insert(parameter, value);
    }

    /// Returns the value of `parameter`, or `None` if the device does not report it.
    pub fn get(&self, parameter: Parameter) -> Option<f64> {
        self.0.get(&parameter).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Parameter, f64)> + '_ {
        self.0.iter().map(|(parameter, value)| (*parameter, *value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(Parameter, f64)> for Values {
    fn from_iter<I: IntoIterator<Item = (Parameter, f64)>>(iter: I) -> Self {
        Values(iter.into_iter().collect())
    }
}

impl fmt::Display for Values {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (parameter, value) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            match parameter {
                Parameter::Ph | Parameter::Ec => write!(f, "{parameter}={value:.2}")?,
                _ => write!(f, "{parameter}={value:.1}")?,
            }
            if !parameter.unit().is_empty() {
                write!(f, " {}", parameter.unit())?;
            }
        }
        Ok(())
    }
}

/// Order of the two registers holding an IEEE-754 single.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum WordOrder {
    #[default]
    HighFirst,
    LowFirst,
}

/// How a field is encoded in the register block.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(tag = "type", rename_all = "snake_case")
)]
pub enum FieldEncoding {
    /// One unsigned word divided by `scale`.
    Scaled { scale: f64 },
    /// Two consecutive words combined into a 32-bit float.
    Float32 {
        #[cfg_attr(feature = "serde", serde(default))]
        word_order: WordOrder,
    },
}

impl FieldEncoding {
    /// Number of registers occupied by the field.
    pub fn width(&self) -> usize {
        match self {
            FieldEncoding::Scaled { .. } => 1,
            FieldEncoding::Float32 { .. } => 2,
        }
    }

    fn decode(&self, words: &[u16]) -> f64 {
        match *self {
            FieldEncoding::Scaled { scale } => f64::from(words[0]) / scale,
            FieldEncoding::Float32 { word_order } => {
                let (high, low) = match word_order {
                    WordOrder::HighFirst => (words[0], words[1]),
                    WordOrder::LowFirst => (words[1], words[0]),
                };
                f64::from(float32_from_registers(high, low))
            }
        }
    }
}

/// Combines two registers into an IEEE-754 single precision float.
pub fn float32_from_registers(high: u16, low: u16) -> f32 {
    f32::from_bits((u32::from(high) << 16) | u32::from(low))
}

/// Position and encoding of one parameter inside the register block.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldSpec {
    pub parameter: Parameter,
    /// Index of the first word, relative to the block start.
    pub word: usize,
    pub encoding: FieldEncoding,
}

impl FieldSpec {
    pub const fn scaled(parameter: Parameter, word: usize, scale: f64) -> Self {
        Self {
            parameter,
            word,
            encoding: FieldEncoding::Scaled { scale },
        }
    }
}

/// Fixed layout of the register block returned by one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterLayout {
    start: u16,
    count: u16,
    fields: Vec<FieldSpec>,
}

impl RegisterLayout {
    /// Layout of the NPK soil sensor: 8 registers from register 4, words 0-1 reserved.
    pub fn npk_soil() -> Self {
        Self {
            start: 4,
            count: 8,
            fields: vec![
                FieldSpec::scaled(Parameter::Nitrogen, 2, 10.0),
                FieldSpec::scaled(Parameter::Phosphorus, 3, 10.0),
                FieldSpec::scaled(Parameter::Potassium, 4, 10.0),
                FieldSpec::scaled(Parameter::Ph, 5, 100.0),
                FieldSpec::scaled(Parameter::Ec, 6, 100.0),
                FieldSpec::scaled(Parameter::Temperature, 7, 100.0),
            ],
        }
    }

    /// Creates a custom layout, validating that every field fits the block.
    pub fn new(start: u16, count: u16, fields: Vec<FieldSpec>) -> Result<Self> {
        if !(1..=MAX_REGISTER_COUNT).contains(&count) {
            return Err(Error::Configuration(format!(
                "register count {count} out of range 1..={MAX_REGISTER_COUNT}"
            )));
        }
        if fields.is_empty() {
            return Err(Error::Configuration("register layout has no fields".into()));
        }
        for (i, field) in fields.iter().enumerate() {
            if field.word + field.encoding.width() > usize::from(count) {
                return Err(Error::Configuration(format!(
                    "{} at word {} does not fit a block of {count} registers",
                    field.parameter, field.word
                )));
            }
            if let FieldEncoding::Scaled { scale } = field.encoding {
                if !(scale.is_finite() && scale > 0.0) {
                    return Err(Error::Configuration(format!(
                        "{} has invalid scale {scale}",
                        field.parameter
                    )));
                }
            }
            if fields[..i].iter().any(|f| f.parameter == field.parameter) {
                return Err(Error::Configuration(format!(
                    "{} is mapped more than once",
                    field.parameter
                )));
            }
        }
        Ok(Self {
            start,
            count,
            fields,
        })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Decodes a register block into raw values.
    ///
    /// Fails with [`Error::ShortResponse`] if the block holds fewer words than
    /// the layout requires; no field is guessed or zero-filled.
    pub fn decode(&self, words: &[u16]) -> Result<Values> {
        let expected = usize::from(self.count);
        if words.len() < expected {
            return Err(Error::ShortResponse {
                expected,
                actual: words.len(),
            });
        }
        Ok(self
            .fields
            .iter()
            .map(|field| {
                let end = field.word + field.encoding.width();
                (field.parameter, field.encoding.decode(&words[field.word..end]))
            })
            .collect())
    }
}

impl Default for RegisterLayout {
    fn default() -> Self {
        Self::npk_soil()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn address_range() {
        assert_matches!(Address::try_from(0), Err(Error::Configuration(..)));
        assert_eq!(*Address::try_from(1).unwrap(), 1);
        assert_eq!(*Address::try_from(247).unwrap(), 247);
        assert_matches!(Address::try_from(248), Err(Error::Configuration(..)));
    }

    #[test]
    fn baud_rate_conversion() {
        assert_eq!(BaudRate::try_from(9600).unwrap(), BaudRate::B9600);
        assert_eq!(u32::from(BaudRate::B19200), 19200);
        assert_matches!(BaudRate::try_from(115200), Err(Error::Configuration(..)));
        assert_eq!(BaudRate::default().to_string(), "9600");
    }

    #[test]
    fn parameter_keys() {
        for parameter in Parameter::ALL {
            assert_eq!(parameter.name().parse::<Parameter>().unwrap(), parameter);
        }
        assert_matches!("moisture".parse::<Parameter>(), Err(Error::Configuration(..)));
    }

    #[test]
    fn decode_npk_block() {
        let words = [0, 0, 452, 123, 1876, 652, 135, 2150];
        let values = RegisterLayout::npk_soil().decode(&words).unwrap();
        assert_eq!(values.len(), 6);
        assert_eq!(values.get(Parameter::Nitrogen), Some(45.2));
        assert_eq!(values.get(Parameter::Phosphorus), Some(12.3));
        assert_eq!(values.get(Parameter::Potassium), Some(187.6));
        assert_eq!(values.get(Parameter::Ph), Some(6.52));
        assert_eq!(values.get(Parameter::Ec), Some(1.35));
        assert_eq!(values.get(Parameter::Temperature), Some(21.5));
        assert_eq!(values.get(Parameter::Humidity), None);
    }

    #[test]
    fn decode_ignores_reserved_words() {
        let layout = RegisterLayout::npk_soil();
        let a = layout.decode(&[0, 0, 1, 2, 3, 4, 5, 6]).unwrap();
        let b = layout.decode(&[0xFFFF, 0x1234, 1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn decode_short_block() {
        let layout = RegisterLayout::npk_soil();
        for len in 0..8 {
            let words = vec![100u16; len];
            assert_matches!(
                layout.decode(&words),
                Err(Error::ShortResponse { expected: 8, actual }) if actual == len
            );
        }
    }

    #[test]
    fn decode_float_pair() {
        let bits = 23.5f32.to_bits();
        let (high, low) = ((bits >> 16) as u16, bits as u16);
        assert_eq!(float32_from_registers(high, low), 23.5);

        let layout = RegisterLayout::new(
            0,
            4,
            vec![
                FieldSpec {
                    parameter: Parameter::Temperature,
                    word: 0,
                    encoding: FieldEncoding::Float32 {
                        word_order: WordOrder::HighFirst,
                    },
                },
                FieldSpec {
                    parameter: Parameter::Humidity,
                    word: 2,
                    encoding: FieldEncoding::Float32 {
                        word_order: WordOrder::LowFirst,
                    },
                },
            ],
        )
        .unwrap();
        let values = layout.decode(&[high, low, low, high]).unwrap();
        assert_eq!(values.get(Parameter::Temperature), Some(23.5));
        assert_eq!(values.get(Parameter::Humidity), Some(23.5));
    }

    #[test]
    fn layout_validation() {
        assert_matches!(
            RegisterLayout::new(0, 0, vec![FieldSpec::scaled(Parameter::Ph, 0, 100.0)]),
            Err(Error::Configuration(..))
        );
        assert_matches!(
            RegisterLayout::new(0, 2, vec![FieldSpec::scaled(Parameter::Ph, 2, 100.0)]),
            Err(Error::Configuration(..))
        );
        assert_matches!(
            RegisterLayout::new(0, 2, vec![FieldSpec::scaled(Parameter::Ph, 0, 0.0)]),
            Err(Error::Configuration(..))
        );
        assert_matches!(
            RegisterLayout::new(
                0,
                2,
                vec![
                    FieldSpec::scaled(Parameter::Ph, 0, 100.0),
                    FieldSpec::scaled(Parameter::Ph, 1, 100.0)
                ]
            ),
            Err(Error::Configuration(..))
        );
        assert!(RegisterLayout::new(
            0,
            2,
            vec![
                FieldSpec::scaled(Parameter::Temperature, 0, 10.0),
                FieldSpec::scaled(Parameter::Humidity, 1, 10.0)
            ]
        )
        .is_ok());
    }

    #[test]
    fn values_display() {
        let values: Values = [(Parameter::Ph, 6.5), (Parameter::Nitrogen, 45.24)]
            .into_iter()
            .collect();
        assert_eq!(values.to_string(), "nitrogen=45.2 mg/kg, ph=6.50");
    }
}
