//! Hysteresis controllers mapping calibrated readings to actuator states.
//!
//! Controllers are plain state machines without I/O. Each call to `decide`
//! either switches on a named threshold crossing or keeps the previous state.
use crate::{Error, Result};
use log::*;
use std::fmt;

/// Direction in which a quantity activates its actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Switch on at or above the on-threshold (cooling).
    Rising,
    /// Switch on below the on-threshold (humidifying).
    Falling,
}

/// A validated pair of on/off thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    on: f64,
    off: f64,
    activation: Activation,
}

impl Band {
    /// Band switched on by high values; requires `on > off`.
    pub fn rising(on: f64, off: f64) -> Result<Self> {
        if !(on > off) {
            return Err(Error::Configuration(format!(
                "on threshold {on} must be above off threshold {off}"
            )));
        }
        Ok(Self {
            on,
            off,
            activation: Activation::Rising,
        })
    }

    /// Band switched on by low values; requires `on < off`.
    pub fn falling(on: f64, off: f64) -> Result<Self> {
        if !(on < off) {
            return Err(Error::Configuration(format!(
                "on threshold {on} must be below off threshold {off}"
            )));
        }
        Ok(Self {
            on,
            off,
            activation: Activation::Falling,
        })
    }

    pub fn on(&self) -> f64 {
        self.on
    }

    pub fn off(&self) -> f64 {
        self.off
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    fn activates(&self, value: f64) -> bool {
        match self.activation {
            Activation::Rising => value >= self.on,
            Activation::Falling => value < self.on,
        }
    }

    fn releases(&self, value: f64) -> bool {
        match self.activation {
            Activation::Rising => value <= self.off,
            Activation::Falling => value >= self.off,
        }
    }
}

/// Outcome of one controller evaluation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Decision {
    pub active: bool,
    /// `true` if this evaluation switched the state.
    pub changed: bool,
    pub reason: String,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

const MISSING_DATA: &str = "missing sensor data";

fn state_name(active: bool) -> &'static str {
    if active {
        "ON"
    } else {
        "OFF"
    }
}

/// Drives a humidifier: on below `on` percent, off at or above `off` percent.
#[derive(Debug, Clone, PartialEq)]
pub struct HumidityController {
    band: Band,
    active: bool,
}

impl HumidityController {
    pub const DEFAULT_ON: f64 = 60.0;
    pub const DEFAULT_OFF: f64 = 75.0;

    pub fn new(on: f64, off: f64) -> Result<Self> {
        Ok(Self {
            band: Band::falling(on, off)?,
            active: false,
        })
    }

    pub fn band(&self) -> &Band {
        &self.band
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn decide(&mut self, humidity: Option<f64>) -> Decision {
        let Some(humidity) = humidity else {
            return Decision {
                active: self.active,
                changed: false,
                reason: MISSING_DATA.into(),
            };
        };
        let next = if !self.active && self.band.activates(humidity) {
            true
        } else if self.active && self.band.releases(humidity) {
            false
        } else {
            self.active
        };
        let changed = next != self.active;
        self.active = next;

        let reason = if changed && next {
            format!("Humidifier ON: Humidity={humidity:.1}% (<{})", self.band.on)
        } else if changed {
            format!("Humidifier OFF: Humidity={humidity:.1}% (≥{})", self.band.off)
        } else {
            format!(
                "Humidifier {}: Humidity={humidity:.1}% (no change)",
                state_name(next)
            )
        };
        if changed {
            info!("{reason}");
        }
        Decision {
            active: next,
            changed,
            reason,
        }
    }
}

impl Default for HumidityController {
    fn default() -> Self {
        Self {
            band: Band {
                on: Self::DEFAULT_ON,
                off: Self::DEFAULT_OFF,
                activation: Activation::Falling,
            },
            active: false,
        }
    }
}

/// Drives an air conditioner from temperature and humidity.
///
/// Either quantity reaching its on-threshold switches the unit on; it is
/// switched off only once both are at or below their off-thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct AcController {
    temperature: Band,
    humidity: Band,
    active: bool,
}

impl AcController {
    pub const DEFAULT_TEMPERATURE: (f64, f64) = (28.0, 24.0);
    pub const DEFAULT_HUMIDITY: (f64, f64) = (70.0, 60.0);

    pub fn new(temperature: (f64, f64), humidity: (f64, f64)) -> Result<Self> {
        Ok(Self {
            temperature: Band::rising(temperature.0, temperature.1)?,
            humidity: Band::rising(humidity.0, humidity.1)?,
            active: false,
        })
    }

    pub fn temperature_band(&self) -> &Band {
        &self.temperature
    }

    pub fn humidity_band(&self) -> &Band {
        &self.humidity
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn decide(&mut self, temperature: Option<f64>, humidity: Option<f64>) -> Decision {
        let (Some(temperature), Some(humidity)) = (temperature, humidity) else {
            return Decision {
                active: self.active,
                changed: false,
                reason: MISSING_DATA.into(),
            };
        };
        let hot = self.temperature.activates(temperature);
        let humid = self.humidity.activates(humidity);
        let next = if !self.active && (hot || humid) {
            true
        } else if self.active
            && self.temperature.releases(temperature)
            && self.humidity.releases(humidity)
        {
            false
        } else {
            self.active
        };
        let changed = next != self.active;
        self.active = next;

        let reason = if changed && next {
            let mut triggers = Vec::with_capacity(2);
            if hot {
                triggers.push(format!("Temp={temperature:.1}°C (≥{})", self.temperature.on));
            }
            if humid {
                triggers.push(format!("Humidity={humidity:.1}% (≥{})", self.humidity.on));
            }
            format!("AC ON: {}", triggers.join(", "))
        } else if changed {
            format!(
                "AC OFF: Temp={temperature:.1}°C (≤{}), Humidity={humidity:.1}% (≤{})",
                self.temperature.off, self.humidity.off
            )
        } else {
            format!(
                "AC {}: Temp={temperature:.1}°C, Humidity={humidity:.1}% (no change)",
                state_name(next)
            )
        };
        if changed {
            info!("{reason}");
        }
        Decision {
            active: next,
            changed,
            reason,
        }
    }
}

impl Default for AcController {
    fn default() -> Self {
        let (temperature_on, temperature_off) = Self::DEFAULT_TEMPERATURE;
        let (humidity_on, humidity_off) = Self::DEFAULT_HUMIDITY;
        Self {
            temperature: Band {
                on: temperature_on,
                off: temperature_off,
                activation: Activation::Rising,
            },
            humidity: Band {
                on: humidity_on,
                off: humidity_off,
                activation: Activation::Rising,
            },
            active: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn humidity_sequence() {
        let mut controller = HumidityController::new(60.0, 75.0).unwrap();
        let expected = [
            (50.0, true, true),
            (80.0, false, true),
            (65.0, false, false),
            (58.0, true, true),
            (70.0, true, false),
            (76.0, false, true),
        ];
        for (humidity, active, changed) in expected {
            let decision = controller.decide(Some(humidity));
            assert_eq!(
                (decision.active, decision.changed),
                (active, changed),
                "humidity {humidity}"
            );
        }
    }

    #[test]
    fn humidity_threshold_edges() {
        let mut controller = HumidityController::default();
        assert!(!controller.decide(Some(60.0)).active);
        assert!(controller.decide(Some(59.9)).active);
        assert!(controller.decide(Some(74.9)).active);
        let decision = controller.decide(Some(75.0));
        assert!(!decision.active);
        assert_eq!(decision.reason, "Humidifier OFF: Humidity=75.0% (≥75)");
    }

    #[test]
    fn ac_sequence() {
        let mut controller = AcController::new((28.0, 24.0), (70.0, 60.0)).unwrap();
        let on = controller.decide(Some(30.0), Some(50.0));
        assert!(on.active && on.changed);
        assert_eq!(on.reason, "AC ON: Temp=30.0°C (≥28)");

        let held = controller.decide(Some(23.0), Some(65.0));
        assert!(held.active && !held.changed);

        let off = controller.decide(Some(23.0), Some(55.0));
        assert!(!off.active && off.changed);
    }

    #[test]
    fn ac_switches_on_humidity_alone() {
        let mut controller = AcController::default();
        let decision = controller.decide(Some(20.0), Some(70.0));
        assert!(decision.active);
        assert_eq!(decision.reason, "AC ON: Humidity=70.0% (≥70)");
        assert!(!controller.decide(Some(24.0), Some(60.0)).active);
    }

    #[test]
    fn missing_input_retains_state() {
        let mut humidifier = HumidityController::default();
        humidifier.decide(Some(40.0));
        let decision = humidifier.decide(None);
        assert!(decision.active && !decision.changed);
        assert_eq!(decision.reason, "missing sensor data");

        let mut ac = AcController::default();
        ac.decide(Some(35.0), Some(40.0));
        for (temperature, humidity) in [(None, Some(10.0)), (Some(10.0), None), (None, None)] {
            let decision = ac.decide(temperature, humidity);
            assert!(decision.active && !decision.changed);
            assert_eq!(decision.reason, "missing sensor data");
        }
    }

    #[test]
    fn degenerate_thresholds_rejected() {
        assert_matches!(HumidityController::new(75.0, 60.0), Err(Error::Configuration(..)));
        assert_matches!(HumidityController::new(60.0, 60.0), Err(Error::Configuration(..)));
        assert_matches!(
            AcController::new((24.0, 28.0), (70.0, 60.0)),
            Err(Error::Configuration(..))
        );
        assert_matches!(
            AcController::new((28.0, 24.0), (60.0, 60.0)),
            Err(Error::Configuration(..))
        );
        assert_matches!(Band::rising(f64::NAN, 1.0), Err(Error::Configuration(..)));
    }

    #[test]
    fn defaults_match_constructors() {
        assert_eq!(
            HumidityController::default(),
            HumidityController::new(60.0, 75.0).unwrap()
        );
        assert_eq!(
            AcController::default(),
            AcController::new((28.0, 24.0), (70.0, 60.0)).unwrap()
        );
    }
}
