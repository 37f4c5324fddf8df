//! Wires sensor readings to the controllers and their actuator outputs.
use crate::acquisition::Reading;
use crate::control::{AcController, Decision, HumidityController};
use crate::protocol::Address;
use log::*;
use std::fmt;
use std::io;

/// Identifier of a relay output, as labelled on the relay board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutputId(pub u8);

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hardware side of the actuators.
pub trait ActuatorGateway {
    /// Drives `output` on or off.
    fn set_output(&mut self, output: OutputId, on: bool) -> io::Result<()>;
}

impl<G: ActuatorGateway + ?Sized> ActuatorGateway for Box<G> {
    fn set_output(&mut self, output: OutputId, on: bool) -> io::Result<()> {
        (**self).set_output(output, on)
    }
}

/// Snapshot of one actuator channel.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ActuatorState {
    pub output: OutputId,
    pub label: String,
    pub active: bool,
    pub reason: String,
}

impl fmt::Display for ActuatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Relay {} ({}): {} - {}",
            self.output,
            self.label,
            if self.active { "ON" } else { "OFF" },
            self.reason
        )
    }
}

#[derive(Debug)]
struct Channel<C> {
    controller: C,
    output: OutputId,
    label: String,
    source: Address,
    reason: String,
}

impl<C> Channel<C> {
    fn new(controller: C, output: OutputId, label: impl Into<String>, source: Address) -> Self {
        Self {
            controller,
            output,
            label: label.into(),
            source,
            reason: "not evaluated yet".into(),
        }
    }

    fn state(&self, active: bool) -> ActuatorState {
        ActuatorState {
            output: self.output,
            label: self.label.clone(),
            active,
            reason: self.reason.clone(),
        }
    }
}

fn source_reading(readings: &[Reading], source: Address) -> Option<&Reading> {
    readings
        .iter()
        .find(|reading| reading.address == source && reading.is_valid())
}

/// Owns the gateway and the configured controller channels.
pub struct Automation<G> {
    gateway: G,
    humidifier: Option<Channel<HumidityController>>,
    air_conditioner: Option<Channel<AcController>>,
}

impl<G: ActuatorGateway> Automation<G> {
    pub fn new(gateway: G) -> Self {
        Self {
            gateway,
            humidifier: None,
            air_conditioner: None,
        }
    }

    /// Adds a humidifier channel fed by the humidity of sensor `source`.
    pub fn with_humidifier(
        mut self,
        controller: HumidityController,
        output: OutputId,
        label: impl Into<String>,
        source: Address,
    ) -> Self {
        self.humidifier = Some(Channel::new(controller, output, label, source));
        self
    }

    /// Adds an air conditioning channel fed by sensor `source`.
    pub fn with_air_conditioner(
        mut self,
        controller: AcController,
        output: OutputId,
        label: impl Into<String>,
        source: Address,
    ) -> Self {
        self.air_conditioner = Some(Channel::new(controller, output, label, source));
        self
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Runs every controller on `readings` and drives its output.
    pub fn evaluate(&mut self, readings: &[Reading]) -> Vec<ActuatorState> {
        let mut states = Vec::with_capacity(2);
        if let Some(channel) = self.humidifier.as_mut() {
            let reading = source_reading(readings, channel.source);
            let decision = channel.controller.decide(reading.and_then(Reading::humidity));
            states.push(Self::apply(&mut self.gateway, channel, decision));
        }
        if let Some(channel) = self.air_conditioner.as_mut() {
            let reading = source_reading(readings, channel.source);
            let decision = channel.controller.decide(
                reading.and_then(Reading::temperature),
                reading.and_then(Reading::humidity),
            );
            states.push(Self::apply(&mut self.gateway, channel, decision));
        }
        states
    }

    fn apply<C>(gateway: &mut G, channel: &mut Channel<C>, decision: Decision) -> ActuatorState {
        if decision.changed {
            info!(
                "{} on relay {} switched {}",
                channel.label,
                channel.output,
                if decision.active { "ON" } else { "OFF" }
            );
        } else {
            debug!("{} on relay {}: {}", channel.label, channel.output, decision);
        }
        if let Err(err) = gateway.set_output(channel.output, decision.active) {
            error!("Failed to drive relay {} ({}): {err}", channel.output, channel.label);
        }
        channel.reason = decision.reason;
        channel.state(decision.active)
    }

    /// Current state of every channel.
    pub fn states(&self) -> Vec<ActuatorState> {
        let mut states = Vec::with_capacity(2);
        if let Some(channel) = &self.humidifier {
            states.push(channel.state(channel.controller.is_active()));
        }
        if let Some(channel) = &self.air_conditioner {
            states.push(channel.state(channel.controller.is_active()));
        }
        states
    }

    /// Pushes the current state of every channel to the gateway.
    pub fn sync_outputs(&mut self) -> io::Result<()> {
        for state in self.states() {
            self.gateway.set_output(state.output, state.active)?;
        }
        Ok(())
    }
}
