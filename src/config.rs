//! YAML configuration of the `soilmon` binary.
//!
//! Loaded once at startup; any invalid value aborts before the bus is touched.
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use soilmon_lib::{
    acquisition::RetryPolicy,
    automation::OutputId,
    calibration::{Calibration, CalibrationTable, Coefficients},
    control::{AcController, HumidityController},
    health::PlausibilityLimits,
    link::{self, LinkSettings},
    protocol::{Address, BaudRate, FieldSpec, Parameter, RegisterLayout},
};
use std::collections::BTreeMap;
use std::fs::File;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "soilmon.yml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LinkConfig {
    /// Own RTU framing with an optional DE/RE direction GPIO.
    Rtu {
        #[serde(default = "default_device")]
        device: String,
        #[serde(default)]
        baud_rate: BaudRate,
        #[serde(default = "default_timeout", with = "humantime_serde")]
        timeout: Duration,
        #[serde(default = "default_settle_delay", with = "humantime_serde")]
        settle_delay: Duration,
        #[serde(default = "default_direction_pin")]
        direction_pin: Option<u32>,
    },
    /// `tokio-modbus` RTU client for adapters with automatic direction control.
    ModbusRtu {
        #[serde(default = "default_device")]
        device: String,
        #[serde(default)]
        baud_rate: BaudRate,
        #[serde(default = "default_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
    /// Modbus TCP gateway in front of the RS-485 bus.
    Tcp {
        address: SocketAddr,
        #[serde(default = "default_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
}

fn default_device() -> String {
    String::from("/dev/ttyAMA0")
}

fn default_timeout() -> Duration {
    link::DEFAULT_TIMEOUT
}

fn default_settle_delay() -> Duration {
    link::DEFAULT_SETTLE_DELAY
}

fn default_direction_pin() -> Option<u32> {
    Some(24)
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig::Rtu {
            device: default_device(),
            baud_rate: BaudRate::default(),
            timeout: default_timeout(),
            settle_delay: default_settle_delay(),
            direction_pin: default_direction_pin(),
        }
    }
}

impl LinkConfig {
    /// Serial settings of the RTU variants.
    pub fn serial_settings(&self) -> Option<LinkSettings> {
        match self {
            LinkConfig::Rtu {
                device,
                baud_rate,
                timeout,
                settle_delay,
                direction_pin,
            } => Some(LinkSettings {
                device: device.clone(),
                baud_rate: *baud_rate,
                timeout: *timeout,
                settle_delay: *settle_delay,
                direction_pin: *direction_pin,
            }),
            LinkConfig::ModbusRtu {
                device,
                baud_rate,
                timeout,
            } => Some(LinkSettings {
                device: device.clone(),
                baud_rate: *baud_rate,
                timeout: *timeout,
                settle_delay: Duration::ZERO,
                direction_pin: None,
            }),
            LinkConfig::Tcp { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LayoutConfig {
    pub start: u16,
    pub count: u16,
    pub fields: Vec<FieldSpec>,
}

impl LayoutConfig {
    fn build(&self) -> soilmon_lib::Result<RegisterLayout> {
        RegisterLayout::new(self.start, self.count, self.fields.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorsConfig {
    #[serde(default = "default_addresses")]
    pub addresses: Vec<Address>,
    #[serde(default = "default_retries")]
    pub retries: u8,
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff: Duration,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    pub layout: Option<LayoutConfig>,
    /// Layouts of devices that differ from `layout`, keyed by address.
    #[serde(default)]
    pub layouts: BTreeMap<u8, LayoutConfig>,
}

fn default_addresses() -> Vec<Address> {
    vec![Address::default()]
}

fn default_retries() -> u8 {
    3
}

fn default_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            addresses: default_addresses(),
            retries: default_retries(),
            backoff: default_backoff(),
            poll_interval: default_poll_interval(),
            layout: None,
            layouts: BTreeMap::new(),
        }
    }
}

impl SensorsConfig {
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy::new(self.retries, self.backoff)?)
    }

    pub fn layout(&self) -> Result<RegisterLayout> {
        match &self.layout {
            Some(layout) => layout.build().context("Invalid sensor layout"),
            None => Ok(RegisterLayout::npk_soil()),
        }
    }

    pub fn device_layouts(&self) -> Result<Vec<(Address, RegisterLayout)>> {
        self.layouts
            .iter()
            .map(|(address, layout)| {
                let address = Address::try_from(*address)
                    .with_context(|| format!("Invalid layout sensor {address}"))?;
                let layout = layout
                    .build()
                    .with_context(|| format!("Invalid layout of sensor {address}"))?;
                Ok((address, layout))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Coefficients per sensor address, keyed by parameter name.
    #[serde(default)]
    pub sensors: BTreeMap<u8, BTreeMap<String, Coefficients>>,
}

fn default_true() -> bool {
    true
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sensors: BTreeMap::new(),
        }
    }
}

impl CalibrationConfig {
    pub fn calibration(&self) -> Result<Calibration> {
        if !self.enabled {
            return Ok(Calibration::Disabled);
        }
        let mut table = CalibrationTable::new();
        for (address, parameters) in &self.sensors {
            let address = Address::try_from(*address)
                .with_context(|| format!("Invalid calibration sensor {address}"))?;
            for (key, coefficients) in parameters {
                let parameter: Parameter = key
                    .parse()
                    .with_context(|| format!("Invalid calibration of sensor {address}"))?;
                table = table.with_entry(address, parameter, *coefficients);
            }
        }
        Ok(Calibration::Enabled(table))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ThresholdConfig {
    pub on: f64,
    pub off: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HumidifierConfig {
    #[serde(default = "default_humidifier_output")]
    pub output: OutputId,
    #[serde(default = "default_humidifier_label")]
    pub label: String,
    #[serde(default)]
    pub source: Address,
    #[serde(default = "default_humidifier_thresholds")]
    pub humidity: ThresholdConfig,
}

fn default_humidifier_output() -> OutputId {
    OutputId(1)
}

fn default_humidifier_label() -> String {
    String::from("Atomizer/Humidifier")
}

fn default_humidifier_thresholds() -> ThresholdConfig {
    ThresholdConfig {
        on: HumidityController::DEFAULT_ON,
        off: HumidityController::DEFAULT_OFF,
    }
}

impl HumidifierConfig {
    pub fn controller(&self) -> Result<HumidityController> {
        HumidityController::new(self.humidity.on, self.humidity.off)
            .context("Invalid humidifier thresholds")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AirConditionerConfig {
    #[serde(default = "default_ac_output")]
    pub output: OutputId,
    #[serde(default = "default_ac_label")]
    pub label: String,
    #[serde(default)]
    pub source: Address,
    #[serde(default = "default_ac_temperature")]
    pub temperature: ThresholdConfig,
    #[serde(default = "default_ac_humidity")]
    pub humidity: ThresholdConfig,
}

fn default_ac_output() -> OutputId {
    OutputId(2)
}

fn default_ac_label() -> String {
    String::from("Air Conditioner")
}

fn default_ac_temperature() -> ThresholdConfig {
    let (on, off) = AcController::DEFAULT_TEMPERATURE;
    ThresholdConfig { on, off }
}

fn default_ac_humidity() -> ThresholdConfig {
    let (on, off) = AcController::DEFAULT_HUMIDITY;
    ThresholdConfig { on, off }
}

impl AirConditionerConfig {
    pub fn controller(&self) -> Result<AcController> {
        AcController::new(
            (self.temperature.on, self.temperature.off),
            (self.humidity.on, self.humidity.off),
        )
        .context("Invalid air conditioner thresholds")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ControlConfig {
    pub humidifier: Option<HumidifierConfig>,
    pub air_conditioner: Option<AirConditionerConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Inclusive `[min, max]` bounds keyed by parameter name.
    #[serde(default)]
    pub plausibility: BTreeMap<String, (f64, f64)>,
    #[serde(default)]
    pub control: ControlConfig,
    /// GPIO number of each relay output.
    #[serde(default = "default_relays")]
    pub relays: BTreeMap<u8, u32>,
}

fn default_relays() -> BTreeMap<u8, u32> {
    BTreeMap::from([(1, 26), (2, 19)])
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        log::debug!("Loading config file from {path:?}");
        let file =
            File::open(path).with_context(|| format!("Cannot open config file {path:?}"))?;
        let config: Config = serde_yaml::from_reader(&file)
            .with_context(|| format!("Cannot parse config file {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds every derived value once so that errors surface at startup.
    pub fn validate(&self) -> Result<()> {
        if self.sensors.addresses.is_empty() {
            bail!("At least one sensor address must be configured");
        }
        self.sensors.retry_policy()?;
        self.sensors.layout()?;
        self.sensors.device_layouts()?;
        self.calibration.calibration()?;
        self.plausibility_limits()?;
        if let Some(humidifier) = &self.control.humidifier {
            humidifier.controller()?;
            self.check_source("humidifier", humidifier.source, &[Parameter::Humidity])?;
            self.relay_pin(humidifier.output)?;
        }
        if let Some(air_conditioner) = &self.control.air_conditioner {
            air_conditioner.controller()?;
            self.check_source(
                "air conditioner",
                air_conditioner.source,
                &[Parameter::Temperature, Parameter::Humidity],
            )?;
            self.relay_pin(air_conditioner.output)?;
        }
        Ok(())
    }

    /// A controller source must be polled and its layout must decode every
    /// parameter the controller reads.
    fn check_source(&self, controller: &str, source: Address, required: &[Parameter]) -> Result<()> {
        if !self.sensors.addresses.contains(&source) {
            bail!("The {controller} source sensor {source} is not in sensors.addresses");
        }
        let layout = match self
            .sensors
            .device_layouts()?
            .into_iter()
            .find(|(address, _)| *address == source)
        {
            Some((_, layout)) => layout,
            None => self.sensors.layout()?,
        };
        for parameter in required {
            if !layout.fields().iter().any(|field| field.parameter == *parameter) {
                bail!("The layout of {controller} source sensor {source} has no {parameter} field");
            }
        }
        Ok(())
    }

    pub fn plausibility_limits(&self) -> Result<Option<PlausibilityLimits>> {
        if self.plausibility.is_empty() {
            return Ok(None);
        }
        let mut limits = PlausibilityLimits::new();
        for (key, (min, max)) in &self.plausibility {
            let parameter: Parameter = key.parse().context("Invalid plausibility limit")?;
            limits = limits.with_limit(parameter, *min, *max)?;
        }
        Ok(Some(limits))
    }

    pub fn relay_pin(&self, output: OutputId) -> Result<u32> {
        match self.relays.get(&output.0) {
            Some(pin) => Ok(*pin),
            None => bail!("No GPIO configured for relay output {output}"),
        }
    }
}
