//! Soil monitor CLI
//!
//! A command-line interface (CLI) application polling NPK soil sensors over an
//! RS-485 bus using Modbus RTU (own framing with a DE/RE direction GPIO, an
//! auto-direction adapter via `tokio-modbus`, or a Modbus TCP gateway).
//!
//! This tool allows users to:
//! - Read calibrated nitrogen, phosphorus, potassium, pH, EC and temperature values.
//! - Run in a continuous daemon mode that drives a humidifier and an air
//!   conditioner relay from the readings using hysteresis control.
//! - Scan a range of addresses for responding sensors.
//! - Inspect the configured calibration and controller settings.
//!
//! The CLI leverages the `soilmon_lib` crate for the bus protocol, calibration
//! and control logic.

use anyhow::{Context, Result, bail};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use soilmon_lib::{
    acquisition::{Reading, RetryPolicy, SensorService},
    automation::{ActuatorGateway, Automation, OutputId},
    gpio::SysfsPin,
    health::ReferenceRanges,
    link::{RtuLink, Transport},
    protocol as proto,
    tokio_sync::ModbusLink,
};
use std::collections::BTreeMap;
use std::io::{self, Write, stdout};
use std::{panic, time::Duration};

mod commandline;
mod config;

use config::{Config, LinkConfig};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

/// Relay outputs wired to sysfs GPIO lines, driven high for ON.
struct RelayBoard {
    pins: BTreeMap<OutputId, SysfsPin>,
}

impl RelayBoard {
    fn open(config: &Config, outputs: &[OutputId]) -> Result<Self> {
        let mut pins = BTreeMap::new();
        for output in outputs {
            let number = config.relay_pin(*output)?;
            let pin = SysfsPin::export(number)
                .with_context(|| format!("Cannot export GPIO {number} for relay {output}"))?;
            info!("Relay {output} on GPIO {number}");
            pins.insert(*output, pin);
        }
        Ok(Self { pins })
    }
}

impl ActuatorGateway for RelayBoard {
    fn set_output(&mut self, output: OutputId, on: bool) -> io::Result<()> {
        match self.pins.get_mut(&output) {
            Some(pin) => pin.set(on),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("relay {output} is not configured"),
            )),
        }
    }
}

/// Logs relay decisions without driving any hardware.
struct DryRun;

impl ActuatorGateway for DryRun {
    fn set_output(&mut self, output: OutputId, on: bool) -> io::Result<()> {
        info!("Dry run: relay {output} -> {}", if on { "ON" } else { "OFF" });
        Ok(())
    }
}

/// Opens the configured link.
fn open_link(link: &LinkConfig) -> Result<Box<dyn Transport>> {
    let transport: Box<dyn Transport> = match link {
        LinkConfig::Rtu { .. } => {
            let settings = link.serial_settings().context("Missing serial settings")?;
            info!(
                "Attempting to open RTU link on {} (Baud: {}, DE/RE GPIO: {:?})...",
                settings.device, settings.baud_rate, settings.direction_pin
            );
            Box::new(
                RtuLink::open(&settings)
                    .with_context(|| format!("Cannot open serial port {}", settings.device))?,
            )
        }
        LinkConfig::ModbusRtu { .. } => {
            let settings = link.serial_settings().context("Missing serial settings")?;
            info!(
                "Attempting to connect via RTU to device {} (Baud: {})...",
                settings.device, settings.baud_rate
            );
            Box::new(
                ModbusLink::connect_rtu(&settings)
                    .with_context(|| format!("Cannot open serial port {}", settings.device))?,
            )
        }
        LinkConfig::Tcp { address, timeout } => {
            info!("Attempting to connect via TCP to {address}...");
            Box::new(ModbusLink::connect_tcp(*address, *timeout).with_context(|| {
                format!("Failed to connect to Modbus TCP gateway at {address}")
            })?)
        }
    };
    Ok(transport)
}

fn create_service(config: &Config) -> Result<SensorService<Box<dyn Transport>>> {
    let link = open_link(&config.link)?;
    let mut service = SensorService::new(
        link,
        config.sensors.layout()?,
        config.calibration.calibration()?,
    )
    .with_retry_policy(config.sensors.retry_policy()?);
    for (address, layout) in config.sensors.device_layouts()? {
        service = service.with_device_layout(address, layout);
    }
    if let Some(limits) = config.plausibility_limits()? {
        service = service.with_plausibility(limits);
    }
    Ok(service)
}

fn create_automation(config: &Config, dry_run: bool) -> Result<Automation<Box<dyn ActuatorGateway>>> {
    let control = &config.control;
    let outputs: Vec<_> = control
        .humidifier
        .iter()
        .map(|humidifier| humidifier.output)
        .chain(control.air_conditioner.iter().map(|ac| ac.output))
        .collect();
    let gateway: Box<dyn ActuatorGateway> = if dry_run {
        Box::new(DryRun)
    } else {
        Box::new(RelayBoard::open(config, &outputs)?)
    };

    let mut automation = Automation::new(gateway);
    if let Some(humidifier) = &control.humidifier {
        automation = automation.with_humidifier(
            humidifier.controller()?,
            humidifier.output,
            humidifier.label.clone(),
            humidifier.source,
        );
    }
    if let Some(ac) = &control.air_conditioner {
        automation = automation.with_air_conditioner(
            ac.controller()?,
            ac.output,
            ac.label.clone(),
            ac.source,
        );
    }
    automation
        .sync_outputs()
        .context("Cannot switch relays to their initial state")?;
    Ok(automation)
}

fn print_reading(reading: &Reading, ranges: &ReferenceRanges) {
    println!("{reading}");
    if let Some(measurement) = reading.measurement() {
        for (parameter, value) in measurement.calibrated.iter() {
            let health = ranges
                .classify(parameter, value)
                .map(|health| format!(" ({health})"))
                .unwrap_or_default();
            println!("  {parameter}: {value:.2} {}{health}", parameter.unit());
        }
    }
}

fn handle_read(config: &Config, addresses: &[proto::Address]) -> Result<()> {
    let service = create_service(config)?;
    let addresses = if addresses.is_empty() {
        config.sensors.addresses.as_slice()
    } else {
        addresses
    };
    let ranges = ReferenceRanges::default();
    let readings = service.read_all(addresses);
    for reading in &readings {
        print_reading(reading, &ranges);
    }
    if readings.iter().all(|reading| !reading.is_valid()) {
        bail!("No sensor returned a valid reading");
    }
    Ok(())
}

fn handle_daemon(config: &Config, poll_interval: Duration, dry_run: bool) -> Result<()> {
    let service = create_service(config)?;
    let mut automation = create_automation(config, dry_run)?;
    let ranges = ReferenceRanges::default();
    info!(
        "Starting daemon mode: sensors={:?}, interval={poll_interval:?}, dry_run={dry_run}",
        config.sensors.addresses
    );
    loop {
        debug!("Daemon: Reading sensors...");
        let readings = service.read_all(&config.sensors.addresses);
        for reading in &readings {
            print_reading(reading, &ranges);
        }
        for state in automation.evaluate(&readings) {
            println!("{state}");
        }
        std::thread::sleep(poll_interval);
    }
}

fn handle_scan(config: &Config, from: proto::Address, to: proto::Address) -> Result<()> {
    if from > to {
        bail!("Scan range {from}..{to} is empty");
    }
    let service = create_service(config)?
        .with_retry_policy(RetryPolicy::new(1, Duration::ZERO)?);
    info!("Starting scan of addresses {from} to {to}");
    let mut found = 0;
    for address in *from..=*to {
        let address = proto::Address::try_from(address)?;
        print!("Probing address {address} ... ");
        stdout().flush().context("Failed to flush stdout")?;
        match service.read_registers(address) {
            Ok(words) => {
                found += 1;
                println!("FOUND");
                let raw: Vec<_> = words.iter().map(|word| format!("{word:#06x}")).collect();
                println!("  Registers: [{}]", raw.join(", "));
                match service.layout_for(address).decode(&words) {
                    Ok(values) => println!("  Values: {values}"),
                    Err(error) => println!("  Values: {error}"),
                }
            }
            Err(failure) => {
                println!("no response.");
                debug!("Scan error at address {address}: {failure}");
            }
        }
    }
    println!("Scan complete: {found} sensor(s) found.");
    Ok(())
}

fn handle_calibration(config: &Config, address: Option<proto::Address>) -> Result<()> {
    let calibration = config.calibration.calibration()?;
    let Some(table) = calibration.table() else {
        println!("Calibration disabled: raw values are reported unchanged.");
        return Ok(());
    };
    let addresses = match address {
        Some(address) => vec![address],
        None => config.sensors.addresses.clone(),
    };
    for address in addresses {
        println!("{}", table.describe(address));
    }
    Ok(())
}

fn handle_status(config: &Config) -> Result<()> {
    match &config.link {
        LinkConfig::Tcp { address, timeout } => {
            println!("Link: Modbus TCP {address} (timeout {timeout:?})");
        }
        link => {
            if let Some(settings) = link.serial_settings() {
                println!(
                    "Link: {} at {} baud (timeout {:?}, DE/RE GPIO {:?})",
                    settings.device, settings.baud_rate, settings.timeout, settings.direction_pin
                );
            }
        }
    }
    let layout = config.sensors.layout()?;
    let addresses: Vec<_> = config.sensors.addresses.iter().map(ToString::to_string).collect();
    println!("Sensors: [{}]", addresses.join(", "));
    println!(
        "Registers: start {}, count {}, {} fields",
        layout.start(),
        layout.count(),
        layout.fields().len()
    );
    for (address, layout) in config.sensors.device_layouts()? {
        println!(
            "Registers of sensor {address}: start {}, count {}, {} fields",
            layout.start(),
            layout.count(),
            layout.fields().len()
        );
    }
    let retry = config.sensors.retry_policy()?;
    println!(
        "Retries: {} attempts, backoff {:?}, poll interval {:?}",
        retry.attempts, retry.backoff, config.sensors.poll_interval
    );
    let calibration = config.calibration.calibration()?;
    match calibration.table() {
        Some(table) => println!("Calibration: enabled ({} entries)", table.len()),
        None => println!("Calibration: disabled"),
    }
    if let Some(humidifier) = &config.control.humidifier {
        println!(
            "Relay {} ({}): GPIO {}, humidity on < {}% / off >= {}%, source sensor {}",
            humidifier.output,
            humidifier.label,
            config.relay_pin(humidifier.output)?,
            humidifier.humidity.on,
            humidifier.humidity.off,
            humidifier.source
        );
    }
    if let Some(ac) = &config.control.air_conditioner {
        println!(
            "Relay {} ({}): GPIO {}, on at >= {}°C or >= {}%, off at <= {}°C and <= {}%, source sensor {}",
            ac.output,
            ac.label,
            config.relay_pin(ac.output)?,
            ac.temperature.on,
            ac.humidity.on,
            ac.temperature.off,
            ac.humidity.off,
            ac.source
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "Soil monitor CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Configuration errors abort before the bus is opened
    let config = Config::load(&args.config)?;

    // 3. Execute the command
    match &args.command {
        commandline::CliCommands::Read { address } => {
            info!("Executing: Read Sensors");
            handle_read(&config, address)?;
        }
        commandline::CliCommands::Daemon {
            poll_interval,
            dry_run,
        } => {
            let poll_interval = poll_interval.unwrap_or(config.sensors.poll_interval);
            handle_daemon(&config, poll_interval, *dry_run)?;
        }
        commandline::CliCommands::Scan { from, to } => {
            handle_scan(&config, *from, *to)?;
        }
        commandline::CliCommands::Calibration { address } => {
            info!("Executing: Show Calibration");
            handle_calibration(&config, *address)?;
        }
        commandline::CliCommands::Status => {
            handle_status(&config)?;
        }
    }

    Ok(())
}
