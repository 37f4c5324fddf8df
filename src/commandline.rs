use crate::config::DEFAULT_CONFIG_FILE;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use soilmon_lib::protocol as proto;
use std::path::PathBuf;
use std::time::Duration;

fn parse_address(s: &str) -> Result<proto::Address, String> {
    let address_val =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    proto::Address::try_from(address_val).map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Read and display calibrated values of the configured sensors.
    Read {
        /// Only read these sensor addresses (1 to 247) instead of the configured ones.
        /// Can be specified in decimal or hexadecimal (e.g., "0x01").
        #[arg(short, long, value_parser = parse_address, verbatim_doc_comment)]
        address: Vec<proto::Address>,
    },

    /// Run in daemon mode: poll all sensors at a fixed interval and drive the
    /// configured humidifier and air conditioner relays from the readings.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Interval between polls (e.g., "10s", "1m").
        /// Overrides `sensors.poll_interval` of the configuration file.
        #[arg(value_parser = humantime::parse_duration, short, long, verbatim_doc_comment)]
        poll_interval: Option<Duration>,

        /// Log relay decisions without touching the relay GPIOs.
        #[arg(long)]
        dry_run: bool,
    },

    /// Probe a range of addresses and print the raw registers of every
    /// responding sensor together with the decoded values.
    /// **Warning:** Addresses are probed one after the other; a large range on
    /// a slow bus takes `timeout * retries` per silent address.
    #[clap(verbatim_doc_comment)]
    Scan {
        /// First address to probe.
        #[arg(long, default_value_t = proto::Address::default(), value_parser = parse_address)]
        from: proto::Address,

        /// Last address to probe.
        #[arg(long, default_value = "10", value_parser = parse_address)]
        to: proto::Address,
    },

    /// Show the calibration coefficients of the configured sensors.
    Calibration {
        /// Only show this sensor address.
        #[arg(short, long, value_parser = parse_address)]
        address: Option<proto::Address>,
    },

    /// Show the link, sensors, controller thresholds and relay assignments.
    Status,
}

const fn about_text() -> &'static str {
    "Soil monitor CLI - Poll NPK soil sensors via Modbus RTU and control climate relays."
}

#[derive(Parser, Debug)]
#[command(name="soilmon", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// YAML configuration file.
    #[arg(global = true, short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: CliCommands,
}
