use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use smsups_lib::protocol as proto;
use std::path::PathBuf;
use std::time::Duration;

fn parse_baud_rate(s: &str) -> Result<proto::BaudRate, String> {
    let rate_val = s
        .parse::<u32>()
        .map_err(|e| format!("Invalid baud rate number format: {e}"))?;
    proto::BaudRate::try_from(rate_val).map_err(|e| e.to_string())
}

fn parse_full_power(s: &str) -> Result<proto::FullPower, String> {
    let watts = s
        .parse::<u32>()
        .map_err(|e| format!("Invalid full power format: {e}"))?;
    proto::FullPower::try_from(watts).map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode: continuously poll the UPS at a specified interval
    /// and print a status line for every poll.
    /// Connection losses are reported and the port is reopened on the next poll.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Interval between two polls (e.g., "3s", "1m"). Values below one second are raised to one second.
        /// Defaults to the configuration file value or "3s".
        #[arg(value_parser = humantime::parse_duration, short = 'i', long, verbatim_doc_comment)]
        poll_interval: Option<Duration>,

        /// Print every snapshot as a JSON line instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Query the UPS once and print the decoded reading.
    Read,

    /// Decode a captured status frame given as hex text, e.g. "3d00e600e6...".
    /// No serial port is opened.
    #[clap(verbatim_doc_comment)]
    Decode {
        /// The frame in hex, whitespace between bytes is allowed.
        frame: String,
    },

    /// List the serial ports available on this host.
    ListPorts,
}

const fn about_text() -> &'static str {
    "SMS UPS monitor - Poll SMS UPS units over their serial interface."
}

#[derive(Parser, Debug)]
#[command(name="upsmon", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: CliCommands,

    /// Configuration file (YAML, or Home Assistant add-on options JSON).
    /// Without this option "config.yml", "config.yaml" and "config.json"
    /// are searched in the working directory and in "./config".
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub config: Option<PathBuf>,

    /// Serial port device name, tried in the given order until one opens.
    /// Can be repeated or comma separated, e.g. "/dev/ttyUSB0,/dev/ttyUSB1" (Linux), "COM3" (Windows).
    #[arg(global = true, short, long = "port", value_delimiter = ',', verbatim_doc_comment)]
    pub ports: Vec<String>,

    /// Baud rate for serial communication.
    /// Supported values: 2400, 4800, 9600.
    #[arg(global = true, long, value_parser = parse_baud_rate, verbatim_doc_comment)]
    pub baud_rate: Option<proto::BaudRate>,

    /// Rated power of the UPS at 100% load in watts, used to compute the current wattage.
    #[arg(global = true, long, value_parser = parse_full_power)]
    pub full_power: Option<proto::FullPower>,

    /// Serial read timeout.
    /// Examples: "2s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,
}
