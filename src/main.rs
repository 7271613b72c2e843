//! SMS UPS monitor CLI
//!
//! A command-line interface (CLI) application for monitoring SMS UPS units
//! through their serial interface.
//!
//! This tool allows users to:
//! - Run a continuous daemon that polls the UPS, reconnects after failures and
//!   prints one status line (or JSON document) per poll.
//! - Query the UPS once and print every decoded value.
//! - Decode a captured status frame offline.
//! - List the serial ports of the host.
//!
//! The CLI leverages the `smsups_lib` crate for the protocol, the serial
//! transport and the poll loop.

use anyhow::{bail, Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use smsups_lib::{
    poller::{self, Poller, Snapshot},
    protocol as proto,
    transport::{self, SerialOpener, Transport},
};
use std::panic;

mod commandline;
mod config;

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

/// Renders a snapshot as a single console line.
fn render_snapshot(snapshot: &Snapshot) -> String {
    let connection = if snapshot.connected {
        "● Connected"
    } else {
        "○ Disconnected"
    };
    let mut line = format!(
        "{connection} | {} | {}",
        snapshot.reading.condition(),
        snapshot.reading
    );
    if let Some(diagnostic) = &snapshot.diagnostic {
        line.push_str(" | Debug: ");
        line.push_str(diagnostic);
    }
    line
}

fn active_flags(status: &proto::Status) -> Vec<&'static str> {
    [
        (status.battery_in_use, "battery in use"),
        (status.battery_low, "battery low"),
        (status.bypass_active, "bypass"),
        (status.boost_active, "boost"),
        (status.line_ok, "line ok"),
        (status.test_active, "test"),
        (status.shutdown_active, "shutdown"),
        (status.beep_enabled, "beep"),
    ]
    .into_iter()
    .filter_map(|(active, name)| active.then_some(name))
    .collect()
}

fn print_reading(reading: &proto::Reading) {
    println!("Status: {}", reading.condition());
    println!("Last input voltage: {:.1} V", reading.last_input_voltage);
    println!("Input voltage: {:.1} V", reading.input_voltage);
    println!("Output voltage: {:.1} V", reading.output_voltage);
    println!("Output load: {:.1} %", reading.output_load);
    println!("Output power: {:.0} W", reading.watts);
    println!("Output frequency: {:.1} Hz", reading.output_frequency);
    println!("Battery level: {:.1} %", reading.battery_level);
    println!("Temperature: {:.1} °C", reading.temperature);
    let flags = active_flags(&reading.status);
    if flags.is_empty() {
        println!("Flags: none");
    } else {
        println!("Flags: {}", flags.join(", "));
    }
}

fn handle_read(config: &config::Config) -> Result<()> {
    let settings = &config.settings;
    info!("Executing: Read UPS status from {:?}", settings.ports);
    let mut transport = Transport::new(SerialOpener);
    transport
        .open(
            settings.ports.as_slice(),
            &settings.baud_rate,
            settings.read_timeout,
        )
        .with_context(|| format!("Cannot open serial port at {} baud", settings.baud_rate))?;
    transport.wake();

    let response = transport
        .exchange(&proto::build_query_command())
        .with_context(|| "Cannot query UPS status")?;
    transport.close();

    let reading = proto::decode(&response)
        .with_context(|| {
            format!(
                "Cannot decode {} byte response [{}]",
                response.len(),
                hex::encode(&response)
            )
        })?
        .with_full_power(settings.full_power);
    println!("SMS UPS - {}_{}", config.ups_name, config.ups_id);
    print_reading(&reading);
    Ok(())
}

fn handle_decode(frame: &str, config: &config::Config) -> Result<()> {
    info!("Executing: Decode frame {frame}");
    let reading = proto::decode_hex(frame)
        .with_context(|| format!("Cannot decode frame '{frame}'"))?
        .with_full_power(config.settings.full_power);
    print_reading(&reading);
    Ok(())
}

fn handle_list_ports() -> Result<()> {
    info!("Executing: List serial ports");
    let ports = transport::available_ports().with_context(|| "Cannot enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn handle_daemon(config: config::Config, json: bool) -> Result<()> {
    let poller = Poller::new(config.settings, SerialOpener);
    let settings = poller.settings();
    info!(
        "Starting daemon mode: ports={:?}, baud={}, interval={:?}, full power={}",
        settings.ports,
        settings.baud_rate,
        settings.effective_interval(),
        settings.full_power
    );
    if !json {
        println!("SMS UPS - {}_{}", config.ups_name, config.ups_id);
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Snapshot>();
    let worker = poller::spawn(poller, tx).with_context(|| "Cannot start poll thread")?;

    while let Some(snapshot) = rx.blocking_recv() {
        if json {
            println!(
                "{}",
                serde_json::to_string(&snapshot).with_context(|| "Cannot serialize snapshot")?
            );
        } else {
            println!("{}", render_snapshot(&snapshot));
        }
    }

    if worker.join().is_err() {
        bail!("Poll thread panicked");
    }
    bail!("Poll thread stopped unexpectedly");
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "SMS UPS monitor started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Load the configuration, command line values win
    let mut config = config::get_config(args.config.as_deref());
    config.apply_args(&args);
    trace!("Config: {config:?}");

    // 3. Execute the command
    match args.command {
        commandline::CliCommands::Daemon {
            poll_interval,
            json,
        } => {
            if let Some(poll_interval) = poll_interval {
                config.settings.poll_interval = poll_interval;
            }
            handle_daemon(config, json)
        }
        commandline::CliCommands::Read => handle_read(&config),
        commandline::CliCommands::Decode { ref frame } => handle_decode(frame, &config),
        commandline::CliCommands::ListPorts => handle_list_ports(),
    }
}
