//! Configuration file handling.
//!
//! Any problem with a configuration file is logged and the built-in defaults
//! are used instead; the monitor must keep running unattended.

use crate::commandline::CliArgs;
use anyhow::{Context, Result};
use log::*;
use serde::Deserialize;
use smsups_lib::{poller::PollSettings, protocol as proto};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIRS: [&str; 2] = [".", "config"];
const YAML_FILE_NAMES: [&str; 2] = ["config.yml", "config.yaml"];
const JSON_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub settings: PollSettings,
    pub ups_name: String,
    pub ups_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings: PollSettings::default(),
            ups_name: String::from("SMS"),
            ups_id: String::from("01"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PortList {
    Joined(String),
    List(Vec<String>),
}

impl PortList {
    fn into_ports(self) -> Vec<String> {
        match self {
            PortList::Joined(ports) => split_ports(&ports),
            PortList::List(ports) => split_ports(&ports.join(",")),
        }
    }
}

/// Contents of a YAML configuration file, every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    ports: Option<PortList>,
    baud_rate: Option<u32>,
    #[serde(with = "humantime_serde")]
    poll_interval: Option<Duration>,
    full_power: Option<u32>,
    #[serde(with = "humantime_serde")]
    read_timeout: Option<Duration>,
    ups_name: Option<String>,
    ups_id: Option<String>,
}

/// Home Assistant add-on options, `{"options": {...}}`.
#[derive(Debug, Clone, Default, Deserialize)]
struct HaOptionsFile {
    #[serde(default)]
    options: HaOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct HaOptions {
    #[serde(rename = "PORTA")]
    ports: String,
    #[serde(rename = "BAUD_RATE")]
    baud_rate: u32,
    #[serde(rename = "SMSUPS_FULL_POWER")]
    full_power: u32,
    #[serde(rename = "UPS_NAME")]
    ups_name: String,
    #[serde(rename = "UPS_ID")]
    ups_id: String,
}

impl From<HaOptions> for FileConfig {
    fn from(options: HaOptions) -> Self {
        let non_empty = |s: String| (!s.trim().is_empty()).then_some(s);
        Self {
            ports: non_empty(options.ports).map(PortList::Joined),
            baud_rate: Some(options.baud_rate).filter(|rate| *rate != 0),
            full_power: Some(options.full_power).filter(|watts| *watts != 0),
            ups_name: non_empty(options.ups_name),
            ups_id: non_empty(options.ups_id),
            ..Self::default()
        }
    }
}

/// Splits a comma separated port list, trimming blanks and quotes.
///
/// Falls back to the default port if nothing is left.
pub fn split_ports(ports: &str) -> Vec<String> {
    let ports: Vec<String> = ports
        .split(',')
        .map(|port| port.trim().trim_matches(|c| c == '"' || c == '\'').trim())
        .filter(|port| !port.is_empty())
        .map(String::from)
        .collect();
    if ports.is_empty() {
        vec![PollSettings::DEFAULT_PORT.to_string()]
    } else {
        ports
    }
}

impl Config {
    /// Takes over the valid values of `file`, invalid ones keep their current value.
    fn merge(&mut self, file: FileConfig) {
        if let Some(ports) = file.ports {
            self.settings.ports = ports.into_ports();
        }
        if let Some(rate) = file.baud_rate {
            match proto::BaudRate::try_from(rate) {
                Ok(baud_rate) => self.settings.baud_rate = baud_rate,
                Err(error) => warn!("Ignoring configured baud rate: {error}"),
            }
        }
        match file.poll_interval {
            Some(interval) if interval.is_zero() => warn!("Ignoring zero poll interval"),
            Some(interval) => self.settings.poll_interval = interval,
            None => {}
        }
        if let Some(watts) = file.full_power {
            match proto::FullPower::try_from(watts) {
                Ok(full_power) => self.settings.full_power = full_power,
                Err(error) => warn!("Ignoring configured full power: {error}"),
            }
        }
        if let Some(timeout) = file.read_timeout {
            self.settings.read_timeout = Some(timeout);
        }
        if let Some(name) = file.ups_name {
            self.ups_name = name.trim().to_string();
        }
        if let Some(id) = file.ups_id {
            self.ups_id = id.trim().to_string();
        }
    }

    /// Applies the command line overrides.
    pub fn apply_args(&mut self, args: &CliArgs) {
        if !args.ports.is_empty() {
            self.settings.ports = split_ports(&args.ports.join(","));
        }
        if let Some(baud_rate) = args.baud_rate {
            self.settings.baud_rate = baud_rate;
        }
        if let Some(full_power) = args.full_power {
            self.settings.full_power = full_power;
        }
        if args.timeout.is_some() {
            self.settings.read_timeout = args.timeout;
        }
    }
}

fn parse_yaml(reader: impl std::io::Read) -> Result<FileConfig> {
    Ok(serde_yaml::from_reader(reader)?)
}

fn parse_ha_options(reader: impl std::io::Read) -> Result<FileConfig> {
    let file: HaOptionsFile = serde_json::from_reader(reader)?;
    Ok(file.options.into())
}

fn read_config_file(path: &Path) -> Result<FileConfig> {
    let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
    if is_json {
        parse_ha_options(file).with_context(|| format!("Cannot parse {}", path.display()))
    } else {
        parse_yaml(file).with_context(|| format!("Cannot parse {}", path.display()))
    }
}

fn find_config_files() -> Vec<PathBuf> {
    let find = |names: &[&str]| {
        CONFIG_DIRS
            .iter()
            .flat_map(|dir| names.iter().map(move |name| Path::new(dir).join(name)))
            .find(|path| path.is_file())
    };
    // A YAML file first, options JSON values take precedence.
    find(&YAML_FILE_NAMES)
        .into_iter()
        .chain(find(&[JSON_FILE_NAME]))
        .collect()
}

/// Loads the configuration, falling back to defaults on any error.
pub fn get_config(path: Option<&Path>) -> Config {
    let paths = match path {
        Some(path) => vec![path.to_path_buf()],
        None => find_config_files(),
    };
    let mut config = Config::default();
    if paths.is_empty() {
        debug!("No config file found, using defaults");
    }
    for path in paths {
        debug!("Loading config file from {:?}", &path);
        match read_config_file(&path) {
            Ok(file) => config.merge(file),
            Err(error) => warn!("Config load warning: {error:#} (using defaults)"),
        }
    }
    config
}
