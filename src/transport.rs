//! Serial transport for the SMS UPS.
//!
//! [`Transport`] owns at most one open serial connection and performs one
//! query/response exchange at a time. It never reconnects on its own: after
//! an I/O error the caller is expected to [`Transport::close`] it and open it
//! again later.
//!
//! ## Example
//!
//! ```no_run
//! use smsups_lib::protocol::{self as proto, BaudRate};
//! use smsups_lib::transport::{SerialOpener, Transport};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut transport = Transport::new(SerialOpener);
//!     transport.open(&["/dev/ttyUSB0", "/dev/ttyUSB1"], &BaudRate::B2400, None)?;
//!     transport.wake();
//!
//!     let frame = transport.exchange(&proto::build_query_command())?;
//!     println!("{}", proto::decode(&frame)?);
//!     Ok(())
//! }
//! ```

use crate::protocol as proto;
use log::*;
use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

/// Represents all possible errors of the serial transport.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Open was called with an empty list of ports.
    #[error("no serial port configured")]
    NoPortCandidates,

    /// The port could not be opened.
    #[error("cannot open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    /// The port was opened but refused the read timeout.
    #[error("cannot set read timeout on {port}: {source}")]
    ReadTimeout {
        port: String,
        #[source]
        source: io::Error,
    },

    /// An exchange was attempted without an open connection.
    #[error("serial port is not open")]
    NotOpen,

    /// Writing the command failed.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// Reading the response failed, `partial` holds the bytes received so far.
    #[error("read failed after {} bytes: {source}", .partial.len())]
    Read {
        partial: Vec<u8>,
        #[source]
        source: io::Error,
    },
}

/// The result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The parity used for serial communication.
pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::None;
/// The number of stop bits used for serial communication.
pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
/// The number of data bits used for serial communication.
pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;

/// Read timeout used when none or a zero timeout is given to [`Transport::open`].
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause between two command bytes; the device loses sync on burst writes.
pub const INTER_BYTE_DELAY: Duration = Duration::from_millis(100);
/// Time the device needs to process a command before it answers.
pub const SETTLE_DELAY: Duration = Duration::from_millis(300);
/// Pause between two read cycles.
pub const READ_CYCLE_DELAY: Duration = Duration::from_millis(50);
/// Maximum number of read cycles per exchange.
pub const READ_CYCLES: usize = 5;
/// Size of the buffer used for a single read.
pub const READ_CHUNK_LEN: usize = 32;
/// How long DTR is held low while waking the device.
pub const WAKE_LOW_DELAY: Duration = Duration::from_millis(100);
/// How long to wait after DTR went high again.
pub const WAKE_HIGH_DELAY: Duration = Duration::from_millis(200);

/// Creates a `tokio_serial::SerialPortBuilder` with the specified settings.
///
/// # Arguments
///
/// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0`).
/// * `baud_rate` - The baud rate for the serial communication.
pub fn serial_port_builder(
    device: &str,
    baud_rate: &proto::BaudRate,
) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, u32::from(baud_rate))
        .parity(*PARITY)
        .stop_bits(*STOP_BITS)
        .data_bits(*DATA_BITS)
        .flow_control(tokio_serial::FlowControl::None)
}

/// Lists the serial ports present on this host.
pub fn available_ports() -> tokio_serial::Result<Vec<String>> {
    Ok(tokio_serial::available_ports()?
        .into_iter()
        .map(|info| info.port_name)
        .collect())
}

/// A byte stream to the device with the few serial line controls the protocol needs.
pub trait Link: Read + Write + Send {
    /// Drops any bytes waiting in the input buffer.
    fn discard_input(&mut self) -> io::Result<()>;

    /// Sets the level of the DTR control line.
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;

    /// Sets how long a single read may block.
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

impl Link for Box<dyn tokio_serial::SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        Ok(self.clear(tokio_serial::ClearBuffer::Input)?)
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        Ok(self.write_data_terminal_ready(level)?)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        Ok(self.set_timeout(timeout)?)
    }
}

/// Opens a [`Link`] by port name.
pub trait Opener {
    type Link: Link;

    fn open(&self, port: &str, baud_rate: &proto::BaudRate) -> tokio_serial::Result<Self::Link>;
}

/// Opens real serial ports, 8N1 without flow control.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl Opener for SerialOpener {
    type Link = Box<dyn tokio_serial::SerialPort>;

    fn open(&self, port: &str, baud_rate: &proto::BaudRate) -> tokio_serial::Result<Self::Link> {
        serial_port_builder(port, baud_rate).open()
    }
}

/// Device timing of one exchange.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pacing {
    pub inter_byte: Duration,
    pub settle: Duration,
    pub read_cycle: Duration,
    pub wake_low: Duration,
    pub wake_high: Duration,
}

impl Pacing {
    pub const DEVICE: Pacing = Pacing {
        inter_byte: INTER_BYTE_DELAY,
        settle: SETTLE_DELAY,
        read_cycle: READ_CYCLE_DELAY,
        wake_low: WAKE_LOW_DELAY,
        wake_high: WAKE_HIGH_DELAY,
    };

    #[cfg(test)]
    pub const NONE: Pacing = Pacing {
        inter_byte: Duration::ZERO,
        settle: Duration::ZERO,
        read_cycle: Duration::ZERO,
        wake_low: Duration::ZERO,
        wake_high: Duration::ZERO,
    };
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

/// A read that ran into the timeout just means the device had nothing more to send.
fn is_quiet(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

struct Connection<L> {
    link: L,
    port: String,
    read_timeout: Duration,
}

/// Owns the serial connection to the UPS.
pub struct Transport<O: Opener = SerialOpener> {
    opener: O,
    connection: Option<Connection<O::Link>>,
    pacing: Pacing,
}

impl<O: Opener> Transport<O> {
    /// Creates a closed transport that opens its ports with `opener`.
    pub fn new(opener: O) -> Self {
        Self {
            opener,
            connection: None,
            pacing: Pacing::DEVICE,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Name of the currently open port.
    pub fn port(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.port.as_str())
    }

    /// Read timeout of the currently open port.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.connection.as_ref().map(|c| c.read_timeout)
    }

    /// Opens the first of `candidates` that opens and accepts the read timeout.
    ///
    /// A connection that is already open is closed first. If every candidate
    /// fails, the error of the last one is returned.
    ///
    /// # Arguments
    ///
    /// * `candidates` - Port names, tried in order.
    /// * `baud_rate` - The baud rate the device is configured for.
    /// * `read_timeout` - Timeout of a single read, [`DEFAULT_READ_TIMEOUT`] if `None` or zero.
    pub fn open<S: AsRef<str>>(
        &mut self,
        candidates: &[S],
        baud_rate: &proto::BaudRate,
        read_timeout: Option<Duration>,
    ) -> Result<()> {
        self.close();
        let read_timeout = read_timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(DEFAULT_READ_TIMEOUT);

        let mut last_error = Error::NoPortCandidates;
        for port in candidates.iter().map(AsRef::as_ref) {
            debug!("Opening {port} at {baud_rate} baud");
            let mut link = match self.opener.open(port, baud_rate) {
                Ok(link) => link,
                Err(source) => {
                    debug!("Cannot open {port}: {source}");
                    last_error = Error::Open {
                        port: port.to_string(),
                        source,
                    };
                    continue;
                }
            };
            if let Err(source) = link.set_read_timeout(read_timeout) {
                debug!("Cannot set read timeout on {port}: {source}");
                last_error = Error::ReadTimeout {
                    port: port.to_string(),
                    source,
                };
                continue;
            }
            info!("Opened {port} at {baud_rate} baud");
            self.connection = Some(Connection {
                link,
                port: port.to_string(),
                read_timeout,
            });
            return Ok(());
        }
        Err(last_error)
    }

    /// Pulses DTR low and high again, some models only answer after this.
    ///
    /// Does nothing if no port is open. Control line errors are only logged.
    pub fn wake(&mut self) {
        let pacing = self.pacing;
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        trace!("Waking device on {}", connection.port);
        if let Err(error) = connection.link.set_dtr(false) {
            debug!("Cannot lower DTR on {}: {error}", connection.port);
        }
        pause(pacing.wake_low);
        if let Err(error) = connection.link.set_dtr(true) {
            debug!("Cannot raise DTR on {}: {error}", connection.port);
        }
        pause(pacing.wake_high);
    }

    /// Sends `command` and collects the response.
    ///
    /// The command is written byte by byte with [`INTER_BYTE_DELAY`] in
    /// between. After [`SETTLE_DELAY`] up to [`READ_CYCLES`] reads are made,
    /// stopping as soon as [`proto::FRAME_LEN`] bytes arrived. A short
    /// response is returned as is; validating it is left to the decoder.
    pub fn exchange(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let pacing = self.pacing;
        let connection = self.connection.as_mut().ok_or(Error::NotOpen)?;
        let link = &mut connection.link;

        if let Err(error) = link.discard_input() {
            debug!("Cannot discard stale input on {}: {error}", connection.port);
        }

        trace!("Sending {} to {}", hex::encode(command), connection.port);
        for (index, byte) in command.iter().enumerate() {
            link.write_all(std::slice::from_ref(byte))
                .map_err(Error::Write)?;
            if index + 1 < command.len() {
                pause(pacing.inter_byte);
            }
        }
        link.flush().map_err(Error::Write)?;

        pause(pacing.settle);

        let mut chunk = [0u8; READ_CHUNK_LEN];
        let mut response = Vec::with_capacity(READ_CHUNK_LEN);
        for cycle in 0..READ_CYCLES {
            match link.read(&mut chunk) {
                Ok(len) => response.extend_from_slice(&chunk[..len]),
                Err(error) if is_quiet(&error) => {}
                Err(source) => {
                    return Err(Error::Read {
                        partial: response,
                        source,
                    })
                }
            }
            if response.len() >= proto::FRAME_LEN {
                break;
            }
            if cycle + 1 < READ_CYCLES {
                pause(pacing.read_cycle);
            }
        }
        trace!(
            "Received {} bytes from {}: {}",
            response.len(),
            connection.port,
            hex::encode(&response)
        );
        Ok(response)
    }

    /// Closes the connection. Calling it without an open connection is a no-op.
    pub fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            info!("Closing {}", connection.port);
        }
    }
}
