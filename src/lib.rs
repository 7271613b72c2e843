//! A library for monitoring SMS UPS units over their serial interface.
//!
//! The UPS is polled with a single fixed query command and answers with a
//! binary status frame. This crate is split into three layers:
//!
//! 1.  **Protocol**: Building the query command, checksums and decoding status
//!     frames into strongly typed readings. See [`protocol`].
//!
//! 2.  **Transport**: Opening one of several candidate serial ports, waking the
//!     device and running a paced query/response exchange. See [`transport`].
//!
//! 3.  **Poller**: A poll loop that keeps the connection alive, reconnects after
//!     failures and publishes immutable snapshots to observers. See [`poller`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use smsups_lib::{
//!     poller::{PollSettings, Poller, Snapshot},
//!     protocol::{BaudRate, FullPower},
//!     transport::SerialOpener,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = PollSettings {
//!         ports: vec!["/dev/ttyUSB0".into(), "/dev/ttyACM0".into()],
//!         baud_rate: BaudRate::B2400,
//!         full_power: FullPower::try_from(1400)?,
//!         ..PollSettings::default()
//!     };
//!     let mut poller = Poller::new(settings, SerialOpener);
//!
//!     let mut snapshots: Vec<Snapshot> = Vec::new();
//!     poller.poll_once(&mut snapshots);
//!     for snapshot in snapshots {
//!         println!("connected: {}, {}", snapshot.connected, snapshot.reading);
//!     }
//!     Ok(())
//! }
//! ```

pub mod protocol;

#[cfg_attr(docsrs, doc(cfg(feature = "serial")))]
#[cfg(feature = "serial")]
pub mod transport;

#[cfg_attr(docsrs, doc(cfg(feature = "serial")))]
#[cfg(feature = "serial")]
pub mod poller;

#[cfg(all(test, feature = "serial"))]
mod mock_serial;
