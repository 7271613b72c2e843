//! Poll loop driving the transport, the decoder and the wattage derivation.
//!
//! A [`Poller`] owns the [`Transport`] and is meant to run on exactly one
//! background thread (see [`spawn`]). Once per interval it publishes an
//! immutable [`Snapshot`] to a [`SnapshotSink`], so observers never see a
//! half updated state and never touch the serial port.
//!
//! ```no_run
//! use smsups_lib::poller::{self, PollSettings, Poller, Snapshot};
//! use smsups_lib::transport::SerialOpener;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Snapshot>();
//! let poller = Poller::new(PollSettings::default(), SerialOpener);
//! poller::spawn(poller, tx)?;
//!
//! while let Some(snapshot) = rx.blocking_recv() {
//!     println!("{}", snapshot.reading);
//! }
//! # Ok::<(), std::io::Error>(())
//! ```

use crate::protocol::{self as proto, BaudRate, FullPower, Reading};
use crate::transport::{Opener, SerialOpener, Transport};
use log::*;
use std::thread;
use std::time::Duration;

/// Shortest interval between two polls, whatever is configured.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Number of response bytes shown as hex in a decode failure diagnostic.
const HEX_PREVIEW_BYTES: usize = 30;

/// Connection and scaling settings of the poll loop.
///
/// They are read once when the [`Poller`] is created and never change while it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    /// Serial ports tried in order until one opens.
    pub ports: Vec<String>,
    pub baud_rate: BaudRate,
    pub poll_interval: Duration,
    pub full_power: FullPower,
    /// Read timeout of the port, the transport default if `None`.
    pub read_timeout: Option<Duration>,
}

impl PollSettings {
    pub const DEFAULT_PORT: &'static str = "/dev/ttyUSB0";
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

    /// The poll interval, never shorter than [`MIN_POLL_INTERVAL`].
    pub fn effective_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            ports: vec![Self::DEFAULT_PORT.to_string()],
            baud_rate: BaudRate::default(),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            full_power: FullPower::default(),
            read_timeout: None,
        }
    }
}

/// State of the connection to the UPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// What observers get after each poll step.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// The latest reading, or [`Reading::no_data`].
    pub reading: Reading,
    pub connected: bool,
    /// Why no reading is available, if something went wrong.
    pub diagnostic: Option<String>,
}

impl Snapshot {
    fn disconnected(diagnostic: String) -> Self {
        Self {
            reading: Reading::no_data(),
            connected: false,
            diagnostic: Some(diagnostic),
        }
    }

    fn connected() -> Self {
        Self {
            reading: Reading::no_data(),
            connected: true,
            diagnostic: None,
        }
    }

    fn undecodable(response: &[u8], error: &proto::Error) -> Self {
        Self {
            reading: Reading::no_data(),
            connected: true,
            diagnostic: Some(format!(
                "{} bytes [{}] - {error}",
                response.len(),
                hex_preview(response)
            )),
        }
    }

    fn decoded(reading: Reading) -> Self {
        Self {
            reading,
            connected: true,
            diagnostic: None,
        }
    }

    /// The reading, if one is available.
    pub fn reading(&self) -> Option<&Reading> {
        (!self.reading.no_data).then_some(&self.reading)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            reading: Reading::no_data(),
            connected: false,
            diagnostic: None,
        }
    }
}

/// Hex text of the first [`HEX_PREVIEW_BYTES`] bytes, `...` appended if truncated.
fn hex_preview(response: &[u8]) -> String {
    if response.len() > HEX_PREVIEW_BYTES {
        format!("{}...", hex::encode(&response[..HEX_PREVIEW_BYTES]))
    } else {
        hex::encode(response)
    }
}

/// Receives the snapshots published by the poll loop.
pub trait SnapshotSink {
    fn publish(&mut self, snapshot: Snapshot);
}

/// Latest value slot: readers always see the most recent complete snapshot.
impl SnapshotSink for tokio::sync::watch::Sender<Snapshot> {
    fn publish(&mut self, snapshot: Snapshot) {
        self.send_replace(snapshot);
    }
}

impl SnapshotSink for tokio::sync::mpsc::UnboundedSender<Snapshot> {
    fn publish(&mut self, snapshot: Snapshot) {
        if self.send(snapshot).is_err() {
            trace!("Snapshot receiver is gone");
        }
    }
}

impl SnapshotSink for Vec<Snapshot> {
    fn publish(&mut self, snapshot: Snapshot) {
        self.push(snapshot);
    }
}

/// Drives one UPS: opens the port, queries it and publishes the results.
pub struct Poller<O: Opener = SerialOpener> {
    settings: PollSettings,
    transport: Transport<O>,
    query: proto::Command,
}

impl<O: Opener> Poller<O> {
    pub fn new(settings: PollSettings, opener: O) -> Self {
        Self::with_transport(settings, Transport::new(opener))
    }

    pub(crate) fn with_transport(settings: PollSettings, transport: Transport<O>) -> Self {
        Self {
            settings,
            transport,
            query: proto::build_query_command(),
        }
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        if self.transport.is_open() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Runs one poll step and publishes its outcome to `sink`.
    ///
    /// When disconnected the port is opened first, which publishes a
    /// connected snapshot without data before the query is sent. Transport
    /// errors close the port; decode errors keep it open.
    pub fn poll_once<S: SnapshotSink + ?Sized>(&mut self, sink: &mut S) {
        if !self.transport.is_open() {
            if let Err(error) = self.transport.open(
                self.settings.ports.as_slice(),
                &self.settings.baud_rate,
                self.settings.read_timeout,
            ) {
                warn!("Cannot open UPS port: {error}");
                sink.publish(Snapshot::disconnected(format!("Open: {error}")));
                return;
            }
            self.transport.wake();
            sink.publish(Snapshot::connected());
        }

        let response = match self.transport.exchange(&self.query) {
            Ok(response) => response,
            Err(error) => {
                warn!("UPS query failed, closing port: {error}");
                self.transport.close();
                sink.publish(Snapshot::disconnected(format!("Read: {error}")));
                return;
            }
        };

        match proto::decode(&response) {
            Ok(reading) => {
                let reading = reading.with_full_power(self.settings.full_power);
                debug!("UPS reading: {reading}");
                sink.publish(Snapshot::decoded(reading));
            }
            Err(error) => {
                warn!("Cannot decode UPS response of {} bytes: {error}", response.len());
                sink.publish(Snapshot::undecodable(&response, &error));
            }
        }
    }

    /// Polls forever, sleeping [`PollSettings::effective_interval`] between steps.
    pub fn run<S: SnapshotSink>(mut self, mut sink: S) {
        let interval = self.settings.effective_interval();
        info!(
            "Polling {:?} at {} baud every {interval:?}",
            self.settings.ports, self.settings.baud_rate
        );
        loop {
            self.poll_once(&mut sink);
            thread::sleep(interval);
        }
    }
}

/// Runs `poller` on a dedicated background thread.
pub fn spawn<O, S>(poller: Poller<O>, sink: S) -> std::io::Result<thread::JoinHandle<()>>
where
    O: Opener + Send + 'static,
    S: SnapshotSink + Send + 'static,
{
    thread::Builder::new()
        .name("ups-poller".to_string())
        .spawn(move || poller.run(sink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial::{MockOpener, ReadStep};
    use crate::transport::Pacing;
    use std::time::Instant;

    const FRAME: [u8; 18] = [
        0x3D, 0x00, 0xE6, 0x00, 0xE6, 0x00, 0xE6, 0x03, 0xE8, 0x01, 0xF4, 0x03, 0xE8, 0x00, 0x19,
        0x00, 0x00, 0x00,
    ];

    fn settings(ports: &[&str]) -> PollSettings {
        PollSettings {
            ports: ports.iter().map(|p| p.to_string()).collect(),
            full_power: FullPower::try_from(1400).unwrap(),
            ..PollSettings::default()
        }
    }

    fn poller(ports: &[&str], opener: &MockOpener) -> Poller<MockOpener> {
        Poller::with_transport(
            settings(ports),
            Transport::new(opener.clone()).with_pacing(Pacing::NONE),
        )
    }

    #[test]
    fn decoded_reading() {
        let opener = MockOpener::new().with_reads([ReadStep::Data(FRAME.to_vec())]);
        let mut poller = poller(&["/dev/ttyUSB0"], &opener);
        let mut snapshots = Vec::new();

        poller.poll_once(&mut snapshots);

        assert_eq!(poller.state(), ConnectionState::Connected);
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0], Snapshot::connected());

        let snapshot = &snapshots[1];
        assert!(snapshot.connected);
        assert_eq!(snapshot.diagnostic, None);
        let reading = snapshot.reading().unwrap();
        assert_eq!(reading.input_voltage, 23.0);
        assert_eq!(reading.output_voltage, 23.0);
        assert_eq!(reading.output_load, 100.0);
        assert_eq!(reading.output_frequency, 50.0);
        assert_eq!(reading.battery_level, 100.0);
        assert_eq!(reading.temperature, 2.5);
        assert_eq!(reading.watts, 1400.0);
        assert_eq!(reading.status, proto::Status::default());

        assert_eq!(opener.state().dtr, vec![false, true]);
    }

    #[test]
    fn short_response_keeps_connection() {
        let opener = MockOpener::new().with_reads([ReadStep::Data(FRAME[..10].to_vec())]);
        let mut poller = poller(&["/dev/ttyUSB0"], &opener);
        let mut snapshots = Vec::new();

        poller.poll_once(&mut snapshots);

        assert_eq!(poller.state(), ConnectionState::Connected);
        let snapshot = snapshots.last().unwrap();
        assert!(snapshot.connected);
        assert!(snapshot.reading.no_data);
        assert_eq!(snapshot.reading(), None);
        assert_eq!(
            snapshot.diagnostic.as_deref(),
            Some("10 bytes [3d00e600e600e603e801] - response too short: 10 bytes")
        );

        // Next step reuses the open port.
        opener.push_reads([ReadStep::Data(FRAME.to_vec())]);
        let mut snapshots = Vec::new();
        poller.poll_once(&mut snapshots);
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].reading().is_some());
        assert_eq!(opener.state().opened.len(), 1);
    }

    #[test]
    fn long_garbage_is_truncated() {
        let garbage = vec![0x28; 40];
        let opener = MockOpener::new().with_reads([ReadStep::Data(garbage)]);
        let mut poller = poller(&["/dev/ttyUSB0"], &opener);
        let mut snapshots = Vec::new();

        poller.poll_once(&mut snapshots);

        let diagnostic = snapshots.last().unwrap().diagnostic.clone().unwrap();
        // 32 bytes per read, the frame is complete after the first one.
        assert!(diagnostic.starts_with("32 bytes ["), "{diagnostic}");
        assert!(diagnostic.contains(&format!("[{}...]", "28".repeat(30))), "{diagnostic}");
        assert!(diagnostic.ends_with("invalid header: expected 0x3d, got 0x28"));
        assert_eq!(poller.state(), ConnectionState::Connected);
    }

    #[test]
    fn open_failure() {
        let opener = MockOpener::new()
            .with_unavailable("/dev/ttyUSB0")
            .with_unavailable("/dev/ttyUSB1");
        let mut poller = poller(&["/dev/ttyUSB0", "/dev/ttyUSB1"], &opener);
        let mut snapshots = Vec::new();

        poller.poll_once(&mut snapshots);

        assert_eq!(poller.state(), ConnectionState::Disconnected);
        assert_eq!(snapshots.len(), 1);
        let snapshot = &snapshots[0];
        assert!(!snapshot.connected);
        assert!(snapshot.reading.no_data);
        let diagnostic = snapshot.diagnostic.as_deref().unwrap();
        assert!(diagnostic.starts_with("Open: "), "{diagnostic}");
        assert!(diagnostic.contains("/dev/ttyUSB1"), "{diagnostic}");

        // The next step starts over with the whole list.
        opener.set_unavailable(&["/dev/ttyUSB0"]);
        opener.push_reads([ReadStep::Data(FRAME.to_vec())]);
        let mut snapshots = Vec::new();
        poller.poll_once(&mut snapshots);
        assert_eq!(poller.state(), ConnectionState::Connected);
        assert_eq!(opener.state().opened[0].0, "/dev/ttyUSB1");
        assert!(snapshots.last().unwrap().reading().is_some());
    }

    #[test]
    fn transport_error_disconnects() {
        let opener = MockOpener::new().with_reads([ReadStep::Data(FRAME.to_vec())]);
        let mut poller = poller(&["/dev/ttyUSB0"], &opener);
        poller.poll_once(&mut Vec::new());
        assert_eq!(poller.state(), ConnectionState::Connected);

        opener.set_write_failure(true);
        let mut snapshots = Vec::new();
        poller.poll_once(&mut snapshots);

        assert_eq!(poller.state(), ConnectionState::Disconnected);
        assert_eq!(snapshots.len(), 1);
        assert!(!snapshots[0].connected);
        assert!(snapshots[0]
            .diagnostic
            .as_deref()
            .unwrap()
            .starts_with("Read: write failed"));

        // Reconnects on the following step.
        opener.set_write_failure(false);
        opener.push_reads([ReadStep::Data(FRAME.to_vec())]);
        let mut snapshots = Vec::new();
        poller.poll_once(&mut snapshots);
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[1].reading().is_some());
        assert_eq!(opener.state().opened.len(), 2);
    }

    #[test]
    fn read_error_disconnects() {
        let opener = MockOpener::new().with_reads([
            ReadStep::Data(FRAME[..4].to_vec()),
            ReadStep::Fail(std::io::ErrorKind::BrokenPipe),
        ]);
        let mut poller = poller(&["/dev/ttyUSB0"], &opener);
        let mut snapshots = Vec::new();

        poller.poll_once(&mut snapshots);

        assert_eq!(poller.state(), ConnectionState::Disconnected);
        let diagnostic = snapshots.last().unwrap().diagnostic.as_deref().unwrap();
        assert!(diagnostic.starts_with("Read: read failed after 4 bytes"), "{diagnostic}");
    }

    #[test]
    fn watch_sink_keeps_latest() {
        let opener = MockOpener::new().with_reads([ReadStep::Data(FRAME.to_vec())]);
        let mut poller = poller(&["/dev/ttyUSB0"], &opener);
        let (mut tx, rx) = tokio::sync::watch::channel(Snapshot::default());

        poller.poll_once(&mut tx);

        let latest = rx.borrow();
        assert!(latest.connected);
        assert_eq!(latest.reading().map(|r| r.watts), Some(1400.0));
    }

    #[test]
    fn spawned_worker_retries_at_interval_floor() {
        let opener = MockOpener::new().with_unavailable("/dev/ttyUSB0");
        let poller = Poller::with_transport(
            PollSettings {
                poll_interval: Duration::ZERO,
                ..settings(&["/dev/ttyUSB0"])
            },
            Transport::new(opener.clone()).with_pacing(Pacing::NONE),
        );
        assert_eq!(poller.settings().effective_interval(), MIN_POLL_INTERVAL);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let started = Instant::now();
        let worker = spawn(poller, tx).unwrap();
        assert_eq!(worker.thread().name(), Some("ups-poller"));

        let first = rx.blocking_recv().unwrap();
        assert!(!first.connected);
        assert!(first.diagnostic.as_deref().unwrap().starts_with("Open: "));

        let retry = rx.blocking_recv().unwrap();
        let elapsed = started.elapsed();
        assert_eq!(retry, first);
        assert!(elapsed >= MIN_POLL_INTERVAL, "retried after {elapsed:?}");
        assert!(elapsed < MIN_POLL_INTERVAL * 2, "retried after {elapsed:?}");

        // The worker reconnects on its own once the port is back.
        opener.set_unavailable(&[]);
        opener.push_reads([ReadStep::Data(FRAME.to_vec())]);
        assert_eq!(rx.blocking_recv().unwrap(), Snapshot::connected());
        let decoded = rx.blocking_recv().unwrap();
        assert_eq!(decoded.reading().map(|r| r.watts), Some(1400.0));
    }

    #[test]
    fn effective_interval() {
        let mut settings = PollSettings::default();
        assert_eq!(settings.effective_interval(), Duration::from_secs(3));
        settings.poll_interval = Duration::from_millis(200);
        assert_eq!(settings.effective_interval(), MIN_POLL_INTERVAL);
        settings.poll_interval = Duration::ZERO;
        assert_eq!(settings.effective_interval(), MIN_POLL_INTERVAL);
    }

    #[test]
    fn flagged_reading_is_hidden() {
        let snapshot = Snapshot {
            reading: Reading {
                output_voltage: 229.5,
                ..Reading::no_data()
            },
            connected: true,
            diagnostic: None,
        };
        assert_eq!(snapshot.reading(), None);
    }

    #[test]
    fn hex_preview_limit() {
        assert_eq!(hex_preview(&[]), "");
        assert_eq!(hex_preview(&[0xAB; 30]), "ab".repeat(30));
        assert_eq!(hex_preview(&[0xAB; 31]), format!("{}...", "ab".repeat(30)));
    }
}
