//! We use this mocking module in unit tests to emulate a serial port and the UPS behind it.

use crate::protocol as proto;
use crate::transport::{Link, Opener};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What a single `read()` call on the mock returns.
#[derive(Debug, Clone)]
pub enum ReadStep {
    /// Bytes delivered by this read.
    Data(Vec<u8>),
    /// The read times out without data.
    Quiet,
    /// The read fails with the given error.
    Fail(io::ErrorKind),
}

/// Everything the mock recorded, shared between the opener and its links.
#[derive(Debug, Clone, Default)]
pub struct MockState {
    /// Successfully opened ports with their baud rate.
    pub opened: Vec<(String, u32)>,
    /// Last read timeout set on a link.
    pub read_timeout: Option<Duration>,
    /// DTR levels in the order they were set.
    pub dtr: Vec<bool>,
    /// Number of input buffer discards.
    pub discarded: usize,
    /// Data of every write call.
    pub writes: Vec<Vec<u8>>,
    /// Number of read calls.
    pub reads: usize,
    /// Pending read results, a timeout is reported once these run out.
    pub pending_reads: VecDeque<ReadStep>,
    unavailable: Vec<String>,
    reject_timeout: bool,
    fail_writes: bool,
    fail_discard: bool,
}

/// Opener handing out [`MockLink`]s that all share one [`MockState`].
#[derive(Debug, Clone, Default)]
pub struct MockOpener {
    state: Arc<Mutex<MockState>>,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Opening `port` fails.
    pub fn with_unavailable(self, port: &str) -> Self {
        self.lock().unavailable.push(port.to_string());
        self
    }

    /// Every port refuses the read timeout.
    pub fn with_timeout_rejected(self) -> Self {
        self.lock().reject_timeout = true;
        self
    }

    /// Every write fails.
    pub fn with_write_failure(self) -> Self {
        self.set_write_failure(true);
        self
    }

    /// Discarding the input buffer fails.
    pub fn with_discard_failure(self) -> Self {
        self.lock().fail_discard = true;
        self
    }

    pub fn with_reads(self, steps: impl IntoIterator<Item = ReadStep>) -> Self {
        self.push_reads(steps);
        self
    }

    pub fn push_reads(&self, steps: impl IntoIterator<Item = ReadStep>) {
        self.lock().pending_reads.extend(steps);
    }

    pub fn set_unavailable(&self, ports: &[&str]) {
        self.lock().unavailable = ports.iter().map(|p| p.to_string()).collect();
    }

    pub fn set_write_failure(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// A copy of everything recorded so far.
    pub fn state(&self) -> MockState {
        self.lock().clone()
    }
}

impl Opener for MockOpener {
    type Link = MockLink;

    fn open(&self, port: &str, baud_rate: &proto::BaudRate) -> tokio_serial::Result<Self::Link> {
        let mut state = self.lock();
        if state.unavailable.iter().any(|p| p == port) {
            return Err(tokio_serial::Error::new(
                tokio_serial::ErrorKind::NoDevice,
                format!("{port}: no such device"),
            ));
        }
        state.opened.push((port.to_string(), u32::from(baud_rate)));
        Ok(MockLink {
            state: self.state.clone(),
        })
    }
}

/// Our mock type used to emulate an open serial port.
#[derive(Debug)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl io::Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        state.reads += 1;
        match state.pending_reads.pop_front() {
            Some(ReadStep::Data(mut data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                if len < data.len() {
                    let rest = data.split_off(len);
                    state.pending_reads.push_front(ReadStep::Data(rest));
                }
                Ok(len)
            }
            Some(ReadStep::Fail(kind)) => Err(io::Error::new(kind, "simulated read error")),
            Some(ReadStep::Quiet) | None => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "Operation timed out"))
            }
        }
    }
}

impl io::Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated write error",
            ));
        }
        state.writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for MockLink {
    fn discard_input(&mut self) -> io::Result<()> {
        let mut state = self.lock();
        if state.fail_discard {
            return Err(io::Error::other("simulated discard error"));
        }
        state.discarded += 1;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.lock().dtr.push(level);
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        let mut state = self.lock();
        if state.reject_timeout {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "simulated timeout error",
            ));
        }
        state.read_timeout = Some(timeout);
        Ok(())
    }
}
