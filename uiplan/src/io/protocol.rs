//! Client for the line-framed actuator device protocol.
//!
//! One command is in flight at a time. [`ProtocolClient::interrupt`] is the
//! exception: it writes an `ABORT` frame while another command may still be
//! waiting for its reply, and marks both sequence numbers as abandoned so
//! their late replies are skipped instead of being taken as a mismatch.

use std::collections::BTreeSet;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::core::wire::{self, Command, LineBuffer, Reply};
use crate::io::actuator::ActuatorError;

/// Sleep between empty reads while waiting for a reply.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct ReadHalf {
    inner: Box<dyn Read + Send>,
    lines: LineBuffer,
}

pub struct ProtocolClient {
    device: String,
    reader: Mutex<ReadHalf>,
    writer: Mutex<Box<dyn Write + Send>>,
    command_lock: Mutex<()>,
    next_seq: AtomicU64,
    /// Sequence number awaiting a reply, 0 when idle.
    in_flight: AtomicU64,
    abandoned: Mutex<BTreeSet<u64>>,
    read_timeout: Duration,
}

impl ProtocolClient {
    /// Wrap an already-open byte stream. Sequence numbers start at 1.
    pub fn new(
        device: impl Into<String>,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            device: device.into(),
            reader: Mutex::new(ReadHalf {
                inner: reader,
                lines: LineBuffer::default(),
            }),
            writer: Mutex::new(writer),
            command_lock: Mutex::new(()),
            next_seq: AtomicU64::new(1),
            in_flight: AtomicU64::new(0),
            abandoned: Mutex::new(BTreeSet::new()),
            read_timeout,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Send a command and wait for its reply within the default read timeout.
    pub fn send(&self, command: &Command) -> Result<Reply, ActuatorError> {
        self.send_with_timeout(command, self.read_timeout)
    }

    #[instrument(skip_all, fields(device = %self.device, verb = command.verb()))]
    pub fn send_with_timeout(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<Reply, ActuatorError> {
        let _guard = self.command_lock.lock();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let frame = wire::encode(seq, command)?;
        self.in_flight.store(seq, Ordering::SeqCst);
        let result = self
            .write_frame(&frame)
            .and_then(|()| self.read_reply(seq, timeout));
        self.in_flight.store(0, Ordering::SeqCst);

        let reply = result?;
        if !reply.ok {
            warn!(seq, reply = %reply.body, "device reported failure");
            return Err(ActuatorError::CommandFailed {
                verb: command.verb().to_string(),
                detail: reply.body,
            });
        }
        debug!(seq, "command acknowledged");
        Ok(reply)
    }

    /// Write an `ABORT` frame without taking the command lock or waiting for
    /// any reply.
    ///
    /// Reading `in_flight` and recording it as abandoned is not atomic with a
    /// command that is just starting: if that command was sent in between, its
    /// late reply is not drained and can still surface as `ProtocolMismatch`.
    pub fn interrupt(&self) -> Result<(), ActuatorError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        {
            let mut abandoned = self.abandoned.lock();
            abandoned.insert(seq);
            let current = self.in_flight.load(Ordering::SeqCst);
            if current != 0 {
                abandoned.insert(current);
            }
        }
        let frame = wire::encode(seq, &Command::Abort)?;
        debug!(seq, "writing abort frame");
        self.write_frame(&frame)
    }

    fn write_frame(&self, frame: &str) -> Result<(), ActuatorError> {
        let mut writer = self.writer.lock();
        writer.write_all(frame.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn read_reply(&self, seq: u64, timeout: Duration) -> Result<Reply, ActuatorError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.reader.lock();
        let ReadHalf { inner, lines } = &mut *guard;
        let mut chunk = [0u8; 256];
        loop {
            while let Some(line) = lines.next_line() {
                if let Ok(reply) = wire::decode(seq, &line) {
                    self.abandoned.lock().remove(&seq);
                    return Ok(reply);
                }
                if let Ok(stale) = wire::parse_reply(&line)
                    && self.abandoned.lock().remove(&stale.seq)
                {
                    debug!(seq = stale.seq, "skipped reply to abandoned command");
                    continue;
                }
                warn!(expected = seq, line = %line, "reply does not match command");
                return Err(ActuatorError::ProtocolMismatch {
                    expected: seq,
                    line,
                });
            }
            if Instant::now() >= deadline {
                warn!(seq, timeout_ms = timeout.as_millis() as u64, "reply timed out");
                return Err(ActuatorError::ReadTimeout {
                    seq,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            match inner.read(&mut chunk) {
                Ok(0) => thread::sleep(POLL_INTERVAL),
                Ok(n) => lines.push(&chunk[..n]),
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(ActuatorError::Io(err)),
            }
        }
    }
}
